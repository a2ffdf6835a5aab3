//! Query routing and delivery.
//!
//! For one query the dispatcher:
//! 1. collects overlapping registrations that accept the action
//!    (READ/RPC: publishers; CREATE/UPDATE/DELETE: publishers and subscribers),
//! 2. narrows sharded registrations to the members owning the resolved chunk,
//!    against a single table snapshot,
//! 3. deduplicates per member and orders by (chunk id, member id), unsharded
//!    registrants last,
//! 4. delivers `prepare` to every target in parallel under the prepare
//!    timeout and merges the answers in target order.

use crate::coordinator::TxnControl;
use crate::member::{Member, PrepareContext, PrepareStatus, QueryHandle, ReplyEvent};
use crate::registry::{MemberRegistry, Registration};
use crate::shard::{ChunkResolution, ShardRouter, ShardTable};
use crate::types::*;
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};
use trellis_core::{Action, PathSpec, QueryFlags, Segment};

/// Sort rank of a target: explicit chunks first, then the default pool,
/// then unsharded registrants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Rank {
    Chunk(ChunkId),
    DefaultPool,
    Unsharded,
}

/// One member selected for a query.
#[derive(Debug, Clone)]
pub struct Target {
    pub member: Arc<Member>,
    pub registration: Arc<Registration>,
    pub chunk: Option<ChunkId>,
    rank: Rank,
}

impl Target {
    pub fn member_id(&self) -> MemberId {
        self.member.id()
    }
}

/// Computes target sets and delivers queries.
pub struct QueryDispatcher {
    registry: Arc<RwLock<MemberRegistry>>,
    router: Arc<ShardRouter>,
}

impl QueryDispatcher {
    pub fn new(registry: Arc<RwLock<MemberRegistry>>, router: Arc<ShardRouter>) -> Self {
        Self { registry, router }
    }

    /// Target members of `query`, in delivery order.
    pub async fn route(&self, query: &Query) -> Vec<Target> {
        let registrations = self.registry.read().await.matching(&query.path);
        let mut snapshots: HashMap<PathSpec, Option<Arc<ShardTable>>> = HashMap::new();
        let mut targets = Vec::new();

        for registration in registrations {
            if !registration.accepts(query.action) {
                continue;
            }
            let placement = if registration.is_sharded() {
                let table = snapshots
                    .entry(registration.path.clone())
                    .or_insert_with(|| self.router.snapshot(&registration.path))
                    .clone();
                // A sharded registrant owns nothing until its bindings commit.
                table.and_then(|t| place_in_table(&t, &registration, &query.path))
            } else {
                Some((None, Rank::Unsharded))
            };
            if let Some((chunk, rank)) = placement {
                targets.push(Target {
                    member: Arc::clone(&registration.member),
                    registration,
                    chunk,
                    rank,
                });
            }
        }

        targets.sort_by_key(|t| (t.rank, t.member.id()));
        let mut seen = HashSet::new();
        targets.retain(|t| seen.insert(t.member.id()));

        if query.action == Action::Rpc || query.flags.contains(QueryFlags::ANYCAST) {
            targets.truncate(1);
        }
        debug!(
            "Routed {} {} to {} member(s)",
            query.action,
            query.path,
            targets.len()
        );
        targets
    }

    /// Deliver `prepare` to every target and merge the answers.
    pub(crate) async fn deliver(
        &self,
        control: &TxnControl,
        query_id: QueryId,
        query: Arc<Query>,
        targets: &[Target],
        timeout: Duration,
    ) -> QueryResult {
        let deliveries = targets.iter().map(|target| {
            deliver_one(control.clone(), query_id, Arc::clone(&query), target, timeout)
        });
        let responses: Vec<MemberResponse> = join_all(deliveries).await;
        merge(query_id, &query, responses)
    }
}

/// Chunk and rank of a sharded registrant, or `None` if it does not own the
/// queried key.
fn place_in_table(
    table: &ShardTable,
    registration: &Registration,
    path: &PathSpec,
) -> Option<(Option<ChunkId>, Rank)> {
    let member = registration.member.id();
    let depth = registration.path.len().checked_sub(1)?;
    let key = path
        .segment(depth)
        .and_then(Segment::key_values)
        .filter(|k| !k.is_empty());

    match key {
        Some(key) => match table.resolve_chunk(&key) {
            ChunkResolution::Chunk(chunk) => table
                .member_ids_for(ChunkResolution::Chunk(chunk))
                .contains(&member)
                .then_some((Some(chunk), Rank::Chunk(chunk))),
            ChunkResolution::Default => table
                .default_pool()
                .contains(&member)
                .then_some((None, Rank::DefaultPool)),
        },
        // Wildcard or shallower query: every member of the table.
        None => {
            if !table.contains_member(member) {
                return None;
            }
            Some(match table.chunk_of(member) {
                Some(chunk) => (Some(chunk), Rank::Chunk(chunk)),
                None => (None, Rank::DefaultPool),
            })
        }
    }
}

async fn deliver_one(
    control: TxnControl,
    query_id: QueryId,
    query: Arc<Query>,
    target: &Target,
    timeout: Duration,
) -> MemberResponse {
    let member = &target.member;
    if !member.is_alive() {
        warn!(
            "{} is gone; {} {} bounces as timeout",
            member.id(),
            query.action,
            query.path
        );
        return MemberResponse {
            member: member.id(),
            reply: MemberReply::TimedOut,
        };
    }

    let (handle, mut rx) = QueryHandle::channel(member.id());
    let ctx = PrepareContext {
        txn: control.id(),
        query_id,
        query,
        member: member.id(),
        registration: target.registration.path.clone(),
        chunk: target.chunk,
        replies: handle,
        control,
    };
    let callbacks = Arc::clone(member.callbacks());
    let exchange = async move {
        let status = callbacks.prepare(&ctx).await;
        // Only handles the member kept may answer from here on.
        drop(ctx);
        collect_reply(status, &mut rx).await
    };

    let reply = match tokio::time::timeout(timeout, exchange).await {
        Ok(reply) => reply,
        Err(_) => {
            warn!("{} timed out preparing {:?}", member.id(), query_id);
            MemberReply::TimedOut
        }
    };
    MemberResponse {
        member: member.id(),
        reply,
    }
}

async fn collect_reply(
    status: PrepareStatus,
    rx: &mut mpsc::UnboundedReceiver<ReplyEvent>,
) -> MemberReply {
    let wait = match status {
        PrepareStatus::NotApplicable => return MemberReply::NotApplicable,
        PrepareStatus::NotOk(reason) => return MemberReply::Rejected(reason),
        PrepareStatus::Ok => false,
        PrepareStatus::Async => true,
    };

    let mut records = Vec::new();
    loop {
        let event = if wait { rx.recv().await } else { rx.try_recv().ok() };
        match event {
            Some(ReplyEvent::Records {
                records: mut batch,
                more,
            }) => {
                records.append(&mut batch);
                if wait && !more {
                    return MemberReply::Data(records);
                }
            }
            Some(ReplyEvent::NotApplicable) => return MemberReply::NotApplicable,
            Some(ReplyEvent::Rejected(reason)) => return MemberReply::Rejected(reason),
            None if wait => {
                return MemberReply::Rejected("response handle dropped without an answer".into())
            }
            None => return MemberReply::Data(records),
        }
    }
}

fn merge(query_id: QueryId, query: &Query, responses: Vec<MemberResponse>) -> QueryResult {
    let keyonly = query.flags.contains(QueryFlags::KEYONLY);
    let records = responses
        .iter()
        .filter_map(|r| match &r.reply {
            MemberReply::Data(records) => Some(records),
            _ => None,
        })
        .flatten()
        .map(|record| ResponseRecord {
            payload: if keyonly { None } else { record.payload.clone() },
            ..record.clone()
        })
        .collect();

    QueryResult {
        query: query_id,
        correlation: query.correlation,
        action: query.action,
        path: query.path.clone(),
        responses,
        records,
    }
}
