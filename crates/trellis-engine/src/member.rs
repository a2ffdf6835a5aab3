//! Members and the callback contract they implement.
//!
//! A member is one participating endpoint. The engine drives it through the
//! [`MemberCallbacks`] trait: `prepare` for every query routed to it, then
//! `precommit`, and finally `commit` or `abort`. `recover` runs when a
//! transaction the member took part in ends inconsistent.
//!
//! `prepare` may answer synchronously (records sent on the context's
//! [`QueryHandle`] before returning [`PrepareStatus::Ok`] are collected) or
//! return [`PrepareStatus::Async`] and answer later through a cloned handle.

use crate::coordinator::TxnControl;
use crate::tasks::MemberTasks;
use crate::types::*;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use trellis_core::PathSpec;

/// Immediate answer of a `prepare` callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrepareStatus {
    /// Done; whatever was sent on the handle so far is the answer.
    Ok,
    /// The query is outside what this member owns.
    NotApplicable,
    /// Veto the transaction.
    NotOk(String),
    /// The answer will arrive later on a [`QueryHandle`].
    Async,
}

/// Answer to PRECOMMIT or COMMIT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Vote {
    Ok,
    NotOk(String),
}

/// Transaction event callbacks of one member.
///
/// Only `prepare` is required. The remaining phases default to agreeing and
/// doing nothing.
#[async_trait]
pub trait MemberCallbacks: Send + Sync {
    async fn prepare(&self, ctx: &PrepareContext) -> PrepareStatus;

    async fn precommit(&self, _txn: TxnId) -> Vote {
        Vote::Ok
    }

    async fn commit(&self, _txn: TxnId) -> Vote {
        Vote::Ok
    }

    async fn abort(&self, _txn: TxnId) {}

    async fn recover(&self, _txn: TxnId, _report: &FailureReport) {}
}

#[derive(Debug)]
pub(crate) enum ReplyEvent {
    Records { records: Vec<ResponseRecord>, more: bool },
    NotApplicable,
    Rejected(String),
}

/// Owned response channel for one (query, member) pair.
///
/// Cloneable and `'static`, so it can be moved into a task that answers
/// after `prepare` has returned. When every clone is dropped without a
/// final answer the member is treated as having rejected the query.
#[derive(Debug, Clone)]
pub struct QueryHandle {
    member: MemberId,
    tx: mpsc::UnboundedSender<ReplyEvent>,
}

impl QueryHandle {
    pub(crate) fn channel(member: MemberId) -> (Self, mpsc::UnboundedReceiver<ReplyEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { member, tx }, rx)
    }

    /// Send records for `keyspec`, one per message; an empty message list
    /// sends a single key-only record. `more = false` ends the answer.
    pub fn respond(&self, keyspec: PathSpec, messages: Vec<Value>, more: bool) {
        let records = if messages.is_empty() {
            vec![ResponseRecord {
                member: self.member,
                path: keyspec,
                payload: None,
            }]
        } else {
            messages
                .into_iter()
                .map(|payload| ResponseRecord {
                    member: self.member,
                    path: keyspec.clone(),
                    payload: Some(payload),
                })
                .collect()
        };
        // The receiver is gone once the query has been answered or timed out.
        let _ = self.tx.send(ReplyEvent::Records { records, more });
    }

    /// End the answer with no records.
    pub fn done(&self) {
        let _ = self.tx.send(ReplyEvent::Records {
            records: Vec::new(),
            more: false,
        });
    }

    pub fn not_applicable(&self) {
        let _ = self.tx.send(ReplyEvent::NotApplicable);
    }

    pub fn reject(&self, reason: impl Into<String>) {
        let _ = self.tx.send(ReplyEvent::Rejected(reason.into()));
    }

    pub fn member(&self) -> MemberId {
        self.member
    }
}

/// What a member sees while preparing one query.
pub struct PrepareContext {
    pub(crate) txn: TxnId,
    pub(crate) query_id: QueryId,
    pub(crate) query: Arc<Query>,
    pub(crate) member: MemberId,
    pub(crate) registration: PathSpec,
    pub(crate) chunk: Option<ChunkId>,
    pub(crate) replies: QueryHandle,
    pub(crate) control: TxnControl,
}

impl PrepareContext {
    pub fn txn(&self) -> TxnId {
        self.txn
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn member(&self) -> MemberId {
        self.member
    }

    /// The registration this query was routed through.
    pub fn registration(&self) -> &PathSpec {
        &self.registration
    }

    /// The chunk this member was selected for, when routed through a shard
    /// table.
    pub fn chunk(&self) -> Option<ChunkId> {
        self.chunk
    }

    /// A response handle that outlives this context.
    pub fn handle(&self) -> QueryHandle {
        self.replies.clone()
    }

    /// Append a block of queries to the running transaction.
    pub fn append_block(&self, queries: Vec<Query>) -> EngineResult<()> {
        self.control.append_block(queries)
    }

    /// Ask for the transaction to be aborted.
    pub fn abort(&self, reason: impl Into<String>) -> EngineResult<()> {
        self.control
            .request_abort(AbortStatus::Cancelled, Some(self.member), reason.into())
    }
}

/// One participating endpoint.
pub struct Member {
    id: MemberId,
    address: String,
    callbacks: Arc<dyn MemberCallbacks>,
    virtual_table: Option<Arc<crate::registry::VirtualTable>>,
    alive: AtomicBool,
    last_heartbeat: Mutex<Instant>,
    tasks: MemberTasks,
}

impl Member {
    pub(crate) fn new(id: MemberId, address: String, callbacks: Arc<dyn MemberCallbacks>) -> Self {
        Self {
            id,
            address,
            callbacks,
            virtual_table: None,
            alive: AtomicBool::new(true),
            last_heartbeat: Mutex::new(Instant::now()),
            tasks: MemberTasks::new(),
        }
    }

    /// A code-free member served from engine-side storage.
    pub(crate) fn code_free(id: MemberId, address: String) -> Self {
        let table = Arc::new(crate::registry::VirtualTable::new());
        let mut member = Self::new(id, address, table.clone());
        member.virtual_table = Some(table);
        member
    }

    pub fn id(&self) -> MemberId {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn callbacks(&self) -> &Arc<dyn MemberCallbacks> {
        &self.callbacks
    }

    /// The storage backing a code-free member.
    pub fn virtual_table(&self) -> Option<&Arc<crate::registry::VirtualTable>> {
        self.virtual_table.as_ref()
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub(crate) fn mark_dead(&self) {
        self.alive.store(false, Ordering::Release);
    }

    pub fn last_heartbeat(&self) -> Instant {
        *self.last_heartbeat.lock()
    }

    pub(crate) fn touch(&self) {
        *self.last_heartbeat.lock() = Instant::now();
    }

    pub fn tasks(&self) -> &MemberTasks {
        &self.tasks
    }
}

impl fmt::Debug for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Member")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("alive", &self.is_alive())
            .field("code_free", &self.virtual_table.is_some())
            .finish()
    }
}
