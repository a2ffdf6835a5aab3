//! Transaction coordination.
//!
//! Each transaction is driven by one spawned task through
//! PREPARE, PRECOMMIT and COMMIT (or ABORT):
//! - PREPARE runs blocks strictly in append order, the queries of one block
//!   in parallel. A rejection or timeout aborts.
//! - PRECOMMIT asks every touched member to confirm, block by block.
//! - COMMIT runs block by block. A failure here does not stop the remaining
//!   blocks; the transaction ends FAILED and touched members get `recover`.
//!
//! An abort request is honoured until COMMIT begins and cancels whatever
//! block is in flight.

mod transaction;

pub use transaction::TransactionHandle;
pub(crate) use transaction::TxnControl;

use crate::config::EngineConfig;
use crate::dispatch::QueryDispatcher;
use crate::member::{Member, Vote};
use crate::types::*;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use transaction::{Block, Step, TxnShared};
use trellis_core::Action;

/// Starts transactions and owns their id sequence.
pub struct TransactionCoordinator {
    dispatcher: Arc<QueryDispatcher>,
    config: EngineConfig,
    next_txn: AtomicU64,
}

impl TransactionCoordinator {
    pub fn new(dispatcher: Arc<QueryDispatcher>, config: EngineConfig) -> Self {
        Self {
            dispatcher,
            config,
            next_txn: AtomicU64::new(0),
        }
    }

    /// Start an empty transaction.
    ///
    /// Must be called from within a tokio runtime. The transaction stays in
    /// PREPARE until [`TransactionHandle::commit`] is called.
    pub fn begin(&self) -> TransactionHandle {
        let id = TxnId(self.next_txn.fetch_add(1, Ordering::SeqCst) + 1);
        let shared = Arc::new(TxnShared::new(id));
        let driver = Driver {
            shared: Arc::clone(&shared),
            dispatcher: Arc::clone(&self.dispatcher),
            config: self.config.clone(),
            touched: Mutex::new(Touched::default()),
        };
        tokio::spawn(driver.run());
        TransactionHandle::new(shared)
    }

    /// Start a transaction holding a single block and commit it.
    pub fn submit(&self, queries: Vec<Query>) -> TransactionHandle {
        let handle = self.begin();
        // A fresh transaction is always open.
        let _ = handle.append_block(queries);
        handle.commit();
        handle
    }
}

/// Members that received PREPARE, grouped by the block that first touched
/// them. RPC targets are not recorded.
#[derive(Default)]
struct Touched {
    blocks: Vec<Vec<Arc<Member>>>,
    seen: HashSet<MemberId>,
}

struct Driver {
    shared: Arc<TxnShared>,
    dispatcher: Arc<QueryDispatcher>,
    config: EngineConfig,
    touched: Mutex<Touched>,
}

impl Driver {
    async fn run(self) {
        let txn = self.shared.id();
        self.shared.set_state(TxnState::Prepare);

        if let Err(reason) = self.prepare().await {
            self.abort(reason).await;
            return;
        }

        self.shared.set_state(TxnState::Precommit);
        if let Err(reason) = self.precommit().await {
            self.abort(reason).await;
            return;
        }

        if !self.shared.begin_commit() {
            let reason = self.shared.abort_reason();
            self.abort(reason).await;
            return;
        }
        self.commit().await;
        info!("{} finished as {}", txn, self.shared.state());
    }

    async fn prepare(&self) -> Result<(), AbortReason> {
        loop {
            match self.shared.next_step() {
                Step::Abort => return Err(self.shared.abort_reason()),
                Step::Finished => return Ok(()),
                Step::Wait => self.shared.wait_for_work().await,
                Step::Block(block) => {
                    let results = tokio::select! {
                        biased;
                        _ = self.shared.cancelled().cancelled() => None,
                        results = self.run_block(block) => Some(results),
                    };
                    // Cancelled: the next step reports the abort.
                    let Some(results) = results else { continue };
                    if let Some(reason) = veto(&results) {
                        let _ = self.shared.request_abort(
                            reason.status,
                            reason.member,
                            reason.reason.clone(),
                        );
                        return Err(self.shared.abort_reason());
                    }
                    self.shared.record_results(results);
                }
            }
        }
    }

    async fn run_block(&self, block: Block) -> Vec<QueryResult> {
        self.touched.lock().blocks.push(Vec::new());

        let mut routed = Vec::with_capacity(block.len());
        for (id, query) in block {
            let targets = self.dispatcher.route(&query).await;
            if query.action != Action::Rpc {
                let mut touched = self.touched.lock();
                let Touched { blocks, seen } = &mut *touched;
                if let Some(current) = blocks.last_mut() {
                    for target in &targets {
                        if seen.insert(target.member_id()) {
                            current.push(Arc::clone(&target.member));
                        }
                    }
                }
            }
            routed.push((id, Arc::new(query), targets));
        }

        let control = TxnControl::new(Arc::clone(&self.shared));
        let timeout = self.config.prepare_timeout();
        join_all(routed.iter().map(|(id, query, targets)| {
            self.dispatcher
                .deliver(&control, *id, Arc::clone(query), targets, timeout)
        }))
        .await
    }

    fn touched_blocks(&self) -> Vec<Vec<Arc<Member>>> {
        self.touched.lock().blocks.clone()
    }

    async fn precommit(&self) -> Result<(), AbortReason> {
        let timeout = self.config.precommit_timeout();
        for block in self.touched_blocks() {
            let votes = tokio::select! {
                biased;
                _ = self.shared.cancelled().cancelled() => None,
                votes = self.vote(&block, TxnState::Precommit, timeout) => Some(votes),
            };
            let Some(votes) = votes else {
                return Err(self.shared.abort_reason());
            };
            for (member, vote) in votes {
                let (status, reason) = match vote {
                    Some(Vote::Ok) => continue,
                    Some(Vote::NotOk(reason)) => (AbortStatus::Rejected, reason),
                    None => (AbortStatus::Timeout, "no answer to PRECOMMIT".to_string()),
                };
                let _ = self.shared.request_abort(status, Some(member), reason);
                return Err(self.shared.abort_reason());
            }
        }
        Ok(())
    }

    async fn commit(&self) {
        let txn = self.shared.id();
        let timeout = self.config.commit_timeout();
        let mut failed = Vec::new();
        for block in self.touched_blocks() {
            for (member, vote) in self.vote(&block, TxnState::Commit, timeout).await {
                match vote {
                    Some(Vote::Ok) => {}
                    Some(Vote::NotOk(reason)) => failed.push((member, reason)),
                    None => failed.push((member, "no answer to COMMIT".to_string())),
                }
            }
        }

        if failed.is_empty() {
            let results = self.shared.take_results();
            self.shared
                .finish(TransactionOutcome::Committed { results });
            return;
        }

        let report = FailureReport { failed };
        error!("{} is inconsistent: {}", txn, report);
        let timeout = self.config.abort_timeout();
        let members: Vec<Arc<Member>> = self.touched_blocks().into_iter().flatten().collect();
        join_all(members.iter().map(|member| {
            let report = &report;
            async move {
                if !member.is_alive() {
                    return;
                }
                let recover = member.callbacks().recover(txn, report);
                if tokio::time::timeout(timeout, recover).await.is_err() {
                    warn!("{} timed out recovering {}", member.id(), txn);
                }
            }
        }))
        .await;
        self.shared.finish(TransactionOutcome::Failed(report));
    }

    async fn abort(&self, reason: AbortReason) {
        let txn = self.shared.id();
        self.shared.set_state(TxnState::Abort);
        info!("{} aborted: {}", txn, reason);

        let timeout = self.config.abort_timeout();
        let members: Vec<Arc<Member>> = self.touched_blocks().into_iter().flatten().collect();
        join_all(members.iter().map(|member| async move {
            if !member.is_alive() {
                return;
            }
            if tokio::time::timeout(timeout, member.callbacks().abort(txn))
                .await
                .is_err()
            {
                warn!("{} timed out handling ABORT of {}", member.id(), txn);
            }
        }))
        .await;
        self.shared.finish(TransactionOutcome::Aborted(reason));
    }

    /// Ask every member of a block for its PRECOMMIT or COMMIT vote.
    /// `None` means no answer in time (or the member is gone).
    async fn vote(
        &self,
        members: &[Arc<Member>],
        phase: TxnState,
        timeout: Duration,
    ) -> Vec<(MemberId, Option<Vote>)> {
        let txn = self.shared.id();
        join_all(members.iter().map(|member| async move {
            if !member.is_alive() {
                warn!("{} is gone; {} of {} bounces as timeout", member.id(), phase, txn);
                return (member.id(), None);
            }
            let callbacks = member.callbacks();
            let call = async {
                match phase {
                    TxnState::Precommit => callbacks.precommit(txn).await,
                    _ => callbacks.commit(txn).await,
                }
            };
            match tokio::time::timeout(timeout, call).await {
                Ok(vote) => (member.id(), Some(vote)),
                Err(_) => {
                    warn!("{} timed out during {} of {}", member.id(), phase, txn);
                    (member.id(), None)
                }
            }
        }))
        .await
    }
}

/// The first PREPARE rejection or timeout among a block's results.
///
/// RPC answers are not transactional and never veto.
fn veto(results: &[QueryResult]) -> Option<AbortReason> {
    results
        .iter()
        .filter(|r| r.action != Action::Rpc)
        .flat_map(|r| r.responses.iter())
        .find_map(|response| match &response.reply {
            MemberReply::Rejected(reason) => Some(AbortReason {
                status: AbortStatus::Rejected,
                member: Some(response.member),
                phase: TxnState::Prepare,
                reason: reason.clone(),
            }),
            MemberReply::TimedOut => Some(AbortReason {
                status: AbortStatus::Timeout,
                member: Some(response.member),
                phase: TxnState::Prepare,
                reason: "no answer to PREPARE".into(),
            }),
            _ => None,
        })
}
