//! Per-transaction shared state and the handles onto it.
//!
//! The driver task, the originator's [`TransactionHandle`] and every member
//! context ([`TxnControl`]) share one `TxnShared`. All bookkeeping sits
//! behind a short `parking_lot` lock that is never held across an await;
//! the driver is woken through `Notify` and aborts are signalled through a
//! `CancellationToken`.

use crate::types::*;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub(crate) type Block = Vec<(QueryId, Query)>;

/// What the driver should do next during PREPARE.
pub(crate) enum Step {
    Block(Block),
    /// The originator committed and no block is pending.
    Finished,
    Wait,
    Abort,
}

struct TxnInner {
    state: TxnState,
    history: Vec<TxnState>,
    pending: VecDeque<Block>,
    /// The originator has called `commit()`.
    sealed: bool,
    /// No more blocks accepted.
    closed: bool,
    abort: Option<AbortReason>,
    next_query: u64,
    results: Vec<QueryResult>,
    outcome: Option<TransactionOutcome>,
}

impl TxnInner {
    fn transition(&mut self, id: TxnId, state: TxnState, tx: &watch::Sender<TxnState>) {
        if self.state == state {
            return;
        }
        debug!("{} {} -> {}", id, self.state, state);
        self.state = state;
        self.history.push(state);
        tx.send_replace(state);
    }
}

pub(crate) struct TxnShared {
    id: TxnId,
    inner: Mutex<TxnInner>,
    wake: Notify,
    cancel: CancellationToken,
    state_tx: watch::Sender<TxnState>,
}

impl TxnShared {
    pub(crate) fn new(id: TxnId) -> Self {
        let (state_tx, _) = watch::channel(TxnState::Unsent);
        Self {
            id,
            inner: Mutex::new(TxnInner {
                state: TxnState::Unsent,
                history: vec![TxnState::Unsent],
                pending: VecDeque::new(),
                sealed: false,
                closed: false,
                abort: None,
                next_query: 0,
                results: Vec::new(),
                outcome: None,
            }),
            wake: Notify::new(),
            cancel: CancellationToken::new(),
            state_tx,
        }
    }

    pub(crate) fn id(&self) -> TxnId {
        self.id
    }

    pub(crate) fn state(&self) -> TxnState {
        self.inner.lock().state
    }

    pub(crate) fn set_state(&self, state: TxnState) {
        self.inner.lock().transition(self.id, state, &self.state_tx);
    }

    pub(crate) fn append_block(&self, queries: Vec<Query>) -> EngineResult<()> {
        {
            let mut inner = self.inner.lock();
            if inner.closed || inner.state.is_terminal() {
                return Err(EngineError::TransactionClosed(self.id));
            }
            let mut block = Vec::with_capacity(queries.len());
            for query in queries {
                block.push((QueryId(inner.next_query), query));
                inner.next_query += 1;
            }
            inner.pending.push_back(block);
        }
        self.wake.notify_one();
        Ok(())
    }

    pub(crate) fn seal(&self) {
        self.inner.lock().sealed = true;
        self.wake.notify_one();
    }

    /// Record an abort request. Refused once COMMIT has begun.
    pub(crate) fn request_abort(
        &self,
        status: AbortStatus,
        member: Option<MemberId>,
        reason: String,
    ) -> EngineResult<()> {
        {
            let mut inner = self.inner.lock();
            match inner.state {
                TxnState::Commit | TxnState::Done | TxnState::Failed => {
                    return Err(EngineError::AbortRefused(self.id));
                }
                TxnState::Abort | TxnState::Aborted => return Ok(()),
                phase => {
                    if inner.abort.is_none() {
                        inner.abort = Some(AbortReason {
                            status,
                            member,
                            phase,
                            reason,
                        });
                    }
                    inner.closed = true;
                }
            }
        }
        self.cancel.cancel();
        self.wake.notify_one();
        Ok(())
    }

    pub(crate) fn next_step(&self) -> Step {
        let mut inner = self.inner.lock();
        if inner.abort.is_some() {
            return Step::Abort;
        }
        if let Some(block) = inner.pending.pop_front() {
            return Step::Block(block);
        }
        if inner.sealed {
            inner.closed = true;
            return Step::Finished;
        }
        Step::Wait
    }

    pub(crate) async fn wait_for_work(&self) {
        tokio::select! {
            _ = self.wake.notified() => {}
            _ = self.cancel.cancelled() => {}
        }
    }

    pub(crate) fn cancelled(&self) -> &CancellationToken {
        &self.cancel
    }

    /// The recorded abort reason, or a generic one.
    pub(crate) fn abort_reason(&self) -> AbortReason {
        let inner = self.inner.lock();
        inner.abort.clone().unwrap_or(AbortReason {
            status: AbortStatus::Cancelled,
            member: None,
            phase: inner.state,
            reason: "aborted".into(),
        })
    }

    /// Enter COMMIT unless an abort was requested first.
    pub(crate) fn begin_commit(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.abort.is_some() {
            return false;
        }
        inner.closed = true;
        inner.transition(self.id, TxnState::Commit, &self.state_tx);
        true
    }

    pub(crate) fn record_results(&self, results: Vec<QueryResult>) {
        self.inner.lock().results.extend(results);
    }

    pub(crate) fn take_results(&self) -> Vec<QueryResult> {
        let mut results = std::mem::take(&mut self.inner.lock().results);
        results.sort_by_key(|r| r.query);
        results
    }

    /// Store the outcome and enter its terminal state atomically.
    pub(crate) fn finish(&self, outcome: TransactionOutcome) {
        let state = match outcome {
            TransactionOutcome::Committed { .. } => TxnState::Done,
            TransactionOutcome::Aborted(_) => TxnState::Aborted,
            TransactionOutcome::Failed(_) => TxnState::Failed,
        };
        let mut inner = self.inner.lock();
        inner.outcome = Some(outcome);
        inner.closed = true;
        inner.pending.clear();
        inner.transition(self.id, state, &self.state_tx);
    }

    fn outcome(&self) -> Option<TransactionOutcome> {
        self.inner.lock().outcome.clone()
    }

    fn history(&self) -> Vec<TxnState> {
        self.inner.lock().history.clone()
    }
}

/// A member's view of a running transaction.
#[derive(Clone)]
pub(crate) struct TxnControl(Arc<TxnShared>);

impl TxnControl {
    pub(crate) fn new(shared: Arc<TxnShared>) -> Self {
        Self(shared)
    }

    pub(crate) fn id(&self) -> TxnId {
        self.0.id()
    }

    pub(crate) fn append_block(&self, queries: Vec<Query>) -> EngineResult<()> {
        self.0.append_block(queries)
    }

    pub(crate) fn request_abort(
        &self,
        status: AbortStatus,
        member: Option<MemberId>,
        reason: String,
    ) -> EngineResult<()> {
        self.0.request_abort(status, member, reason)
    }
}

/// The originator's handle on a transaction.
#[derive(Clone)]
pub struct TransactionHandle {
    shared: Arc<TxnShared>,
}

impl TransactionHandle {
    pub(crate) fn new(shared: Arc<TxnShared>) -> Self {
        Self { shared }
    }

    pub fn id(&self) -> TxnId {
        self.shared.id()
    }

    /// Append a block; it runs after every earlier block has been answered.
    pub fn append_block(&self, queries: Vec<Query>) -> EngineResult<()> {
        self.shared.append_block(queries)
    }

    /// No more blocks from the originator. PREPARE ends once all pending
    /// blocks have been answered.
    pub fn commit(&self) {
        self.shared.seal();
    }

    /// Abort the transaction. Fails with `AbortRefused` once COMMIT has begun.
    pub fn abort(&self, status: AbortStatus, reason: impl Into<String>) -> EngineResult<()> {
        self.shared.request_abort(status, None, reason.into())
    }

    pub fn state(&self) -> TxnState {
        self.shared.state()
    }

    /// Every state the transaction has been in, in order.
    pub fn state_history(&self) -> Vec<TxnState> {
        self.shared.history()
    }

    /// Live state updates.
    pub fn subscribe(&self) -> watch::Receiver<TxnState> {
        self.shared.state_tx.subscribe()
    }

    /// Results so far. Never partial: `Ready` only once committed.
    ///
    /// With a correlation id only the queries carrying it are returned.
    pub fn get_result(&self, correlation: Option<CorrelationId>) -> ResultStatus {
        match self.shared.outcome() {
            None => ResultStatus::Pending,
            Some(TransactionOutcome::Committed { results }) => ResultStatus::Ready(
                results
                    .into_iter()
                    .filter(|r| correlation.is_none() || r.correlation == correlation)
                    .collect(),
            ),
            Some(TransactionOutcome::Aborted(reason)) => ResultStatus::Aborted(reason),
            Some(TransactionOutcome::Failed(report)) => ResultStatus::Failed(report),
        }
    }

    /// Wait for the transaction to end.
    pub async fn wait(&self) -> TransactionOutcome {
        let mut rx = self.shared.state_tx.subscribe();
        loop {
            if let Some(outcome) = self.shared.outcome() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                // The sender lives in `shared`, which this handle keeps alive.
                return self.shared.outcome().unwrap_or(TransactionOutcome::Failed(
                    FailureReport { failed: Vec::new() },
                ));
            }
        }
    }

    /// Wait and turn the outcome into results or an error.
    pub async fn results(&self) -> EngineResult<Vec<QueryResult>> {
        self.wait().await.into_results(self.id())
    }
}

impl std::fmt::Debug for TransactionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionHandle")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}
