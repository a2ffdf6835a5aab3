//! Core types for routing and transaction coordination.
//!
//! This module defines the identifiers, query/response shapes, transaction
//! states and outcomes, and the error type shared by the whole engine.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use trellis_core::{Action, CoreError, PathSpec, QueryFlags};

/// Unique identifier for a member within one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemberId(pub u64);

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "member-{}", self.0)
    }
}

/// Identifier of a chunk within one shard table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkId(pub u32);

impl ChunkId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chunk-{}", self.0)
    }
}

/// Monotonically increasing transaction identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxnId(pub u64);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

/// Engine-assigned identifier of a query within its transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryId(pub u64);

/// Caller-chosen correlation id used to pick results out of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CorrelationId(pub u64);

/// Identifier of one logical registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegistrationId(pub u64);

bitflags::bitflags! {
    /// Capability flags of a registration (and, unioned, of a member).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct Capabilities: u32 {
        const PUBLISHER = 1 << 0;
        const SUBSCRIBER = 1 << 1;
        /// Member keeps an outboard cache of the data it publishes.
        const DATA_CACHE = 1 << 2;
    }
}

/// Transaction state.
///
/// The success path is `Unsent, Prepare, Precommit, Commit, Done`; the abort
/// path is `Unsent, Prepare, [Precommit,] Abort, Aborted`; a failure during
/// COMMIT ends in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxnState {
    Unsent,
    Prepare,
    Precommit,
    Commit,
    Abort,
    Done,
    Aborted,
    Failed,
}

impl TxnState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxnState::Done | TxnState::Aborted | TxnState::Failed)
    }

    /// Whether an abort request is still honoured in this state.
    pub fn is_abortable(&self) -> bool {
        matches!(self, TxnState::Unsent | TxnState::Prepare | TxnState::Precommit)
    }
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxnState::Unsent => "UNSENT",
            TxnState::Prepare => "PREPARE",
            TxnState::Precommit => "PRECOMMIT",
            TxnState::Commit => "COMMIT",
            TxnState::Abort => "ABORT",
            TxnState::Done => "DONE",
            TxnState::Aborted => "ABORTED",
            TxnState::Failed => "FAILED",
        };
        write!(f, "{}", name)
    }
}

/// A single read/write/rpc request against the data tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub action: Action,
    pub path: PathSpec,
    pub payload: Option<Value>,
    pub flags: QueryFlags,
    pub correlation: Option<CorrelationId>,
}

impl Query {
    pub fn new(action: Action, path: PathSpec) -> Self {
        Self {
            action,
            path,
            payload: None,
            flags: QueryFlags::empty(),
            correlation: None,
        }
    }

    pub fn create(path: PathSpec, payload: Value) -> Self {
        Self::new(Action::Create, path).with_payload(payload)
    }

    pub fn read(path: PathSpec) -> Self {
        Self::new(Action::Read, path)
    }

    pub fn update(path: PathSpec, payload: Value) -> Self {
        Self::new(Action::Update, path).with_payload(payload)
    }

    pub fn delete(path: PathSpec) -> Self {
        Self::new(Action::Delete, path)
    }

    pub fn rpc(path: PathSpec, payload: Value) -> Self {
        Self::new(Action::Rpc, path).with_payload(payload)
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_flags(mut self, flags: QueryFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn with_correlation(mut self, id: u64) -> Self {
        self.correlation = Some(CorrelationId(id));
        self
    }
}

/// One record of a query result, tagged with where it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseRecord {
    /// The member that produced this record.
    pub member: MemberId,
    /// The keyspec the member answered with (fully qualified for entries).
    pub path: PathSpec,
    /// `None` for key-only answers.
    pub payload: Option<Value>,
}

/// A member's terminal answer to one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MemberReply {
    Data(Vec<ResponseRecord>),
    /// The query falls outside what the member owns. A routing signal, not an error.
    NotApplicable,
    Rejected(String),
    TimedOut,
}

impl MemberReply {
    /// Whether this reply vetoes the transaction.
    pub fn is_veto(&self) -> bool {
        matches!(self, MemberReply::Rejected(_) | MemberReply::TimedOut)
    }
}

/// Per-member response to one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberResponse {
    pub member: MemberId,
    pub reply: MemberReply,
}

/// Result of one query within a committed transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub query: QueryId,
    pub correlation: Option<CorrelationId>,
    pub action: Action,
    pub path: PathSpec,
    /// Every targeted member's answer, in routing order.
    pub responses: Vec<MemberResponse>,
    /// Merged records of all non-NA answers, in routing order.
    pub records: Vec<ResponseRecord>,
}

impl QueryResult {
    /// Members that answered NA.
    pub fn not_applicable(&self) -> Vec<MemberId> {
        self.responses
            .iter()
            .filter(|r| r.reply == MemberReply::NotApplicable)
            .map(|r| r.member)
            .collect()
    }

    /// Members the query was delivered to.
    pub fn targets(&self) -> Vec<MemberId> {
        self.responses.iter().map(|r| r.member).collect()
    }
}

/// Why a transaction was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortStatus {
    /// The originator or a member asked for it.
    Cancelled,
    /// A member answered NOT_OK.
    Rejected,
    /// A member did not answer within its budget.
    Timeout,
}

/// Details of an aborted transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortReason {
    pub status: AbortStatus,
    /// The member responsible, if any.
    pub member: Option<MemberId>,
    /// The phase in which the abort was decided.
    pub phase: TxnState,
    pub reason: String,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.member {
            Some(member) => write!(
                f,
                "{:?} by {} during {}: {}",
                self.status, member, self.phase, self.reason
            ),
            None => write!(f, "{:?} during {}: {}", self.status, self.phase, self.reason),
        }
    }
}

/// Details of a transaction that failed during COMMIT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    /// Members that rejected or did not answer COMMIT.
    pub failed: Vec<(MemberId, String)>,
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .failed
            .iter()
            .map(|(m, why)| format!("{}: {}", m, why))
            .collect();
        write!(f, "commit failed on {}", parts.join(", "))
    }
}

/// What the originator finally sees.
#[derive(Debug, Clone)]
pub enum TransactionOutcome {
    Committed { results: Vec<QueryResult> },
    Aborted(AbortReason),
    /// Inconsistent: some participant failed during COMMIT. Requires external
    /// reconciliation; never retried.
    Failed(FailureReport),
}

impl TransactionOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, TransactionOutcome::Committed { .. })
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, TransactionOutcome::Aborted(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, TransactionOutcome::Failed(_))
    }

    /// Results of a committed transaction, or the matching error.
    pub fn into_results(self, txn: TxnId) -> EngineResult<Vec<QueryResult>> {
        match self {
            TransactionOutcome::Committed { results } => Ok(results),
            TransactionOutcome::Aborted(reason) => Err(EngineError::Aborted {
                txn,
                reason: reason.to_string(),
            }),
            TransactionOutcome::Failed(report) => Err(EngineError::Inconsistent {
                txn,
                reason: report.to_string(),
            }),
        }
    }
}

/// Answer of `get_result`.
#[derive(Debug, Clone)]
pub enum ResultStatus {
    Pending,
    Ready(Vec<QueryResult>),
    Aborted(AbortReason),
    Failed(FailureReport),
}

/// Errors that can occur in engine operations.
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("Malformed path: {0}")]
    MalformedPath(#[from] CoreError),

    #[error("Invalid registration at {path}: {reason}")]
    InvalidRegistration { path: String, reason: String },

    #[error("Member {0} not found")]
    MemberNotFound(MemberId),

    #[error("Registration {0:?} not found")]
    RegistrationNotFound(RegistrationId),

    #[error("Shard conflict on {table}: {reason}")]
    ShardConflict { table: String, reason: String },

    #[error("No shard table at {0}")]
    ShardTableNotFound(String),

    #[error("Transaction {0} no longer accepts blocks")]
    TransactionClosed(TxnId),

    #[error("Transaction {0} has entered COMMIT; abort refused")]
    AbortRefused(TxnId),

    #[error("Member {member} rejected: {reason}")]
    Rejected { member: MemberId, reason: String },

    #[error("Member {member} timed out during {phase}")]
    Timeout { member: MemberId, phase: TxnState },

    #[error("Transaction {txn} is inconsistent: {reason}")]
    Inconsistent { txn: TxnId, reason: String },

    #[error("Transaction {txn} aborted: {reason}")]
    Aborted { txn: TxnId, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
