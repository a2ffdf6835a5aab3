//! # Trellis Engine
//!
//! Sharded routing and multi-phase transaction coordination for the
//! Trellis data plane.
//!
//! Members register at path patterns. Queries are routed to the members
//! whose registrations overlap the query path (narrowed through shard
//! tables where a registration is sharded) and grouped into transactions
//! that run PREPARE, PRECOMMIT and COMMIT (or ABORT) across every member
//! they touch.

pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod engine;
pub mod loader;
pub mod member;
pub mod registry;
pub mod shard;
pub mod tasks;
pub mod types;

pub use config::EngineConfig;
pub use coordinator::{TransactionCoordinator, TransactionHandle};
pub use dispatch::{QueryDispatcher, Target};
pub use engine::Engine;
pub use loader::{Attempt, LoaderPhase, LoaderPlan, SchemaLoader};
pub use member::{Member, MemberCallbacks, PrepareContext, PrepareStatus, QueryHandle, Vote};
pub use registry::{MemberRegistry, Registration, RegistrationHandle, VirtualTable};
pub use shard::router::TableLayout;
pub use shard::{
    BindingOp, BindingRequest, ChunkCount, ChunkResolution, KeyDetail, NestingViolation,
    ShardDetail, ShardKind, ShardRouter, ShardTable, BINDING_PATH,
};
pub use tasks::{MemberTasks, ScheduledTask};
pub use types::*;
