//! # Trellis
//!
//! A transactional publish/subscribe data plane with sharded routing.
//!
//! Members register at hierarchical path patterns as publishers or
//! subscribers. Every query runs inside a transaction that fans out to the
//! members whose registrations overlap the query path and commits only when
//! every one of them agrees.
//!
//! ## Quick Start
//!
//! ```rust
//! use trellis::prelude::*;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = Engine::new(EngineConfig::default());
//!
//!     // A member without callbacks keeps its entries inside the engine.
//!     let store = engine.connect("local://store", None).await;
//!     let table = PathSpec::parse("/config/interface[*]")?;
//!     engine.register(&store, table, Capabilities::PUBLISHER, None).await?;
//!
//!     let eth0 = PathSpec::parse("/config/interface[name='eth0']")?;
//!     engine
//!         .query(eth0.clone(), Action::Create, Some(json!({"mtu": 1500})), QueryFlags::empty())
//!         .results()
//!         .await?;
//!
//!     let results = engine
//!         .query(eth0, Action::Read, None, QueryFlags::empty())
//!         .results()
//!         .await?;
//!     assert_eq!(results[0].records.len(), 1);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`trellis_core`] - path expressions, schema, key values and actions
//! - [`trellis_engine`] - registry, shard tables, dispatch and the
//!   transaction coordinator
//!
//! ## Transactions
//!
//! | Phase | What members see | Failure means |
//! |-------|------------------|---------------|
//! | PREPARE | `prepare` per query, block by block | ABORT |
//! | PRECOMMIT | `precommit` once per touched member | ABORT |
//! | COMMIT | `commit` once per touched member | FAILED, `recover` |
//! | ABORT | `abort` once per touched member | nothing further |
//!
//! ## Sharding
//!
//! A table registration (one whose last segment is wildcard) may carry a
//! [`ShardDetail`](trellis_engine::ShardDetail). Queries that name a concrete
//! key at the table's wildcard segment then reach only the members bound to
//! that key's chunk, falling back to the default pool.

pub use trellis_core as core;
pub use trellis_engine as engine;

/// Prelude module for convenient imports.
///
/// ```rust
/// use trellis::prelude::*;
/// ```
pub mod prelude {
    // Paths and values
    pub use trellis_core::{
        matches, overlaps, prefix_of, Action, KeyType, KeyValue, PathSpec, QueryFlags, Schema,
        SchemaBuilder, Segment,
    };

    // Errors
    pub use trellis_core::{CoreError, CoreResult};
    pub use trellis_engine::{EngineError, EngineResult};

    // Engine and configuration
    pub use trellis_engine::{Engine, EngineConfig};

    // Members
    pub use trellis_engine::{
        Capabilities, Member, MemberCallbacks, MemberId, PrepareContext, PrepareStatus,
        QueryHandle, RegistrationHandle, Vote,
    };

    // Transactions
    pub use trellis_engine::{
        AbortReason, AbortStatus, FailureReport, Query, QueryResult, ResultStatus,
        TransactionHandle, TransactionOutcome, TxnId, TxnState,
    };

    // Sharding
    pub use trellis_engine::{ChunkCount, ChunkId, KeyDetail, ShardDetail, ShardKind, ShardTable};

    // Clients
    pub use trellis_engine::{LoaderPhase, LoaderPlan, SchemaLoader};
}

/// Version information.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
