//! # Trellis Core
//!
//! Leaf value types for the Trellis transactional publish/subscribe data plane.
//!
//! Everything the routing and coordination layers operate on lives here:
//!
//! - **PathSpec**: an immutable, compiled hierarchical key path with optional wildcards
//! - **Schema**: the registered element tree path expressions are checked against
//! - **KeyValue**: a typed key field value (integer or string)
//! - **Action** / **QueryFlags**: what a query does and the adverbs modifying it
//!
//! ## Quick Start
//!
//! ```rust
//! use trellis_core::prelude::*;
//!
//! let schema = Schema::builder()
//!     .element("/config/interface", &[("name", KeyType::Str)])
//!     .build();
//!
//! let pattern = schema.compile("/config/interface[*]").unwrap();
//! let entry = schema.compile("/config/interface[name='eth0']").unwrap();
//! assert!(matches(&entry, &pattern));
//! ```

pub mod error;
pub mod pathspec;
pub mod prelude;
pub mod schema;
pub mod types;

pub use error::{CoreError, CoreResult};
pub use pathspec::{matches, overlaps, prefix_of, KeyMatch, PathSpec, Segment};
pub use schema::{ElementDef, KeyField, Schema, SchemaBuilder};
pub use types::{Action, KeyType, KeyValue, QueryFlags};
