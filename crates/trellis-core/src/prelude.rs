//! Trellis Core Prelude: convenient imports for common usage.
//!
//! ```rust
//! use trellis_core::prelude::*;
//! ```

pub use crate::types::{Action, KeyType, KeyValue, QueryFlags};

pub use crate::pathspec::{matches, overlaps, prefix_of, KeyMatch, PathSpec, Segment};

pub use crate::schema::{Schema, SchemaBuilder};

pub use crate::error::{CoreError, CoreResult};
