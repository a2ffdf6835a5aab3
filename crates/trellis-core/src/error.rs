//! Error types for path compilation.
//!
//! Routing and malformed-input errors are returned synchronously to the
//! caller; nothing here ever enters a transaction.

use std::error::Error;
use std::fmt;

/// Result type for core operations.
pub type CoreResult<T> = std::result::Result<T, CoreError>;

/// Errors raised while building or compiling path specifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// The expression is syntactically invalid or does not agree with the schema.
    MalformedPath {
        /// The offending expression (or its rendering, for built paths).
        expr: String,
        /// What was wrong with it.
        reason: String,
    },
}

impl CoreError {
    /// Build a `MalformedPath` error.
    pub fn malformed(expr: impl Into<String>, reason: impl Into<String>) -> Self {
        CoreError::MalformedPath {
            expr: expr.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::MalformedPath { expr, reason } => {
                write!(f, "Malformed path '{}': {}", expr, reason)
            }
        }
    }
}

impl Error for CoreError {}
