//! Shared value types used across all Trellis crates.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A concrete, typed key field value.
///
/// Ordering puts all integers before all strings, which keeps mixed-type
/// key sets sortable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeyValue {
    Int(i64),
    Str(String),
}

impl KeyValue {
    /// Create a string key value.
    pub fn str(value: impl Into<String>) -> Self {
        KeyValue::Str(value.into())
    }

    /// Integer coercion: `Int` as-is, `Str` when it holds a decimal integer.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            KeyValue::Int(n) => Some(*n),
            KeyValue::Str(s) => s.trim().parse().ok(),
        }
    }

    /// Byte form used for string-keyed and hashed shard lookups.
    ///
    /// `Int(5)` and `Str("5")` share the byte key `b"5"`.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            KeyValue::Int(n) => n.to_string().into_bytes(),
            KeyValue::Str(s) => s.as_bytes().to_vec(),
        }
    }

    /// The declared type this value satisfies.
    pub fn key_type(&self) -> KeyType {
        match self {
            KeyValue::Int(_) => KeyType::Int,
            KeyValue::Str(_) => KeyType::Str,
        }
    }
}

impl From<i64> for KeyValue {
    fn from(n: i64) -> Self {
        KeyValue::Int(n)
    }
}

impl From<&str> for KeyValue {
    fn from(s: &str) -> Self {
        KeyValue::Str(s.to_string())
    }
}

impl From<String> for KeyValue {
    fn from(s: String) -> Self {
        KeyValue::Str(s)
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Int(n) => write!(f, "{}", n),
            KeyValue::Str(s) => {
                use fmt::Write;
                // Backslash escapes the quote character and itself.
                let quote = if s.contains('\'') && !s.contains('"') { '"' } else { '\'' };
                f.write_char(quote)?;
                for c in s.chars() {
                    if c == quote || c == '\\' {
                        f.write_char('\\')?;
                    }
                    f.write_char(c)?;
                }
                f.write_char(quote)
            }
        }
    }
}

/// Declared type of a key field in the schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyType {
    Int,
    Str,
}

/// What a query does to the data tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Create,
    Read,
    Update,
    Delete,
    /// Request/response call to a single registrant; not transactional.
    Rpc,
}

impl Action {
    /// Whether this action changes published data (and so is also delivered
    /// to subscribers).
    pub fn is_mutating(&self) -> bool {
        matches!(self, Action::Create | Action::Update | Action::Delete)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Create => write!(f, "CREATE"),
            Action::Read => write!(f, "READ"),
            Action::Update => write!(f, "UPDATE"),
            Action::Delete => write!(f, "DELETE"),
            Action::Rpc => write!(f, "RPC"),
        }
    }
}

bitflags::bitflags! {
    /// Query adverbs modifying default CRUD behavior.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct QueryFlags: u32 {
        /// Return keys only, no payloads.
        const KEYONLY = 1 << 0;
        /// Deliver to exactly one of the matching members.
        const ANYCAST = 1 << 1;
        /// UPDATE merges the payload into the existing object (the default).
        const MERGE = 1 << 2;
        /// UPDATE replaces the existing object.
        const REPLACE = 1 << 3;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_value_coercion() {
        assert_eq!(KeyValue::Int(7).as_int(), Some(7));
        assert_eq!(KeyValue::str("42").as_int(), Some(42));
        assert_eq!(KeyValue::str("eth0").as_int(), None);
    }

    #[test]
    fn test_key_value_bytes_shared_between_forms() {
        assert_eq!(KeyValue::Int(5).to_bytes(), KeyValue::str("5").to_bytes());
    }

    #[test]
    fn test_key_value_display() {
        assert_eq!(KeyValue::Int(-3).to_string(), "-3");
        assert_eq!(KeyValue::str("eth0").to_string(), "'eth0'");
        assert_eq!(KeyValue::str("it's").to_string(), "\"it's\"");
        assert_eq!(
            KeyValue::str("say \"it's\"").to_string(),
            r#"'say "it\'s"'"#
        );
        assert_eq!(KeyValue::str(r"C:\tmp").to_string(), r"'C:\\tmp'");
    }

    #[test]
    fn test_key_value_ordering() {
        let mut keys = vec![KeyValue::str("b"), KeyValue::Int(10), KeyValue::str("a"), KeyValue::Int(2)];
        keys.sort();
        assert_eq!(
            keys,
            vec![KeyValue::Int(2), KeyValue::Int(10), KeyValue::str("a"), KeyValue::str("b")]
        );
    }

    #[test]
    fn test_action_mutating() {
        assert!(Action::Create.is_mutating());
        assert!(Action::Delete.is_mutating());
        assert!(!Action::Read.is_mutating());
        assert!(!Action::Rpc.is_mutating());
        assert_eq!(Action::Update.to_string(), "UPDATE");
    }

    #[test]
    fn test_query_flags() {
        let flags = QueryFlags::KEYONLY | QueryFlags::ANYCAST;
        assert!(flags.contains(QueryFlags::ANYCAST));
        assert!(!flags.contains(QueryFlags::REPLACE));
        assert_eq!(QueryFlags::default(), QueryFlags::empty());
    }
}
