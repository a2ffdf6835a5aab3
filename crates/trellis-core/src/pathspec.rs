//! Compiled hierarchical key paths.
//!
//! A `PathSpec` is an ordered list of segments. Each segment names a schema
//! element and carries zero or more key fields, each bound to a concrete
//! value or marked wildcard. Path specs are immutable; cloning one only bumps
//! a reference count.
//!
//! Expression syntax:
//!
//! ```text
//! /config/interface[name='eth0']/address[ip='10.0.0.1'][prefix=24]
//! /config/interface[*]            all keys wildcard
//! /config/interface[name=*]       one key wildcard
//! ```

use crate::error::{CoreError, CoreResult};
use crate::types::KeyValue;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// A key field's binding within a segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyMatch {
    Value(KeyValue),
    Wildcard,
}

impl KeyMatch {
    pub fn is_wildcard(&self) -> bool {
        matches!(self, KeyMatch::Wildcard)
    }

    pub fn value(&self) -> Option<&KeyValue> {
        match self {
            KeyMatch::Value(v) => Some(v),
            KeyMatch::Wildcard => None,
        }
    }
}

/// One element of a path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Segment {
    name: String,
    keys: Vec<(String, KeyMatch)>,
    /// `[*]` without a schema: every key is wildcard, key names unknown.
    any_keys: bool,
}

impl Segment {
    /// A segment with no key fields (a container).
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            keys: Vec::new(),
            any_keys: false,
        }
    }

    /// A segment whose key fields are all wildcard, whatever they are.
    pub fn any(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            keys: Vec::new(),
            any_keys: true,
        }
    }

    /// Add a concrete key field.
    pub fn with_key(mut self, name: impl Into<String>, value: impl Into<KeyValue>) -> Self {
        self.keys.push((name.into(), KeyMatch::Value(value.into())));
        self
    }

    /// Add a wildcard key field.
    pub fn with_wildcard(mut self, name: impl Into<String>) -> Self {
        self.keys.push((name.into(), KeyMatch::Wildcard));
        self
    }

    pub(crate) fn from_parts(name: String, keys: Vec<(String, KeyMatch)>, any_keys: bool) -> Self {
        Self {
            name,
            keys,
            any_keys,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn keys(&self) -> &[(String, KeyMatch)] {
        &self.keys
    }

    /// True when no key field is wildcard.
    pub fn is_concrete(&self) -> bool {
        !self.any_keys && self.keys.iter().all(|(_, k)| !k.is_wildcard())
    }

    /// True when at least one key field is wildcard.
    pub fn is_wildcard(&self) -> bool {
        !self.is_concrete()
    }

    /// The concrete key values of this segment, in key order.
    ///
    /// `None` if any key is wildcard.
    pub fn key_values(&self) -> Option<Vec<KeyValue>> {
        if !self.is_concrete() {
            return None;
        }
        Some(
            self.keys
                .iter()
                .filter_map(|(_, k)| k.value().cloned())
                .collect(),
        )
    }

    /// Whether `self`, read as a pattern, covers `other`.
    fn covers(&self, other: &Segment) -> bool {
        if self.name != other.name {
            return false;
        }
        if self.any_keys {
            return true;
        }
        if other.any_keys || self.keys.len() != other.keys.len() {
            return false;
        }
        self.keys
            .iter()
            .zip(other.keys.iter())
            .all(|((pn, pk), (cn, ck))| {
                pn == cn
                    && match (pk, ck) {
                        (KeyMatch::Wildcard, _) => true,
                        (KeyMatch::Value(p), KeyMatch::Value(c)) => p == c,
                        (KeyMatch::Value(_), KeyMatch::Wildcard) => false,
                    }
            })
    }

    /// Whether the two segments can address a common entry.
    fn compatible(&self, other: &Segment) -> bool {
        if self.name != other.name {
            return false;
        }
        if self.any_keys || other.any_keys {
            return true;
        }
        self.keys.len() == other.keys.len()
            && self
                .keys
                .iter()
                .zip(other.keys.iter())
                .all(|((an, ak), (bn, bk))| {
                    an == bn
                        && match (ak, bk) {
                            (KeyMatch::Value(a), KeyMatch::Value(b)) => a == b,
                            _ => true,
                        }
                })
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if self.any_keys {
            return write!(f, "[*]");
        }
        for (name, key) in &self.keys {
            match key {
                KeyMatch::Value(v) => write!(f, "[{}={}]", name, v)?,
                KeyMatch::Wildcard => write!(f, "[{}=*]", name)?,
            }
        }
        Ok(())
    }
}

/// Immutable compiled hierarchical key path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathSpec {
    segments: Arc<[Segment]>,
}

impl PathSpec {
    /// Build a path from segments.
    pub fn new(segments: Vec<Segment>) -> Self {
        Self {
            segments: segments.into(),
        }
    }

    /// Parse an expression without a schema.
    ///
    /// Bare integers become `Int` keys; quoted and other bare tokens become
    /// `Str` keys. Use [`crate::Schema::compile`] for typed, checked paths.
    pub fn parse(expr: &str) -> CoreResult<Self> {
        let raw = parse_raw(expr)?;
        let segments = raw
            .into_iter()
            .map(|seg| {
                if seg.preds.iter().any(|p| matches!(p, RawPred::All)) {
                    if seg.preds.len() != 1 {
                        return Err(CoreError::malformed(
                            expr,
                            format!("'{}' mixes [*] with key predicates", seg.name),
                        ));
                    }
                    return Ok(Segment::any(seg.name));
                }
                let keys = seg
                    .preds
                    .into_iter()
                    .filter_map(|p| match p {
                        RawPred::Key(name, value) => Some((name, value.untyped())),
                        RawPred::All => None,
                    })
                    .collect();
                Ok(Segment::from_parts(seg.name, keys, false))
            })
            .collect::<CoreResult<Vec<_>>>()?;
        Ok(Self::new(segments))
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn segment(&self, index: usize) -> Option<&Segment> {
        self.segments.get(index)
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// True when every key of every segment is bound.
    pub fn is_concrete(&self) -> bool {
        self.segments.iter().all(Segment::is_concrete)
    }

    /// Index of the first segment carrying a wildcard, if any.
    pub fn wildcard_depth(&self) -> Option<usize> {
        self.segments.iter().position(Segment::is_wildcard)
    }

    /// Registration paths end at a concrete entry or a single trailing
    /// wildcard segment.
    pub fn is_registrable(&self) -> bool {
        match self.wildcard_depth() {
            None => !self.is_empty(),
            Some(depth) => depth + 1 == self.len(),
        }
    }

    /// True when the last segment is the only wildcard one.
    pub fn is_table(&self) -> bool {
        self.is_registrable() && !self.is_concrete()
    }

    /// The first `depth` segments.
    pub fn truncate(&self, depth: usize) -> PathSpec {
        let depth = depth.min(self.len());
        Self::new(self.segments[..depth].to_vec())
    }

    /// This path with one more segment appended.
    pub fn join(&self, segment: Segment) -> PathSpec {
        let mut segments = self.segments.to_vec();
        segments.push(segment);
        Self::new(segments)
    }

    pub fn last(&self) -> Option<&Segment> {
        self.segments.last()
    }
}

impl fmt::Display for PathSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return write!(f, "/");
        }
        for segment in self.segments.iter() {
            write!(f, "/{}", segment)?;
        }
        Ok(())
    }
}

impl FromStr for PathSpec {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        PathSpec::parse(s)
    }
}

impl Serialize for PathSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PathSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let expr = String::deserialize(deserializer)?;
        PathSpec::parse(&expr).map_err(serde::de::Error::custom)
    }
}

/// Whether a concrete `candidate` is matched by `pattern`.
///
/// Both paths must have the same depth. A candidate carrying wildcards never
/// matches.
pub fn matches(candidate: &PathSpec, pattern: &PathSpec) -> bool {
    candidate.is_concrete()
        && candidate.len() == pattern.len()
        && pattern
            .segments()
            .iter()
            .zip(candidate.segments())
            .all(|(p, c)| p.covers(c))
}

/// Whether `a` addresses an ancestor of (or the same subtree as) `b`.
pub fn prefix_of(a: &PathSpec, b: &PathSpec) -> bool {
    a.len() <= b.len()
        && a
            .segments()
            .iter()
            .zip(b.segments())
            .all(|(x, y)| x.covers(y))
}

/// Whether `a` and `b` can address a common subtree.
///
/// Only the shared prefix is compared; wildcards on either side match.
pub fn overlaps(a: &PathSpec, b: &PathSpec) -> bool {
    a.segments()
        .iter()
        .zip(b.segments())
        .all(|(x, y)| x.compatible(y))
}

pub(crate) struct RawSegment {
    pub name: String,
    pub preds: Vec<RawPred>,
}

pub(crate) enum RawPred {
    All,
    Key(String, RawValue),
}

pub(crate) enum RawValue {
    Quoted(String),
    Bare(String),
    Wildcard,
}

impl RawValue {
    fn untyped(self) -> KeyMatch {
        match self {
            RawValue::Wildcard => KeyMatch::Wildcard,
            RawValue::Quoted(s) => KeyMatch::Value(KeyValue::Str(s)),
            RawValue::Bare(s) => match s.parse::<i64>() {
                Ok(n) => KeyMatch::Value(KeyValue::Int(n)),
                Err(_) => KeyMatch::Value(KeyValue::Str(s)),
            },
        }
    }
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '-' | '_' | ':' | '.')
}

pub(crate) fn parse_raw(expr: &str) -> CoreResult<Vec<RawSegment>> {
    let err = |reason: String| CoreError::malformed(expr, reason);
    let chars: Vec<char> = expr.trim().chars().collect();
    if chars.is_empty() {
        return Err(err("empty path".to_string()));
    }

    let skip_ws = |pos: &mut usize| {
        while *pos < chars.len() && chars[*pos].is_whitespace() {
            *pos += 1;
        }
    };
    let read_name = |pos: &mut usize| -> String {
        let start = *pos;
        while *pos < chars.len() && is_name_char(chars[*pos]) {
            *pos += 1;
        }
        chars[start..*pos].iter().collect()
    };

    let mut pos = 0;
    let mut segments = Vec::new();
    while pos < chars.len() {
        if chars[pos] != '/' {
            return Err(err(format!("expected '/' at offset {}", pos)));
        }
        pos += 1;
        let name = read_name(&mut pos);
        if name.is_empty() {
            return Err(err(format!("empty segment name at offset {}", pos)));
        }

        let mut preds = Vec::new();
        while pos < chars.len() && chars[pos] == '[' {
            pos += 1;
            skip_ws(&mut pos);
            if chars.get(pos) == Some(&'*') {
                pos += 1;
                skip_ws(&mut pos);
                if chars.get(pos) != Some(&']') {
                    return Err(err(format!("expected ']' after '*' in '{}'", name)));
                }
                pos += 1;
                preds.push(RawPred::All);
                continue;
            }

            let key = read_name(&mut pos);
            if key.is_empty() {
                return Err(err(format!("missing key name in '{}'", name)));
            }
            skip_ws(&mut pos);
            if chars.get(pos) != Some(&'=') {
                return Err(err(format!("expected '=' after key '{}'", key)));
            }
            pos += 1;
            skip_ws(&mut pos);

            let value = match chars.get(pos) {
                Some(&quote) if quote == '\'' || quote == '"' => {
                    pos += 1;
                    let mut s = String::new();
                    loop {
                        match chars.get(pos) {
                            Some(&'\\') if pos + 1 < chars.len() => {
                                s.push(chars[pos + 1]);
                                pos += 2;
                            }
                            Some(&c) if c == quote => break,
                            Some(&c) if c != '\\' => {
                                s.push(c);
                                pos += 1;
                            }
                            _ => {
                                return Err(err(format!("unterminated string for key '{}'", key)))
                            }
                        }
                    }
                    pos += 1;
                    RawValue::Quoted(s)
                }
                Some(&'*') => {
                    pos += 1;
                    RawValue::Wildcard
                }
                _ => {
                    let start = pos;
                    while pos < chars.len() && chars[pos] != ']' && !chars[pos].is_whitespace() {
                        pos += 1;
                    }
                    let s: String = chars[start..pos].iter().collect();
                    if s.is_empty() {
                        return Err(err(format!("missing value for key '{}'", key)));
                    }
                    RawValue::Bare(s)
                }
            };

            skip_ws(&mut pos);
            if chars.get(pos) != Some(&']') {
                return Err(err(format!("unterminated key predicate in '{}'", name)));
            }
            pos += 1;
            preds.push(RawPred::Key(key, value));
        }

        segments.push(RawSegment { name, preds });
    }

    Ok(segments)
}
