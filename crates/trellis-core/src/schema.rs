//! Registered element tree used to compile path expressions.
//!
//! The schema only knows element names, their key fields and the key types.
//! Payload typing is the application's business.

use crate::error::{CoreError, CoreResult};
use crate::pathspec::{parse_raw, PathSpec, RawPred, RawSegment, RawValue, Segment};
use crate::types::{KeyType, KeyValue};
use std::collections::BTreeMap;

/// A key field declared on an element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyField {
    pub name: String,
    pub ty: KeyType,
}

/// An element of the schema tree.
#[derive(Debug, Clone, Default)]
pub struct ElementDef {
    pub keys: Vec<KeyField>,
    pub children: BTreeMap<String, ElementDef>,
}

impl ElementDef {
    /// Whether this element is a keyed list.
    pub fn is_list(&self) -> bool {
        !self.keys.is_empty()
    }

    fn bind(&self, expr: &str, seg: RawSegment) -> CoreResult<Segment> {
        let malformed = |reason: String| CoreError::malformed(expr, reason);

        if seg.preds.iter().any(|p| matches!(p, RawPred::All)) {
            if seg.preds.len() != 1 {
                return Err(malformed(format!(
                    "'{}' mixes [*] with key predicates",
                    seg.name
                )));
            }
            if !self.is_list() {
                return Err(malformed(format!("'{}' has no keys to wildcard", seg.name)));
            }
            return Ok(self.all_wildcard(seg.name));
        }

        // A keyed list addressed without keys means every entry.
        if seg.preds.is_empty() {
            return Ok(self.all_wildcard(seg.name));
        }

        if seg.preds.len() != self.keys.len() {
            return Err(malformed(format!(
                "'{}' expects {} key(s), got {}",
                seg.name,
                self.keys.len(),
                seg.preds.len()
            )));
        }

        let mut given: BTreeMap<String, RawValue> = BTreeMap::new();
        for pred in seg.preds {
            if let RawPred::Key(name, value) = pred {
                if !self.keys.iter().any(|k| k.name == name) {
                    return Err(malformed(format!(
                        "'{}' has no key named '{}'",
                        seg.name, name
                    )));
                }
                if given.insert(name.clone(), value).is_some() {
                    return Err(malformed(format!("key '{}' given twice", name)));
                }
            }
        }

        let mut segment = Segment::new(seg.name);
        for field in &self.keys {
            let Some(value) = given.remove(&field.name) else {
                return Err(malformed(format!("missing key '{}'", field.name)));
            };
            segment = match value {
                RawValue::Wildcard => segment.with_wildcard(field.name.clone()),
                RawValue::Quoted(s) | RawValue::Bare(s) => {
                    let typed = match field.ty {
                        KeyType::Str => KeyValue::Str(s),
                        KeyType::Int => KeyValue::Int(s.trim().parse().map_err(|_| {
                            malformed(format!(
                                "key '{}' expects an integer, got '{}'",
                                field.name, s
                            ))
                        })?),
                    };
                    segment.with_key(field.name.clone(), typed)
                }
            };
        }
        Ok(segment)
    }

    fn all_wildcard(&self, name: String) -> Segment {
        self.keys
            .iter()
            .fold(Segment::new(name), |seg, key| seg.with_wildcard(key.name.clone()))
    }
}

/// The registered element tree.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    roots: BTreeMap<String, ElementDef>,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    /// Compile an expression against this schema.
    ///
    /// Fails with `MalformedPath` when an element is unknown or the segment's
    /// key arity, key names or key types disagree with the schema.
    pub fn compile(&self, expr: &str) -> CoreResult<PathSpec> {
        let raw = parse_raw(expr)?;
        let mut level = &self.roots;
        let mut segments = Vec::with_capacity(raw.len());
        for seg in raw {
            let def = level.get(&seg.name).ok_or_else(|| {
                CoreError::malformed(expr, format!("unknown element '{}'", seg.name))
            })?;
            segments.push(def.bind(expr, seg)?);
            level = &def.children;
        }
        Ok(PathSpec::new(segments))
    }

    /// Look up an element by its plain name path (`/a/b/c`).
    pub fn element(&self, path: &str) -> Option<&ElementDef> {
        let mut level = &self.roots;
        let mut found = None;
        for name in path.split('/').filter(|s| !s.is_empty()) {
            let def = level.get(name)?;
            found = Some(def);
            level = &def.children;
        }
        found
    }
}

/// Incrementally declares elements.
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    schema: Schema,
}

impl SchemaBuilder {
    /// Declare the element at `path` (plain names, `/a/b/c`) with the given
    /// keys. Missing ancestors are declared as containers.
    pub fn element(mut self, path: &str, keys: &[(&str, KeyType)]) -> Self {
        let names: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let Some((last, ancestors)) = names.split_last() else {
            return self;
        };
        let mut level = &mut self.schema.roots;
        for name in ancestors {
            level = &mut level.entry(name.to_string()).or_default().children;
        }
        let leaf = level.entry(last.to_string()).or_default();
        leaf.keys = keys
            .iter()
            .map(|(name, ty)| KeyField {
                name: name.to_string(),
                ty: *ty,
            })
            .collect();
        self
    }

    pub fn build(self) -> Schema {
        self.schema
    }
}
