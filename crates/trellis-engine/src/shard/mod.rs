//! Shard tables: which member owns which keys under a table registration.
//!
//! One `ShardTable` exists per wildcarded registration point. It maps the
//! key values at the wildcard segment to chunks and chunks to members.
//! Tables are only changed through binding queries executed inside
//! transactions (see [`router`]); everything here operates on a private copy.

pub mod router;

pub use router::{BindingOp, BindingRequest, NestingViolation, ShardRouter, BINDING_PATH};

use crate::member::Member;
use crate::types::*;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};
use trellis_core::{KeyValue, PathSpec};

/// How key values map to chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShardKind {
    /// The integer key is the chunk id.
    IdentityInt,
    /// Exact byte-key lookup.
    StringKey,
    /// Inclusive integer intervals.
    Range,
    /// `hash(key) mod chunk_count`.
    Hash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChunkCount {
    Fixed(u32),
    /// Chunks are allocated as members bind.
    Dynamic,
}

/// A key (or key range) a member binds to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyDetail {
    ByteKey(Vec<u8>),
    Range { first: i64, last: i64 },
}

impl KeyDetail {
    pub fn bytes(key: impl AsRef<[u8]>) -> Self {
        KeyDetail::ByteKey(key.as_ref().to_vec())
    }

    pub fn int(n: i64) -> Self {
        KeyDetail::ByteKey(n.to_string().into_bytes())
    }

    pub fn range(first: i64, last: i64) -> Self {
        KeyDetail::Range { first, last }
    }

    fn as_int(&self) -> Option<i64> {
        match self {
            KeyDetail::ByteKey(bytes) => std::str::from_utf8(bytes).ok()?.trim().parse().ok(),
            KeyDetail::Range { first, last } if first == last => Some(*first),
            KeyDetail::Range { .. } => None,
        }
    }
}

/// Sharding parameters carried by a table registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardDetail {
    pub kind: ShardKind,
    pub chunk_count: ChunkCount,
    #[serde(default)]
    pub keys: Vec<KeyDetail>,
    /// Join the table's default pool.
    #[serde(default)]
    pub default: bool,
    /// Enclosing registration point whose table must contain every member
    /// of this one.
    #[serde(default)]
    pub parent: Option<PathSpec>,
}

impl ShardDetail {
    pub fn new(kind: ShardKind, chunk_count: ChunkCount) -> Self {
        Self {
            kind,
            chunk_count,
            keys: Vec::new(),
            default: false,
            parent: None,
        }
    }

    pub fn with_key(mut self, key: KeyDetail) -> Self {
        self.keys.push(key);
        self
    }

    pub fn with_default(mut self) -> Self {
        self.default = true;
        self
    }

    pub fn with_parent(mut self, parent: PathSpec) -> Self {
        self.parent = Some(parent);
        self
    }
}

/// Where a key lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkResolution {
    Chunk(ChunkId),
    /// No explicit chunk: the default pool.
    Default,
}

#[derive(Debug, Clone)]
struct ChunkMember {
    member: Weak<Member>,
    id: MemberId,
    refs: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RangeEntry {
    first: i64,
    last: i64,
    chunk: ChunkId,
}

/// Key-to-member mapping for one registration point.
#[derive(Debug, Clone)]
pub struct ShardTable {
    point: PathSpec,
    kind: ShardKind,
    chunk_count: ChunkCount,
    chunks: BTreeMap<ChunkId, Vec<ChunkMember>>,
    strings: HashMap<Vec<u8>, ChunkId>,
    /// Sorted by `first`, never overlapping.
    ranges: Vec<RangeEntry>,
    default_pool: Vec<ChunkMember>,
    parent: Option<PathSpec>,
    version: u64,
    next_chunk: u32,
}

impl ShardTable {
    pub fn new(point: PathSpec, kind: ShardKind, chunk_count: ChunkCount) -> Self {
        Self {
            point,
            kind,
            chunk_count,
            chunks: BTreeMap::new(),
            strings: HashMap::new(),
            ranges: Vec::new(),
            default_pool: Vec::new(),
            parent: None,
            version: 0,
            next_chunk: 0,
        }
    }

    pub fn with_parent(mut self, parent: Option<PathSpec>) -> Self {
        self.parent = parent;
        self
    }

    pub fn point(&self) -> &PathSpec {
        &self.point
    }

    pub fn kind(&self) -> ShardKind {
        self.kind
    }

    pub fn chunk_count(&self) -> ChunkCount {
        self.chunk_count
    }

    pub fn parent(&self) -> Option<&PathSpec> {
        self.parent.as_ref()
    }

    /// Bumped on every committed update.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    /// Resolve the key values of the wildcard segment to a chunk.
    ///
    /// Deterministic for a given table version.
    pub fn resolve_chunk(&self, key: &[KeyValue]) -> ChunkResolution {
        let chunk = match self.kind {
            ShardKind::IdentityInt => key
                .first()
                .and_then(KeyValue::as_int)
                .and_then(|n| u32::try_from(n).ok())
                .map(ChunkId),
            ShardKind::StringKey => self.strings.get(&key_bytes(key)).copied(),
            ShardKind::Range => key.first().and_then(KeyValue::as_int).and_then(|n| {
                let idx = self.ranges.partition_point(|r| r.first <= n);
                let entry = self.ranges.get(idx.checked_sub(1)?)?;
                (n <= entry.last).then_some(entry.chunk)
            }),
            ShardKind::Hash => {
                let count = self.hash_modulus();
                (count > 0).then(|| {
                    let mut hasher = DefaultHasher::new();
                    key_bytes(key).hash(&mut hasher);
                    ChunkId((hasher.finish() % count as u64) as u32)
                })
            }
        };

        match chunk {
            Some(chunk) if self.chunks.get(&chunk).is_some_and(|m| !m.is_empty()) => {
                ChunkResolution::Chunk(chunk)
            }
            _ => ChunkResolution::Default,
        }
    }

    fn hash_modulus(&self) -> u32 {
        match self.chunk_count {
            ChunkCount::Fixed(n) => n,
            ChunkCount::Dynamic => self.chunks.keys().next_back().map_or(0, |c| c.0 + 1),
        }
    }

    /// Members owning a resolution. `Default` yields the whole default pool,
    /// whatever the action; an empty pool yields an empty list.
    pub fn members_for(&self, resolution: ChunkResolution) -> Vec<Arc<Member>> {
        let entries = match resolution {
            ChunkResolution::Chunk(chunk) => self.chunks.get(&chunk).map(Vec::as_slice),
            ChunkResolution::Default => Some(self.default_pool.as_slice()),
        };
        entries
            .unwrap_or_default()
            .iter()
            .filter_map(|e| e.member.upgrade())
            .collect()
    }

    /// Member ids owning a resolution.
    pub fn member_ids_for(&self, resolution: ChunkResolution) -> Vec<MemberId> {
        let entries = match resolution {
            ChunkResolution::Chunk(chunk) => self.chunks.get(&chunk).map(Vec::as_slice),
            ChunkResolution::Default => Some(self.default_pool.as_slice()),
        };
        entries
            .unwrap_or_default()
            .iter()
            .map(|e| e.id)
            .collect()
    }

    /// Whether `member` is bound anywhere in this table.
    pub fn contains_member(&self, member: MemberId) -> bool {
        self.default_pool.iter().any(|e| e.id == member)
            || self.chunks.values().flatten().any(|e| e.id == member)
    }

    /// Lowest chunk `member` is bound to.
    pub fn chunk_of(&self, member: MemberId) -> Option<ChunkId> {
        self.chunks
            .iter()
            .find(|(_, members)| members.iter().any(|e| e.id == member))
            .map(|(chunk, _)| *chunk)
    }

    /// Every member id bound in this table, sorted.
    pub fn member_ids(&self) -> Vec<MemberId> {
        let mut ids: Vec<MemberId> = self
            .chunks
            .values()
            .flatten()
            .chain(self.default_pool.iter())
            .map(|e| e.id)
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn chunk_ids(&self) -> Vec<ChunkId> {
        self.chunks.keys().copied().collect()
    }

    pub fn default_pool(&self) -> Vec<MemberId> {
        self.default_pool.iter().map(|e| e.id).collect()
    }

    /// Bind `member` to the chunk for `key`, allocating the chunk if needed.
    ///
    /// Re-binding the same member bumps its reference count.
    pub fn bind(&mut self, member: &Arc<Member>, key: &KeyDetail) -> EngineResult<ChunkId> {
        let chunk = self.chunk_for_bind(key)?;
        add_ref(self.chunks.entry(chunk).or_default(), member);
        Ok(chunk)
    }

    pub fn bind_default(&mut self, member: &Arc<Member>) {
        add_ref(&mut self.default_pool, member);
    }

    /// Drop one reference of `member` on the chunk for `key`.
    ///
    /// Returns false when the member was not bound there.
    pub fn unbind(&mut self, member: MemberId, key: &KeyDetail) -> bool {
        let Some(chunk) = self.chunk_for_key(key) else {
            return false;
        };
        let Some(members) = self.chunks.get_mut(&chunk) else {
            return false;
        };
        let removed = drop_ref(members, member);
        if members.is_empty() {
            self.forget_chunk(chunk);
        }
        removed
    }

    pub fn unbind_default(&mut self, member: MemberId) -> bool {
        drop_ref(&mut self.default_pool, member)
    }

    /// Remove every binding of `member`, whatever its reference counts.
    pub fn unbind_member(&mut self, member: MemberId) -> bool {
        let before = self.member_ids().len();
        self.default_pool.retain(|e| e.id != member);
        let mut emptied = Vec::new();
        for (chunk, members) in self.chunks.iter_mut() {
            members.retain(|e| e.id != member);
            if members.is_empty() {
                emptied.push(*chunk);
            }
        }
        for chunk in emptied {
            self.forget_chunk(chunk);
        }
        self.member_ids().len() != before
    }

    fn forget_chunk(&mut self, chunk: ChunkId) {
        self.chunks.remove(&chunk);
        self.strings.retain(|_, c| *c != chunk);
        self.ranges.retain(|r| r.chunk != chunk);
    }

    /// Existing chunk for `key`, without allocating.
    fn chunk_for_key(&self, key: &KeyDetail) -> Option<ChunkId> {
        match (self.kind, key) {
            (ShardKind::IdentityInt | ShardKind::Hash, _) => {
                key.as_int().and_then(|n| u32::try_from(n).ok()).map(ChunkId)
            }
            (ShardKind::StringKey, KeyDetail::ByteKey(bytes)) => self.strings.get(bytes).copied(),
            (ShardKind::Range, KeyDetail::Range { first, last }) => self
                .ranges
                .iter()
                .find(|r| r.first == *first && r.last == *last)
                .map(|r| r.chunk),
            _ => None,
        }
    }

    fn chunk_for_bind(&mut self, key: &KeyDetail) -> EngineResult<ChunkId> {
        match (self.kind, key) {
            (ShardKind::IdentityInt | ShardKind::Hash, _) => {
                let n = key
                    .as_int()
                    .and_then(|n| u32::try_from(n).ok())
                    .ok_or_else(|| self.conflict(format!("{:?} is not a chunk number", key)))?;
                if let ChunkCount::Fixed(count) = self.chunk_count {
                    if n >= count {
                        return Err(self.conflict(format!(
                            "chunk {} outside fixed count {}",
                            n, count
                        )));
                    }
                }
                Ok(ChunkId(n))
            }
            (ShardKind::StringKey, KeyDetail::ByteKey(bytes)) => {
                if let Some(chunk) = self.strings.get(bytes) {
                    return Ok(*chunk);
                }
                let chunk = self.allocate()?;
                self.strings.insert(bytes.clone(), chunk);
                Ok(chunk)
            }
            (ShardKind::Range, KeyDetail::Range { first, last }) => {
                let (first, last) = (*first, *last);
                if first > last {
                    return Err(self.conflict(format!("empty range [{}, {}]", first, last)));
                }
                if let Some(existing) = self
                    .ranges
                    .iter()
                    .find(|r| r.first <= last && first <= r.last)
                {
                    if existing.first == first && existing.last == last {
                        return Ok(existing.chunk);
                    }
                    return Err(self.conflict(format!(
                        "range [{}, {}] overlaps [{}, {}]",
                        first, last, existing.first, existing.last
                    )));
                }
                let chunk = self.allocate()?;
                let idx = self.ranges.partition_point(|r| r.first < first);
                self.ranges.insert(idx, RangeEntry { first, last, chunk });
                Ok(chunk)
            }
            (kind, key) => Err(self.conflict(format!("{:?} key {:?} does not fit", kind, key))),
        }
    }

    fn allocate(&mut self) -> EngineResult<ChunkId> {
        if let ChunkCount::Fixed(count) = self.chunk_count {
            if self.next_chunk >= count {
                return Err(self.conflict(format!("all {} chunks are allocated", count)));
            }
        }
        let chunk = ChunkId(self.next_chunk);
        self.next_chunk += 1;
        Ok(chunk)
    }

    fn conflict(&self, reason: String) -> EngineError {
        EngineError::ShardConflict {
            table: self.point.to_string(),
            reason,
        }
    }
}

fn add_ref(entries: &mut Vec<ChunkMember>, member: &Arc<Member>) {
    if let Some(entry) = entries.iter_mut().find(|e| e.id == member.id()) {
        entry.refs += 1;
        entry.member = Arc::downgrade(member);
        return;
    }
    entries.push(ChunkMember {
        member: Arc::downgrade(member),
        id: member.id(),
        refs: 1,
    });
    entries.sort_by_key(|e| e.id);
}

fn drop_ref(entries: &mut Vec<ChunkMember>, member: MemberId) -> bool {
    let Some(pos) = entries.iter().position(|e| e.id == member) else {
        return false;
    };
    entries[pos].refs -= 1;
    if entries[pos].refs == 0 {
        entries.remove(pos);
    }
    true
}

/// Byte key of a segment's key values; multiple keys are NUL-joined.
pub fn key_bytes(key: &[KeyValue]) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, value) in key.iter().enumerate() {
        if i > 0 {
            out.push(0);
        }
        out.extend(value.to_bytes());
    }
    out
}
