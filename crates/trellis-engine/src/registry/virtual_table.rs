//! Engine-side storage for code-free members.
//!
//! Writes are staged per transaction during PREPARE and applied at COMMIT;
//! ABORT discards them. Reads inside a transaction see that transaction's own
//! staged writes. A query that touches nothing held here is answered NA and
//! changes nothing.
//!
//! Every committed entry carries a version. A transaction remembers the
//! version of each entry it wrote as seen at PREPARE, and PRECOMMIT votes
//! NOT_OK if any of them moved since. A successful PRECOMMIT claims the
//! written entries until COMMIT or ABORT, so two transactions that both
//! staged the same entry can never both commit.

use crate::member::{MemberCallbacks, PrepareContext, PrepareStatus, Vote};
use crate::types::{Query, TxnId};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;
use trellis_core::{matches, prefix_of, Action, PathSpec, QueryFlags};

#[derive(Debug, Clone)]
enum StagedWrite {
    Put(PathSpec, Value),
    Remove(PathSpec),
}

impl StagedWrite {
    fn path(&self) -> &PathSpec {
        match self {
            StagedWrite::Put(path, _) | StagedWrite::Remove(path) => path,
        }
    }
}

#[derive(Debug, Default)]
struct Staged {
    writes: Vec<StagedWrite>,
    /// Committed version of each written entry when this transaction first
    /// wrote it; `None` when the entry did not exist.
    seen: HashMap<PathSpec, Option<u64>>,
}

#[derive(Debug, Default)]
struct Ledger {
    versions: HashMap<PathSpec, u64>,
    next_version: u64,
    /// Entries held by a transaction between PRECOMMIT and COMMIT/ABORT.
    claims: HashMap<PathSpec, TxnId>,
}

impl Ledger {
    fn version(&self, path: &PathSpec) -> Option<u64> {
        self.versions.get(path).copied()
    }

    fn record(&mut self, write: &StagedWrite) {
        match write {
            StagedWrite::Put(path, _) => {
                self.next_version += 1;
                self.versions.insert(path.clone(), self.next_version);
            }
            StagedWrite::Remove(path) => {
                self.versions.remove(path);
            }
        }
    }

    fn release(&mut self, txn: TxnId) {
        self.claims.retain(|_, owner| *owner != txn);
    }
}

/// In-memory entry store keyed by concrete paths.
#[derive(Debug, Default)]
pub struct VirtualTable {
    data: RwLock<BTreeMap<PathSpec, Value>>,
    staged: Mutex<HashMap<TxnId, Staged>>,
    ledger: Mutex<Ledger>,
}

impl VirtualTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed value at `path`.
    pub fn get(&self, path: &PathSpec) -> Option<Value> {
        self.data.read().get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Committed entries in path order.
    pub fn entries(&self) -> Vec<(PathSpec, Value)> {
        self.data
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn has_staged(&self, txn: TxnId) -> bool {
        self.staged.lock().contains_key(&txn)
    }

    /// `committed` with `txn`'s staged writes applied on top.
    fn view(&self, committed: &BTreeMap<PathSpec, Value>, txn: TxnId) -> BTreeMap<PathSpec, Value> {
        let mut view = committed.clone();
        if let Some(staged) = self.staged.lock().get(&txn) {
            apply(&mut view, &staged.writes);
        }
        view
    }

    /// Must run while the committed data is read-locked, so the recorded
    /// versions belong to the data the writes were computed from.
    fn stage(&self, txn: TxnId, writes: Vec<StagedWrite>) {
        let mut staged = self.staged.lock();
        let entry = staged.entry(txn).or_default();
        let ledger = self.ledger.lock();
        for write in &writes {
            entry
                .seen
                .entry(write.path().clone())
                .or_insert_with(|| ledger.version(write.path()));
        }
        entry.writes.extend(writes);
    }

    fn execute(&self, txn: TxnId, query: &Query) -> Outcome {
        let committed = self.data.read();
        let view = self.view(&committed, txn);
        let hits: Vec<(&PathSpec, &Value)> = view
            .iter()
            .filter(|(path, _)| within(path, &query.path))
            .collect();

        match query.action {
            Action::Rpc => Outcome::NotApplicable,
            Action::Read => {
                if hits.is_empty() {
                    return Outcome::NotApplicable;
                }
                let keyonly = query.flags.contains(QueryFlags::KEYONLY);
                Outcome::Records(
                    hits.into_iter()
                        .map(|(path, value)| {
                            (path.clone(), if keyonly { None } else { Some(value.clone()) })
                        })
                        .collect(),
                )
            }
            Action::Create => {
                if !query.path.is_concrete() {
                    return Outcome::Reject(format!("CREATE needs a concrete path, got {}", query.path));
                }
                if view.contains_key(&query.path) {
                    return Outcome::Reject(format!("entry {} already exists", query.path));
                }
                let value = query.payload.clone().unwrap_or(Value::Null);
                self.stage(txn, vec![StagedWrite::Put(query.path.clone(), value)]);
                Outcome::Records(vec![(query.path.clone(), None)])
            }
            Action::Update => {
                let payload = query.payload.clone().unwrap_or(Value::Null);
                let replace = query.flags.contains(QueryFlags::REPLACE);
                let targets: Vec<(PathSpec, Option<Value>)> = if query.path.is_concrete() {
                    vec![(query.path.clone(), view.get(&query.path).cloned())]
                } else {
                    hits.iter()
                        .filter(|(path, _)| path.len() == query.path.len())
                        .map(|(path, value)| ((*path).clone(), Some((*value).clone())))
                        .collect()
                };
                if targets.is_empty() {
                    return Outcome::NotApplicable;
                }
                let mut writes = Vec::with_capacity(targets.len());
                let mut touched = Vec::with_capacity(targets.len());
                for (path, current) in targets {
                    let next = match current {
                        Some(current) if !replace => merge(current, &payload),
                        _ => payload.clone(),
                    };
                    touched.push((path.clone(), None));
                    writes.push(StagedWrite::Put(path, next));
                }
                self.stage(txn, writes);
                Outcome::Records(touched)
            }
            Action::Delete => {
                if hits.is_empty() {
                    return Outcome::NotApplicable;
                }
                let paths: Vec<PathSpec> = hits.into_iter().map(|(p, _)| p.clone()).collect();
                self.stage(
                    txn,
                    paths.iter().cloned().map(StagedWrite::Remove).collect(),
                );
                Outcome::Records(paths.into_iter().map(|p| (p, None)).collect())
            }
        }
    }
}

enum Outcome {
    Records(Vec<(PathSpec, Option<Value>)>),
    NotApplicable,
    Reject(String),
}

/// `entry` is addressed by `query` exactly or lies in its subtree.
fn within(entry: &PathSpec, query: &PathSpec) -> bool {
    if entry.len() == query.len() {
        matches(entry, query)
    } else {
        prefix_of(query, entry)
    }
}

/// Shallow object merge; non-objects are replaced.
fn merge(current: Value, patch: &Value) -> Value {
    match (current, patch) {
        (Value::Object(mut base), Value::Object(patch)) => {
            for (k, v) in patch {
                base.insert(k.clone(), v.clone());
            }
            Value::Object(base)
        }
        (_, patch) => patch.clone(),
    }
}

fn apply(data: &mut BTreeMap<PathSpec, Value>, writes: &[StagedWrite]) {
    for write in writes {
        match write {
            StagedWrite::Put(path, value) => {
                data.insert(path.clone(), value.clone());
            }
            StagedWrite::Remove(path) => {
                data.remove(path);
            }
        }
    }
}

#[async_trait]
impl MemberCallbacks for VirtualTable {
    async fn prepare(&self, ctx: &PrepareContext) -> PrepareStatus {
        match self.execute(ctx.txn(), ctx.query()) {
            Outcome::NotApplicable => PrepareStatus::NotApplicable,
            Outcome::Reject(reason) => PrepareStatus::NotOk(reason),
            Outcome::Records(records) => {
                let handle = ctx.handle();
                for (path, payload) in records {
                    handle.respond(path, payload.into_iter().collect(), true);
                }
                handle.done();
                PrepareStatus::Ok
            }
        }
    }

    async fn precommit(&self, txn: TxnId) -> Vote {
        let staged = self.staged.lock();
        let Some(mine) = staged.get(&txn) else {
            return Vote::Ok;
        };
        let mut ledger = self.ledger.lock();
        for (path, seen) in &mine.seen {
            if let Some(owner) = ledger.claims.get(path).filter(|owner| **owner != txn) {
                debug!("{} lost {} to {}", txn, path, owner);
                return Vote::NotOk(format!("entry {} is being committed by {}", path, owner));
            }
            if ledger.version(path) != *seen {
                debug!("{} saw a stale {}", txn, path);
                return Vote::NotOk(format!("entry {} changed since PREPARE", path));
            }
        }
        for path in mine.seen.keys() {
            ledger.claims.insert(path.clone(), txn);
        }
        Vote::Ok
    }

    async fn commit(&self, txn: TxnId) -> Vote {
        let staged = self.staged.lock().remove(&txn);
        let mut data = self.data.write();
        let mut ledger = self.ledger.lock();
        if let Some(staged) = staged {
            apply(&mut data, &staged.writes);
            for write in &staged.writes {
                ledger.record(write);
            }
        }
        ledger.release(txn);
        Vote::Ok
    }

    async fn abort(&self, txn: TxnId) {
        self.staged.lock().remove(&txn);
        self.ledger.lock().release(txn);
    }
}
