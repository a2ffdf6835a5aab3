//! Shard table ownership and transactional table updates.
//!
//! Every table lives behind an `ArcSwap`, so dispatch takes a snapshot once
//! and routes the whole query against it: a concurrent update is seen
//! entirely or not at all. Updates are binding queries (UPDATEs against
//! [`BINDING_PATH`]) answered by an internal [`BindingMember`]. During
//! PREPARE it takes the table's update lock and stages a private copy; the
//! copy is swapped in at COMMIT and dropped at ABORT. Holding the lock from
//! PREPARE to the end of the transaction serializes updates per table.

use super::{ChunkCount, KeyDetail, ShardKind, ShardTable};
use crate::member::{Member, MemberCallbacks, PrepareContext, PrepareStatus, Vote};
use crate::registry::MemberRegistry;
use crate::types::*;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info};
use trellis_core::{Action, PathSpec};

/// Reserved path the binding member is registered at.
pub const BINDING_PATH: &str = "/trellis-router/binding";

/// One change to a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BindingOp {
    Bind { member: MemberId, key: KeyDetail },
    BindDefault { member: MemberId },
    Unbind { member: MemberId, key: KeyDetail },
    UnbindDefault { member: MemberId },
    UnbindMember { member: MemberId },
}

/// Shape of a table, needed when the first binding creates it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableLayout {
    pub kind: ShardKind,
    pub chunk_count: ChunkCount,
    #[serde(default)]
    pub parent: Option<PathSpec>,
}

/// Payload of a binding query. All ops for one table travel in one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingRequest {
    pub table: PathSpec,
    #[serde(default)]
    pub layout: Option<TableLayout>,
    pub ops: Vec<BindingOp>,
}

impl BindingRequest {
    pub fn new(table: PathSpec) -> Self {
        Self {
            table,
            layout: None,
            ops: Vec::new(),
        }
    }

    pub fn with_layout(mut self, layout: TableLayout) -> Self {
        self.layout = Some(layout);
        self
    }

    pub fn op(mut self, op: BindingOp) -> Self {
        self.ops.push(op);
        self
    }

    fn members(&self) -> Vec<MemberId> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                BindingOp::Bind { member, .. } | BindingOp::BindDefault { member } => {
                    Some(*member)
                }
                _ => None,
            })
            .collect()
    }
}

/// A member bound in a nested table but missing from its parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NestingViolation {
    pub table: PathSpec,
    pub parent: PathSpec,
    pub member: MemberId,
}

/// Owns every shard table.
pub struct ShardRouter {
    tables: RwLock<HashMap<PathSpec, Arc<ArcSwap<ShardTable>>>>,
    locks: Mutex<HashMap<PathSpec, Arc<tokio::sync::Mutex<()>>>>,
}

impl ShardRouter {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Current committed table at `point`.
    pub fn snapshot(&self, point: &PathSpec) -> Option<Arc<ShardTable>> {
        self.tables.read().get(point).map(|slot| slot.load_full())
    }

    /// Snapshots of all tables, ordered by registration point.
    pub fn tables(&self) -> Vec<Arc<ShardTable>> {
        let mut all: Vec<Arc<ShardTable>> =
            self.tables.read().values().map(|s| s.load_full()).collect();
        all.sort_by(|a, b| a.point().cmp(b.point()));
        all
    }

    fn update_lock(&self, point: &PathSpec) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.locks.lock().entry(point.clone()).or_default())
    }

    /// Publish a new table version.
    fn install(&self, table: ShardTable) {
        let point = table.point().clone();
        let version = table.version();
        let mut tables = self.tables.write();
        match tables.get(&point) {
            Some(slot) => slot.store(Arc::new(table)),
            None => {
                tables.insert(point.clone(), Arc::new(ArcSwap::from_pointee(table)));
            }
        }
        info!("Installed shard table {} version {}", point, version);
    }

    /// Check that every member of a nested table is bound in its parent.
    pub fn validate_nesting(&self) -> Vec<NestingViolation> {
        let tables = self.tables();
        let mut violations = Vec::new();
        for table in &tables {
            let Some(parent_point) = table.parent() else {
                continue;
            };
            let parent = self.snapshot(parent_point);
            for member in table.member_ids() {
                let present = parent
                    .as_ref()
                    .is_some_and(|p| p.contains_member(member));
                if !present {
                    violations.push(NestingViolation {
                        table: table.point().clone(),
                        parent: parent_point.clone(),
                        member,
                    });
                }
            }
        }
        violations
    }
}

impl Default for ShardRouter {
    fn default() -> Self {
        Self::new()
    }
}

struct Staged {
    table: ShardTable,
    base_version: u64,
    _guard: OwnedMutexGuard<()>,
}

/// Internal member answering binding queries.
pub(crate) struct BindingMember {
    router: Arc<ShardRouter>,
    registry: Arc<tokio::sync::RwLock<MemberRegistry>>,
    staged: Mutex<HashMap<(TxnId, PathSpec), Staged>>,
}

impl BindingMember {
    pub(crate) fn new(
        router: Arc<ShardRouter>,
        registry: Arc<tokio::sync::RwLock<MemberRegistry>>,
    ) -> Self {
        Self {
            router,
            registry,
            staged: Mutex::new(HashMap::new()),
        }
    }

    async fn stage(&self, txn: TxnId, request: BindingRequest) -> EngineResult<Vec<ChunkId>> {
        let members = {
            let registry = self.registry.read().await;
            let mut found: HashMap<MemberId, Arc<Member>> = HashMap::new();
            for id in request.members() {
                let member = registry.member(id).ok_or(EngineError::MemberNotFound(id))?;
                found.insert(id, member);
            }
            found
        };

        let key = (txn, request.table.clone());
        let existing = self.staged.lock().remove(&key);
        let mut staged = match existing {
            Some(staged) => staged,
            None => {
                let guard = self.router.update_lock(&request.table).lock_owned().await;
                let base = self.router.snapshot(&request.table);
                let base_version = base.as_ref().map_or(0, |t| t.version());
                let table = match (base, &request.layout) {
                    (Some(current), Some(layout)) if current.kind() != layout.kind => {
                        return Err(EngineError::ShardConflict {
                            table: request.table.to_string(),
                            reason: format!(
                                "table is {:?}, binding asks for {:?}",
                                current.kind(),
                                layout.kind
                            ),
                        });
                    }
                    (Some(current), _) => (*current).clone(),
                    (None, Some(layout)) => {
                        ShardTable::new(request.table.clone(), layout.kind, layout.chunk_count)
                            .with_parent(layout.parent.clone())
                    }
                    (None, None) => {
                        return Err(EngineError::ShardTableNotFound(request.table.to_string()))
                    }
                };
                Staged {
                    table,
                    base_version,
                    _guard: guard,
                }
            }
        };

        let mut working = staged.table.clone();
        let result = apply_ops(&mut working, &request.ops, &members);
        if result.is_ok() {
            staged.table = working;
        }
        self.staged.lock().insert(key, staged);
        result
    }
}

fn apply_ops(
    table: &mut ShardTable,
    ops: &[BindingOp],
    members: &HashMap<MemberId, Arc<Member>>,
) -> EngineResult<Vec<ChunkId>> {
    let lookup = |id: &MemberId| members.get(id).ok_or(EngineError::MemberNotFound(*id));
    let mut chunks = Vec::new();
    for op in ops {
        match op {
            BindingOp::Bind { member, key } => chunks.push(table.bind(lookup(member)?, key)?),
            BindingOp::BindDefault { member } => table.bind_default(lookup(member)?),
            BindingOp::Unbind { member, key } => {
                table.unbind(*member, key);
            }
            BindingOp::UnbindDefault { member } => {
                table.unbind_default(*member);
            }
            BindingOp::UnbindMember { member } => {
                table.unbind_member(*member);
            }
        }
    }
    Ok(chunks)
}

#[async_trait]
impl MemberCallbacks for BindingMember {
    async fn prepare(&self, ctx: &PrepareContext) -> PrepareStatus {
        let query = ctx.query();
        if query.action != Action::Update {
            return PrepareStatus::NotApplicable;
        }
        let request: BindingRequest = match query
            .payload
            .clone()
            .map(serde_json::from_value::<BindingRequest>)
        {
            Some(Ok(request)) => request,
            Some(Err(e)) => return PrepareStatus::NotOk(format!("bad binding request: {}", e)),
            None => return PrepareStatus::NotOk("binding request has no payload".into()),
        };

        let table = request.table.clone();
        match self.stage(ctx.txn(), request).await {
            Ok(chunks) => {
                debug!("Staged binding update of {} in {}", table, ctx.txn());
                let chunks: Vec<u32> = chunks.iter().map(ChunkId::as_u32).collect();
                ctx.handle()
                    .respond(query.path.clone(), vec![json!({ "chunks": chunks })], false);
                PrepareStatus::Ok
            }
            Err(e) => PrepareStatus::NotOk(e.to_string()),
        }
    }

    async fn commit(&self, txn: TxnId) -> Vote {
        let staged: Vec<Staged> = {
            let mut all = self.staged.lock();
            let keys: Vec<(TxnId, PathSpec)> =
                all.keys().filter(|(t, _)| *t == txn).cloned().collect();
            keys.iter().filter_map(|k| all.remove(k)).collect()
        };
        for Staged {
            mut table,
            base_version,
            _guard,
        } in staged
        {
            table.set_version(base_version + 1);
            self.router.install(table);
        }
        Vote::Ok
    }

    async fn abort(&self, txn: TxnId) {
        self.staged.lock().retain(|(t, _), _| *t != txn);
    }
}
