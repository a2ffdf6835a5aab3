//! The engine context.
//!
//! An `Engine` owns a registry, a shard router, a dispatcher and a
//! transaction coordinator. Several engines can coexist in one process;
//! nothing here is global.

use crate::config::EngineConfig;
use crate::coordinator::{TransactionCoordinator, TransactionHandle};
use crate::dispatch::QueryDispatcher;
use crate::member::{Member, MemberCallbacks};
use crate::registry::{MemberRegistry, Registration, RegistrationHandle, RESERVED_ROOT};
use crate::shard::router::{BindingMember, TableLayout};
use crate::shard::{
    BindingOp, BindingRequest, KeyDetail, NestingViolation, ShardDetail, ShardRouter, ShardTable,
    BINDING_PATH,
};
use crate::types::*;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use trellis_core::{Action, PathSpec, QueryFlags, Segment};

/// Transactional pub/sub engine.
///
/// # Example
///
/// ```rust,ignore
/// use trellis_engine::{Engine, EngineConfig, Capabilities};
/// use trellis_core::{Action, PathSpec, QueryFlags, Segment};
///
/// let engine = Engine::new(EngineConfig::default());
/// let store = engine.connect("mem://store", None).await;
/// let path = PathSpec::parse("/config/interface[*]")?;
/// engine.register(&store, path, Capabilities::PUBLISHER, None).await?;
///
/// let entry = PathSpec::parse("/config/interface[name='eth0']")?;
/// let txn = engine.query(entry, Action::Create, Some(json!({"mtu": 1500})), QueryFlags::empty());
/// let results = txn.results().await?;
/// ```
pub struct Engine {
    config: EngineConfig,
    registry: Arc<RwLock<MemberRegistry>>,
    router: Arc<ShardRouter>,
    dispatcher: Arc<QueryDispatcher>,
    coordinator: TransactionCoordinator,
    binding_path: PathSpec,
    next_member: AtomicU64,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let router = Arc::new(ShardRouter::new());
        let registry = Arc::new(RwLock::new(MemberRegistry::new()));

        // Member 0 answers shard table updates.
        let binding_path = PathSpec::new(vec![
            Segment::new(RESERVED_ROOT),
            Segment::new("binding"),
        ]);
        debug_assert_eq!(binding_path.to_string(), BINDING_PATH);
        let binding = Arc::new(Member::new(
            MemberId(0),
            "internal://binding".into(),
            Arc::new(BindingMember::new(Arc::clone(&router), Arc::clone(&registry))),
        ));
        // Nobody else holds the lock yet.
        if let Ok(mut guard) = registry.try_write() {
            guard.add_member(Arc::clone(&binding));
            if let Err(e) =
                guard.register_internal(&binding, binding_path.clone(), Capabilities::PUBLISHER, None)
            {
                warn!("Failed to register binding member: {}", e);
            }
        }

        let dispatcher = Arc::new(QueryDispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&router),
        ));
        let coordinator = TransactionCoordinator::new(Arc::clone(&dispatcher), config.clone());

        Self {
            config,
            registry,
            router,
            dispatcher,
            coordinator,
            binding_path,
            next_member: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<QueryDispatcher> {
        &self.dispatcher
    }

    pub fn router(&self) -> &Arc<ShardRouter> {
        &self.router
    }

    /// Connect a member. Without callbacks the member is code-free and
    /// served from engine-side storage.
    pub async fn connect(
        &self,
        address: impl Into<String>,
        callbacks: Option<Arc<dyn MemberCallbacks>>,
    ) -> Arc<Member> {
        let id = MemberId(self.next_member.fetch_add(1, Ordering::SeqCst));
        let address = address.into();
        let member = Arc::new(match callbacks {
            Some(callbacks) => Member::new(id, address, callbacks),
            None => Member::code_free(id, address),
        });
        self.registry.write().await.add_member(Arc::clone(&member));
        member
    }

    /// Register `member` at `path`.
    ///
    /// With shard detail the member's keys (and default-pool membership) are
    /// bound in the table at `path` through a binding transaction; if that
    /// fails the registration is rolled back.
    pub async fn register(
        &self,
        member: &Arc<Member>,
        path: PathSpec,
        flags: Capabilities,
        shard: Option<ShardDetail>,
    ) -> EngineResult<RegistrationHandle> {
        let registered =
            self.registry
                .write()
                .await
                .register(member, path.clone(), flags, shard.clone())?;
        let handle = registered.handle;

        if let (Some(detail), true) = (shard, registered.created) {
            let mut request = BindingRequest::new(path.clone()).with_layout(TableLayout {
                kind: detail.kind,
                chunk_count: detail.chunk_count,
                parent: detail.parent.clone(),
            });
            for key in &detail.keys {
                request = request.op(BindingOp::Bind {
                    member: member.id(),
                    key: key.clone(),
                });
            }
            if detail.default {
                request = request.op(BindingOp::BindDefault {
                    member: member.id(),
                });
            }
            if let Err(e) = self.apply_binding(request).await {
                let _ = self.registry.write().await.deregister(&handle);
                return Err(e);
            }
        }

        info!("{} registered at {}", member.id(), path);
        Ok(handle)
    }

    /// Drop one reference of a registration. When the last reference goes
    /// the member's bindings in that table are removed.
    pub async fn deregister(&self, handle: &RegistrationHandle) -> EngineResult<()> {
        let removed = self.registry.write().await.deregister(handle)?;
        if let Some(registration) = removed {
            self.unbind_registration(&registration).await;
            info!("{} deregistered from {}", handle.member, handle.path);
        }
        Ok(())
    }

    /// Remove every member connected from `address`. Their in-flight
    /// deliveries bounce as timeouts. Returns the removed member ids.
    pub async fn deregister_peer(&self, address: &str) -> Vec<MemberId> {
        let (ids, removed) = {
            let mut registry = self.registry.write().await;
            let ids = registry.members_at(address);
            let removed: Vec<Arc<Registration>> = ids
                .iter()
                .flat_map(|id| registry.remove_member(*id))
                .collect();
            (ids, removed)
        };
        for registration in &removed {
            self.unbind_registration(registration).await;
        }
        if !ids.is_empty() {
            info!("Dropped peer {} ({} members)", address, ids.len());
        }
        ids
    }

    pub async fn heartbeat(&self, member: &Member) -> EngineResult<()> {
        self.registry.read().await.heartbeat(member.id())
    }

    /// Drop members whose last heartbeat is older than the configured
    /// timeout. Returns the expired member ids.
    pub async fn expire_peers(&self) -> Vec<MemberId> {
        let timeout = self.config.heartbeat_timeout();
        let expired: Vec<Arc<Member>> = {
            let registry = self.registry.read().await;
            registry
                .expired_members(timeout)
                .into_iter()
                .filter(|id| *id != MemberId(0))
                .filter_map(|id| registry.member(id))
                .collect()
        };
        let mut dropped = Vec::new();
        for member in expired {
            warn!("{} missed its heartbeat window", member.id());
            let removed = self.registry.write().await.remove_member(member.id());
            for registration in &removed {
                self.unbind_registration(registration).await;
            }
            dropped.push(member.id());
        }
        dropped
    }

    pub async fn registrations(&self) -> Vec<Arc<Registration>> {
        self.registry.read().await.registrations()
    }

    pub async fn member(&self, id: MemberId) -> Option<Arc<Member>> {
        self.registry.read().await.member(id)
    }

    /// Run a single query in its own transaction.
    pub fn query(
        &self,
        path: PathSpec,
        action: Action,
        payload: Option<Value>,
        flags: QueryFlags,
    ) -> TransactionHandle {
        let mut query = Query::new(action, path).with_flags(flags);
        query.payload = payload;
        self.coordinator.submit(vec![query])
    }

    /// Start a transaction to append blocks to.
    pub fn begin(&self) -> TransactionHandle {
        self.coordinator.begin()
    }

    /// Bind `member` to the chunk for `key` in the table at `table`.
    ///
    /// The member must hold a sharded registration at `table`.
    pub async fn add_member_binding(
        &self,
        table: &PathSpec,
        member: &Member,
        key: KeyDetail,
    ) -> EngineResult<ChunkId> {
        self.check_bindable(table, member).await?;
        let request = BindingRequest::new(table.clone()).op(BindingOp::Bind {
            member: member.id(),
            key,
        });
        let chunks = self.apply_binding(request).await?;
        chunks
            .first()
            .copied()
            .ok_or_else(|| EngineError::ShardTableNotFound(table.to_string()))
    }

    pub async fn remove_member_binding(
        &self,
        table: &PathSpec,
        member: &Member,
        key: KeyDetail,
    ) -> EngineResult<()> {
        let request = BindingRequest::new(table.clone()).op(BindingOp::Unbind {
            member: member.id(),
            key,
        });
        self.apply_binding(request).await.map(|_| ())
    }

    pub async fn add_default_binding(&self, table: &PathSpec, member: &Member) -> EngineResult<()> {
        self.check_bindable(table, member).await?;
        let request = BindingRequest::new(table.clone()).op(BindingOp::BindDefault {
            member: member.id(),
        });
        self.apply_binding(request).await.map(|_| ())
    }

    /// Committed table at a registration point.
    pub fn shard_table(&self, point: &PathSpec) -> Option<Arc<ShardTable>> {
        self.router.snapshot(point)
    }

    pub fn validate_nesting(&self) -> Vec<NestingViolation> {
        self.router.validate_nesting()
    }

    /// Only members routed through the table at `table` may be bound in it.
    async fn check_bindable(&self, table: &PathSpec, member: &Member) -> EngineResult<()> {
        if self.router.snapshot(table).is_none() {
            return Err(EngineError::ShardTableNotFound(table.to_string()));
        }
        let sharded = self
            .registry
            .read()
            .await
            .registrations()
            .iter()
            .any(|r| r.member.id() == member.id() && &r.path == table && r.is_sharded());
        if !sharded {
            return Err(EngineError::InvalidRegistration {
                path: table.to_string(),
                reason: format!("{} has no sharded registration here", member.id()),
            });
        }
        Ok(())
    }

    /// Run a binding request in its own transaction and return the chunks
    /// its bind ops landed on.
    async fn apply_binding(&self, request: BindingRequest) -> EngineResult<Vec<ChunkId>> {
        let table = request.table.to_string();
        if request.layout.is_none() && self.router.snapshot(&request.table).is_none() {
            return Err(EngineError::ShardTableNotFound(table));
        }
        let payload =
            serde_json::to_value(&request).map_err(|e| EngineError::Config(e.to_string()))?;
        let handle = self
            .coordinator
            .submit(vec![Query::update(self.binding_path.clone(), payload)]);

        match handle.wait().await {
            TransactionOutcome::Committed { results } => Ok(results
                .iter()
                .flat_map(|r| r.records.iter())
                .filter(|r| r.member == MemberId(0))
                .filter_map(|r| r.payload.as_ref()?.get("chunks")?.as_array().cloned())
                .flatten()
                .filter_map(|c| c.as_u64().map(|c| ChunkId(c as u32)))
                .collect()),
            TransactionOutcome::Aborted(reason) if reason.status == AbortStatus::Rejected => {
                Err(EngineError::ShardConflict {
                    table,
                    reason: reason.reason,
                })
            }
            TransactionOutcome::Aborted(reason) => Err(EngineError::Aborted {
                txn: handle.id(),
                reason: reason.to_string(),
            }),
            TransactionOutcome::Failed(report) => Err(EngineError::Inconsistent {
                txn: handle.id(),
                reason: report.to_string(),
            }),
        }
    }

    async fn unbind_registration(&self, registration: &Registration) {
        if !registration.is_sharded() || self.router.snapshot(&registration.path).is_none() {
            return;
        }
        let request = BindingRequest::new(registration.path.clone()).op(BindingOp::UnbindMember {
            member: registration.member.id(),
        });
        if let Err(e) = self.apply_binding(request).await {
            warn!(
                "Failed to unbind {} from {}: {}",
                registration.member.id(),
                registration.path,
                e
            );
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}
