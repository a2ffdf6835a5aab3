//! Member registry: who publishes or subscribes where.
//!
//! Registrations are keyed by (path, member) and reference counted, so a
//! member registering the same path twice must deregister twice. Dispatch
//! clones the `Arc<Registration>`s it resolves, which keeps a registration
//! usable by in-flight queries after it is removed here.

mod virtual_table;

pub use virtual_table::VirtualTable;

use crate::member::Member;
use crate::shard::ShardDetail;
use crate::types::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use trellis_core::{overlaps, PathSpec};

/// Root element reserved for engine-internal members.
pub const RESERVED_ROOT: &str = "trellis-router";

/// One logical registration.
#[derive(Debug)]
pub struct Registration {
    pub id: RegistrationId,
    pub path: PathSpec,
    pub member: Arc<Member>,
    pub flags: Capabilities,
    pub shard: Option<ShardDetail>,
}

impl Registration {
    /// Whether this registration receives queries with `action`.
    pub fn accepts(&self, action: trellis_core::Action) -> bool {
        if action.is_mutating() {
            self.flags
                .intersects(Capabilities::PUBLISHER | Capabilities::SUBSCRIBER)
        } else {
            self.flags.contains(Capabilities::PUBLISHER)
        }
    }

    pub fn is_sharded(&self) -> bool {
        self.shard.is_some()
    }
}

/// Returned to the registering caller; pass it back to deregister.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationHandle {
    pub id: RegistrationId,
    pub path: PathSpec,
    pub member: MemberId,
}

struct RegistrationEntry {
    registration: Arc<Registration>,
    refs: u32,
}

/// Outcome of a register call.
#[derive(Debug)]
pub struct Registered {
    pub handle: RegistrationHandle,
    /// False when an existing registration's reference count was bumped.
    pub created: bool,
}

/// Tracks members and their registrations.
pub struct MemberRegistry {
    members: HashMap<MemberId, Arc<Member>>,
    entries: HashMap<RegistrationId, RegistrationEntry>,
    by_key: HashMap<(PathSpec, MemberId), RegistrationId>,
    next_id: u64,
}

impl MemberRegistry {
    pub fn new() -> Self {
        Self {
            members: HashMap::new(),
            entries: HashMap::new(),
            by_key: HashMap::new(),
            next_id: 0,
        }
    }

    pub fn add_member(&mut self, member: Arc<Member>) {
        debug!("Connected {} at {}", member.id(), member.address());
        self.members.insert(member.id(), member);
    }

    pub fn member(&self, id: MemberId) -> Option<Arc<Member>> {
        self.members.get(&id).cloned()
    }

    pub fn members(&self) -> Vec<Arc<Member>> {
        self.members.values().cloned().collect()
    }

    /// Register `member` at `path`.
    ///
    /// The path must end at a concrete entry or a single trailing wildcard
    /// segment, and only table registrations may carry shard detail. A
    /// repeat registration must match the first one exactly; it only adds a
    /// reference.
    pub fn register(
        &mut self,
        member: &Arc<Member>,
        path: PathSpec,
        flags: Capabilities,
        shard: Option<ShardDetail>,
    ) -> EngineResult<Registered> {
        if path.segment(0).map(|s| s.name()) == Some(RESERVED_ROOT) {
            return Err(invalid(&path, "path is reserved for the engine"));
        }
        self.register_internal(member, path, flags, shard)
    }

    pub(crate) fn register_internal(
        &mut self,
        member: &Arc<Member>,
        path: PathSpec,
        flags: Capabilities,
        shard: Option<ShardDetail>,
    ) -> EngineResult<Registered> {
        if !self.members.contains_key(&member.id()) {
            return Err(EngineError::MemberNotFound(member.id()));
        }
        if !path.is_registrable() {
            return Err(invalid(
                &path,
                "only the last segment of a registration may be wildcard",
            ));
        }
        if !flags.intersects(Capabilities::PUBLISHER | Capabilities::SUBSCRIBER) {
            return Err(invalid(&path, "registration must publish or subscribe"));
        }
        if shard.is_some() && !path.is_table() {
            return Err(invalid(&path, "shard detail needs a wildcard registration"));
        }

        let key = (path.clone(), member.id());
        if let Some(id) = self.by_key.get(&key) {
            if let Some(entry) = self.entries.get_mut(id) {
                if entry.registration.flags != flags || entry.registration.shard != shard {
                    return Err(invalid(
                        &path,
                        "already registered by this member with other capabilities or shard detail",
                    ));
                }
                entry.refs += 1;
                debug!(
                    "Registration {} of {} now has {} references",
                    path,
                    member.id(),
                    entry.refs
                );
                return Ok(Registered {
                    handle: RegistrationHandle {
                        id: *id,
                        path,
                        member: member.id(),
                    },
                    created: false,
                });
            }
        }

        let id = RegistrationId(self.next_id);
        self.next_id += 1;
        let registration = Arc::new(Registration {
            id,
            path: path.clone(),
            member: Arc::clone(member),
            flags,
            shard,
        });
        self.entries.insert(
            id,
            RegistrationEntry {
                registration,
                refs: 1,
            },
        );
        self.by_key.insert(key, id);
        debug!("Registered {} at {} ({:?})", member.id(), path, flags);

        Ok(Registered {
            handle: RegistrationHandle {
                id,
                path,
                member: member.id(),
            },
            created: true,
        })
    }

    /// Drop one reference. Returns the registration once it is removed.
    ///
    /// When a member's last registration goes away its scheduled tasks are
    /// cancelled.
    pub fn deregister(
        &mut self,
        handle: &RegistrationHandle,
    ) -> EngineResult<Option<Arc<Registration>>> {
        let entry = self
            .entries
            .get_mut(&handle.id)
            .ok_or(EngineError::RegistrationNotFound(handle.id))?;
        entry.refs -= 1;
        if entry.refs > 0 {
            return Ok(None);
        }

        let Some(entry) = self.entries.remove(&handle.id) else {
            return Ok(None);
        };
        let registration = entry.registration;
        self.by_key
            .remove(&(registration.path.clone(), registration.member.id()));
        debug!(
            "Deregistered {} at {}",
            registration.member.id(),
            registration.path
        );

        if !self.has_registrations(registration.member.id()) {
            registration.member.tasks().cancel_all();
        }
        Ok(Some(registration))
    }

    /// Remove a member with all of its registrations, marking it dead.
    pub fn remove_member(&mut self, id: MemberId) -> Vec<Arc<Registration>> {
        let Some(member) = self.members.remove(&id) else {
            return Vec::new();
        };
        member.mark_dead();
        member.tasks().cancel_all();

        let ids: Vec<RegistrationId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.registration.member.id() == id)
            .map(|(rid, _)| *rid)
            .collect();
        let mut removed = Vec::with_capacity(ids.len());
        for rid in ids {
            if let Some(entry) = self.entries.remove(&rid) {
                self.by_key.remove(&(entry.registration.path.clone(), id));
                removed.push(entry.registration);
            }
        }
        debug!("Removed {} with {} registrations", id, removed.len());
        removed
    }

    /// Members connected from `address`.
    pub fn members_at(&self, address: &str) -> Vec<MemberId> {
        self.members
            .values()
            .filter(|m| m.address() == address)
            .map(|m| m.id())
            .collect()
    }

    /// Registrations whose path overlaps `path`.
    pub fn matching(&self, path: &PathSpec) -> Vec<Arc<Registration>> {
        let mut found: Vec<Arc<Registration>> = self
            .entries
            .values()
            .filter(|e| overlaps(&e.registration.path, path))
            .map(|e| Arc::clone(&e.registration))
            .collect();
        found.sort_by_key(|r| r.id);
        found
    }

    pub fn registrations(&self) -> Vec<Arc<Registration>> {
        let mut all: Vec<Arc<Registration>> = self
            .entries
            .values()
            .map(|e| Arc::clone(&e.registration))
            .collect();
        all.sort_by_key(|r| r.id);
        all
    }

    pub fn refcount(&self, id: RegistrationId) -> Option<u32> {
        self.entries.get(&id).map(|e| e.refs)
    }

    pub fn has_registrations(&self, member: MemberId) -> bool {
        self.entries
            .values()
            .any(|e| e.registration.member.id() == member)
    }

    /// Union of the capability flags of a member's registrations.
    pub fn capabilities(&self, member: MemberId) -> Capabilities {
        self.entries
            .values()
            .filter(|e| e.registration.member.id() == member)
            .fold(Capabilities::empty(), |acc, e| acc | e.registration.flags)
    }

    /// Record a heartbeat from a member.
    pub fn heartbeat(&self, id: MemberId) -> EngineResult<()> {
        let member = self
            .members
            .get(&id)
            .ok_or(EngineError::MemberNotFound(id))?;
        member.touch();
        Ok(())
    }

    /// Members that have not sent a heartbeat within `timeout`.
    pub fn expired_members(&self, timeout: Duration) -> Vec<MemberId> {
        let now = tokio::time::Instant::now();
        let mut expired: Vec<MemberId> = self
            .members
            .values()
            .filter(|m| now.duration_since(m.last_heartbeat()) > timeout)
            .map(|m| m.id())
            .collect();
        expired.sort();
        expired
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }
}

impl Default for MemberRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn invalid(path: &PathSpec, reason: &str) -> EngineError {
    EngineError::InvalidRegistration {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::member::Member;
    use crate::shard::{ChunkCount, ShardKind};

    fn p(expr: &str) -> PathSpec {
        PathSpec::parse(expr).unwrap()
    }

    fn setup() -> (MemberRegistry, Arc<Member>) {
        let mut registry = MemberRegistry::new();
        let member = Arc::new(Member::code_free(MemberId(1), "mem://1".into()));
        registry.add_member(Arc::clone(&member));
        (registry, member)
    }

    #[test]
    fn test_register_is_refcounted() {
        let (mut registry, member) = setup();
        let first = registry
            .register(&member, p("/config/interface[*]"), Capabilities::PUBLISHER, None)
            .unwrap();
        let second = registry
            .register(&member, p("/config/interface[*]"), Capabilities::PUBLISHER, None)
            .unwrap();
        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.handle, second.handle);
        assert_eq!(registry.refcount(first.handle.id), Some(2));

        assert!(registry.deregister(&first.handle).unwrap().is_none());
        assert_eq!(registry.refcount(first.handle.id), Some(1));
        assert!(registry.deregister(&first.handle).unwrap().is_some());
        assert_eq!(registry.refcount(first.handle.id), None);
        assert!(matches!(
            registry.deregister(&first.handle),
            Err(EngineError::RegistrationNotFound(_))
        ));
    }

    #[test]
    fn test_mismatched_repeat_is_rejected() {
        let (mut registry, member) = setup();
        let sharded = ShardDetail::new(ShardKind::StringKey, ChunkCount::Dynamic);
        let first = registry
            .register(&member, p("/t/e[*]"), Capabilities::PUBLISHER, Some(sharded.clone()))
            .unwrap();

        let other_flags = registry.register(
            &member,
            p("/t/e[*]"),
            Capabilities::PUBLISHER | Capabilities::SUBSCRIBER,
            Some(sharded.clone()),
        );
        assert!(matches!(other_flags, Err(EngineError::InvalidRegistration { .. })));

        let other_detail = registry.register(
            &member,
            p("/t/e[*]"),
            Capabilities::PUBLISHER,
            Some(sharded.clone().with_default()),
        );
        assert!(matches!(other_detail, Err(EngineError::InvalidRegistration { .. })));

        let unsharded = registry.register(&member, p("/t/e[*]"), Capabilities::PUBLISHER, None);
        assert!(matches!(unsharded, Err(EngineError::InvalidRegistration { .. })));
        assert_eq!(registry.refcount(first.handle.id), Some(1));

        let same = registry
            .register(&member, p("/t/e[*]"), Capabilities::PUBLISHER, Some(sharded))
            .unwrap();
        assert!(!same.created);
        assert_eq!(registry.refcount(first.handle.id), Some(2));
    }

    #[test]
    fn test_register_validation() {
        let (mut registry, member) = setup();
        let bad_path = registry.register(
            &member,
            p("/config/interface[*]/address[*]"),
            Capabilities::PUBLISHER,
            None,
        );
        assert!(matches!(bad_path, Err(EngineError::InvalidRegistration { .. })));

        let no_caps = registry.register(
            &member,
            p("/config"),
            Capabilities::DATA_CACHE,
            None,
        );
        assert!(matches!(no_caps, Err(EngineError::InvalidRegistration { .. })));

        let detail = ShardDetail::new(ShardKind::Range, ChunkCount::Dynamic);
        let concrete_sharded = registry.register(
            &member,
            p("/config/interface[name='eth0']"),
            Capabilities::PUBLISHER,
            Some(detail),
        );
        assert!(matches!(
            concrete_sharded,
            Err(EngineError::InvalidRegistration { .. })
        ));

        let reserved = registry.register(
            &member,
            p("/trellis-router/binding"),
            Capabilities::PUBLISHER,
            None,
        );
        assert!(matches!(reserved, Err(EngineError::InvalidRegistration { .. })));

        let stranger = Arc::new(Member::code_free(MemberId(7), "mem://7".into()));
        assert!(matches!(
            registry.register(&stranger, p("/config"), Capabilities::PUBLISHER, None),
            Err(EngineError::MemberNotFound(MemberId(7)))
        ));
    }

    #[test]
    fn test_matching_and_capabilities() {
        let (mut registry, member) = setup();
        registry
            .register(&member, p("/config/interface[*]"), Capabilities::PUBLISHER, None)
            .unwrap();
        registry
            .register(&member, p("/state/counter[id=3]"), Capabilities::SUBSCRIBER, None)
            .unwrap();

        assert_eq!(registry.matching(&p("/config")).len(), 1);
        assert_eq!(registry.matching(&p("/config/interface[name='eth0']")).len(), 1);
        assert_eq!(registry.matching(&p("/state/counter[id=4]")).len(), 0);
        assert_eq!(
            registry.capabilities(member.id()),
            Capabilities::PUBLISHER | Capabilities::SUBSCRIBER
        );
        assert_eq!(registry.registrations().len(), 2);
    }

    #[test]
    fn test_remove_member() {
        let (mut registry, member) = setup();
        registry
            .register(&member, p("/a"), Capabilities::PUBLISHER, None)
            .unwrap();
        registry
            .register(&member, p("/b"), Capabilities::PUBLISHER, None)
            .unwrap();
        assert_eq!(registry.members_at("mem://1"), vec![member.id()]);

        let removed = registry.remove_member(member.id());
        assert_eq!(removed.len(), 2);
        assert!(!member.is_alive());
        assert!(registry.matching(&p("/a")).is_empty());
        assert!(registry.member(member.id()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_expiry() {
        let (mut registry, member) = setup();
        let other = Arc::new(Member::code_free(MemberId(2), "mem://2".into()));
        registry.add_member(Arc::clone(&other));

        tokio::time::advance(Duration::from_secs(20)).await;
        registry.heartbeat(other.id()).unwrap();
        tokio::time::advance(Duration::from_secs(15)).await;

        assert_eq!(
            registry.expired_members(Duration::from_secs(30)),
            vec![member.id()]
        );
        assert!(matches!(
            registry.heartbeat(MemberId(99)),
            Err(EngineError::MemberNotFound(_))
        ));
    }
}
