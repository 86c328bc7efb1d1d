//! Snapshot and apply component state across a network boundary.
//!
//! The adapter never touches a socket: [`ReplicationAdapter::snapshot`]
//! produces bytes for an external transport, and
//! [`ReplicationAdapter::apply`] consumes bytes that transport received.

use std::fmt;

use hashbrown::{HashMap, HashSet};
use reflecs_ecs::{ComponentValue, Entity, TypeDescriptor, TypeHandle, World};
use rustc_hash::FxBuildHasher;

use crate::{
    error::{ReplicationError, Result},
    network_id::{NetworkId, NetworkIds},
    policy::{AuthorityPolicy, Conflict, NetRole, Resolution, ServerAuthoritative},
    wire::{self, Record},
};

/// Why a record was not applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// No local type has this stable id (version skew).
    UnknownType,
    /// The local type exists but is not marked replicable.
    NotReplicable(String),
    /// The payload hook rejected the bytes.
    Undecodable(String),
    /// The world refused the decoded value.
    Rejected(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SkippedRecord {
    pub type_id: u32,
    /// Wire size of the record, header included.
    pub bytes: usize,
    pub reason: SkipReason,
}

/// Outcome of one [`ReplicationAdapter::apply`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: Vec<TypeHandle>,
    pub skipped: Vec<SkippedRecord>,
    /// Records the authority policy resolved in favour of the local value.
    pub kept_local: Vec<TypeHandle>,
}

impl ApplyReport {
    #[must_use]
    pub fn skipped_bytes(&self) -> usize {
        self.skipped.iter().map(|s| s.bytes).sum()
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.skipped.is_empty()
    }
}

/// Replication state for one world.
pub struct ReplicationAdapter {
    role: NetRole,
    policy: Box<dyn AuthorityPolicy>,
    local_writes: HashSet<(Entity, TypeHandle), FxBuildHasher>,
    baselines: HashMap<Entity, HashMap<u32, Vec<u8>, FxBuildHasher>, FxBuildHasher>,
    ids: NetworkIds,
}

impl ReplicationAdapter {
    /// Adapter using [`ServerAuthoritative`].
    #[must_use]
    pub fn new(role: NetRole) -> Self {
        Self::with_policy(role, Box::new(ServerAuthoritative))
    }

    #[must_use]
    pub fn with_policy(role: NetRole, policy: Box<dyn AuthorityPolicy>) -> Self {
        Self {
            role,
            policy,
            local_writes: HashSet::default(),
            baselines: HashMap::default(),
            ids: NetworkIds::new(),
        }
    }

    #[must_use]
    pub const fn role(&self) -> NetRole {
        self.role
    }

    pub fn set_policy(&mut self, policy: Box<dyn AuthorityPolicy>) {
        self.policy = policy;
    }

    #[must_use]
    pub const fn network_ids(&self) -> &NetworkIds {
        &self.ids
    }

    pub fn network_ids_mut(&mut self) -> &mut NetworkIds {
        &mut self.ids
    }

    // ==================== Snapshot ====================

    /// Encode the replicable components of `entity` listed in `components`.
    /// Components the entity lacks, and types not marked replicable, are
    /// left out.
    pub fn snapshot(&self, world: &World, entity: Entity, components: &[TypeHandle]) -> Result<Vec<u8>> {
        let records = collect(world, entity, components.iter().copied())?;
        self.encode(entity, records)
    }

    /// Encode every replicable component of `entity`.
    pub fn snapshot_all(&self, world: &World, entity: Entity) -> Result<Vec<u8>> {
        let records = collect(world, entity, replicable_types(world))?;
        self.encode(entity, records)
    }

    /// Like [`snapshot_all`](Self::snapshot_all), but only records whose
    /// bytes changed since the previous delta for `entity`. Removed
    /// components are not signalled.
    pub fn snapshot_delta(&mut self, world: &World, entity: Entity) -> Result<Vec<u8>> {
        let current = collect(world, entity, replicable_types(world))?;
        let baseline = self.baselines.entry(entity).or_default();

        let mut changed = Vec::new();
        for record in current {
            if baseline.get(&record.type_id) == Some(&record.payload) {
                continue;
            }
            baseline.insert(record.type_id, record.payload.clone());
            changed.push(record);
        }
        self.encode(entity, changed)
    }

    fn encode(&self, entity: Entity, mut records: Vec<Record>) -> Result<Vec<u8>> {
        tracing::trace!(%entity, role = %self.role, records = records.len(), "snapshot");
        wire::encode(&mut records)
    }

    // ==================== Apply ====================

    /// Apply a snapshot to `entity`.
    ///
    /// Framing errors and a stale entity reject the whole payload. Any
    /// other problem skips just that record.
    pub fn apply(&mut self, world: &mut World, entity: Entity, bytes: &[u8]) -> Result<ApplyReport> {
        let records = wire::decode(bytes)?;
        if !world.is_alive(entity) {
            return Err(ReplicationError::StaleEntity(entity));
        }

        let mut report = ApplyReport::default();
        for record in records {
            let skip = |reason: SkipReason| SkippedRecord {
                type_id: record.type_id,
                bytes: record.wire_len(),
                reason,
            };

            let Some(handle) = world.registry().by_stable_id(record.type_id) else {
                tracing::warn!(%entity, type_id = record.type_id, "unknown replicated type skipped");
                report.skipped.push(skip(SkipReason::UnknownType));
                continue;
            };
            let Some(descriptor) = world.registry().descriptor(handle).cloned() else {
                report.skipped.push(skip(SkipReason::UnknownType));
                continue;
            };
            if !descriptor.is_replicable() {
                tracing::warn!(%entity, type_path = descriptor.path(), "non-replicable type skipped");
                report
                    .skipped
                    .push(skip(SkipReason::NotReplicable(descriptor.path().to_owned())));
                continue;
            }

            if self.local_writes.remove(&(entity, handle)) {
                let conflict = Conflict {
                    entity,
                    handle,
                    type_path: descriptor.path(),
                    role: self.role,
                };
                if self.policy.resolve(&conflict) == Resolution::KeepLocal {
                    tracing::debug!(%entity, type_path = descriptor.path(), "remote write lost to local");
                    report.kept_local.push(handle);
                    continue;
                }
            }

            match decode_into(world, entity, &descriptor, record.payload) {
                Ok(()) => report.applied.push(handle),
                Err(reason) => {
                    tracing::warn!(%entity, type_path = descriptor.path(), ?reason, "replicated record skipped");
                    report.skipped.push(skip(reason));
                }
            }
        }

        tracing::debug!(
            %entity,
            applied = report.applied.len(),
            skipped = report.skipped.len(),
            skipped_bytes = report.skipped_bytes(),
            "applied snapshot"
        );
        Ok(report)
    }

    /// Apply a snapshot addressed by network id.
    pub fn apply_networked(&mut self, world: &mut World, id: NetworkId, bytes: &[u8]) -> Result<ApplyReport> {
        let entity = self
            .ids
            .entity(id)
            .ok_or(ReplicationError::UnboundNetworkId(id))?;
        self.apply(world, entity, bytes)
    }

    // ==================== Local writes ====================

    /// Write a value locally and remember it for authority checks.
    pub fn write_local<T: 'static>(
        &mut self,
        world: &mut World,
        entity: Entity,
        handle: TypeHandle,
        value: T,
    ) -> Result<()> {
        world.write(entity, handle, value)?;
        self.mark_local_write(entity, handle);
        Ok(())
    }

    /// Record that `handle` on `entity` was changed locally.
    pub fn mark_local_write(&mut self, entity: Entity, handle: TypeHandle) {
        self.local_writes.insert((entity, handle));
    }

    #[must_use]
    pub fn has_local_write(&self, entity: Entity, handle: TypeHandle) -> bool {
        self.local_writes.contains(&(entity, handle))
    }

    /// Drop everything remembered about `entity`.
    pub fn forget(&mut self, entity: Entity) {
        self.baselines.remove(&entity);
        self.local_writes.retain(|(e, _)| *e != entity);
        self.ids.unbind_entity(entity);
    }

    /// Drop baselines, local-write marks and network ids of every entity
    /// that is no longer alive in `world`. Returns how many baselines were
    /// dropped.
    pub fn retain_alive(&mut self, world: &World) -> usize {
        let before = self.baselines.len();
        self.baselines.retain(|entity, _| world.is_alive(*entity));
        let forgotten = before - self.baselines.len();
        self.local_writes.retain(|(entity, _)| world.is_alive(*entity));
        let unbound = self.ids.retain_alive(world);
        if forgotten + unbound > 0 {
            tracing::trace!(baselines = forgotten, network_ids = unbound, "pruned dead entities");
        }
        forgotten
    }

    /// Entities with a delta baseline.
    #[must_use]
    pub fn baseline_count(&self) -> usize {
        self.baselines.len()
    }

    #[must_use]
    pub fn local_write_count(&self) -> usize {
        self.local_writes.len()
    }
}

impl Default for ReplicationAdapter {
    fn default() -> Self {
        Self::new(NetRole::default())
    }
}

impl fmt::Debug for ReplicationAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationAdapter")
            .field("role", &self.role)
            .field("local_writes", &self.local_writes.len())
            .field("baselines", &self.baselines.len())
            .field("network_ids", &self.ids.len())
            .finish()
    }
}

fn collect(
    world: &World,
    entity: Entity,
    components: impl Iterator<Item = TypeHandle>,
) -> Result<Vec<Record>> {
    if !world.is_alive(entity) {
        return Err(ReplicationError::StaleEntity(entity));
    }

    let mut records: Vec<Record> = Vec::new();
    for handle in components {
        let descriptor = world
            .registry()
            .descriptor(handle)
            .ok_or(reflecs_ecs::EcsError::UnknownType(handle))?;
        if !descriptor.is_replicable() || !world.has(entity, handle) {
            continue;
        }
        if records.iter().any(|r| r.type_id == descriptor.stable_id()) {
            continue;
        }
        let payload = encode_payload(world, entity, descriptor)?;
        records.push(Record {
            type_id: descriptor.stable_id(),
            payload,
        });
    }
    Ok(records)
}

fn replicable_types(world: &World) -> impl Iterator<Item = TypeHandle> + '_ {
    world
        .registry()
        .iter()
        .filter(|d| d.is_replicable())
        .map(|d| d.handle())
}

fn encode_payload(world: &World, entity: Entity, descriptor: &TypeDescriptor) -> Result<Vec<u8>> {
    if descriptor.is_tag() {
        return Ok(Vec::new());
    }
    let (Some(hooks), Some(value)) = (
        descriptor.replication(),
        world.read_value(entity, descriptor.handle()),
    ) else {
        return Ok(Vec::new());
    };
    // SAFETY: value holds an initialised instance of the descriptor's type
    unsafe { (hooks.serialize)(value.as_ptr()) }.map_err(|source| ReplicationError::Serialize {
        type_path: descriptor.path().to_owned(),
        source,
    })
}

fn decode_into(world: &mut World, entity: Entity, descriptor: &TypeDescriptor, payload: &[u8]) -> Result<(), SkipReason> {
    let handle = descriptor.handle();
    if descriptor.is_tag() {
        return world
            .add(entity, handle)
            .map(drop)
            .map_err(|e| SkipReason::Rejected(e.to_string()));
    }
    let Some(hooks) = descriptor.replication() else {
        return Err(SkipReason::NotReplicable(descriptor.path().to_owned()));
    };
    // SAFETY: the deserialize hook initialises dst whenever it returns Ok
    let value = unsafe {
        ComponentValue::try_init(world.registry(), handle, |dst| (hooks.deserialize)(payload, dst))
    }
    .map_err(|e| SkipReason::Rejected(e.to_string()))?
    .map_err(|e| SkipReason::Undecodable(e.0))?;

    world
        .write_value(entity, value)
        .map_err(|e| SkipReason::Rejected(e.to_string()))
}

#[cfg(test)]
mod tests {
    use bytemuck::{Pod, Zeroable};
    use reflecs_ecs::TypeDescription;
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::{
        hooks::{bincode_hooks, pod_hooks},
        policy::{PreferLocal, PreferRemote},
    };

    #[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
    #[repr(C)]
    struct Position {
        x: f32,
        y: f32,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
    #[repr(C)]
    struct Health(u32);

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Label(String);

    #[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
    #[repr(C)]
    struct Secret(u64);

    struct Handles {
        pos: TypeHandle,
        health: TypeHandle,
        label: TypeHandle,
        secret: TypeHandle,
    }

    fn world() -> (World, Handles) {
        let mut world = World::new();
        let handles = Handles {
            pos: world
                .register_type(TypeDescription::pod::<Position>("Game.Position").replicated(pod_hooks::<Position>()))
                .unwrap(),
            health: world
                .register_type(TypeDescription::pod::<Health>("Game.Health").replicated(pod_hooks::<Health>()))
                .unwrap(),
            label: world
                .register_type(TypeDescription::of::<Label>("Game.Label").replicated(bincode_hooks::<Label>()))
                .unwrap(),
            secret: world
                .register_type(TypeDescription::pod::<Secret>("Game.Secret"))
                .unwrap(),
        };
        (world, handles)
    }

    fn populated() -> (World, Handles, Entity) {
        let (mut world, h) = world();
        let e = world.spawn();
        world.write(e, h.pos, Position { x: 1.0, y: 2.0 }).unwrap();
        world.write(e, h.health, Health(90)).unwrap();
        world.write(e, h.label, Label("orc".into())).unwrap();
        world.write(e, h.secret, Secret(7)).unwrap();
        (world, h, e)
    }

    #[test]
    fn test_snapshot_skips_non_replicable() {
        let (world, h, e) = populated();
        let adapter = ReplicationAdapter::default();
        let bytes = adapter.snapshot_all(&world, e).unwrap();
        let records = wire::decode(&bytes).unwrap();
        assert_eq!(records.len(), 3);

        let secret_id = world.registry().descriptor(h.secret).unwrap().stable_id();
        assert!(records.iter().all(|r| r.type_id != secret_id));
    }

    #[test]
    fn test_snapshot_is_ascending_and_deterministic() {
        let (world, h, e) = populated();
        let adapter = ReplicationAdapter::default();
        let a = adapter.snapshot(&world, e, &[h.label, h.pos, h.health]).unwrap();
        let b = adapter.snapshot(&world, e, &[h.health, h.label, h.pos, h.pos]).unwrap();
        assert_eq!(a, b);

        let ids: Vec<u32> = wire::decode(&a).unwrap().iter().map(|r| r.type_id).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn test_world_to_world() {
        let (source, _, e) = populated();
        let (mut target, h) = world();
        let remote = target.spawn();

        let bytes = ReplicationAdapter::default().snapshot_all(&source, e).unwrap();
        let mut client = ReplicationAdapter::new(NetRole::Client);
        let report = client.apply(&mut target, remote, &bytes).unwrap();

        assert!(report.is_clean());
        assert_eq!(report.applied.len(), 3);
        assert_eq!(target.read::<Position>(remote, h.pos).unwrap(), Some(Position { x: 1.0, y: 2.0 }));
        assert_eq!(target.read::<Label>(remote, h.label).unwrap(), Some(Label("orc".into())));
        assert_eq!(target.read::<Secret>(remote, h.secret).unwrap(), None);
    }

    #[test]
    fn test_unknown_type_skipped() {
        let (mut source, _, e) = populated();
        let extra = source
            .register_type(TypeDescription::pod::<u64>("Game.Mana").replicated(pod_hooks::<u64>()))
            .unwrap();
        source.write(e, extra, 5u64).unwrap();
        let bytes = ReplicationAdapter::default().snapshot_all(&source, e).unwrap();

        let (mut target, _) = world();
        let remote = target.spawn();
        let report = ReplicationAdapter::new(NetRole::Client)
            .apply(&mut target, remote, &bytes)
            .unwrap();

        assert_eq!(report.applied.len(), 3);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].reason, SkipReason::UnknownType);
        assert_eq!(report.skipped_bytes(), wire::RECORD_HEADER_LEN + 8);
    }

    #[test]
    fn test_undecodable_record_does_not_abort() {
        let (mut world, h) = world();
        let e = world.spawn();
        let pos_id = world.registry().descriptor(h.pos).unwrap().stable_id();
        let health_id = world.registry().descriptor(h.health).unwrap().stable_id();
        let bytes = wire::encode(&mut [
            Record {
                type_id: pos_id,
                payload: vec![1, 2, 3],
            },
            Record {
                type_id: health_id,
                payload: 42u32.to_le_bytes().to_vec(),
            },
        ])
        .unwrap();

        let report = ReplicationAdapter::new(NetRole::Client)
            .apply(&mut world, e, &bytes)
            .unwrap();
        assert_eq!(report.applied, vec![h.health]);
        assert!(matches!(report.skipped[0].reason, SkipReason::Undecodable(_)));
        assert_eq!(world.read::<Health>(e, h.health).unwrap(), Some(Health(42)));
        assert!(!world.has(e, h.pos));
    }

    #[test]
    fn test_malformed_payload_applies_nothing() {
        let (source, h, e) = populated();
        let mut bytes = ReplicationAdapter::default().snapshot_all(&source, e).unwrap();
        bytes.pop();

        let (mut target, _) = world();
        let remote = target.spawn();
        let result = ReplicationAdapter::default().apply(&mut target, remote, &bytes);
        assert!(matches!(result, Err(ReplicationError::Malformed { .. })));
        assert!(!target.has(remote, h.pos));
    }

    #[test]
    fn test_stale_entity() {
        let (mut world, _, e) = populated();
        let adapter = ReplicationAdapter::default();
        let bytes = adapter.snapshot_all(&world, e).unwrap();
        world.despawn(e);

        assert!(matches!(
            adapter.snapshot_all(&world, e),
            Err(ReplicationError::StaleEntity(_))
        ));
        let mut adapter = adapter;
        assert!(matches!(
            adapter.apply(&mut world, e, &bytes),
            Err(ReplicationError::StaleEntity(_))
        ));
    }

    #[test]
    fn test_server_keeps_local_write() {
        let (mut world, h, e) = populated();
        let remote = wire::encode(&mut [Record {
            type_id: world.registry().descriptor(h.health).unwrap().stable_id(),
            payload: 10u32.to_le_bytes().to_vec(),
        }])
        .unwrap();

        let mut server = ReplicationAdapter::new(NetRole::Server);
        server.write_local(&mut world, e, h.health, Health(50)).unwrap();
        let report = server.apply(&mut world, e, &remote).unwrap();
        assert_eq!(report.kept_local, vec![h.health]);
        assert_eq!(world.read::<Health>(e, h.health).unwrap(), Some(Health(50)));

        // the local write was consumed by the previous apply
        let report = server.apply(&mut world, e, &remote).unwrap();
        assert_eq!(report.applied, vec![h.health]);
        assert_eq!(world.read::<Health>(e, h.health).unwrap(), Some(Health(10)));
    }

    #[test]
    fn test_client_accepts_remote() {
        let (mut world, h, e) = populated();
        let remote = wire::encode(&mut [Record {
            type_id: world.registry().descriptor(h.health).unwrap().stable_id(),
            payload: 10u32.to_le_bytes().to_vec(),
        }])
        .unwrap();

        let mut client = ReplicationAdapter::new(NetRole::Client);
        client.mark_local_write(e, h.health);
        let report = client.apply(&mut world, e, &remote).unwrap();
        assert_eq!(report.applied, vec![h.health]);
        assert!(!client.has_local_write(e, h.health));
        assert_eq!(world.read::<Health>(e, h.health).unwrap(), Some(Health(10)));
    }

    #[test]
    fn test_policy_overrides_role() {
        let (mut world, h, e) = populated();
        let remote = wire::encode(&mut [Record {
            type_id: world.registry().descriptor(h.health).unwrap().stable_id(),
            payload: 1u32.to_le_bytes().to_vec(),
        }])
        .unwrap();

        let mut predicted = ReplicationAdapter::with_policy(NetRole::Client, Box::new(PreferLocal));
        predicted.mark_local_write(e, h.health);
        assert_eq!(predicted.apply(&mut world, e, &remote).unwrap().kept_local, vec![h.health]);

        let mut follower = ReplicationAdapter::with_policy(NetRole::Server, Box::new(PreferRemote));
        follower.mark_local_write(e, h.health);
        assert_eq!(follower.apply(&mut world, e, &remote).unwrap().applied, vec![h.health]);
    }

    #[test]
    fn test_delta_only_changed() {
        let (mut world, h, e) = populated();
        let mut adapter = ReplicationAdapter::default();

        let first = adapter.snapshot_delta(&world, e).unwrap();
        assert_eq!(wire::peek_count(&first).unwrap(), 3);

        let unchanged = adapter.snapshot_delta(&world, e).unwrap();
        assert_eq!(wire::peek_count(&unchanged).unwrap(), 0);

        world.write(e, h.health, Health(1)).unwrap();
        let delta = adapter.snapshot_delta(&world, e).unwrap();
        let records = wire::decode(&delta).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].type_id,
            world.registry().descriptor(h.health).unwrap().stable_id()
        );

        adapter.forget(e);
        let again = adapter.snapshot_delta(&world, e).unwrap();
        assert_eq!(wire::peek_count(&again).unwrap(), 3);
    }

    #[test]
    fn test_retain_alive_prunes_dead_entities() {
        let (mut world, h, e) = populated();
        let survivor = world.spawn();
        world.write(survivor, h.health, Health(5)).unwrap();
        let mut adapter = ReplicationAdapter::default();

        adapter.snapshot_delta(&world, e).unwrap();
        adapter.snapshot_delta(&world, survivor).unwrap();
        adapter.mark_local_write(e, h.pos);
        adapter.mark_local_write(survivor, h.health);
        let id = adapter.network_ids_mut().allocate(e);
        assert_eq!(adapter.network_ids().entity(id), Some(e));
        assert_eq!(adapter.retain_alive(&world), 0);

        world.despawn(e);
        assert_eq!(adapter.retain_alive(&world), 1);
        assert_eq!(adapter.baseline_count(), 1);
        assert_eq!(adapter.local_write_count(), 1);
        assert!(!adapter.has_local_write(e, h.pos));
        assert!(adapter.has_local_write(survivor, h.health));
        assert!(adapter.network_ids().is_empty());
    }

    #[test]
    fn test_apply_networked() {
        let (source, _, e) = populated();
        let bytes = ReplicationAdapter::default().snapshot_all(&source, e).unwrap();

        let (mut target, h) = world();
        let local = target.spawn();
        let mut client = ReplicationAdapter::new(NetRole::Client);
        client.network_ids_mut().bind(NetworkId(3), local);

        client.apply_networked(&mut target, NetworkId(3), &bytes).unwrap();
        assert_eq!(target.read::<Health>(local, h.health).unwrap(), Some(Health(90)));
        assert!(matches!(
            client.apply_networked(&mut target, NetworkId(4), &bytes),
            Err(ReplicationError::UnboundNetworkId(NetworkId(4)))
        ));
    }

    #[test]
    fn test_replicated_tag() {
        let mut world = World::new();
        let stunned = world
            .register_type(TypeDescription::tag("Game.Stunned").replicated(pod_hooks::<u8>()))
            .unwrap();
        let e = world.spawn();
        world.add(e, stunned).unwrap();

        let bytes = ReplicationAdapter::default().snapshot_all(&world, e).unwrap();
        let records = wire::decode(&bytes).unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].payload.is_empty());

        let other = world.spawn();
        let report = ReplicationAdapter::new(NetRole::Client)
            .apply(&mut world, other, &bytes)
            .unwrap();
        assert_eq!(report.applied, vec![stunned]);
        assert!(world.has(other, stunned));
    }
}
