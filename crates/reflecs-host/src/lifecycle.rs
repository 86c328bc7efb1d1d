//! Keeps host objects and entities alive together.
//!
//! ```text
//!   Unbound ──create/spawn/attach──► Bound ──destroy (either side)──► Destroying
//!      ▲                                                                  │
//!      └──────────────── despawn hook removes the record ─────────────────┘
//! ```
//!
//! Every transition needs `&mut World`, so none can happen while systems
//! are running. The identity table is shared with the world's despawn hook;
//! that hook is the only place a record is removed, whichever side started
//! the destruction.

use std::{fmt, sync::Arc};

use hashbrown::HashMap;
use parking_lot::RwLock;
use reflecs_ecs::{Entity, World};
use rustc_hash::FxBuildHasher;
use serde::{Deserialize, Serialize};

use crate::{
    error::{BridgeError, Result},
    record::EntityRecord,
};

/// Stable identity of a host object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindingState {
    Unbound,
    Bound(Entity),
    Destroying(Entity),
}

/// Told when the ECS side deletes an entity the host did not ask to delete,
/// so the host does not destroy the object's entity a second time.
pub trait HostNotifier: Send + Sync {
    fn entity_deleted(&self, object: ObjectId, entity: Entity);
}

/// Ignores notifications.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopNotifier;

impl HostNotifier for NoopNotifier {
    fn entity_deleted(&self, _: ObjectId, _: Entity) {}
}

/// Transition counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LifecycleStats {
    pub bound: u64,
    pub unbound: u64,
    /// Unbinds that started on the ECS side.
    pub external_deletes: u64,
}

#[derive(Clone, Copy, Debug)]
struct Binding {
    entity: Entity,
    destroying: bool,
}

#[derive(Debug, Default)]
struct IdentityTable {
    by_object: HashMap<ObjectId, Binding, FxBuildHasher>,
    by_entity: HashMap<Entity, ObjectId, FxBuildHasher>,
    stats: LifecycleStats,
}

impl IdentityTable {
    fn bind(&mut self, object: ObjectId, entity: Entity) {
        let stale = self.by_object.insert(
            object,
            Binding {
                entity,
                destroying: false,
            },
        );
        if let Some(stale) = stale {
            self.by_entity.remove(&stale.entity);
        }
        self.by_entity.insert(entity, object);
        self.stats.bound += 1;
    }

    /// Remove the record of `entity`. Returns the object and whether the
    /// host started the destruction.
    fn unbind(&mut self, entity: Entity) -> Option<(ObjectId, bool)> {
        let object = self.by_entity.remove(&entity)?;
        let binding = self.by_object.remove(&object);
        debug_assert!(binding.is_some_and(|b| b.entity == entity));
        self.stats.unbound += 1;
        let host_initiated = binding.is_some_and(|b| b.destroying);
        if !host_initiated {
            self.stats.external_deletes += 1;
        }
        Some((object, host_initiated))
    }
}

/// Identity map between host objects and entities.
pub struct LifecycleBridge {
    table: Arc<RwLock<IdentityTable>>,
}

impl LifecycleBridge {
    /// Create the bridge and hook it into `world`'s despawn notifications.
    pub fn install(world: &mut World, notifier: Arc<dyn HostNotifier>) -> Self {
        let table = Arc::new(RwLock::new(IdentityTable::default()));
        let hook_table = Arc::clone(&table);
        world.on_despawn(Arc::new(move |entity| {
            let unbound = hook_table.write().unbind(entity);
            match unbound {
                Some((object, true)) => {
                    tracing::debug!(%object, %entity, "object unbound");
                }
                Some((object, false)) => {
                    tracing::debug!(%object, %entity, "entity deleted from the ECS side");
                    notifier.entity_deleted(object, entity);
                }
                None => {}
            }
        }));
        Self { table }
    }

    /// Bind `object` if its record attaches at least one registered type.
    /// Returns `None` when the object stays outside the ECS domain.
    pub fn on_object_created(
        &self,
        world: &mut World,
        object: ObjectId,
        record: &EntityRecord,
    ) -> Result<Option<Entity>> {
        if !record.participates(world) {
            tracing::trace!(%object, "object has no registered components, left unbound");
            return Ok(None);
        }
        let targets: Vec<(ObjectId, Entity)> = record
            .pair_targets()
            .into_iter()
            .filter_map(|target| Some((target, self.entity_of(world, target)?)))
            .collect();

        let entity = self.spawn(world, object)?;
        let resolve = |target: ObjectId| {
            targets
                .iter()
                .find(|(candidate, _)| *candidate == target)
                .map(|&(_, entity)| entity)
        };
        if let Err(err) = record.apply(world, entity, resolve) {
            self.on_object_destroyed(world, object);
            return Err(err);
        }
        Ok(Some(entity))
    }

    /// Bind `object` to a fresh, empty entity.
    pub fn spawn(&self, world: &mut World, object: ObjectId) -> Result<Entity> {
        if self.entity_of(world, object).is_some() {
            return Err(BridgeError::AlreadyBound(object));
        }
        let entity = world.spawn();
        self.table.write().bind(object, entity);
        tracing::debug!(%object, %entity, "object bound");
        Ok(entity)
    }

    /// Put `child` under `parent` in the hierarchy, binding `child` first if
    /// needed.
    pub fn attach(&self, world: &mut World, child: ObjectId, parent: ObjectId) -> Result<Entity> {
        let parent_entity = self
            .entity_of(world, parent)
            .ok_or(BridgeError::NotBound(parent))?;
        let child_entity = match self.entity_of(world, child) {
            Some(entity) => entity,
            None => self.spawn(world, child)?,
        };
        world.set_parent(child_entity, parent_entity)?;
        Ok(child_entity)
    }

    /// Host-side destruction. Destroying an object that is unbound or
    /// already being destroyed is a no-op that returns `false`.
    pub fn on_object_destroyed(&self, world: &mut World, object: ObjectId) -> bool {
        let entity = {
            let mut table = self.table.write();
            let Some(binding) = table.by_object.get_mut(&object) else {
                return false;
            };
            if binding.destroying {
                return false;
            }
            binding.destroying = true;
            binding.entity
        };

        if !world.despawn(entity) {
            // the entity died without the hook seeing it (world reset)
            self.table.write().unbind(entity);
        }
        true
    }

    /// Entity of `object`, if bound to a live entity.
    #[must_use]
    pub fn entity_of(&self, world: &World, object: ObjectId) -> Option<Entity> {
        let table = self.table.read();
        let binding = table.by_object.get(&object)?;
        (!binding.destroying && world.is_alive(binding.entity)).then_some(binding.entity)
    }

    #[must_use]
    pub fn object_of(&self, entity: Entity) -> Option<ObjectId> {
        self.table.read().by_entity.get(&entity).copied()
    }

    #[must_use]
    pub fn state(&self, object: ObjectId) -> BindingState {
        match self.table.read().by_object.get(&object) {
            None => BindingState::Unbound,
            Some(b) if b.destroying => BindingState::Destroying(b.entity),
            Some(b) => BindingState::Bound(b.entity),
        }
    }

    #[must_use]
    pub fn bound_count(&self) -> usize {
        self.table.read().by_object.len()
    }

    #[must_use]
    pub fn stats(&self) -> LifecycleStats {
        self.table.read().stats
    }

    /// Mark every binding as destroying so a following world teardown does
    /// not report host-side deletions.
    pub fn begin_shutdown(&self) {
        for binding in self.table.write().by_object.values_mut() {
            binding.destroying = true;
        }
    }
}

impl fmt::Debug for LifecycleBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.table.read();
        f.debug_struct("LifecycleBridge")
            .field("bound", &table.by_object.len())
            .field("stats", &table.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use reflecs_ecs::TypeDescription;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        deleted: Mutex<Vec<(ObjectId, Entity)>>,
    }

    impl HostNotifier for Recorder {
        fn entity_deleted(&self, object: ObjectId, entity: Entity) {
            self.deleted.lock().push((object, entity));
        }
    }

    fn setup() -> (World, LifecycleBridge, Arc<Recorder>) {
        let mut world = World::new();
        let recorder = Arc::new(Recorder::default());
        let bridge = LifecycleBridge::install(&mut world, recorder.clone());
        (world, bridge, recorder)
    }

    #[test]
    fn test_created_without_components_stays_unbound() {
        let (mut world, bridge, _) = setup();
        let created = bridge
            .on_object_created(&mut world, ObjectId(1), &EntityRecord::new().name("x"))
            .unwrap();
        assert_eq!(created, None);
        assert_eq!(bridge.state(ObjectId(1)), BindingState::Unbound);
        assert_eq!(world.entity_count(), 0);
    }

    #[test]
    fn test_created_with_components_binds() {
        let (mut world, bridge, _) = setup();
        let hp = world
            .register_type(TypeDescription::pod::<u32>("Game.Health"))
            .unwrap();
        let entity = bridge
            .on_object_created(&mut world, ObjectId(1), &EntityRecord::new().with(hp))
            .unwrap()
            .unwrap();

        assert_eq!(bridge.state(ObjectId(1)), BindingState::Bound(entity));
        assert_eq!(bridge.object_of(entity), Some(ObjectId(1)));
        assert_eq!(world.read::<u32>(entity, hp).unwrap(), Some(0));
    }

    #[test]
    fn test_failing_sub_entity_rolls_back_whole_record() {
        let (mut world, bridge, recorder) = setup();
        let hp = world
            .register_type(TypeDescription::pod::<u32>("Game.Health"))
            .unwrap();
        let child_of = world.child_of();
        let record = EntityRecord::new()
            .with(hp)
            .name("knight")
            .sub_entity("shield", EntityRecord::new().with(hp))
            .sub_entity("banner", EntityRecord::new().pair(child_of, ObjectId(9)));

        let err = bridge
            .on_object_created(&mut world, ObjectId(1), &record)
            .unwrap_err();
        assert!(matches!(err, BridgeError::NotBound(ObjectId(9))));
        assert_eq!(bridge.state(ObjectId(1)), BindingState::Unbound);
        assert_eq!(world.entity_count(), 0);
        assert_eq!(world.lookup("knight.shield"), None);
        assert!(recorder.deleted.lock().is_empty());
    }

    #[test]
    fn test_sub_entities_follow_bound_object() {
        let (mut world, bridge, _) = setup();
        let hp = world
            .register_type(TypeDescription::pod::<u32>("Game.Health"))
            .unwrap();
        let record = EntityRecord::new()
            .name("knight")
            .sub_entity("shield", EntityRecord::new().with(hp));

        let entity = bridge
            .on_object_created(&mut world, ObjectId(1), &record)
            .unwrap()
            .unwrap();
        let shield = world.lookup("knight.shield").unwrap();
        assert_eq!(world.parent_of(shield), Some(entity));
        assert_eq!(bridge.object_of(shield), None);

        assert!(bridge.on_object_destroyed(&mut world, ObjectId(1)));
        assert!(!world.is_alive(shield));
        assert_eq!(world.entity_count(), 0);
    }

    #[test]
    fn test_at_most_one_entity_per_object() {
        let (mut world, bridge, _) = setup();
        bridge.spawn(&mut world, ObjectId(1)).unwrap();
        assert!(matches!(
            bridge.spawn(&mut world, ObjectId(1)),
            Err(BridgeError::AlreadyBound(ObjectId(1)))
        ));
    }

    #[test]
    fn test_host_destroy_unbinds_without_notification() {
        let (mut world, bridge, recorder) = setup();
        let entity = bridge.spawn(&mut world, ObjectId(1)).unwrap();

        assert!(bridge.on_object_destroyed(&mut world, ObjectId(1)));
        assert!(!world.is_alive(entity));
        assert_eq!(bridge.state(ObjectId(1)), BindingState::Unbound);
        assert!(recorder.deleted.lock().is_empty());
    }

    #[test]
    fn test_ecs_delete_notifies_host() {
        let (mut world, bridge, recorder) = setup();
        let entity = bridge.spawn(&mut world, ObjectId(1)).unwrap();

        world.despawn(entity);
        assert_eq!(bridge.state(ObjectId(1)), BindingState::Unbound);
        assert_eq!(*recorder.deleted.lock(), vec![(ObjectId(1), entity)]);

        // the host now destroys its object: nothing left to do
        assert!(!bridge.on_object_destroyed(&mut world, ObjectId(1)));
        let stats = bridge.stats();
        assert_eq!(stats.unbound, 1);
        assert_eq!(stats.external_deletes, 1);
    }

    #[test]
    fn test_double_destroy_is_noop() {
        let (mut world, bridge, recorder) = setup();
        let entity = bridge.spawn(&mut world, ObjectId(1)).unwrap();

        assert!(bridge.on_object_destroyed(&mut world, ObjectId(1)));
        assert!(!world.despawn(entity));
        assert!(!bridge.on_object_destroyed(&mut world, ObjectId(1)));
        assert_eq!(bridge.stats().unbound, 1);
        assert!(recorder.deleted.lock().is_empty());
    }

    #[test]
    fn test_attach_binds_child_and_cascades() {
        let (mut world, bridge, recorder) = setup();
        let parent = bridge.spawn(&mut world, ObjectId(1)).unwrap();
        let child = bridge.attach(&mut world, ObjectId(2), ObjectId(1)).unwrap();

        assert_eq!(world.parent_of(child), Some(parent));
        assert_eq!(bridge.state(ObjectId(2)), BindingState::Bound(child));

        bridge.on_object_destroyed(&mut world, ObjectId(1));
        assert!(!world.is_alive(child));
        assert_eq!(bridge.state(ObjectId(2)), BindingState::Unbound);
        // the child went with its parent; the host never asked for that
        assert_eq!(*recorder.deleted.lock(), vec![(ObjectId(2), child)]);
    }

    #[test]
    fn test_attach_requires_bound_parent() {
        let (mut world, bridge, _) = setup();
        assert!(matches!(
            bridge.attach(&mut world, ObjectId(2), ObjectId(1)),
            Err(BridgeError::NotBound(ObjectId(1)))
        ));
        assert_eq!(bridge.state(ObjectId(2)), BindingState::Unbound);
    }

    #[test]
    fn test_failed_record_rolls_back() {
        let (mut world, bridge, recorder) = setup();
        let hp = world
            .register_type(TypeDescription::pod::<u32>("Game.Health"))
            .unwrap();
        let record = EntityRecord::new().with(hp).pair(world.child_of(), ObjectId(7));

        assert!(bridge.on_object_created(&mut world, ObjectId(1), &record).is_err());
        assert_eq!(bridge.state(ObjectId(1)), BindingState::Unbound);
        assert_eq!(world.entity_count(), 0);
        assert!(recorder.deleted.lock().is_empty());
    }

    #[test]
    fn test_shutdown_is_silent() {
        let (mut world, bridge, recorder) = setup();
        bridge.spawn(&mut world, ObjectId(1)).unwrap();
        bridge.spawn(&mut world, ObjectId(2)).unwrap();

        bridge.begin_shutdown();
        world.shutdown();
        assert_eq!(bridge.bound_count(), 0);
        assert!(recorder.deleted.lock().is_empty());
    }
}
