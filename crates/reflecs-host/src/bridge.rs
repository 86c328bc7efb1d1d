//! The host-facing facade.

use std::sync::Arc;

use reflecs_ecs::{
    ComponentValue, EcsError, Entity, Query, QueryRow, Reflect, RowMut, TermList, TypeDescription,
    TypeHandle, World,
};
use reflecs_net::{ApplyReport, ReplicationAdapter};
use reflecs_tick::{FrameReport, Phase, PhaseReport, Scheduler, SystemBuilder, SystemHandle};

use crate::{
    config::BridgeConfig,
    error::Result,
    lifecycle::{BindingState, HostNotifier, LifecycleBridge, NoopNotifier, ObjectId},
    module::{Module, ModuleRegistry},
    record::EntityRecord,
};

/// One world with its scheduler, identity map, replication state and
/// loaded modules.
///
/// Every structural operation takes `&mut self`, so none of them can run
/// while a phase is executing.
pub struct Bridge {
    config: BridgeConfig,
    world: World,
    scheduler: Scheduler,
    lifecycle: LifecycleBridge,
    replication: ReplicationAdapter,
    modules: ModuleRegistry,
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Result<Self> {
        Self::with_notifier(config, Arc::new(NoopNotifier))
    }

    pub fn with_notifier(config: BridgeConfig, notifier: Arc<dyn HostNotifier>) -> Result<Self> {
        let mut world = World::new();
        let scheduler = Scheduler::new(config.scheduler.clone())?;
        let lifecycle = LifecycleBridge::install(&mut world, notifier);
        let replication = ReplicationAdapter::with_policy(config.role, config.authority.into_policy());

        tracing::info!(
            world = %config.world_name,
            role = %config.role,
            authority = ?config.authority,
            "bridge ready"
        );
        Ok(Self {
            config,
            world,
            scheduler,
            lifecycle,
            replication,
            modules: ModuleRegistry::new(),
        })
    }

    // ==================== Registration ====================

    /// Register a host type. Registering the same description again returns
    /// the same handle.
    pub fn register_component_type(&mut self, desc: TypeDescription) -> Result<TypeHandle> {
        Ok(self.world.register_type(desc)?)
    }

    pub fn register<T: Reflect>(&mut self) -> Result<TypeHandle> {
        Ok(self.world.register::<T>()?)
    }

    // ==================== Entities ====================

    /// Spawn an entity with no host object.
    pub fn spawn(&mut self) -> Entity {
        self.world.spawn()
    }

    /// Delete `entity`. Any host object bound to it is notified. Returns
    /// `false` for stale handles.
    pub fn destroy(&mut self, entity: Entity) -> bool {
        let destroyed = self.world.despawn(entity);
        if destroyed {
            self.replication.forget(entity);
            self.forget_dead();
        }
        destroyed
    }

    /// Add `handle` to `entity`, with `value` or the type's default.
    pub fn add(&mut self, entity: Entity, handle: TypeHandle, value: Option<ComponentValue>) -> Result<()> {
        match value {
            Some(value) if value.handle() != handle => {
                let expected = self
                    .world
                    .registry()
                    .descriptor(handle)
                    .ok_or(EcsError::UnknownType(handle))?;
                Err(EcsError::TypeMismatch {
                    type_name: expected.path().to_owned(),
                    expected_size: expected.size(),
                    expected_align: expected.align(),
                    found_size: value.descriptor().size(),
                    found_align: value.descriptor().align(),
                }
                .into())
            }
            Some(value) => Ok(self.world.write_value(entity, value)?),
            None => {
                self.world.add(entity, handle)?;
                Ok(())
            }
        }
    }

    /// Typed write, adding the component if absent.
    pub fn set<T: 'static>(&mut self, entity: Entity, handle: TypeHandle, value: T) -> Result<()> {
        Ok(self.world.write(entity, handle, value)?)
    }

    pub fn remove(&mut self, entity: Entity, handle: TypeHandle) -> Result<bool> {
        Ok(self.world.remove(entity, handle)?)
    }

    /// Copy of the value, or `None` if absent or the entity is stale.
    pub fn get<T: 'static>(&self, entity: Entity, handle: TypeHandle) -> Result<Option<T>> {
        Ok(self.world.read(entity, handle)?)
    }

    #[must_use]
    pub fn get_value(&self, entity: Entity, handle: TypeHandle) -> Option<ComponentValue> {
        self.world.read_value(entity, handle)
    }

    #[must_use]
    pub fn has(&self, entity: Entity, handle: TypeHandle) -> bool {
        self.world.has(entity, handle)
    }

    // ==================== Host objects ====================

    /// Host object created. Binds it when `record` attaches a registered
    /// type.
    pub fn create_object(&mut self, object: ObjectId, record: &EntityRecord) -> Result<Option<Entity>> {
        self.lifecycle.on_object_created(&mut self.world, object, record)
    }

    /// Explicitly bind `object` to a new entity.
    pub fn spawn_object(&mut self, object: ObjectId) -> Result<Entity> {
        self.lifecycle.spawn(&mut self.world, object)
    }

    pub fn attach(&mut self, child: ObjectId, parent: ObjectId) -> Result<Entity> {
        self.lifecycle.attach(&mut self.world, child, parent)
    }

    /// Host object destroyed. A second call is a no-op returning `false`.
    pub fn destroy_object(&mut self, object: ObjectId) -> bool {
        let entity = match self.lifecycle.state(object) {
            BindingState::Bound(entity) | BindingState::Destroying(entity) => Some(entity),
            BindingState::Unbound => None,
        };
        let destroyed = self.lifecycle.on_object_destroyed(&mut self.world, object);
        if let Some(entity) = entity.filter(|_| destroyed) {
            self.replication.forget(entity);
            self.forget_dead();
        }
        destroyed
    }

    #[must_use]
    pub fn entity_of(&self, object: ObjectId) -> Option<Entity> {
        self.lifecycle.entity_of(&self.world, object)
    }

    #[must_use]
    pub fn object_of(&self, entity: Entity) -> Option<ObjectId> {
        self.lifecycle.object_of(entity)
    }

    // ==================== Queries ====================

    pub fn build_query(&self, terms: &TermList) -> Result<Query> {
        Ok(terms.compile(&self.world)?)
    }

    pub fn for_each(&self, query: &Query, f: impl FnMut(QueryRow<'_>)) {
        query.for_each(&self.world, f);
    }

    pub fn for_each_mut(&mut self, query: &Query, f: impl FnMut(RowMut<'_>)) {
        query.for_each_mut(&mut self.world, f);
    }

    // ==================== Systems ====================

    pub fn register_system(&mut self, builder: SystemBuilder) -> Result<SystemHandle> {
        Ok(self.scheduler.register_system(&self.world, builder)?)
    }

    pub fn unregister_system(&mut self, handle: SystemHandle) -> Result<()> {
        Ok(self.scheduler.unregister_system(handle)?)
    }

    /// Run one phase.
    pub fn tick(&mut self, phase: Phase, delta: f32) -> Result<PhaseReport> {
        let report = self.scheduler.run_phase(&mut self.world, phase, delta)?;
        if report.commands.applied > 0 {
            self.forget_dead();
        }
        Ok(report)
    }

    /// Run every phase of the pipeline once.
    pub fn progress(&mut self, delta: f32) -> Result<FrameReport> {
        let report = self.scheduler.progress(&mut self.world, delta)?;
        self.forget_dead();
        Ok(report)
    }

    // ==================== Modules ====================

    pub fn load_module(&mut self, module: impl Module) -> Result<()> {
        self.modules
            .load(&mut self.world, &mut self.scheduler, Box::new(module))
    }

    pub fn unload_module(&mut self, name: &str) -> Result<()> {
        self.modules.unload(&mut self.world, &mut self.scheduler, name)
    }

    // ==================== Replication ====================

    pub fn snapshot(&self, entity: Entity, components: &[TypeHandle]) -> Result<Vec<u8>> {
        Ok(self.replication.snapshot(&self.world, entity, components)?)
    }

    pub fn snapshot_all(&self, entity: Entity) -> Result<Vec<u8>> {
        Ok(self.replication.snapshot_all(&self.world, entity)?)
    }

    /// Replicable components of `entity` that changed since the previous
    /// delta.
    pub fn snapshot_delta(&mut self, entity: Entity) -> Result<Vec<u8>> {
        Ok(self.replication.snapshot_delta(&self.world, entity)?)
    }

    pub fn apply_snapshot(&mut self, entity: Entity, bytes: &[u8]) -> Result<ApplyReport> {
        Ok(self.replication.apply(&mut self.world, entity, bytes)?)
    }

    // ==================== Access ====================

    #[must_use]
    pub const fn config(&self) -> &BridgeConfig {
        &self.config
    }

    #[must_use]
    pub const fn world(&self) -> &World {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    #[must_use]
    pub const fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    #[must_use]
    pub const fn lifecycle(&self) -> &LifecycleBridge {
        &self.lifecycle
    }

    #[must_use]
    pub const fn replication(&self) -> &ReplicationAdapter {
        &self.replication
    }

    pub fn replication_mut(&mut self) -> &mut ReplicationAdapter {
        &mut self.replication
    }

    #[must_use]
    pub const fn modules(&self) -> &ModuleRegistry {
        &self.modules
    }

    /// Unload every module, delete every entity without notifying the host,
    /// then clear the type registry.
    pub fn shutdown(&mut self) {
        self.modules.unload_all(&mut self.world, &mut self.scheduler);
        self.lifecycle.begin_shutdown();
        self.world.shutdown();
        self.replication = ReplicationAdapter::with_policy(self.config.role, self.config.authority.into_policy());
        tracing::info!(world = %self.config.world_name, "bridge shut down");
    }

    /// Cascades and deferred despawns kill entities the bridge never saw.
    fn forget_dead(&mut self) {
        self.replication.retain_alive(&self.world);
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("world", &self.config.world_name)
            .field("entities", &self.world.entity_count())
            .field("scheduler", &self.scheduler)
            .field("lifecycle", &self.lifecycle)
            .field("modules", &self.modules)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use bytemuck::{Pod, Zeroable};
    use reflecs_net::pod_hooks;
    use reflecs_tick::SchedulerConfig;

    use super::*;
    use crate::error::BridgeError;

    #[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
    #[repr(C)]
    struct Position {
        x: f32,
        y: f32,
    }

    #[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
    #[repr(C)]
    struct Velocity {
        x: f32,
        y: f32,
    }

    fn bridge() -> Bridge {
        Bridge::new(BridgeConfig {
            scheduler: SchedulerConfig {
                parallel: false,
                ..SchedulerConfig::default()
            },
            ..BridgeConfig::default()
        })
        .unwrap()
    }

    fn register(bridge: &mut Bridge) -> (TypeHandle, TypeHandle) {
        let pos = bridge
            .register_component_type(
                TypeDescription::pod::<Position>("Game.Position").replicated(pod_hooks::<Position>()),
            )
            .unwrap();
        let vel = bridge
            .register_component_type(TypeDescription::pod::<Velocity>("Game.Velocity"))
            .unwrap();
        (pos, vel)
    }

    #[test]
    fn test_add_default_and_value() {
        let mut bridge = bridge();
        let (pos, vel) = register(&mut bridge);
        let e = bridge.spawn();

        bridge.add(e, pos, None).unwrap();
        assert_eq!(bridge.get::<Position>(e, pos).unwrap(), Some(Position::default()));

        let value = ComponentValue::from_typed(bridge.world().registry(), vel, Velocity { x: 1.0, y: 2.0 }).unwrap();
        bridge.add(e, vel, Some(value)).unwrap();
        assert_eq!(
            bridge.get::<Velocity>(e, vel).unwrap(),
            Some(Velocity { x: 1.0, y: 2.0 })
        );
    }

    #[test]
    fn test_add_value_of_other_type() {
        let mut bridge = bridge();
        let (pos, vel) = register(&mut bridge);
        let e = bridge.spawn();

        let value = ComponentValue::from_typed(bridge.world().registry(), vel, Velocity::default()).unwrap();
        let err = bridge.add(e, pos, Some(value)).unwrap_err();
        assert!(matches!(err, BridgeError::Ecs(EcsError::TypeMismatch { .. })));
        assert!(!bridge.has(e, pos));
    }

    #[test]
    fn test_stale_entity_reads_empty() {
        let mut bridge = bridge();
        let (pos, _) = register(&mut bridge);
        let e = bridge.spawn();
        bridge.set(e, pos, Position { x: 1.0, y: 1.0 }).unwrap();

        assert!(bridge.destroy(e));
        assert!(!bridge.destroy(e));
        assert_eq!(bridge.get::<Position>(e, pos).unwrap(), None);
        assert!(bridge.get_value(e, pos).is_none());
    }

    #[test]
    fn test_progress_moves_entities() {
        let mut bridge = bridge();
        let (pos, vel) = register(&mut bridge);
        let e = bridge.spawn();
        bridge.set(e, pos, Position::default()).unwrap();
        bridge.set(e, vel, Velocity { x: 2.0, y: -1.0 }).unwrap();

        bridge
            .register_system(
                SystemBuilder::new("move")
                    .terms(TermList::new().write(pos).read(vel))
                    .run(move |ctx| {
                        let delta = ctx.delta();
                        ctx.for_each(|row| {
                            let p: Position = row.get(pos)?;
                            let v: Velocity = row.get(vel)?;
                            row.set(pos, Position {
                                x: v.x.mul_add(delta, p.x),
                                y: v.y.mul_add(delta, p.y),
                            })
                        })
                    }),
            )
            .unwrap();

        bridge.progress(0.5).unwrap();
        assert_eq!(
            bridge.get::<Position>(e, pos).unwrap(),
            Some(Position { x: 1.0, y: -0.5 })
        );
    }

    #[test]
    fn test_destroy_object_forgets_network_id() {
        let mut bridge = bridge();
        let (pos, _) = register(&mut bridge);
        let e = bridge
            .create_object(ObjectId(1), &EntityRecord::new().with(pos))
            .unwrap()
            .unwrap();
        let id = bridge.replication_mut().network_ids_mut().allocate(e);

        assert!(bridge.destroy_object(ObjectId(1)));
        assert!(!bridge.destroy_object(ObjectId(1)));
        assert_eq!(bridge.replication().network_ids().entity(id), None);
        assert_eq!(bridge.entity_of(ObjectId(1)), None);
    }

    #[test]
    fn test_cascade_forgets_child_replication_state() {
        let mut bridge = bridge();
        let (pos, _) = register(&mut bridge);
        bridge
            .create_object(ObjectId(1), &EntityRecord::new().with(pos))
            .unwrap();
        let child = bridge.attach(ObjectId(2), ObjectId(1)).unwrap();
        bridge.set(child, pos, Position { x: 1.0, y: 0.0 }).unwrap();
        bridge.snapshot_delta(child).unwrap();
        bridge.replication_mut().mark_local_write(child, pos);
        assert_eq!(bridge.replication().baseline_count(), 1);

        assert!(bridge.destroy_object(ObjectId(1)));
        assert!(!bridge.world().is_alive(child));
        assert_eq!(bridge.replication().baseline_count(), 0);
        assert_eq!(bridge.replication().local_write_count(), 0);
    }

    #[test]
    fn test_deferred_despawn_forgets_replication_state() {
        let mut bridge = bridge();
        let (pos, _) = register(&mut bridge);
        let e = bridge.spawn();
        bridge.set(e, pos, Position::default()).unwrap();
        bridge.snapshot_delta(e).unwrap();

        bridge
            .register_system(
                SystemBuilder::new("reap")
                    .terms(TermList::new().read(pos))
                    .run(|ctx| {
                        for row in ctx.rows() {
                            ctx.commands().despawn(row.entity());
                        }
                        Ok(())
                    }),
            )
            .unwrap();
        bridge.tick(Phase::ON_UPDATE, 0.0).unwrap();

        assert!(!bridge.world().is_alive(e));
        assert_eq!(bridge.replication().baseline_count(), 0);
    }

    #[test]
    fn test_snapshot_between_bridges() {
        let mut server = bridge();
        let (pos, vel) = register(&mut server);
        let e = server.spawn();
        server.set(e, pos, Position { x: 3.0, y: 4.0 }).unwrap();
        server.set(e, vel, Velocity { x: 9.0, y: 9.0 }).unwrap();
        let bytes = server.snapshot_all(e).unwrap();

        let mut client = bridge();
        let (cpos, cvel) = register(&mut client);
        let ce = client.spawn();
        let report = client.apply_snapshot(ce, &bytes).unwrap();

        assert_eq!(report.applied, vec![cpos]);
        assert_eq!(
            client.get::<Position>(ce, cpos).unwrap(),
            Some(Position { x: 3.0, y: 4.0 })
        );
        // velocity is not replicable
        assert!(!client.has(ce, cvel));
    }

    #[test]
    fn test_query_facade() {
        let mut bridge = bridge();
        let (pos, vel) = register(&mut bridge);
        for (i, x) in [0.0, 1.0, 2.0, 3.0].into_iter().enumerate() {
            let e = bridge.spawn();
            bridge.set(e, pos, Position { x, y: 0.0 }).unwrap();
            if i % 2 == 0 {
                bridge.set(e, vel, Velocity::default()).unwrap();
            }
        }

        let query = bridge.build_query(&TermList::new().write(pos).without(vel)).unwrap();
        bridge.for_each_mut(&query, |mut row| {
            row.set(pos, Position { x: -1.0, y: -1.0 }).unwrap();
        });

        let mut touched = 0;
        bridge.for_each(&query, |row| {
            assert_eq!(row.get::<Position>(pos).unwrap(), Position { x: -1.0, y: -1.0 });
            touched += 1;
        });
        assert_eq!(touched, 2);
    }

    #[test]
    fn test_shutdown_is_silent() {
        let mut bridge = bridge();
        let (pos, _) = register(&mut bridge);
        bridge
            .create_object(ObjectId(7), &EntityRecord::new().with(pos))
            .unwrap();

        bridge.shutdown();
        assert_eq!(bridge.world().entity_count(), 0);
        assert_eq!(bridge.lifecycle().stats().external_deletes, 0);
        assert!(bridge.world().registry().lookup("Game.Position").is_none());
    }
}
