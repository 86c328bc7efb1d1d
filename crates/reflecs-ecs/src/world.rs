//! World - entity store, type registry and archetype tables in one place.
//!
//! Structural operations (spawn, despawn, add, remove) take `&mut self`.
//! Phase execution only ever holds `&World`, so the borrow checker keeps
//! structural changes on the main thread between phases.

use std::sync::Arc;

use hashbrown::HashMap;
use rustc_hash::FxBuildHasher;

use crate::{
    archetype::{ArchetypeId, ArchetypeStorage},
    component::{Classification, Reflect, TypeDescription, TypeDescriptor, TypeHandle, TypeRegistry},
    entity::{Entity, EntityAllocator, EntityIndex},
    error::{EcsError, EcsResult, QueryError, SchemaError},
    relation::{CHILD_OF, CleanupPolicy, Id},
    storage::Column,
};

/// Called with every despawned entity, after its storage is gone.
pub type DespawnHook = Arc<dyn Fn(Entity) + Send + Sync>;

/// Where an entity's row lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntityLocation {
    pub archetype: ArchetypeId,
    pub row: usize,
}

/// The ECS world.
pub struct World {
    registry: TypeRegistry,
    entities: EntityAllocator,
    locations: Vec<Option<EntityLocation>>,
    archetypes: ArchetypeStorage,
    names: HashMap<String, Entity, FxBuildHasher>,
    entity_names: HashMap<EntityIndex, String, FxBuildHasher>,
    despawn_hooks: Vec<DespawnHook>,
    child_of: TypeHandle,
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl World {
    #[must_use]
    pub fn new() -> Self {
        let mut registry = TypeRegistry::new();
        let child_of = Self::register_builtins(&mut registry);
        Self {
            registry,
            entities: EntityAllocator::new(),
            locations: Vec::new(),
            archetypes: ArchetypeStorage::new(),
            names: HashMap::default(),
            entity_names: HashMap::default(),
            despawn_hooks: Vec::new(),
            child_of,
        }
    }

    fn register_builtins(registry: &mut TypeRegistry) -> TypeHandle {
        registry
            .register(TypeDescription::tag(CHILD_OF).relationship(CleanupPolicy::Delete))
            .expect("built-in ChildOf description is well formed")
    }

    /// Tear down: despawn every entity, run despawn hooks, then clear the
    /// type registry. Built-in types are registered again so the world can
    /// be reloaded.
    pub fn shutdown(&mut self) {
        let live: Vec<Entity> = (0..self.locations.len() as EntityIndex)
            .filter_map(|index| self.entities.resolve(index))
            .collect();

        self.archetypes.reset();
        self.entities.clear();
        self.locations.clear();
        self.names.clear();
        self.entity_names.clear();

        for &entity in &live {
            for hook in &self.despawn_hooks {
                hook(entity);
            }
        }

        self.registry.clear();
        self.child_of = Self::register_builtins(&mut self.registry);
        tracing::info!(despawned = live.len(), "world shut down");
    }

    // ==================== Types ====================

    pub fn register_type(&mut self, desc: TypeDescription) -> Result<TypeHandle, SchemaError> {
        self.registry.register(desc)
    }

    pub fn register<T: Reflect>(&mut self) -> Result<TypeHandle, SchemaError> {
        self.registry.register(T::describe())
    }

    #[must_use]
    pub fn handle_of<T: 'static>(&self) -> Option<TypeHandle> {
        self.registry.handle_of::<T>()
    }

    #[must_use]
    pub const fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    /// Handle of the built-in hierarchy relation.
    #[must_use]
    pub const fn child_of(&self) -> TypeHandle {
        self.child_of
    }

    pub(crate) fn descriptor(&self, handle: TypeHandle) -> EcsResult<&Arc<TypeDescriptor>> {
        self.registry
            .descriptor(handle)
            .ok_or(EcsError::UnknownType(handle))
    }

    #[must_use]
    pub const fn archetypes(&self) -> &ArchetypeStorage {
        &self.archetypes
    }

    // ==================== Entities ====================

    pub fn spawn(&mut self) -> Entity {
        let entity = self.entities.allocate();
        let slot = entity.index() as usize;
        if slot >= self.locations.len() {
            self.locations.resize(slot + 1, None);
        }

        let row = self
            .archetypes
            .get_mut(ArchetypeId::EMPTY)
            .map_or(0, |empty| empty.push_entity(entity));
        self.locations[slot] = Some(EntityLocation {
            archetype: ArchetypeId::EMPTY,
            row,
        });

        tracing::trace!(%entity, "spawned");
        entity
    }

    #[must_use]
    pub fn is_alive(&self, entity: Entity) -> bool {
        self.entities.is_alive(entity)
    }

    #[must_use]
    pub const fn entity_count(&self) -> u32 {
        self.entities.alive_count()
    }

    /// The live entity occupying slot `index`.
    #[must_use]
    pub fn resolve_index(&self, index: EntityIndex) -> Option<Entity> {
        self.entities.resolve(index)
    }

    #[must_use]
    pub fn location(&self, entity: Entity) -> Option<EntityLocation> {
        if !self.entities.is_alive(entity) {
            return None;
        }
        self.locations.get(entity.index() as usize).copied().flatten()
    }

    /// Location for a write; stale handles are logged.
    pub(crate) fn location_for_write(&self, entity: Entity) -> EcsResult<EntityLocation> {
        self.location(entity).ok_or_else(|| {
            tracing::warn!(%entity, "write to stale entity ignored");
            EcsError::StaleHandle(entity)
        })
    }

    /// Despawn `entity` and apply relationship cleanup to entities that point
    /// at it. Returns `false` for stale handles.
    pub fn despawn(&mut self, entity: Entity) -> bool {
        if !self.is_alive(entity) {
            return false;
        }

        let mut pending = vec![entity];
        while let Some(next) = pending.pop() {
            if !self.is_alive(next) {
                continue;
            }
            for (source, id, policy) in self.pair_sources(next) {
                match policy {
                    CleanupPolicy::Delete => pending.push(source),
                    CleanupPolicy::Remove => {
                        if let Err(err) = self.remove(source, id) {
                            tracing::debug!(%source, %err, "pair cleanup skipped");
                        }
                    }
                }
            }
            self.despawn_one(next);
        }
        true
    }

    /// Entities holding a pair whose target is `target`.
    fn pair_sources(&self, target: Entity) -> Vec<(Entity, Id, CleanupPolicy)> {
        let mut sources = Vec::new();
        for archetype in self.archetypes.iter() {
            for &id in archetype.ids() {
                if id.target_index() != Some(target.index()) {
                    continue;
                }
                let policy = self
                    .registry
                    .descriptor(id.type_handle())
                    .map_or(CleanupPolicy::Remove, |d| d.cleanup());
                sources.extend(archetype.entities().iter().map(|&e| (e, id, policy)));
            }
        }
        sources
    }

    fn despawn_one(&mut self, entity: Entity) {
        let Some(loc) = self
            .locations
            .get_mut(entity.index() as usize)
            .and_then(Option::take)
        else {
            return;
        };

        if let Some(archetype) = self.archetypes.get_mut(loc.archetype) {
            for column in archetype.columns_mut() {
                // SAFETY: loc.row is this entity's row in every column
                unsafe { column.swap_remove_drop(loc.row) };
            }
            if let Some(moved) = archetype.swap_remove_entity(loc.row) {
                if let Some(Some(moved_loc)) = self.locations.get_mut(moved.index() as usize) {
                    moved_loc.row = loc.row;
                }
            }
        }

        if let Some(name) = self.entity_names.remove(&entity.index()) {
            self.names.remove(&name);
        }
        self.entities.deallocate(entity);
        tracing::trace!(%entity, "despawned");

        for hook in &self.despawn_hooks {
            hook(entity);
        }
    }

    /// Register a callback run after every despawn, whatever triggered it.
    pub fn on_despawn(&mut self, hook: DespawnHook) {
        self.despawn_hooks.push(hook);
    }

    // ==================== Structure ====================

    #[must_use]
    pub fn has(&self, entity: Entity, id: impl Into<Id>) -> bool {
        let id = id.into();
        self.location(entity)
            .and_then(|loc| self.archetypes.get(loc.archetype))
            .is_some_and(|archetype| archetype.contains(id))
    }

    /// Add `id` with its default value. Returns `false` if already present.
    pub fn add(&mut self, entity: Entity, id: impl Into<Id>) -> EcsResult<bool> {
        let id = id.into();
        let loc = self.location_for_write(entity)?;
        self.check_id(id)?;
        if self.has(entity, id) {
            return Ok(false);
        }

        let schema = self
            .registry
            .schema(id.type_handle())
            .ok_or(EcsError::UnknownType(id.type_handle()))?;
        if !schema.can_default() {
            return Err(SchemaError::NoDefault {
                path: schema.name().to_owned(),
            }
            .into());
        }

        self.insert_with(entity, loc, id, |column| {
            // Defaultability was checked above.
            let pushed = column.push_default();
            debug_assert!(pushed.is_ok());
        })?;
        Ok(true)
    }

    /// Remove `id`. Returns `false` if it was not present.
    pub fn remove(&mut self, entity: Entity, id: impl Into<Id>) -> EcsResult<bool> {
        let id = id.into();
        let loc = self.location_for_write(entity)?;
        let target = self
            .archetypes
            .without_id(loc.archetype, id, &self.registry)
            .ok_or(EcsError::UnknownType(id.type_handle()))?;
        if target == loc.archetype {
            return Ok(false);
        }
        let row = self.move_to(entity, loc, target);
        self.locations[entity.index() as usize] = Some(EntityLocation {
            archetype: target,
            row,
        });
        Ok(true)
    }

    /// Validate that `id` is a concrete, registered id.
    pub(crate) fn check_id(&self, id: Id) -> EcsResult<()> {
        let desc = self.descriptor(id.type_handle())?;
        if id.is_pair() {
            if id.is_wildcard() {
                return Err(QueryError::WildcardStored(desc.path().to_owned()).into());
            }
            if desc.classification() != Classification::Relationship {
                return Err(QueryError::NotRelationship(desc.path().to_owned()).into());
            }
        }
        Ok(())
    }

    /// Move `entity` into the archetype extended by `id` and let `init`
    /// construct the new value at the end of its column.
    pub(crate) fn insert_with(
        &mut self,
        entity: Entity,
        loc: EntityLocation,
        id: Id,
        init: impl FnOnce(&mut Column),
    ) -> EcsResult<()> {
        let target = self
            .archetypes
            .with_id(loc.archetype, id, &self.registry)
            .ok_or(EcsError::UnknownType(id.type_handle()))?;
        debug_assert_ne!(target, loc.archetype);

        let row = self.move_to(entity, loc, target);
        if let Some(column) = self
            .archetypes
            .get_mut(target)
            .and_then(|archetype| archetype.column_mut(id))
        {
            init(column);
            debug_assert_eq!(column.len(), row + 1);
        }
        self.locations[entity.index() as usize] = Some(EntityLocation {
            archetype: target,
            row,
        });
        Ok(())
    }

    /// Relocate the row of `entity` into `target`. Values whose id is not in
    /// `target` are destroyed; columns of `target` that `entity` had no value
    /// for are left one short for the caller to fill.
    fn move_to(&mut self, entity: Entity, loc: EntityLocation, target: ArchetypeId) -> usize {
        let (src, dst) = self.archetypes.pair_mut(loc.archetype, target);
        let new_row = dst.push_entity(entity);

        let ids: crate::archetype::IdSet = src.ids().iter().copied().collect();
        for (column, id) in src.columns_mut().iter_mut().zip(ids) {
            match dst.column_mut(id) {
                // SAFETY: loc.row is the entity's row; both columns share a schema
                Some(dst_column) => unsafe { column.swap_remove_into(loc.row, dst_column) },
                // SAFETY: loc.row is the entity's row
                None => unsafe { column.swap_remove_drop(loc.row) },
            }
        }

        if let Some(moved) = src.swap_remove_entity(loc.row) {
            if let Some(Some(moved_loc)) = self.locations.get_mut(moved.index() as usize) {
                moved_loc.row = loc.row;
            }
        }
        new_row
    }

    /// Pointer to the value of `id` on `entity`, if present.
    pub(crate) fn value_ptr(&self, entity: Entity, id: Id) -> Option<(*mut u8, &Column)> {
        let loc = self.location(entity)?;
        let column = self.archetypes.get(loc.archetype)?.column(id)?;
        // SAFETY: loc.row is a live row of this column
        Some((unsafe { column.ptr(loc.row) }, column))
    }

    // ==================== Relationships ====================

    pub fn add_pair(&mut self, entity: Entity, relation: TypeHandle, target: Entity) -> EcsResult<bool> {
        if !self.is_alive(target) {
            return Err(EcsError::StaleHandle(target));
        }
        self.add(entity, Id::pair(relation, target))
    }

    pub fn remove_pair(&mut self, entity: Entity, relation: TypeHandle, target: Entity) -> EcsResult<bool> {
        self.remove(entity, Id::pair(relation, target))
    }

    #[must_use]
    pub fn has_pair(&self, entity: Entity, relation: TypeHandle, target: Entity) -> bool {
        self.is_alive(target) && self.has(entity, Id::pair(relation, target))
    }

    /// Live targets of `relation` on `entity`.
    #[must_use]
    pub fn targets(&self, entity: Entity, relation: TypeHandle) -> Vec<Entity> {
        let Some(archetype) = self
            .location(entity)
            .and_then(|loc| self.archetypes.get(loc.archetype))
        else {
            return Vec::new();
        };
        let pattern = Id::wildcard(relation);
        archetype
            .ids()
            .iter()
            .filter(|id| id.matches(pattern))
            .filter_map(|id| id.target_index())
            .filter_map(|index| self.entities.resolve(index))
            .collect()
    }

    #[must_use]
    pub fn parent_of(&self, entity: Entity) -> Option<Entity> {
        self.targets(entity, self.child_of).into_iter().next()
    }

    /// Make `parent` the only `ChildOf` target of `child`.
    pub fn set_parent(&mut self, child: Entity, parent: Entity) -> EcsResult<()> {
        let child_of = self.child_of;
        for old in self.targets(child, child_of) {
            if old != parent {
                self.remove_pair(child, child_of, old)?;
            }
        }
        self.add_pair(child, child_of, parent)?;
        Ok(())
    }

    #[must_use]
    pub fn children_of(&self, parent: Entity) -> Vec<Entity> {
        let id = Id::pair(self.child_of, parent);
        if !self.is_alive(parent) {
            return Vec::new();
        }
        self.archetypes
            .iter()
            .filter(|archetype| archetype.contains(id))
            .flat_map(|archetype| archetype.entities().iter().copied())
            .collect()
    }

    // ==================== Names ====================

    /// Name `entity`. Fails with `false` if another live entity has the name.
    pub fn set_name(&mut self, entity: Entity, name: impl Into<String>) -> EcsResult<bool> {
        let name = name.into();
        self.location_for_write(entity)?;
        if let Some(&owner) = self.names.get(&name) {
            if owner != entity && self.is_alive(owner) {
                return Ok(false);
            }
        }
        if let Some(old) = self.entity_names.remove(&entity.index()) {
            self.names.remove(&old);
        }
        self.names.insert(name.clone(), entity);
        self.entity_names.insert(entity.index(), name);
        Ok(true)
    }

    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<Entity> {
        self.names
            .get(name)
            .copied()
            .filter(|&entity| self.is_alive(entity))
    }

    #[must_use]
    pub fn name_of(&self, entity: Entity) -> Option<&str> {
        if !self.is_alive(entity) {
            return None;
        }
        self.entity_names.get(&entity.index()).map(String::as_str)
    }
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("entities", &self.entities.alive_count())
            .field("types", &self.registry.len())
            .field("archetypes", &self.archetypes.len())
            .finish()
    }
}
