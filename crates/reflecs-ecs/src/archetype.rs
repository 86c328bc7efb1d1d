//! Archetype tables.
//!
//! An archetype is the set of ids an entity carries. Entities with the same
//! set share one table with one [`Column`] per id. Tables are created on
//! demand and never removed, so an [`ArchetypeId`] stays valid for the life
//! of the world and iteration order is creation order.

use std::fmt;

use hashbrown::HashMap;
use rustc_hash::FxBuildHasher;
use smallvec::SmallVec;

use crate::{component::TypeRegistry, entity::Entity, relation::Id, storage::Column};

/// Sorted id set used as an archetype key.
pub type IdSet = SmallVec<[Id; 8]>;

/// Index of an archetype in creation order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArchetypeId(u32);

impl ArchetypeId {
    /// The archetype of entities with no components.
    pub const EMPTY: Self = Self(0);

    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for ArchetypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArchetypeId({})", self.0)
    }
}

/// A table of entities sharing one id set.
pub struct Archetype {
    id: ArchetypeId,
    ids: IdSet,
    columns: Vec<Column>,
    column_index: HashMap<Id, usize, FxBuildHasher>,
    entities: Vec<Entity>,
    add_edges: HashMap<Id, ArchetypeId, FxBuildHasher>,
    remove_edges: HashMap<Id, ArchetypeId, FxBuildHasher>,
}

impl Archetype {
    /// Build a table for `ids`. Returns `None` if an id's type is not
    /// registered.
    fn new(id: ArchetypeId, ids: IdSet, registry: &TypeRegistry) -> Option<Self> {
        let mut columns = Vec::with_capacity(ids.len());
        let mut column_index = HashMap::with_capacity_and_hasher(ids.len(), FxBuildHasher);

        for (idx, &cid) in ids.iter().enumerate() {
            let schema = registry.schema(cid.type_handle())?;
            columns.push(Column::new(schema.clone()));
            column_index.insert(cid, idx);
        }

        Some(Self {
            id,
            ids,
            columns,
            column_index,
            entities: Vec::new(),
            add_edges: HashMap::default(),
            remove_edges: HashMap::default(),
        })
    }

    #[must_use]
    pub const fn id(&self) -> ArchetypeId {
        self.id
    }

    /// The ids of this table, sorted.
    #[must_use]
    pub fn ids(&self) -> &[Id] {
        &self.ids
    }

    #[must_use]
    pub fn contains(&self, id: Id) -> bool {
        if id.is_wildcard() {
            self.ids.iter().any(|have| have.matches(id))
        } else {
            self.column_index.contains_key(&id)
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    #[must_use]
    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    #[must_use]
    pub fn column(&self, id: Id) -> Option<&Column> {
        self.column_index.get(&id).map(|&idx| &self.columns[idx])
    }

    #[must_use]
    pub fn column_mut(&mut self, id: Id) -> Option<&mut Column> {
        self.column_index.get(&id).map(|&idx| &mut self.columns[idx])
    }

    pub(crate) fn columns_mut(&mut self) -> &mut [Column] {
        &mut self.columns
    }

    /// Append an entity row. Columns must be filled by the caller.
    pub(crate) fn push_entity(&mut self, entity: Entity) -> usize {
        self.entities.push(entity);
        self.entities.len() - 1
    }

    /// Swap-remove the entity row. Columns must already have been emptied at
    /// `row`. Returns the entity moved into `row`, if any.
    pub(crate) fn swap_remove_entity(&mut self, row: usize) -> Option<Entity> {
        self.entities.swap_remove(row);
        self.entities.get(row).copied()
    }
}

impl fmt::Debug for Archetype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Archetype")
            .field("id", &self.id)
            .field("ids", &self.ids)
            .field("entity_count", &self.entities.len())
            .finish()
    }
}

/// All archetypes of a world.
pub struct ArchetypeStorage {
    archetypes: Vec<Archetype>,
    by_ids: HashMap<IdSet, ArchetypeId, FxBuildHasher>,
}

impl Default for ArchetypeStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchetypeStorage {
    #[must_use]
    pub fn new() -> Self {
        let empty = Archetype {
            id: ArchetypeId::EMPTY,
            ids: IdSet::new(),
            columns: Vec::new(),
            column_index: HashMap::default(),
            entities: Vec::new(),
            add_edges: HashMap::default(),
            remove_edges: HashMap::default(),
        };
        let mut by_ids = HashMap::default();
        by_ids.insert(IdSet::new(), ArchetypeId::EMPTY);
        Self {
            archetypes: vec![empty],
            by_ids,
        }
    }

    #[must_use]
    pub fn get(&self, id: ArchetypeId) -> Option<&Archetype> {
        self.archetypes.get(id.index())
    }

    #[must_use]
    pub fn get_mut(&mut self, id: ArchetypeId) -> Option<&mut Archetype> {
        self.archetypes.get_mut(id.index())
    }

    /// Borrow two distinct archetypes mutably.
    pub(crate) fn pair_mut(
        &mut self,
        a: ArchetypeId,
        b: ArchetypeId,
    ) -> (&mut Archetype, &mut Archetype) {
        debug_assert_ne!(a, b);
        if a.index() < b.index() {
            let (lo, hi) = self.archetypes.split_at_mut(b.index());
            (&mut lo[a.index()], &mut hi[0])
        } else {
            let (lo, hi) = self.archetypes.split_at_mut(a.index());
            (&mut hi[0], &mut lo[b.index()])
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.archetypes.len()
    }

    /// Always false: the empty archetype exists from the start.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.archetypes.is_empty()
    }

    /// Archetypes in creation order.
    pub fn iter(&self) -> impl Iterator<Item = &Archetype> {
        self.archetypes.iter()
    }

    /// Archetypes created at or after position `from`.
    pub fn iter_from(&self, from: usize) -> impl Iterator<Item = &Archetype> {
        self.archetypes.iter().skip(from)
    }

    pub fn get_or_create(&mut self, ids: IdSet, registry: &TypeRegistry) -> Option<ArchetypeId> {
        if let Some(&id) = self.by_ids.get(&ids) {
            return Some(id);
        }

        let id = ArchetypeId(self.archetypes.len() as u32);
        let archetype = Archetype::new(id, ids.clone(), registry)?;
        tracing::trace!(?id, ids = ?archetype.ids, "created archetype");
        self.archetypes.push(archetype);
        self.by_ids.insert(ids, id);
        Some(id)
    }

    /// The archetype reached by adding `id` to `base`.
    pub fn with_id(
        &mut self,
        base: ArchetypeId,
        id: Id,
        registry: &TypeRegistry,
    ) -> Option<ArchetypeId> {
        let from = self.get(base)?;
        if from.contains(id) {
            return Some(base);
        }
        if let Some(&next) = from.add_edges.get(&id) {
            return Some(next);
        }

        let mut ids = from.ids.clone();
        let pos = ids.binary_search(&id).unwrap_or_else(|pos| pos);
        ids.insert(pos, id);

        let next = self.get_or_create(ids, registry)?;
        self.archetypes[base.index()].add_edges.insert(id, next);
        Some(next)
    }

    /// The archetype reached by removing `id` from `base`.
    pub fn without_id(
        &mut self,
        base: ArchetypeId,
        id: Id,
        registry: &TypeRegistry,
    ) -> Option<ArchetypeId> {
        let from = self.get(base)?;
        if !from.contains(id) {
            return Some(base);
        }
        if let Some(&next) = from.remove_edges.get(&id) {
            return Some(next);
        }

        let ids: IdSet = from.ids.iter().copied().filter(|&have| have != id).collect();
        let next = self.get_or_create(ids, registry)?;
        self.archetypes[base.index()].remove_edges.insert(id, next);
        Some(next)
    }

    /// Drop every table, destroying all stored values.
    pub(crate) fn reset(&mut self) {
        *self = Self::new();
    }
}

impl fmt::Debug for ArchetypeStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchetypeStorage")
            .field("archetype_count", &self.archetypes.len())
            .finish()
    }
}
