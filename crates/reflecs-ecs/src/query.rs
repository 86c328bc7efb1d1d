//! Query facade over archetype tables.
//!
//! A [`TermList`] is built with method chaining, then compiled once against a
//! world into a [`Query`]. Compilation resolves every term to an [`Id`] and
//! rejects contradictory or ill-typed lists up front, so iteration itself
//! never fails on the shape of the query.
//!
//! # Basic Usage
//!
//! ```ignore
//! let query = TermList::new()
//!     .write(position)
//!     .read(velocity)
//!     .without(frozen)
//!     .compile(&world)?;
//!
//! for row in query.iter(&world) {
//!     let pos: Position = row.get(position)?;
//! }
//! ```
//!
//! # Terms
//!
//! - `.read(h)` / `.write(h)` - entity must have `h`; declares access
//! - `.with(h)` - entity must have `h`; no data access
//! - `.without(h)` - entity must NOT have `h`
//! - `.optional_read(h)` / `.optional_write(h)` - access `h` if present
//! - `.pair(rel, target)` / `.pair_any(rel)` - relationship terms
//!
//! Matching archetypes are cached. Archetypes created after compilation are
//! picked up on the next iteration, in creation order.

use std::{mem::ManuallyDrop, ops::Deref, sync::Arc};

use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::{
    archetype::{Archetype, ArchetypeId},
    component::TypeHandle,
    entity::Entity,
    error::{EcsError, EcsResult, QueryError},
    relation::Id,
    value::{ComponentValue, check_typed},
    world::World,
};

// ============================================================================
// Term Types
// ============================================================================

/// How a term's data is accessed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Access {
    /// Filter only.
    None,
    Read,
    Write,
}

/// Whether a term is required, excluded or optional.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TermOper {
    And,
    Not,
    Optional,
}

/// Target of a relationship term.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TermTarget {
    Entity(Entity),
    /// Any target.
    Any,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TermId {
    Component(TypeHandle),
    Pair(TypeHandle, TermTarget),
}

/// A single term in a term list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Term {
    pub id: TermId,
    pub oper: TermOper,
    pub access: Access,
}

// ============================================================================
// TermList - runtime builder
// ============================================================================

/// Required, excluded and optional terms of a query or system.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TermList {
    terms: Vec<Term>,
}

impl TermList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, id: TermId, oper: TermOper, access: Access) -> Self {
        self.terms.push(Term { id, oper, access });
        self
    }

    #[must_use]
    pub fn read(self, handle: TypeHandle) -> Self {
        self.push(TermId::Component(handle), TermOper::And, Access::Read)
    }

    #[must_use]
    pub fn write(self, handle: TypeHandle) -> Self {
        self.push(TermId::Component(handle), TermOper::And, Access::Write)
    }

    /// Require `handle` without accessing it.
    #[must_use]
    pub fn with(self, handle: TypeHandle) -> Self {
        self.push(TermId::Component(handle), TermOper::And, Access::None)
    }

    #[must_use]
    pub fn without(self, handle: TypeHandle) -> Self {
        self.push(TermId::Component(handle), TermOper::Not, Access::None)
    }

    #[must_use]
    pub fn optional_read(self, handle: TypeHandle) -> Self {
        self.push(TermId::Component(handle), TermOper::Optional, Access::Read)
    }

    #[must_use]
    pub fn optional_write(self, handle: TypeHandle) -> Self {
        self.push(TermId::Component(handle), TermOper::Optional, Access::Write)
    }

    /// Require the `(relation, target)` pair.
    #[must_use]
    pub fn pair(self, relation: TypeHandle, target: Entity) -> Self {
        self.push(
            TermId::Pair(relation, TermTarget::Entity(target)),
            TermOper::And,
            Access::None,
        )
    }

    /// Require some pair with `relation`, whatever its target.
    #[must_use]
    pub fn pair_any(self, relation: TypeHandle) -> Self {
        self.push(TermId::Pair(relation, TermTarget::Any), TermOper::And, Access::None)
    }

    #[must_use]
    pub fn without_pair(self, relation: TypeHandle, target: TermTarget) -> Self {
        self.push(TermId::Pair(relation, target), TermOper::Not, Access::None)
    }

    #[must_use]
    pub fn terms(&self) -> &[Term] {
        &self.terms
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Types read but not written.
    pub fn reads(&self) -> impl Iterator<Item = TypeHandle> + '_ {
        self.accessed(Access::Read)
    }

    pub fn writes(&self) -> impl Iterator<Item = TypeHandle> + '_ {
        self.accessed(Access::Write)
    }

    fn accessed(&self, access: Access) -> impl Iterator<Item = TypeHandle> + '_ {
        self.terms.iter().filter_map(move |term| match term.id {
            TermId::Component(handle) if term.access == access && term.oper != TermOper::Not => Some(handle),
            _ => None,
        })
    }

    /// Resolve every term against `world`.
    pub fn compile(&self, world: &World) -> Result<Query, QueryError> {
        let registry = world.registry();
        let mut compiled: Vec<CompiledTerm> = Vec::with_capacity(self.terms.len());

        for term in &self.terms {
            let (id, target) = match term.id {
                TermId::Component(handle) => {
                    let desc = registry
                        .descriptor(handle)
                        .ok_or(QueryError::UnknownType(handle))?;
                    if term.access == Access::Write && desc.is_tag() {
                        return Err(QueryError::WriteToTag(desc.path().to_owned()));
                    }
                    (Id::component(handle), None)
                }
                TermId::Pair(relation, target) => {
                    let desc = registry
                        .descriptor(relation)
                        .ok_or(QueryError::UnknownType(relation))?;
                    if desc.classification() != crate::component::Classification::Relationship {
                        return Err(QueryError::NotRelationship(desc.path().to_owned()));
                    }
                    match target {
                        TermTarget::Any => (Id::wildcard(relation), None),
                        TermTarget::Entity(entity) => {
                            if !world.is_alive(entity) {
                                return Err(QueryError::StaleTarget(entity));
                            }
                            (Id::pair(relation, entity), Some(entity))
                        }
                    }
                }
            };
            compiled.push(CompiledTerm {
                id,
                oper: term.oper,
                target,
            });
        }

        for required in compiled.iter().filter(|t| t.oper == TermOper::And) {
            let excluded = compiled
                .iter()
                .any(|t| t.oper == TermOper::Not && t.id == required.id);
            if excluded {
                let name = registry
                    .descriptor(required.id.type_handle())
                    .map_or_else(|| format!("{:?}", required.id), |d| d.path().to_owned());
                return Err(QueryError::Contradiction(name));
            }
        }

        tracing::trace!(terms = compiled.len(), "compiled query");
        Ok(Query {
            terms: compiled.into_iter().collect(),
            source: self.clone(),
            cache: RwLock::new(MatchCache::default()),
        })
    }
}

// ============================================================================
// Query - compiled, cached
// ============================================================================

#[derive(Clone, Copy, Debug)]
struct CompiledTerm {
    id: Id,
    oper: TermOper,
    target: Option<Entity>,
}

#[derive(Default)]
struct MatchCache {
    matched: Arc<Vec<ArchetypeId>>,
    seen: usize,
}

/// A compiled query. Safe to share between threads; the archetype cache is
/// updated under a lock.
pub struct Query {
    terms: SmallVec<[CompiledTerm; 8]>,
    source: TermList,
    cache: RwLock<MatchCache>,
}

impl Query {
    /// The term list this query was compiled from.
    #[must_use]
    pub fn terms(&self) -> &TermList {
        &self.source
    }

    fn matches(&self, archetype: &Archetype) -> bool {
        self.terms.iter().all(|term| match term.oper {
            TermOper::And => archetype.contains(term.id),
            TermOper::Not => !archetype.contains(term.id),
            TermOper::Optional => true,
        })
    }

    /// A required pair target died after compilation; nothing can match.
    fn target_lost(&self, world: &World) -> bool {
        self.terms.iter().any(|term| {
            term.oper == TermOper::And && term.target.is_some_and(|e| !world.is_alive(e))
        })
    }

    /// Bring the archetype cache up to date and return the matches.
    pub fn refresh(&self, world: &World) -> Arc<Vec<ArchetypeId>> {
        let storage = world.archetypes();
        {
            let cache = self.cache.read();
            if cache.seen == storage.len() {
                return Arc::clone(&cache.matched);
            }
        }

        let mut cache = self.cache.write();
        if cache.seen > storage.len() {
            *cache = MatchCache::default();
        }
        let fresh: Vec<ArchetypeId> = storage
            .iter_from(cache.seen)
            .filter(|archetype| self.matches(archetype))
            .map(Archetype::id)
            .collect();
        if !fresh.is_empty() {
            Arc::make_mut(&mut cache.matched).extend(fresh);
        }
        cache.seen = storage.len();
        Arc::clone(&cache.matched)
    }

    /// Iterate matching rows, archetype by archetype.
    pub fn iter<'w>(&self, world: &'w World) -> QueryIter<'w> {
        let matched = if self.target_lost(world) {
            Arc::default()
        } else {
            self.refresh(world)
        };
        QueryIter {
            world,
            matched,
            archetype_idx: 0,
            row: 0,
        }
    }

    pub fn for_each<F>(&self, world: &World, mut f: F)
    where
        F: FnMut(QueryRow<'_>),
    {
        for row in self.iter(world) {
            f(row);
        }
    }

    /// Iterate with write access to every matched value. Structural changes
    /// are not possible while rows are borrowed.
    pub fn for_each_mut<F>(&self, world: &mut World, mut f: F)
    where
        F: FnMut(RowMut<'_>),
    {
        for row in self.iter(world) {
            f(RowMut { row });
        }
    }

    /// Non-empty matching archetypes, for chunked iteration.
    pub fn archetypes<'w>(&self, world: &'w World) -> impl Iterator<Item = &'w Archetype> + 'w {
        let matched = if self.target_lost(world) {
            Arc::default()
        } else {
            self.refresh(world)
        };
        let storage = world.archetypes();
        (0..matched.len())
            .filter_map(move |idx| storage.get(matched[idx]))
            .filter(|archetype| !archetype.is_empty())
    }

    #[must_use]
    pub fn count(&self, world: &World) -> usize {
        self.archetypes(world).map(Archetype::len).sum()
    }
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("term_count", &self.terms.len())
            .field("matching_archetypes", &self.cache.read().matched.len())
            .finish()
    }
}

// ============================================================================
// QueryIter
// ============================================================================

/// Iterator over query results.
pub struct QueryIter<'w> {
    world: &'w World,
    matched: Arc<Vec<ArchetypeId>>,
    archetype_idx: usize,
    row: usize,
}

impl<'w> Iterator for QueryIter<'w> {
    type Item = QueryRow<'w>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let &arch_id = self.matched.get(self.archetype_idx)?;
            let archetype = self.world.archetypes().get(arch_id)?;

            if self.row >= archetype.len() {
                self.archetype_idx += 1;
                self.row = 0;
                continue;
            }

            let row = self.row;
            self.row += 1;
            return Some(QueryRow {
                world: self.world,
                archetype,
                entity: archetype.entities()[row],
                row,
            });
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let storage = self.world.archetypes();
        let remaining = self.matched[self.archetype_idx.min(self.matched.len())..]
            .iter()
            .filter_map(|&id| storage.get(id))
            .map(Archetype::len)
            .sum::<usize>()
            .saturating_sub(self.row);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for QueryIter<'_> {}

// ============================================================================
// QueryRow
// ============================================================================

/// One matched entity.
pub struct QueryRow<'w> {
    world: &'w World,
    archetype: &'w Archetype,
    entity: Entity,
    row: usize,
}

impl<'w> QueryRow<'w> {
    #[must_use]
    pub const fn entity(&self) -> Entity {
        self.entity
    }

    #[must_use]
    pub const fn world(&self) -> &'w World {
        self.world
    }

    #[must_use]
    pub fn has(&self, id: impl Into<Id>) -> bool {
        self.archetype.contains(id.into())
    }

    /// Copy of a component the query requires.
    pub fn get<T: 'static>(&self, handle: TypeHandle) -> EcsResult<T> {
        self.try_get(handle)?.ok_or_else(|| EcsError::MissingComponent {
            entity: self.entity,
            type_name: self
                .world
                .registry()
                .descriptor(handle)
                .map_or_else(String::new, |d| d.path().to_owned()),
        })
    }

    /// Copy of an optional component.
    pub fn try_get<T: 'static>(&self, handle: TypeHandle) -> EcsResult<Option<T>> {
        check_typed::<T>(self.world.descriptor(handle)?)?;
        let Some(column) = self.archetype.column(Id::component(handle)) else {
            return Ok(None);
        };
        let mut out = std::mem::MaybeUninit::<T>::uninit();
        // SAFETY: row is live in this column; out is fresh storage for T
        unsafe {
            column
                .schema()
                .copy_into(out.as_mut_ptr().cast(), column.ptr(self.row));
            Ok(Some(out.assume_init()))
        }
    }

    #[must_use]
    pub fn get_value(&self, id: impl Into<Id>) -> Option<ComponentValue> {
        let id = id.into();
        let descriptor = self.world.registry().descriptor(id.type_handle())?;
        let column = self.archetype.column(id)?;
        // SAFETY: row is live in this column
        Some(unsafe {
            ComponentValue::copy_from(Arc::clone(descriptor), column.schema().clone(), column.ptr(self.row))
        })
    }

    /// First live target of `relation` on this entity.
    #[must_use]
    pub fn target(&self, relation: TypeHandle) -> Option<Entity> {
        let pattern = Id::wildcard(relation);
        self.archetype
            .ids()
            .iter()
            .filter(|id| id.matches(pattern))
            .filter_map(|id| id.target_index())
            .find_map(|index| self.world.resolve_index(index))
    }

    /// Overwrite a component in place.
    ///
    /// # Safety
    ///
    /// No other thread may read or write `handle` on this row while the call
    /// runs.
    pub unsafe fn set_unchecked<T: 'static>(&self, handle: TypeHandle, value: T) -> EcsResult<()> {
        let desc = self.world.descriptor(handle)?;
        check_typed::<T>(desc)?;
        if desc.is_tag() {
            return Err(EcsError::TagValue {
                type_name: desc.path().to_owned(),
            });
        }
        let Some(column) = self.archetype.column(Id::component(handle)) else {
            return Err(EcsError::MissingComponent {
                entity: self.entity,
                type_name: desc.path().to_owned(),
            });
        };
        let mut value = ManuallyDrop::new(value);
        // SAFETY: row is live; exclusivity forwarded from the caller; value is
        // consumed by the move
        unsafe { column.assign_move(self.row, std::ptr::from_mut(&mut *value).cast()) };
        Ok(())
    }
}

impl std::fmt::Debug for QueryRow<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryRow")
            .field("entity", &self.entity)
            .field("archetype", &self.archetype.id())
            .finish()
    }
}

/// A row with write access, handed out by [`Query::for_each_mut`].
pub struct RowMut<'w> {
    row: QueryRow<'w>,
}

impl RowMut<'_> {
    pub fn set<T: 'static>(&mut self, handle: TypeHandle, value: T) -> EcsResult<()> {
        // SAFETY: for_each_mut holds the world exclusively
        unsafe { self.row.set_unchecked(handle, value) }
    }
}

impl<'w> Deref for RowMut<'w> {
    type Target = QueryRow<'w>;

    fn deref(&self) -> &Self::Target {
        &self.row
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::TypeDescription;
    use crate::relation::CleanupPolicy;

    #[derive(Debug, Clone, Copy, PartialEq, Default, bytemuck::Pod, bytemuck::Zeroable)]
    #[repr(C)]
    struct Position {
        x: f32,
        y: f32,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Default, bytemuck::Pod, bytemuck::Zeroable)]
    #[repr(C)]
    struct Velocity {
        x: f32,
        y: f32,
    }

    struct Fixture {
        world: World,
        pos: TypeHandle,
        vel: TypeHandle,
        enemy: TypeHandle,
    }

    fn fixture() -> Fixture {
        let mut world = World::new();
        let pos = world
            .register_type(TypeDescription::pod::<Position>("Game.Position"))
            .unwrap();
        let vel = world
            .register_type(TypeDescription::pod::<Velocity>("Game.Velocity"))
            .unwrap();
        let enemy = world.register_type(TypeDescription::tag("Game.Enemy")).unwrap();
        Fixture {
            world,
            pos,
            vel,
            enemy,
        }
    }

    #[test]
    fn test_required_and_excluded() {
        let Fixture {
            mut world,
            pos,
            vel,
            enemy,
        } = fixture();
        let moving = world.spawn();
        world.write(moving, pos, Position::default()).unwrap();
        world.write(moving, vel, Velocity { x: 1.0, y: 0.0 }).unwrap();
        let still = world.spawn();
        world.write(still, pos, Position::default()).unwrap();
        let hostile = world.spawn();
        world.write(hostile, pos, Position::default()).unwrap();
        world.write(hostile, vel, Velocity::default()).unwrap();
        world.add(hostile, enemy).unwrap();

        let query = TermList::new()
            .read(pos)
            .read(vel)
            .without(enemy)
            .compile(&world)
            .unwrap();
        let found: Vec<Entity> = query.iter(&world).map(|row| row.entity()).collect();
        assert_eq!(found, vec![moving]);
    }

    #[test]
    fn test_optional_term() {
        let Fixture {
            mut world, pos, vel, ..
        } = fixture();
        let a = world.spawn();
        world.write(a, pos, Position::default()).unwrap();
        let b = world.spawn();
        world.write(b, pos, Position::default()).unwrap();
        world.write(b, vel, Velocity { x: 2.0, y: 2.0 }).unwrap();

        let query = TermList::new()
            .read(pos)
            .optional_read(vel)
            .compile(&world)
            .unwrap();
        let mut seen = Vec::new();
        query.for_each(&world, |row| {
            seen.push((row.entity(), row.try_get::<Velocity>(vel).unwrap()));
        });
        assert_eq!(seen.len(), 2);
        assert!(seen.contains(&(a, None)));
        assert!(seen.contains(&(b, Some(Velocity { x: 2.0, y: 2.0 }))));
    }

    #[test]
    fn test_contradiction_rejected() {
        let Fixture { world, pos, .. } = fixture();
        let err = TermList::new().read(pos).without(pos).compile(&world).unwrap_err();
        assert_eq!(err, QueryError::Contradiction("Game.Position".into()));
    }

    #[test]
    fn test_write_to_tag_rejected() {
        let Fixture { world, enemy, .. } = fixture();
        assert!(matches!(
            TermList::new().write(enemy).compile(&world),
            Err(QueryError::WriteToTag(_))
        ));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let Fixture { world, .. } = fixture();
        let bogus = TypeHandle::from_raw(900);
        assert_eq!(
            TermList::new().read(bogus).compile(&world).unwrap_err(),
            QueryError::UnknownType(bogus)
        );
    }

    #[test]
    fn test_cache_picks_up_new_archetypes() {
        let Fixture {
            mut world,
            pos,
            vel,
            enemy,
        } = fixture();
        let query = TermList::new().read(pos).compile(&world).unwrap();
        assert_eq!(query.count(&world), 0);

        let a = world.spawn();
        world.write(a, pos, Position::default()).unwrap();
        assert_eq!(query.count(&world), 1);

        let b = world.spawn();
        world.write(b, pos, Position::default()).unwrap();
        world.write(b, vel, Velocity::default()).unwrap();
        world.add(b, enemy).unwrap();
        assert_eq!(query.count(&world), 2);
        assert_eq!(query.iter(&world).len(), 2);
    }

    #[test]
    fn test_pair_terms() {
        let Fixture { mut world, pos, .. } = fixture();
        let likes = world
            .register_type(TypeDescription::tag("Game.Likes").relationship(CleanupPolicy::Remove))
            .unwrap();
        let alice = world.spawn();
        let bob = world.spawn();
        let carol = world.spawn();
        world.add_pair(alice, likes, bob).unwrap();
        world.add_pair(carol, likes, alice).unwrap();

        let likes_bob = TermList::new().pair(likes, bob).compile(&world).unwrap();
        let found: Vec<Entity> = likes_bob.iter(&world).map(|r| r.entity()).collect();
        assert_eq!(found, vec![alice]);

        let likes_anyone = TermList::new().pair_any(likes).compile(&world).unwrap();
        assert_eq!(likes_anyone.count(&world), 2);
        let row = likes_anyone
            .iter(&world)
            .find(|r| r.entity() == carol)
            .unwrap();
        assert_eq!(row.target(likes), Some(alice));

        assert!(matches!(
            TermList::new().pair(pos, bob).compile(&world),
            Err(QueryError::NotRelationship(_))
        ));

        world.despawn(bob);
        assert_eq!(likes_bob.count(&world), 0);
        assert_eq!(
            TermList::new().pair(likes, bob).compile(&world).unwrap_err(),
            QueryError::StaleTarget(bob)
        );
    }

    #[test]
    fn test_for_each_mut_writes() {
        let Fixture {
            mut world, pos, vel, ..
        } = fixture();
        let e = world.spawn();
        world.write(e, pos, Position::default()).unwrap();
        world.write(e, vel, Velocity { x: 1.0, y: 1.0 }).unwrap();

        let query = TermList::new().write(pos).read(vel).compile(&world).unwrap();
        query.for_each_mut(&mut world, |mut row| {
            let p: Position = row.get(pos).unwrap();
            let v: Velocity = row.get(vel).unwrap();
            row.set(pos, Position {
                x: p.x + v.x,
                y: p.y + v.y,
            })
            .unwrap();
        });
        assert_eq!(world.read::<Position>(e, pos).unwrap(), Some(Position { x: 1.0, y: 1.0 }));
    }

    #[test]
    fn test_get_missing_component() {
        let Fixture {
            mut world, pos, vel, ..
        } = fixture();
        let e = world.spawn();
        world.write(e, pos, Position::default()).unwrap();
        let query = TermList::new().read(pos).compile(&world).unwrap();
        let row = query.iter(&world).next().unwrap();
        assert!(matches!(
            row.get::<Velocity>(vel),
            Err(EcsError::MissingComponent { .. })
        ));
        assert!(row.get_value(pos).is_some());
    }

    #[test]
    fn test_reads_and_writes() {
        let Fixture { pos, vel, enemy, .. } = fixture();
        let terms = TermList::new().write(pos).read(vel).without(enemy);
        assert_eq!(terms.writes().collect::<Vec<_>>(), vec![pos]);
        assert_eq!(terms.reads().collect::<Vec<_>>(), vec![vel]);
    }
}
