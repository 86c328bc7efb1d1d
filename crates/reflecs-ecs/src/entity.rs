//! Generation-checked entity handles.
//!
//! A handle packs a slot index with the generation the slot had when the
//! handle was issued. Recycling a slot bumps its generation, so handles held
//! by the host after a despawn compare unequal and are treated as absent.

use std::fmt;

/// Generation counter for an entity slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Generation(u32);

impl Generation {
    #[must_use]
    pub const fn new() -> Self {
        Self(0)
    }

    /// The generation a slot takes after being recycled.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen{}", self.0)
    }
}

/// Raw slot index.
pub type EntityIndex = u32;

/// A generation-checked handle to an entity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Entity {
    index: EntityIndex,
    generation: Generation,
}

impl Entity {
    #[must_use]
    pub const fn new(index: EntityIndex, generation: Generation) -> Self {
        Self { index, generation }
    }

    #[must_use]
    pub const fn index(self) -> EntityIndex {
        self.index
    }

    #[must_use]
    pub const fn generation(self) -> Generation {
        self.generation
    }

    /// Pack into a single `u64` (generation in the high half).
    #[must_use]
    pub const fn to_bits(self) -> u64 {
        ((self.generation.0 as u64) << 32) | (self.index as u64)
    }

    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self {
            index: bits as u32,
            generation: Generation((bits >> 32) as u32),
        }
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({}v{})", self.index, self.generation.0)
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation.0)
    }
}

/// Slot allocator with a free list and per-slot generations.
#[derive(Debug, Default)]
pub struct EntityAllocator {
    generations: Vec<Generation>,
    alive: Vec<bool>,
    free_list: Vec<EntityIndex>,
    alive_count: u32,
}

impl EntityAllocator {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            generations: Vec::new(),
            alive: Vec::new(),
            free_list: Vec::new(),
            alive_count: 0,
        }
    }

    pub fn allocate(&mut self) -> Entity {
        self.alive_count += 1;

        if let Some(index) = self.free_list.pop() {
            self.alive[index as usize] = true;
            return Entity::new(index, self.generations[index as usize]);
        }

        let index = self.generations.len() as EntityIndex;
        self.generations.push(Generation::new());
        self.alive.push(true);
        Entity::new(index, Generation::new())
    }

    /// Release a slot. Returns `false` for stale or unknown handles.
    pub fn deallocate(&mut self, entity: Entity) -> bool {
        if !self.is_alive(entity) {
            return false;
        }

        let slot = entity.index() as usize;
        self.generations[slot] = self.generations[slot].next();
        self.alive[slot] = false;
        self.free_list.push(entity.index());
        self.alive_count -= 1;
        true
    }

    #[must_use]
    pub fn is_alive(&self, entity: Entity) -> bool {
        let slot = entity.index() as usize;
        slot < self.generations.len()
            && self.alive[slot]
            && self.generations[slot] == entity.generation()
    }

    /// The live handle occupying `index`, if any.
    #[must_use]
    pub fn resolve(&self, index: EntityIndex) -> Option<Entity> {
        let slot = index as usize;
        if slot < self.alive.len() && self.alive[slot] {
            Some(Entity::new(index, self.generations[slot]))
        } else {
            None
        }
    }

    #[must_use]
    pub const fn alive_count(&self) -> u32 {
        self.alive_count
    }

    /// Forget every slot. Outstanding handles stay stale forever because
    /// generations are not reset.
    pub fn clear(&mut self) {
        for (slot, alive) in self.alive.iter_mut().enumerate() {
            if *alive {
                *alive = false;
                self.generations[slot] = self.generations[slot].next();
                self.free_list.push(slot as EntityIndex);
            }
        }
        self.alive_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_recycles_with_new_generation() {
        let mut alloc = EntityAllocator::new();
        let a = alloc.allocate();
        assert!(alloc.deallocate(a));

        let b = alloc.allocate();
        assert_eq!(a.index(), b.index());
        assert_ne!(a.generation(), b.generation());
        assert!(!alloc.is_alive(a));
        assert!(alloc.is_alive(b));
    }

    #[test]
    fn test_double_deallocate_is_rejected() {
        let mut alloc = EntityAllocator::new();
        let a = alloc.allocate();
        assert!(alloc.deallocate(a));
        assert!(!alloc.deallocate(a));
        assert_eq!(alloc.alive_count(), 0);
    }

    #[test]
    fn test_resolve_returns_live_handle() {
        let mut alloc = EntityAllocator::new();
        let a = alloc.allocate();
        assert_eq!(alloc.resolve(a.index()), Some(a));
        alloc.deallocate(a);
        assert_eq!(alloc.resolve(a.index()), None);
    }

    #[test]
    fn test_bits_roundtrip() {
        let e = Entity::new(7, Generation::new().next().next());
        assert_eq!(Entity::from_bits(e.to_bits()), e);
    }

    #[test]
    fn test_clear_invalidates_handles() {
        let mut alloc = EntityAllocator::new();
        let a = alloc.allocate();
        let b = alloc.allocate();
        alloc.clear();
        assert!(!alloc.is_alive(a));
        assert!(!alloc.is_alive(b));
        assert_eq!(alloc.alive_count(), 0);
    }
}
