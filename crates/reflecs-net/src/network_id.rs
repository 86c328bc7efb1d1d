//! Connection-independent entity ids.
//!
//! Local [`Entity`] handles differ between peers, so payloads are routed by
//! a [`NetworkId`] that both sides agree on.

use std::fmt;

use hashbrown::HashMap;
use reflecs_ecs::{Entity, World};
use rustc_hash::FxBuildHasher;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NetworkId(pub u32);

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "net#{}", self.0)
    }
}

/// Two-way map between network ids and local entities.
#[derive(Debug, Default)]
pub struct NetworkIds {
    to_entity: HashMap<NetworkId, Entity, FxBuildHasher>,
    to_network: HashMap<Entity, NetworkId, FxBuildHasher>,
    next: u32,
}

impl NetworkIds {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Give `entity` a fresh id, or return the one it already has.
    pub fn allocate(&mut self, entity: Entity) -> NetworkId {
        if let Some(&id) = self.to_network.get(&entity) {
            return id;
        }
        while self.to_entity.contains_key(&NetworkId(self.next)) {
            self.next = self.next.wrapping_add(1);
        }
        let id = NetworkId(self.next);
        self.next = self.next.wrapping_add(1);
        self.bind(id, entity);
        id
    }

    /// Route `id` to `entity`. Any previous binding of either side is
    /// replaced; the entity previously bound to `id` is returned.
    pub fn bind(&mut self, id: NetworkId, entity: Entity) -> Option<Entity> {
        if let Some(old_id) = self.to_network.remove(&entity) {
            self.to_entity.remove(&old_id);
        }
        let previous = self.to_entity.insert(id, entity);
        if let Some(previous) = previous {
            self.to_network.remove(&previous);
        }
        self.to_network.insert(entity, id);
        previous
    }

    pub fn unbind(&mut self, id: NetworkId) -> Option<Entity> {
        let entity = self.to_entity.remove(&id)?;
        self.to_network.remove(&entity);
        Some(entity)
    }

    pub fn unbind_entity(&mut self, entity: Entity) -> Option<NetworkId> {
        let id = self.to_network.remove(&entity)?;
        self.to_entity.remove(&id);
        Some(id)
    }

    #[must_use]
    pub fn entity(&self, id: NetworkId) -> Option<Entity> {
        self.to_entity.get(&id).copied()
    }

    #[must_use]
    pub fn network_id(&self, entity: Entity) -> Option<NetworkId> {
        self.to_network.get(&entity).copied()
    }

    /// Drop bindings whose entity has been despawned.
    pub fn retain_alive(&mut self, world: &World) -> usize {
        let before = self.to_entity.len();
        self.to_entity.retain(|_, entity| world.is_alive(*entity));
        self.to_network.retain(|entity, _| world.is_alive(*entity));
        before - self.to_entity.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.to_entity.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.to_entity.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_is_stable() {
        let mut world = World::new();
        let e = world.spawn();
        let mut ids = NetworkIds::new();
        let id = ids.allocate(e);
        assert_eq!(ids.allocate(e), id);
        assert_eq!(ids.entity(id), Some(e));
        assert_eq!(ids.network_id(e), Some(id));
    }

    #[test]
    fn test_allocate_skips_bound_ids() {
        let mut world = World::new();
        let a = world.spawn();
        let b = world.spawn();
        let mut ids = NetworkIds::new();
        ids.bind(NetworkId(0), a);
        assert_eq!(ids.allocate(b), NetworkId(1));
    }

    #[test]
    fn test_rebind_replaces_both_sides() {
        let mut world = World::new();
        let a = world.spawn();
        let b = world.spawn();
        let mut ids = NetworkIds::new();
        ids.bind(NetworkId(5), a);
        assert_eq!(ids.bind(NetworkId(5), b), Some(a));
        assert_eq!(ids.network_id(a), None);
        assert_eq!(ids.entity(NetworkId(5)), Some(b));
        assert_eq!(ids.len(), 1);
    }

    #[test]
    fn test_retain_alive() {
        let mut world = World::new();
        let a = world.spawn();
        let b = world.spawn();
        let mut ids = NetworkIds::new();
        ids.allocate(a);
        let kept = ids.allocate(b);
        world.despawn(a);
        assert_eq!(ids.retain_alive(&world), 1);
        assert_eq!(ids.entity(kept), Some(b));
        assert_eq!(ids.network_id(a), None);
    }
}
