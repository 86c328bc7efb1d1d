//! Component ids and relationship pairs.
//!
//! Archetypes are keyed by [`Id`], which is either a plain registered type or
//! a `(relation, target)` pair. Pairs pack the relation handle and the
//! target's slot index into one `u64`:
//!
//! ```text
//! bit 63      : pair flag
//! bits 62..32 : relation TypeHandle
//! bits 31..0  : target entity index (or u32::MAX for the wildcard)
//! ```
//!
//! Only the slot index is stored because a target's pairs are cleaned up when
//! it is despawned, so an index found in a live archetype always refers to the
//! entity currently holding that slot.

use std::fmt;

use crate::{component::TypeHandle, entity::Entity};

/// Path under which the built-in hierarchy relation is registered.
pub const CHILD_OF: &str = "reflecs.ChildOf";

/// What happens to `(R, target)` pairs when `target` is despawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CleanupPolicy {
    /// Remove the pair from the source entity.
    #[default]
    Remove,
    /// Despawn the source entity as well.
    Delete,
}

/// Identifier of a column in an archetype.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id(u64);

impl Id {
    const PAIR_FLAG: u64 = 1 << 63;
    const WILDCARD_TARGET: u32 = u32::MAX;

    #[must_use]
    pub const fn component(handle: TypeHandle) -> Self {
        Self(handle.as_raw() as u64)
    }

    #[must_use]
    pub const fn pair(relation: TypeHandle, target: Entity) -> Self {
        Self::pair_index(relation, target.index())
    }

    /// Matches any pair with `relation`.
    #[must_use]
    pub const fn wildcard(relation: TypeHandle) -> Self {
        Self::pair_index(relation, Self::WILDCARD_TARGET)
    }

    const fn pair_index(relation: TypeHandle, target: u32) -> Self {
        Self(Self::PAIR_FLAG | ((relation.as_raw() as u64) << 32) | target as u64)
    }

    #[must_use]
    pub const fn is_pair(self) -> bool {
        self.0 & Self::PAIR_FLAG != 0
    }

    #[must_use]
    pub const fn is_wildcard(self) -> bool {
        self.is_pair() && self.0 as u32 == Self::WILDCARD_TARGET
    }

    /// The type whose schema lays out this column: the component itself, or
    /// the relation for pairs.
    #[must_use]
    pub const fn type_handle(self) -> TypeHandle {
        if self.is_pair() {
            TypeHandle::from_raw(((self.0 & !Self::PAIR_FLAG) >> 32) as u32)
        } else {
            TypeHandle::from_raw(self.0 as u32)
        }
    }

    #[must_use]
    pub const fn target_index(self) -> Option<u32> {
        if self.is_pair() {
            Some(self.0 as u32)
        } else {
            None
        }
    }

    /// Whether `self` (a concrete id) is matched by `pattern`.
    #[must_use]
    pub const fn matches(self, pattern: Self) -> bool {
        if pattern.is_wildcard() {
            self.is_pair() && self.type_handle().as_raw() == pattern.type_handle().as_raw()
        } else {
            self.0 == pattern.0
        }
    }

    #[must_use]
    pub const fn to_bits(self) -> u64 {
        self.0
    }
}

impl From<TypeHandle> for Id {
    fn from(handle: TypeHandle) -> Self {
        Self::component(handle)
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.target_index() {
            Some(Self::WILDCARD_TARGET) => write!(f, "({}, *)", self.type_handle().as_raw()),
            Some(target) => write!(f, "({}, #{target})", self.type_handle().as_raw()),
            None => write!(f, "{}", self.type_handle().as_raw()),
        }
    }
}
