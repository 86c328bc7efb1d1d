// Type-erased storage driven by host-supplied hooks needs raw pointers
#![allow(unsafe_code)]
#![allow(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_safety_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::ptr_as_ptr)]
#![allow(clippy::cast_ptr_alignment)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::float_cmp)]

//! Reflecs ECS - archetype storage for types described at runtime.
//!
//! Component types are not Rust generics here: a reflecting host hands over
//! a [`TypeDescription`] (size, alignment, lifecycle hooks, classification)
//! and gets back a [`TypeHandle`]. Storage, queries and replication all work
//! from the cached descriptor.
//!
//! # Key Concepts
//!
//! - **Type Descriptor**: immutable record of a registered host type
//! - **Component Schema**: the storage-facing view of a descriptor, built lazily
//! - **Entity**: generation-checked handle; stale handles read as empty
//! - **Archetype**: a set of ids whose entities share one table
//! - **Pair**: `(relation, target)` id; `ChildOf` is built in
//! - **Command Buffer**: structural changes deferred to the main thread
//!
//! # Access Patterns
//!
//! - `read::<T>(e, h)` - owned copy via the copy hook
//! - `write(e, h, value)` - move into storage, adding if absent
//! - `write_ref(e, h, &value)` - copy into storage
//! - `ensure_default(e, h)` - add with the default hook, borrow mutably
//!
//! ```ignore
//! let mut world = World::new();
//! let pos = world.register_type(TypeDescription::pod::<Position>("Game.Position"))?;
//! let e = world.spawn();
//! world.write(e, pos, Position { x: 0.0, y: 0.0 })?;
//! assert!(world.read::<Position>(e, pos)?.is_some());
//! ```

mod archetype;
mod commands;
mod component;
mod entity;
mod error;
mod query;
mod relation;
mod storage;
mod value;
mod world;

pub use archetype::{Archetype, ArchetypeId, ArchetypeStorage, IdSet};
pub use commands::{Command, CommandBuffer, CommandReport, PendingEntity, Target};
pub use component::{
    Classification, ComponentSchema, CopyFn, DefaultFn, DeserializeFn, DropFn, FieldDescription,
    FieldKind, LifecycleHooks, MoveFn, Reflect, ReplicationHooks, SerializeFn, TypeDescription,
    TypeDescriptor, TypeFlags, TypeHandle, TypeRegistry, stable_id_of,
};
pub use entity::{Entity, EntityAllocator, EntityIndex, Generation};
pub use error::{EcsError, EcsResult, PayloadError, QueryError, SchemaError};
pub use query::{
    Access, Query, QueryIter, QueryRow, RowMut, Term, TermId, TermList, TermOper, TermTarget,
};
pub use relation::{CHILD_OF, CleanupPolicy, Id};
pub use storage::Column;
pub use value::{ComponentValue, ValueMut};
pub use world::{DespawnHook, EntityLocation, World};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        CleanupPolicy, CommandBuffer, ComponentValue, EcsError, EcsResult, Entity, Id, Query,
        Reflect, TermList, TypeDescription, TypeHandle, World,
    };
}
