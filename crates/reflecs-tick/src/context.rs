//! What a running system sees.

use std::{
    cell::{RefCell, RefMut},
    marker::PhantomData,
};

use reflecs_ecs::{
    CommandBuffer, ComponentValue, EcsError, EcsResult, Entity, Id, Query, QueryRow, TypeHandle,
    TypeRegistry, World,
};

use crate::system::AccessSet;

/// Per-run view of the world for one system.
///
/// The world is shared but never handed out. Component data is reachable
/// only through [`SystemRow`] and [`get`](Self::get), both limited to the
/// system's access set. Values in the write set can be changed in place
/// through [`SystemRow::set`]; structural changes go through
/// [`commands`](Self::commands) and are applied when the phase ends.
pub struct SystemContext<'a> {
    world: &'a World,
    query: &'a Query,
    access: &'a AccessSet,
    commands: RefCell<CommandBuffer>,
    name: &'a str,
    delta: f32,
    frame: u64,
}

impl<'a> SystemContext<'a> {
    pub(crate) fn new(
        world: &'a World,
        query: &'a Query,
        access: &'a AccessSet,
        name: &'a str,
        delta: f32,
        frame: u64,
    ) -> Self {
        Self {
            world,
            query,
            access,
            commands: RefCell::new(CommandBuffer::new()),
            name,
            delta,
            frame,
        }
    }

    /// Type descriptors, for building values and resolving names.
    #[must_use]
    pub const fn registry(&self) -> &'a TypeRegistry {
        self.world.registry()
    }

    #[must_use]
    pub const fn name(&self) -> &'a str {
        self.name
    }

    /// Seconds since the previous frame.
    #[must_use]
    pub const fn delta(&self) -> f32 {
        self.delta
    }

    #[must_use]
    pub const fn frame(&self) -> u64 {
        self.frame
    }

    /// Rows matching the system's term list.
    pub fn rows(&self) -> impl Iterator<Item = SystemRow<'a, '_>> + '_ {
        self.query.iter(self.world).map(|row| SystemRow {
            row,
            access: self.access,
            _not_send: PhantomData,
        })
    }

    pub fn for_each<F>(&self, mut f: F) -> EcsResult<()>
    where
        F: FnMut(SystemRow<'a, '_>) -> EcsResult<()>,
    {
        for row in self.rows() {
            f(row)?;
        }
        Ok(())
    }

    /// Copy of a component on any entity. `handle` must be in the system's
    /// read or write set.
    pub fn get<T: 'static>(&self, entity: Entity, handle: TypeHandle) -> EcsResult<Option<T>> {
        check_read(self.world, self.access, handle)?;
        self.world.read(entity, handle)
    }

    /// Deferred structural changes, applied at phase end.
    pub fn commands(&self) -> RefMut<'_, CommandBuffer> {
        self.commands.borrow_mut()
    }

    pub(crate) fn into_commands(self) -> CommandBuffer {
        self.commands.into_inner()
    }

}

fn violation(world: &World, handle: TypeHandle) -> EcsError {
    EcsError::AccessViolation {
        type_name: world
            .registry()
            .descriptor(handle)
            .map_or_else(|| format!("{handle:?}"), |d| d.path().to_owned()),
    }
}

fn check_read(world: &World, access: &AccessSet, handle: TypeHandle) -> EcsResult<()> {
    if access.reads().contains(&handle) || access.can_write(handle) {
        Ok(())
    } else {
        Err(violation(world, handle))
    }
}

impl std::fmt::Debug for SystemContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemContext")
            .field("name", &self.name)
            .field("frame", &self.frame)
            .field("pending_commands", &self.commands.borrow().len())
            .finish()
    }
}

/// A matched row. Reads are limited to the system's read and write sets,
/// writes to its write set. Rows stay on the thread that runs the system.
pub struct SystemRow<'w, 'c> {
    row: QueryRow<'w>,
    access: &'c AccessSet,
    _not_send: PhantomData<*const ()>,
}

impl SystemRow<'_, '_> {
    #[must_use]
    pub const fn entity(&self) -> Entity {
        self.row.entity()
    }

    /// Whether the row's archetype carries `id`. Archetype membership does
    /// not change during a phase, so this is not access checked.
    #[must_use]
    pub fn has(&self, id: impl Into<Id>) -> bool {
        self.row.has(id)
    }

    /// First live target of `relation` on this row.
    #[must_use]
    pub fn target(&self, relation: TypeHandle) -> Option<Entity> {
        self.row.target(relation)
    }

    /// Copy of a component the row must have.
    pub fn get<T: 'static>(&self, handle: TypeHandle) -> EcsResult<T> {
        check_read(self.row.world(), self.access, handle)?;
        self.row.get(handle)
    }

    /// Copy of a component the row may lack.
    pub fn try_get<T: 'static>(&self, handle: TypeHandle) -> EcsResult<Option<T>> {
        check_read(self.row.world(), self.access, handle)?;
        self.row.try_get(handle)
    }

    /// Erased copy of a component or pair value. `Ok(None)` when absent.
    pub fn get_value(&self, id: impl Into<Id>) -> EcsResult<Option<ComponentValue>> {
        let id = id.into();
        check_read(self.row.world(), self.access, id.type_handle())?;
        Ok(self.row.get_value(id))
    }

    /// Overwrite a component in place.
    #[allow(unsafe_code)]
    pub fn set<T: 'static>(&self, handle: TypeHandle, value: T) -> EcsResult<()> {
        if !self.access.can_write(handle) {
            return Err(violation(self.row.world(), handle));
        }
        // SAFETY: every read and write a system makes goes through this row or
        // `SystemContext::get`, both checked against the access set, and the
        // scheduler never runs two systems at once when one writes a type the
        // other reads or writes. Rows cannot leave the system's thread.
        unsafe { self.row.set_unchecked(handle, value) }
    }
}

impl std::fmt::Debug for SystemRow<'_, '_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemRow")
            .field("entity", &self.row.entity())
            .finish()
    }
}
