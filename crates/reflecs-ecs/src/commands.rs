//! Deferred structural changes.
//!
//! Systems running on worker threads only hold `&World`, so spawns,
//! despawns, adds and removes are recorded into a [`CommandBuffer`] and
//! applied on the main thread by [`World::apply_commands`] once every worker
//! of the phase has joined.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::{
    component::TypeHandle,
    entity::Entity,
    error::{EcsError, EcsResult},
    relation::Id,
    value::ComponentValue,
    world::World,
};

static NEXT_BUFFER: AtomicU32 = AtomicU32::new(1);

/// Placeholder for an entity spawned by an earlier command in the same buffer.
///
/// Tokens carry the id of the buffer that issued them; using one in another
/// buffer fails with [`EcsError::ForeignPending`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PendingEntity {
    buffer: u32,
    index: u32,
}

/// Subject of a command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Target {
    Live(Entity),
    Pending(PendingEntity),
}

impl From<Entity> for Target {
    fn from(entity: Entity) -> Self {
        Self::Live(entity)
    }
}

impl From<PendingEntity> for Target {
    fn from(pending: PendingEntity) -> Self {
        Self::Pending(pending)
    }
}

#[derive(Debug)]
pub enum Command {
    Spawn,
    Despawn(Target),
    Insert {
        target: Target,
        value: ComponentValue,
    },
    AddDefault {
        target: Target,
        id: Id,
    },
    Remove {
        target: Target,
        id: Id,
    },
    AddPair {
        target: Target,
        relation: TypeHandle,
        object: Target,
    },
    RemovePair {
        target: Target,
        relation: TypeHandle,
        object: Target,
    },
}

/// Ordered list of structural changes.
#[derive(Debug)]
pub struct CommandBuffer {
    id: u32,
    commands: Vec<Command>,
    next_pending: u32,
}

impl Default for CommandBuffer {
    fn default() -> Self {
        Self {
            id: NEXT_BUFFER.fetch_add(1, Ordering::Relaxed),
            commands: Vec::new(),
            next_pending: 0,
        }
    }
}

impl CommandBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a spawn. The token can be used by later commands in this
    /// buffer.
    pub fn spawn(&mut self) -> PendingEntity {
        let pending = PendingEntity {
            buffer: self.id,
            index: self.next_pending,
        };
        self.next_pending += 1;
        self.commands.push(Command::Spawn);
        pending
    }

    pub fn despawn(&mut self, target: impl Into<Target>) {
        self.commands.push(Command::Despawn(target.into()));
    }

    /// Set a component, adding it if absent.
    pub fn insert(&mut self, target: impl Into<Target>, value: ComponentValue) {
        self.commands.push(Command::Insert {
            target: target.into(),
            value,
        });
    }

    /// Add a component with its default value.
    pub fn add(&mut self, target: impl Into<Target>, id: impl Into<Id>) {
        self.commands.push(Command::AddDefault {
            target: target.into(),
            id: id.into(),
        });
    }

    pub fn remove(&mut self, target: impl Into<Target>, id: impl Into<Id>) {
        self.commands.push(Command::Remove {
            target: target.into(),
            id: id.into(),
        });
    }

    pub fn add_pair(&mut self, target: impl Into<Target>, relation: TypeHandle, object: impl Into<Target>) {
        self.commands.push(Command::AddPair {
            target: target.into(),
            relation,
            object: object.into(),
        });
    }

    pub fn remove_pair(&mut self, target: impl Into<Target>, relation: TypeHandle, object: impl Into<Target>) {
        self.commands.push(Command::RemovePair {
            target: target.into(),
            relation,
            object: object.into(),
        });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }
}

/// Outcome of applying one or more buffers.
#[derive(Debug, Default)]
pub struct CommandReport {
    /// Entities created, in command order.
    pub spawned: Vec<Entity>,
    /// Commands that took effect.
    pub applied: usize,
    /// One entry per failed command. Failures never stop later commands.
    pub errors: Vec<EcsError>,
}

impl CommandReport {
    pub fn merge(&mut self, other: Self) {
        self.spawned.extend(other.spawned);
        self.applied += other.applied;
        self.errors.extend(other.errors);
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

impl World {
    /// Apply `buffer` in order.
    pub fn apply_commands(&mut self, buffer: CommandBuffer) -> CommandReport {
        let mut report = CommandReport::default();
        let count = buffer.commands.len();
        let id = buffer.id;

        for command in buffer.commands {
            match self.apply_command(id, command, &mut report.spawned) {
                Ok(()) => report.applied += 1,
                Err(err) => {
                    tracing::debug!(%err, "deferred command failed");
                    report.errors.push(err);
                }
            }
        }

        if count > 0 {
            tracing::trace!(
                count,
                applied = report.applied,
                failed = report.errors.len(),
                "applied command buffer"
            );
        }
        report
    }

    fn apply_command(&mut self, buffer: u32, command: Command, spawned: &mut Vec<Entity>) -> EcsResult<()> {
        let resolve = |target: Target, spawned: &[Entity]| -> EcsResult<Entity> {
            match target {
                Target::Live(entity) => Ok(entity),
                Target::Pending(pending) if pending.buffer == buffer => spawned
                    .get(pending.index as usize)
                    .copied()
                    .ok_or(EcsError::ForeignPending(pending.index)),
                Target::Pending(pending) => Err(EcsError::ForeignPending(pending.index)),
            }
        };

        match command {
            Command::Spawn => {
                spawned.push(self.spawn());
            }
            Command::Despawn(target) => {
                let entity = resolve(target, spawned)?;
                if !self.despawn(entity) {
                    tracing::debug!(%entity, "deferred despawn of dead entity ignored");
                }
            }
            Command::Insert { target, value } => {
                let entity = resolve(target, spawned)?;
                self.write_value(entity, value)?;
            }
            Command::AddDefault { target, id } => {
                let entity = resolve(target, spawned)?;
                self.add(entity, id)?;
            }
            Command::Remove { target, id } => {
                let entity = resolve(target, spawned)?;
                self.remove(entity, id)?;
            }
            Command::AddPair {
                target,
                relation,
                object,
            } => {
                let entity = resolve(target, spawned)?;
                let object = resolve(object, spawned)?;
                self.add_pair(entity, relation, object)?;
            }
            Command::RemovePair {
                target,
                relation,
                object,
            } => {
                let entity = resolve(target, spawned)?;
                let object = resolve(object, spawned)?;
                self.remove_pair(entity, relation, object)?;
            }
        }
        Ok(())
    }
}
