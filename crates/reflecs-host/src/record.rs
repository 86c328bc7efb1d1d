//! Declarative component sets for host objects.

use reflecs_ecs::{ComponentValue, Entity, TypeHandle, World};

use crate::{
    error::{BridgeError, Result},
    lifecycle::ObjectId,
};

/// One entry of an [`EntityRecord`].
#[derive(Clone, Debug)]
pub enum Seed {
    /// Add with the type's default value (or as a tag).
    Default(TypeHandle),
    /// Add with this value.
    Value(ComponentValue),
    /// `(relation, target)` where the target is another host object.
    Pair { relation: TypeHandle, target: ObjectId },
    Name(String),
    /// A named child entity with its own record. Spawned under the record's
    /// entity with `ChildOf`, after every other seed.
    SubEntity { name: String, record: EntityRecord },
}

/// The component set a host object declares for its entity.
///
/// ```ignore
/// let record = EntityRecord::new()
///     .with(moving)
///     .value(ComponentValue::from_typed(world.registry(), pos, Position::default())?)
///     .name("player");
/// ```
#[derive(Clone, Debug, Default)]
pub struct EntityRecord {
    seeds: Vec<Seed>,
}

impl EntityRecord {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, handle: TypeHandle) -> Self {
        self.seeds.push(Seed::Default(handle));
        self
    }

    #[must_use]
    pub fn value(mut self, value: ComponentValue) -> Self {
        self.seeds.push(Seed::Value(value));
        self
    }

    #[must_use]
    pub fn pair(mut self, relation: TypeHandle, target: ObjectId) -> Self {
        self.seeds.push(Seed::Pair { relation, target });
        self
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.seeds.push(Seed::Name(name.into()));
        self
    }

    #[must_use]
    pub fn sub_entity(mut self, name: impl Into<String>, record: Self) -> Self {
        self.seeds.push(Seed::SubEntity {
            name: name.into(),
            record,
        });
        self
    }

    #[must_use]
    pub fn seeds(&self) -> &[Seed] {
        &self.seeds
    }

    /// Host objects named as pair targets, sub-entities included.
    #[must_use]
    pub fn pair_targets(&self) -> Vec<ObjectId> {
        let mut out = Vec::new();
        self.collect_pair_targets(&mut out);
        out
    }

    fn collect_pair_targets(&self, out: &mut Vec<ObjectId>) {
        for seed in &self.seeds {
            match seed {
                Seed::Pair { target, .. } if !out.contains(target) => out.push(*target),
                Seed::SubEntity { record, .. } => record.collect_pair_targets(out),
                _ => {}
            }
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seeds.is_empty()
    }

    /// Whether the record attaches at least one type registered in `world`.
    /// Names alone do not count.
    #[must_use]
    pub fn participates(&self, world: &World) -> bool {
        self.seeds.iter().any(|seed| match seed {
            Seed::Default(handle) | Seed::Pair { relation: handle, .. } => {
                world.registry().contains(*handle)
            }
            Seed::Value(value) => world.registry().contains(value.handle()),
            Seed::Name(_) => false,
            Seed::SubEntity { record, .. } => record.participates(world),
        })
    }

    /// Add every seed to `entity`, then spawn its sub-entities. Pair targets
    /// are resolved with `resolve`. Stops at the first failing seed; children
    /// spawned so far stay parented to `entity`, so despawning it removes
    /// them.
    pub fn apply(
        &self,
        world: &mut World,
        entity: Entity,
        resolve: impl Fn(ObjectId) -> Option<Entity>,
    ) -> Result<()> {
        self.apply_with(world, entity, &resolve)
    }

    fn apply_with(
        &self,
        world: &mut World,
        entity: Entity,
        resolve: &dyn Fn(ObjectId) -> Option<Entity>,
    ) -> Result<()> {
        for seed in &self.seeds {
            match seed {
                Seed::Default(handle) => {
                    world.add(entity, *handle)?;
                }
                Seed::Value(value) => world.write_value_ref(entity, value)?,
                Seed::Pair { relation, target } => {
                    let target = resolve(*target).ok_or(BridgeError::NotBound(*target))?;
                    world.add_pair(entity, *relation, target)?;
                }
                Seed::Name(name) => {
                    if !world.set_name(entity, name.as_str())? {
                        tracing::warn!(%entity, name = %name, "entity name already taken");
                    }
                }
                Seed::SubEntity { .. } => {}
            }
        }
        for seed in &self.seeds {
            if let Seed::SubEntity { name, record } = seed {
                spawn_sub_entity(world, entity, name, record, resolve)?;
            }
        }
        Ok(())
    }
}

/// Children are named `parent.child` when the parent has a name.
fn spawn_sub_entity(
    world: &mut World,
    parent: Entity,
    name: &str,
    record: &EntityRecord,
    resolve: &dyn Fn(ObjectId) -> Option<Entity>,
) -> Result<Entity> {
    let child = world.spawn();
    if let Err(err) = world.set_parent(child, parent) {
        world.despawn(child);
        return Err(err.into());
    }
    let path = world
        .name_of(parent)
        .map_or_else(|| name.to_owned(), |scope| format!("{scope}.{name}"));
    if !world.set_name(child, path.as_str())? {
        tracing::warn!(entity = %child, name = %path, "sub-entity name already taken");
    }
    record.apply_with(world, child, resolve)?;
    tracing::trace!(%parent, entity = %child, name = %path, "sub-entity spawned");
    Ok(child)
}
