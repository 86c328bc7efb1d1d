//! Load/unload units of host functionality.
//!
//! A module registers its types and systems in [`Module::load`]. The
//! systems are remembered and unregistered when the module unloads; types
//! stay registered until the world shuts down.

use reflecs_ecs::{Reflect, TypeDescription, TypeHandle, World};
use reflecs_tick::{Scheduler, SystemBuilder, SystemHandle};

use crate::error::{BridgeError, Result};

pub trait Module: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Modules that must be loaded first.
    fn dependencies(&self) -> &[&str] {
        &[]
    }

    fn load(&mut self, ctx: &mut ModuleContext<'_>) -> Result<()>;

    /// Called after the module's systems have been unregistered.
    fn unload(&mut self, world: &mut World) {
        let _ = world;
    }
}

/// What a loading module may touch.
pub struct ModuleContext<'a> {
    module: &'a str,
    world: &'a mut World,
    scheduler: &'a mut Scheduler,
    systems: Vec<SystemHandle>,
}

impl ModuleContext<'_> {
    #[must_use]
    pub fn module(&self) -> &str {
        self.module
    }

    pub fn register_type(&mut self, desc: TypeDescription) -> Result<TypeHandle> {
        Ok(self.world.register_type(desc)?)
    }

    pub fn register<T: Reflect>(&mut self) -> Result<TypeHandle> {
        Ok(self.world.register::<T>()?)
    }

    /// Register a system owned by this module.
    pub fn register_system(&mut self, builder: SystemBuilder) -> Result<SystemHandle> {
        let handle = self.scheduler.register_system(&*self.world, builder)?;
        self.systems.push(handle);
        Ok(handle)
    }

    #[must_use]
    pub fn world(&self) -> &World {
        &*self.world
    }

    pub fn world_mut(&mut self) -> &mut World {
        &mut *self.world
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut *self.scheduler
    }
}

struct LoadedModule {
    module: Box<dyn Module>,
    name: String,
    dependencies: Vec<String>,
    systems: Vec<SystemHandle>,
}

/// Loaded modules, in load order.
#[derive(Default)]
pub struct ModuleRegistry {
    loaded: Vec<LoadedModule>,
}

impl ModuleRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `module`. On failure every system it registered is removed
    /// again.
    pub fn load(&mut self, world: &mut World, scheduler: &mut Scheduler, mut module: Box<dyn Module>) -> Result<()> {
        let name = module.name().to_owned();
        if self.is_loaded(&name) {
            return Err(BridgeError::DuplicateModule(name));
        }
        let dependencies: Vec<String> = module.dependencies().iter().map(|d| (*d).to_owned()).collect();
        if let Some(missing) = dependencies.iter().find(|d| !self.is_loaded(d)) {
            return Err(BridgeError::MissingDependency {
                module: name,
                dependency: missing.clone(),
            });
        }

        let mut ctx = ModuleContext {
            module: &name,
            world: &mut *world,
            scheduler: &mut *scheduler,
            systems: Vec::new(),
        };
        let loaded = module.load(&mut ctx);
        let systems = std::mem::take(&mut ctx.systems);

        if let Err(err) = loaded {
            tracing::warn!(module = %name, %err, "module failed to load");
            for handle in systems {
                if let Err(err) = scheduler.unregister_system(handle) {
                    tracing::debug!(module = %name, %err, "rollback skipped system");
                }
            }
            return Err(err);
        }

        tracing::info!(module = %name, systems = systems.len(), "module loaded");
        self.loaded.push(LoadedModule {
            module,
            name,
            dependencies,
            systems,
        });
        Ok(())
    }

    /// Unload `name`. Fails while another loaded module depends on it.
    pub fn unload(&mut self, world: &mut World, scheduler: &mut Scheduler, name: &str) -> Result<()> {
        let index = self
            .loaded
            .iter()
            .position(|m| m.name == name)
            .ok_or_else(|| BridgeError::UnknownModule(name.to_owned()))?;

        let dependents: Vec<String> = self
            .loaded
            .iter()
            .filter(|m| m.dependencies.iter().any(|d| d == name))
            .map(|m| m.name.clone())
            .collect();
        if !dependents.is_empty() {
            return Err(BridgeError::ModuleInUse {
                module: name.to_owned(),
                dependents,
            });
        }

        let mut entry = self.loaded.remove(index);
        for handle in entry.systems.drain(..) {
            if let Err(err) = scheduler.unregister_system(handle) {
                tracing::debug!(module = %entry.name, %err, "system already gone");
            }
        }
        entry.module.unload(world);
        tracing::info!(module = %entry.name, "module unloaded");
        Ok(())
    }

    /// Unload everything, most recently loaded first.
    pub fn unload_all(&mut self, world: &mut World, scheduler: &mut Scheduler) {
        while let Some(name) = self.loaded.last().map(|m| m.name.clone()) {
            if let Err(err) = self.unload(world, scheduler, &name) {
                tracing::warn!(module = %name, %err, "unload failed");
                self.loaded.pop();
            }
        }
    }

    #[must_use]
    pub fn is_loaded(&self, name: &str) -> bool {
        self.loaded.iter().any(|m| m.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.loaded.iter().map(|m| m.name.as_str())
    }

    /// Systems registered by `name`.
    #[must_use]
    pub fn systems_of(&self, name: &str) -> Option<&[SystemHandle]> {
        self.loaded
            .iter()
            .find(|m| m.name == name)
            .map(|m| m.systems.as_slice())
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
