#![allow(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_fields_in_debug)]

//! Bridge between a reflecting host object model and a reflecs world.
//!
//! ```text
//! host object ──created──► LifecycleBridge ──► entity
//!      ▲                        │
//!      └──── entity_deleted ────┘  (only when the ECS side deleted it)
//!
//! Bridge
//!   ├── World            types, entities, components, queries
//!   ├── Scheduler        phases and systems
//!   ├── ModuleRegistry   load/unload units of types + systems
//!   └── ReplicationAdapter  snapshot/apply byte payloads
//! ```
//!
//! ```ignore
//! let mut bridge = Bridge::new(BridgeConfig::from_env())?;
//! let pos = bridge.register::<Position>()?;
//! let e = bridge.create_object(ObjectId(1), &EntityRecord::new().with(pos))?;
//! bridge.progress(1.0 / 60.0)?;
//! ```

mod bridge;
mod config;
mod error;
mod lifecycle;
mod module;
mod record;

pub use bridge::Bridge;
pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use lifecycle::{
    BindingState, HostNotifier, LifecycleBridge, LifecycleStats, NoopNotifier, ObjectId,
};
pub use module::{Module, ModuleContext, ModuleRegistry};
pub use record::{EntityRecord, Seed};
