//! Bridge-level errors.

use reflecs_ecs::{EcsError, QueryError, SchemaError};
use reflecs_net::ReplicationError;
use reflecs_tick::ScheduleError;
use thiserror::Error;

use crate::lifecycle::ObjectId;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Ecs(#[from] EcsError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Replication(#[from] ReplicationError),

    #[error("host object {0} is already bound to an entity")]
    AlreadyBound(ObjectId),

    #[error("host object {0} is not bound to an entity")]
    NotBound(ObjectId),

    #[error("module {module} depends on {dependency}, which is not loaded")]
    MissingDependency { module: String, dependency: String },

    #[error("module {module} is required by {}", dependents.join(", "))]
    ModuleInUse {
        module: String,
        dependents: Vec<String>,
    },

    #[error("module {0} is already loaded")]
    DuplicateModule(String),

    #[error("module {0} is not loaded")]
    UnknownModule(String),

    #[error("invalid bridge config: {0}")]
    Config(#[from] serde_json::Error),
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;
