//! Error types for the ECS bridge primitives.

use thiserror::Error;

use crate::{component::TypeHandle, entity::Entity};

/// Errors raised while registering a host type description.
///
/// Registration errors never leave partial state behind: the registry is
/// only mutated after every check has passed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("type description has an empty path")]
    EmptyPath,

    #[error("type {path}: alignment {align} is not a power of two")]
    BadAlignment { path: String, align: usize },

    #[error("type {path}: size {size} is not a multiple of alignment {align}")]
    BadSize {
        path: String,
        size: usize,
        align: usize,
    },

    #[error("type {path}: tags must be zero-sized, got {size} bytes")]
    SizedTag { path: String, size: usize },

    #[error("type {path}: field {field} owns a reference but no destructor hook was supplied")]
    MissingDestructor { path: String, field: String },

    #[error("type {path}: non-trivial types must supply a copy hook")]
    MissingCopy { path: String },

    #[error("type {path}: no default-construct hook and not zero-initialisable")]
    NoDefault { path: String },

    #[error("type {path} already registered with a different layout")]
    Conflict { path: String },

    #[error("type {path} hashes to stable id {stable_id:#010x}, already used by {existing}")]
    StableIdCollision {
        path: String,
        stable_id: u32,
        existing: String,
    },

    #[error("type {path}: relationship ids are limited to 31 bits")]
    RegistryFull { path: String },
}

/// Errors raised while compiling a term list into a query.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("term references unregistered type {0:?}")]
    UnknownType(TypeHandle),

    #[error("type {0} is both required and excluded")]
    Contradiction(String),

    #[error("type {0} is a tag and cannot be written")]
    WriteToTag(String),

    #[error("type {0} is not a relationship")]
    NotRelationship(String),

    #[error("wildcard pair on {0} cannot be stored on an entity")]
    WildcardStored(String),

    #[error("pair target {0} is not alive")]
    StaleTarget(Entity),
}

/// Per-entity errors from component reads and writes.
///
/// These are local and recoverable: the failing call leaves the rest of the
/// world untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EcsError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error("type mismatch on {type_name}: expected {expected_size}b/align {expected_align}, got {found_size}b/align {found_align}")]
    TypeMismatch {
        type_name: String,
        expected_size: usize,
        expected_align: usize,
        found_size: usize,
        found_align: usize,
    },

    #[error("type mismatch on {type_name}: value belongs to a different Rust type")]
    ForeignType { type_name: String },

    #[error("entity {0} is stale or was never allocated")]
    StaleHandle(Entity),

    #[error("type {0:?} is not registered")]
    UnknownType(TypeHandle),

    #[error("entity {entity} has no {type_name}")]
    MissingComponent { entity: Entity, type_name: String },

    #[error("{type_name} is not in the write set of this system")]
    AccessViolation { type_name: String },

    #[error("{type_name} is a tag and carries no value")]
    TagValue { type_name: String },

    #[error("pending entity #{0} was not spawned by this command buffer")]
    ForeignPending(u32),
}

/// Result type alias for ECS operations.
pub type EcsResult<T> = Result<T, EcsError>;

/// Failure reported by a replication serialize/deserialize hook.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct PayloadError(pub String);
