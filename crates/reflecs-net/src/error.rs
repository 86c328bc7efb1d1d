//! Replication errors.

use reflecs_ecs::{EcsError, Entity, PayloadError};
use thiserror::Error;

use crate::network_id::NetworkId;

/// Errors that reject a whole payload.
///
/// Problems confined to one record (unknown type id, undecodable payload)
/// are not errors: they are skipped and listed in the
/// [`ApplyReport`](crate::ApplyReport).
#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("payload truncated at byte {offset}: {needed} more bytes expected")]
    Malformed { offset: usize, needed: usize },

    #[error("{0} trailing bytes after the last record")]
    TrailingBytes(usize),

    #[error("record type id {type_id:#010x} is out of ascending order")]
    OutOfOrder { type_id: u32 },

    #[error("record of {0} bytes does not fit the length field")]
    RecordTooLarge(usize),

    #[error("entity {0} is stale")]
    StaleEntity(Entity),

    #[error("network id {0} is not bound to an entity")]
    UnboundNetworkId(NetworkId),

    #[error("failed to serialize {type_path}: {source}")]
    Serialize {
        type_path: String,
        source: PayloadError,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Ecs(#[from] EcsError),
}

pub type Result<T, E = ReplicationError> = std::result::Result<T, E>;
