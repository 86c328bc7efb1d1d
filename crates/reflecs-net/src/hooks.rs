//! Payload codecs for replicated types.
//!
//! A type opts into replication by attaching [`ReplicationHooks`] to its
//! description:
//!
//! ```ignore
//! TypeDescription::of::<Inventory>("Game.Inventory").replicated(bincode_hooks::<Inventory>())
//! TypeDescription::pod::<Position>("Game.Position").replicated(pod_hooks::<Position>())
//! ```

use bytemuck::Pod;
use reflecs_ecs::{PayloadError, ReplicationHooks};
use serde::{Serialize, de::DeserializeOwned};

/// Hooks that encode values with `bincode`.
#[must_use]
pub fn bincode_hooks<T: Serialize + DeserializeOwned + 'static>() -> ReplicationHooks {
    ReplicationHooks {
        serialize: bincode_serialize::<T>,
        deserialize: bincode_deserialize::<T>,
    }
}

/// Hooks that send the raw bytes of a plain-old-data value.
#[must_use]
pub fn pod_hooks<T: Pod>() -> ReplicationHooks {
    ReplicationHooks {
        serialize: pod_serialize::<T>,
        deserialize: pod_deserialize::<T>,
    }
}

unsafe fn bincode_serialize<T: Serialize>(src: *const u8) -> Result<Vec<u8>, PayloadError> {
    // SAFETY: caller passes an initialised T
    let value = unsafe { &*src.cast::<T>() };
    bincode::serialize(value).map_err(|e| PayloadError(e.to_string()))
}

unsafe fn bincode_deserialize<T: DeserializeOwned>(bytes: &[u8], dst: *mut u8) -> Result<(), PayloadError> {
    let value: T = bincode::deserialize(bytes).map_err(|e| PayloadError(e.to_string()))?;
    // SAFETY: caller passes uninitialised storage laid out for T
    unsafe { dst.cast::<T>().write(value) };
    Ok(())
}

unsafe fn pod_serialize<T: Pod>(src: *const u8) -> Result<Vec<u8>, PayloadError> {
    // SAFETY: caller passes an initialised T
    let value = unsafe { &*src.cast::<T>() };
    Ok(bytemuck::bytes_of(value).to_vec())
}

unsafe fn pod_deserialize<T: Pod>(bytes: &[u8], dst: *mut u8) -> Result<(), PayloadError> {
    let value: T = bytemuck::try_pod_read_unaligned(bytes).map_err(|e| {
        PayloadError(format!(
            "{e:?}: expected {} bytes, got {}",
            size_of::<T>(),
            bytes.len()
        ))
    })?;
    // SAFETY: caller passes uninitialised storage laid out for T
    unsafe { dst.cast::<T>().write(value) };
    Ok(())
}
