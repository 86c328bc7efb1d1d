// Payload hooks are unsafe fn pointers over type-erased storage
#![allow(unsafe_code)]

//! Network replication for reflecs worlds.
//!
//! Snapshots carry only components whose type description is marked
//! replicable. Each record is keyed by the type's stable id (a hash of its
//! path), so peers that registered the same paths agree on the wire without
//! exchanging a type table:
//!
//! ```text
//! server world ── snapshot_all ──► bytes ──► transport ──► apply ── client world
//!                                                         │
//!                                       unknown type id ──┴─► skipped, reported
//! ```
//!
//! Transport is out of scope: the adapter produces and consumes byte
//! buffers only.

mod adapter;
mod error;
mod hooks;
mod network_id;
mod policy;
pub mod wire;

pub use adapter::{ApplyReport, ReplicationAdapter, SkipReason, SkippedRecord};
pub use error::{ReplicationError, Result};
pub use hooks::{bincode_hooks, pod_hooks};
pub use network_id::{NetworkId, NetworkIds};
pub use policy::{
    AuthorityMode, AuthorityPolicy, Conflict, NetRole, PreferLocal, PreferRemote, Resolution,
    ServerAuthoritative,
};
