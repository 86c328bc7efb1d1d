//! Phase-based system scheduling for the reflecs bridge.
//!
//! # Tick Execution Model
//!
//! ```text
//! Frame N (progress):
//! ┌─────────────────────────────────────────────────────────────┐
//! │  OnStart (first frame only)                                 │
//! │  OnLoad .. OnStore, strictly in pipeline order              │
//! │    per phase: ordered layers -> parallel groups on workers  │
//! │    per phase: barrier, then deferred commands on main       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Systems only ever see `&World`. In-place writes are limited to the
//! declared write set and structural changes are deferred, so the world is
//! never mutated structurally while workers run.

mod config;
mod context;
mod error;
mod phase;
mod scheduler;
mod system;

pub use config::{SchedulerConfig, parse_bool};
pub use context::{SystemContext, SystemRow};
pub use error::{Result, ScheduleError};
pub use phase::{Phase, Pipeline};
pub use scheduler::{FrameReport, Overlap, PhaseReport, Scheduler, Stage, SystemFailure};
pub use system::{AccessSet, SystemBuilder, SystemFn, SystemHandle};
