//! Scheduler errors.

use reflecs_ecs::QueryError;
use thiserror::Error;

use crate::{phase::Phase, system::SystemHandle};

/// Errors raised by system registration and phase execution.
///
/// Registration errors leave the scheduler exactly as it was before the
/// failing call.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("ordering constraints form a cycle through: {}", systems.join(" -> "))]
    OrderingCycle { systems: Vec<String> },

    #[error("system {0:?} is not registered")]
    UnknownSystem(SystemHandle),

    #[error("phase {0} is not part of the pipeline")]
    UnknownPhase(Phase),

    #[error("system {0} has no run callback")]
    MissingCallback(String),

    #[error("system term list rejected: {0}")]
    Query(#[from] QueryError),

    #[error("failed to build worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

pub type Result<T, E = ScheduleError> = std::result::Result<T, E>;
