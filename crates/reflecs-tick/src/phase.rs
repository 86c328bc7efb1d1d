//! Pipeline phases.
//!
//! ```text
//! progress():
//!   OnStart            (first frame only)
//!   OnLoad -> PostLoad -> PreUpdate -> OnUpdate -> OnValidate
//!          -> PostUpdate -> PreStore -> OnStore
//! ```
//!
//! Each phase fully completes, deferred commands included, before the next
//! one starts.

use std::fmt;

use crate::error::{Result, ScheduleError};

/// A named stage of per-frame execution.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Phase(&'static str);

impl Phase {
    /// Runs once, before the first regular frame.
    pub const ON_START: Self = Self("OnStart");
    pub const ON_LOAD: Self = Self("OnLoad");
    pub const POST_LOAD: Self = Self("PostLoad");
    pub const PRE_UPDATE: Self = Self("PreUpdate");
    pub const ON_UPDATE: Self = Self("OnUpdate");
    pub const ON_VALIDATE: Self = Self("OnValidate");
    pub const POST_UPDATE: Self = Self("PostUpdate");
    pub const PRE_STORE: Self = Self("PreStore");
    pub const ON_STORE: Self = Self("OnStore");

    /// A custom phase. Add it with [`Pipeline::insert_after`].
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        self.0
    }
}

impl fmt::Debug for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Phase({})", self.0)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Strict total order of the per-frame phases.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pipeline {
    phases: Vec<Phase>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self {
            phases: vec![
                Phase::ON_LOAD,
                Phase::POST_LOAD,
                Phase::PRE_UPDATE,
                Phase::ON_UPDATE,
                Phase::ON_VALIDATE,
                Phase::POST_UPDATE,
                Phase::PRE_STORE,
                Phase::ON_STORE,
            ],
        }
    }
}

impl Pipeline {
    /// Insert `phase` directly after `anchor`. Inserting a phase that is
    /// already present is a no-op.
    pub fn insert_after(&mut self, anchor: Phase, phase: Phase) -> Result<()> {
        if self.contains(phase) {
            return Ok(());
        }
        let pos = self
            .phases
            .iter()
            .position(|&p| p == anchor)
            .ok_or(ScheduleError::UnknownPhase(anchor))?;
        self.phases.insert(pos + 1, phase);
        tracing::debug!(%phase, after = %anchor, "inserted pipeline phase");
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, phase: Phase) -> bool {
        phase == Phase::ON_START || self.phases.contains(&phase)
    }

    /// Position in execution order. `OnStart` ranks before everything.
    #[must_use]
    pub fn rank(&self, phase: Phase) -> Option<usize> {
        if phase == Phase::ON_START {
            return Some(0);
        }
        self.phases.iter().position(|&p| p == phase).map(|pos| pos + 1)
    }

    /// Per-frame phases in order, excluding `OnStart`.
    pub fn iter(&self) -> impl Iterator<Item = Phase> + '_ {
        self.phases.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMULATE: Phase = Phase::new("Simulate");

    #[test]
    fn test_default_order() {
        let pipeline = Pipeline::default();
        let names: Vec<_> = pipeline.iter().map(Phase::name).collect();
        assert_eq!(names.first(), Some(&"OnLoad"));
        assert_eq!(names.last(), Some(&"OnStore"));
        assert!(pipeline.rank(Phase::PRE_UPDATE) < pipeline.rank(Phase::ON_UPDATE));
        assert_eq!(pipeline.rank(Phase::ON_START), Some(0));
    }

    #[test]
    fn test_insert_after() {
        let mut pipeline = Pipeline::default();
        pipeline.insert_after(Phase::ON_UPDATE, SIMULATE).unwrap();
        assert_eq!(
            pipeline.rank(SIMULATE),
            pipeline.rank(Phase::ON_UPDATE).map(|r| r + 1)
        );
        assert!(pipeline.rank(SIMULATE) < pipeline.rank(Phase::ON_VALIDATE));

        pipeline.insert_after(Phase::ON_LOAD, SIMULATE).unwrap();
        assert_eq!(pipeline.iter().filter(|&p| p == SIMULATE).count(), 1);
    }

    #[test]
    fn test_insert_after_unknown_anchor() {
        let mut pipeline = Pipeline::default();
        assert!(matches!(
            pipeline.insert_after(Phase::new("Nope"), SIMULATE),
            Err(ScheduleError::UnknownPhase(_))
        ));
    }
}
