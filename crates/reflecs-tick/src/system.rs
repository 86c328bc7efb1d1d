//! System registration records.

use std::fmt;

use reflecs_ecs::{EcsResult, Query, TermList, TypeHandle};
use smallvec::SmallVec;

use crate::{context::SystemContext, phase::Phase};

/// Identifies a registered system. Handles are never reused.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SystemHandle(u64);

impl SystemHandle {
    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for SystemHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SystemHandle({})", self.0)
    }
}

/// Body of a system. Errors are reported in the phase report; they never
/// stop the frame.
pub type SystemFn = Box<dyn Fn(&SystemContext<'_>) -> EcsResult<()> + Send + Sync>;

/// Describes a system before registration.
pub struct SystemBuilder {
    pub(crate) name: String,
    pub(crate) terms: TermList,
    pub(crate) phase: Phase,
    pub(crate) after: Vec<SystemHandle>,
    pub(crate) before: Vec<SystemHandle>,
    pub(crate) parallel_safe: bool,
    pub(crate) run_when_paused: bool,
    pub(crate) run: Option<SystemFn>,
}

impl SystemBuilder {
    /// A main-thread system in `OnUpdate` with no terms.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            terms: TermList::new(),
            phase: Phase::ON_UPDATE,
            after: Vec::new(),
            before: Vec::new(),
            parallel_safe: false,
            run_when_paused: false,
            run: None,
        }
    }

    #[must_use]
    pub fn terms(mut self, terms: TermList) -> Self {
        self.terms = terms;
        self
    }

    #[must_use]
    pub fn phase(mut self, phase: Phase) -> Self {
        self.phase = phase;
        self
    }

    /// Run after `system` completes.
    #[must_use]
    pub fn after(mut self, system: SystemHandle) -> Self {
        self.after.push(system);
        self
    }

    /// Run before `system` starts.
    #[must_use]
    pub fn before(mut self, system: SystemHandle) -> Self {
        self.before.push(system);
        self
    }

    /// Allow running on a worker thread alongside other systems.
    #[must_use]
    pub fn parallel_safe(mut self, parallel_safe: bool) -> Self {
        self.parallel_safe = parallel_safe;
        self
    }

    #[must_use]
    pub fn run_when_paused(mut self, run_when_paused: bool) -> Self {
        self.run_when_paused = run_when_paused;
        self
    }

    #[must_use]
    pub fn run<F>(mut self, f: F) -> Self
    where
        F: Fn(&SystemContext<'_>) -> EcsResult<()> + Send + Sync + 'static,
    {
        self.run = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for SystemBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemBuilder")
            .field("name", &self.name)
            .field("phase", &self.phase)
            .field("parallel_safe", &self.parallel_safe)
            .finish_non_exhaustive()
    }
}

/// Types a system reads and writes, derived from its term list.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccessSet {
    reads: SmallVec<[TypeHandle; 4]>,
    writes: SmallVec<[TypeHandle; 4]>,
}

impl AccessSet {
    #[must_use]
    pub fn from_terms(terms: &TermList) -> Self {
        let mut set = Self::default();
        for handle in terms.writes() {
            if !set.writes.contains(&handle) {
                set.writes.push(handle);
            }
        }
        for handle in terms.reads() {
            if !set.writes.contains(&handle) && !set.reads.contains(&handle) {
                set.reads.push(handle);
            }
        }
        set
    }

    #[must_use]
    pub fn reads(&self) -> &[TypeHandle] {
        &self.reads
    }

    #[must_use]
    pub fn writes(&self) -> &[TypeHandle] {
        &self.writes
    }

    #[must_use]
    pub fn can_write(&self, handle: TypeHandle) -> bool {
        self.writes.contains(&handle)
    }

    /// Types that make running both systems at once unsound: written by
    /// one and read or written by the other.
    #[must_use]
    pub fn conflicts(&self, other: &Self) -> Vec<TypeHandle> {
        // reads and writes are disjoint within a set, so the halves never
        // repeat a handle
        let ours = self
            .writes
            .iter()
            .filter(|h| other.writes.contains(h) || other.reads.contains(h));
        let theirs = other.writes.iter().filter(|h| self.reads.contains(h));
        ours.chain(theirs).copied().collect()
    }
}

/// A registered system.
pub(crate) struct SystemRecord {
    pub handle: SystemHandle,
    pub name: String,
    pub query: Query,
    pub access: AccessSet,
    pub phase: Phase,
    pub after: Vec<SystemHandle>,
    pub before: Vec<SystemHandle>,
    pub parallel_safe: bool,
    pub run_when_paused: bool,
    pub enabled: bool,
    pub run: SystemFn,
}
