//! Phase scheduler.
//!
//! # Execution Model
//!
//! ```text
//! run_phase(P):
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Layer 0: parallel group (workers)  +  serial systems       │
//! │  Barrier                                                    │
//! │  Layer 1: ...                                               │
//! │  Barrier                                                    │
//! │  Apply every system's command buffer, in plan order         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Layers come from a topological sort of the `after`/`before` constraints
//! within the phase, so a constrained pair never shares a layer. Inside a
//! layer, `parallel_safe` systems whose access sets do not conflict share
//! one parallel group; the rest run one at a time.

use hashbrown::HashMap;
use rayon::prelude::*;
use reflecs_ecs::{CommandReport, EcsError, TypeHandle, World};
use rustc_hash::FxBuildHasher;

use crate::{
    config::SchedulerConfig,
    context::SystemContext,
    error::{Result, ScheduleError},
    phase::{Phase, Pipeline},
    system::{AccessSet, SystemBuilder, SystemHandle, SystemRecord},
};

/// One step of a phase plan. Indices point into the scheduler's systems.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Stage {
    Serial(usize),
    Parallel(Vec<usize>),
}

/// A `parallel_safe` system that was moved to serial execution because its
/// access set conflicts with one already in the parallel group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Overlap {
    pub system: String,
    pub conflicts_with: String,
    pub types: Vec<TypeHandle>,
}

#[derive(Debug, Default)]
struct PhasePlan {
    stages: Vec<Stage>,
    overlaps: Vec<Overlap>,
}

/// A system that returned an error.
#[derive(Debug)]
pub struct SystemFailure {
    pub system: String,
    pub error: EcsError,
}

/// Outcome of one [`Scheduler::run_phase`].
#[derive(Debug)]
pub struct PhaseReport {
    pub phase: Phase,
    pub systems_run: usize,
    pub stages: usize,
    pub failures: Vec<SystemFailure>,
    pub commands: CommandReport,
}

impl PhaseReport {
    fn empty(phase: Phase) -> Self {
        Self {
            phase,
            systems_run: 0,
            stages: 0,
            failures: Vec::new(),
            commands: CommandReport::default(),
        }
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.commands.is_clean()
    }
}

/// Outcome of one [`Scheduler::progress`].
#[derive(Debug)]
pub struct FrameReport {
    pub frame: u64,
    pub phases: Vec<PhaseReport>,
}

struct SystemOutput {
    index: usize,
    result: std::result::Result<(), EcsError>,
    commands: reflecs_ecs::CommandBuffer,
}

/// Registers systems and runs them phase by phase.
pub struct Scheduler {
    config: SchedulerConfig,
    pipeline: Pipeline,
    systems: Vec<SystemRecord>,
    plans: HashMap<Phase, PhasePlan, FxBuildHasher>,
    pool: Option<rayon::ThreadPool>,
    next_handle: u64,
    paused: bool,
    started: bool,
    frame: u64,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        Self::with_pipeline(config, Pipeline::default())
    }

    pub fn with_pipeline(config: SchedulerConfig, pipeline: Pipeline) -> Result<Self> {
        let pool = if config.parallel {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(config.worker_threads)
                .thread_name(|i| format!("reflecs-worker-{i}"))
                .build()?;
            tracing::info!(threads = pool.current_num_threads(), "scheduler worker pool ready");
            Some(pool)
        } else {
            None
        };

        Ok(Self {
            config,
            pipeline,
            systems: Vec::new(),
            plans: HashMap::default(),
            pool,
            next_handle: 0,
            paused: false,
            started: false,
            frame: 0,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    #[must_use]
    pub const fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Add a custom phase. Plans are unaffected: a new phase has no systems.
    pub fn insert_phase_after(&mut self, anchor: Phase, phase: Phase) -> Result<()> {
        self.pipeline.insert_after(anchor, phase)
    }

    // ==================== Registration ====================

    /// Register a system. Its term list is compiled against `world`.
    ///
    /// Fails without side effects on an unknown phase or system, an invalid
    /// term list, or constraints that cannot be satisfied.
    pub fn register_system(&mut self, world: &World, builder: SystemBuilder) -> Result<SystemHandle> {
        let SystemBuilder {
            name,
            terms,
            phase,
            after,
            before,
            parallel_safe,
            run_when_paused,
            run,
        } = builder;

        let rank = self
            .pipeline
            .rank(phase)
            .ok_or(ScheduleError::UnknownPhase(phase))?;
        let run = run.ok_or_else(|| ScheduleError::MissingCallback(name.clone()))?;

        for &other in after.iter().chain(&before) {
            self.index_of(other)?;
        }
        // Cross-phase constraints are satisfied by phase order or never.
        for &pred in &after {
            if self.rank_of(pred) > Some(rank) {
                return Err(self.cycle(&[name.as_str(), self.systems[self.index_of(pred)?].name.as_str()]));
            }
        }
        for &succ in &before {
            if self.rank_of(succ) < Some(rank) {
                return Err(self.cycle(&[name.as_str(), self.systems[self.index_of(succ)?].name.as_str()]));
            }
        }

        let query = terms.compile(world)?;
        let access = AccessSet::from_terms(&terms);
        let handle = SystemHandle::new(self.next_handle);

        self.systems.push(SystemRecord {
            handle,
            name,
            query,
            access,
            phase,
            after,
            before,
            parallel_safe,
            run_when_paused,
            enabled: true,
            run,
        });

        match self.build_plan(phase) {
            Ok(plan) => {
                self.plans.insert(phase, plan);
            }
            Err(err) => {
                self.systems.pop();
                return Err(err);
            }
        }

        self.next_handle += 1;
        let record = &self.systems[self.systems.len() - 1];
        tracing::debug!(
            system = %record.name,
            %phase,
            parallel_safe,
            ?handle,
            "registered system"
        );
        Ok(handle)
    }

    /// Remove a system. Constraints other systems had on it are dropped.
    pub fn unregister_system(&mut self, handle: SystemHandle) -> Result<()> {
        let index = self.index_of(handle)?;
        let record = self.systems.remove(index);
        for system in &mut self.systems {
            system.after.retain(|&h| h != handle);
            system.before.retain(|&h| h != handle);
        }
        self.rebuild_all_plans();
        tracing::debug!(system = %record.name, "unregistered system");
        Ok(())
    }

    pub fn set_enabled(&mut self, handle: SystemHandle, enabled: bool) -> Result<()> {
        let index = self.index_of(handle)?;
        self.systems[index].enabled = enabled;
        Ok(())
    }

    #[must_use]
    pub fn is_enabled(&self, handle: SystemHandle) -> Option<bool> {
        self.find(handle).map(|s| s.enabled)
    }

    #[must_use]
    pub fn system_name(&self, handle: SystemHandle) -> Option<&str> {
        self.find(handle).map(|s| s.name.as_str())
    }

    #[must_use]
    pub fn system_phase(&self, handle: SystemHandle) -> Option<Phase> {
        self.find(handle).map(|s| s.phase)
    }

    #[must_use]
    pub fn system_count(&self) -> usize {
        self.systems.len()
    }

    /// Only `run_when_paused` systems run while paused.
    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    #[must_use]
    pub const fn is_paused(&self) -> bool {
        self.paused
    }

    #[must_use]
    pub const fn frame(&self) -> u64 {
        self.frame
    }

    /// Systems downgraded to serial in `phase`.
    #[must_use]
    pub fn diagnostics(&self, phase: Phase) -> &[Overlap] {
        self.plans.get(&phase).map_or(&[], |plan| &plan.overlaps)
    }

    /// The execution plan of `phase`.
    #[must_use]
    pub fn stages(&self, phase: Phase) -> &[Stage] {
        self.plans.get(&phase).map_or(&[], |plan| &plan.stages)
    }

    fn find(&self, handle: SystemHandle) -> Option<&SystemRecord> {
        self.systems.iter().find(|s| s.handle == handle)
    }

    fn index_of(&self, handle: SystemHandle) -> Result<usize> {
        self.systems
            .iter()
            .position(|s| s.handle == handle)
            .ok_or(ScheduleError::UnknownSystem(handle))
    }

    fn rank_of(&self, handle: SystemHandle) -> Option<usize> {
        self.find(handle).and_then(|s| self.pipeline.rank(s.phase))
    }

    fn cycle(&self, names: &[&str]) -> ScheduleError {
        let systems: Vec<String> = names.iter().map(|&n| n.to_owned()).collect();
        tracing::warn!(?systems, "rejected unsatisfiable ordering constraint");
        ScheduleError::OrderingCycle { systems }
    }

    // ==================== Planning ====================

    fn rebuild_all_plans(&mut self) {
        self.plans.clear();
        let phases: Vec<Phase> = {
            let mut seen = Vec::new();
            for system in &self.systems {
                if !seen.contains(&system.phase) {
                    seen.push(system.phase);
                }
            }
            seen
        };
        for phase in phases {
            // Removing systems and constraints cannot introduce a cycle.
            match self.build_plan(phase) {
                Ok(plan) => {
                    self.plans.insert(phase, plan);
                }
                Err(err) => tracing::warn!(%phase, %err, "failed to rebuild phase plan"),
            }
        }
    }

    /// Layer the phase's systems with Kahn's algorithm, breaking ties by
    /// registration order, then split each layer into stages.
    fn build_plan(&self, phase: Phase) -> Result<PhasePlan> {
        let members: Vec<usize> = (0..self.systems.len())
            .filter(|&i| self.systems[i].phase == phase)
            .collect();
        let local = |handle: SystemHandle| members.iter().position(|&i| self.systems[i].handle == handle);

        let mut indegree = vec![0usize; members.len()];
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); members.len()];
        for (node, &i) in members.iter().enumerate() {
            let system = &self.systems[i];
            for pred in system.after.iter().filter_map(|&h| local(h)) {
                successors[pred].push(node);
                indegree[node] += 1;
            }
            for succ in system.before.iter().filter_map(|&h| local(h)) {
                successors[node].push(succ);
                indegree[succ] += 1;
            }
        }

        let mut plan = PhasePlan::default();
        let mut ready: Vec<usize> = (0..members.len()).filter(|&n| indegree[n] == 0).collect();
        let mut placed = 0;

        while !ready.is_empty() {
            ready.sort_unstable();
            let layer = std::mem::take(&mut ready);
            placed += layer.len();

            for &node in &layer {
                for &succ in &successors[node] {
                    indegree[succ] -= 1;
                    if indegree[succ] == 0 {
                        ready.push(succ);
                    }
                }
            }

            let layer: Vec<usize> = layer.into_iter().map(|n| members[n]).collect();
            self.split_layer(&layer, &mut plan);
        }

        if placed < members.len() {
            let systems = (0..members.len())
                .filter(|&n| indegree[n] > 0)
                .map(|n| self.systems[members[n]].name.clone())
                .collect();
            return Err(ScheduleError::OrderingCycle { systems });
        }
        Ok(plan)
    }

    fn split_layer(&self, layer: &[usize], plan: &mut PhasePlan) {
        let mut group: Vec<usize> = Vec::new();
        let mut serial: Vec<usize> = Vec::new();

        for &index in layer {
            let system = &self.systems[index];
            if !system.parallel_safe || !self.config.parallel {
                serial.push(index);
                continue;
            }
            let clash = group.iter().find_map(|&other| {
                let types = system.access.conflicts(&self.systems[other].access);
                (!types.is_empty()).then_some((other, types))
            });
            match clash {
                None => group.push(index),
                Some((other, types)) => {
                    let overlap = Overlap {
                        system: system.name.clone(),
                        conflicts_with: self.systems[other].name.clone(),
                        types,
                    };
                    tracing::warn!(
                        system = %overlap.system,
                        conflicts_with = %overlap.conflicts_with,
                        types = ?overlap.types,
                        "write sets overlap; running serially"
                    );
                    plan.overlaps.push(overlap);
                    serial.push(index);
                }
            }
        }

        match group.len() {
            0 => {}
            1 => plan.stages.push(Stage::Serial(group[0])),
            _ => plan.stages.push(Stage::Parallel(group)),
        }
        plan.stages.extend(serial.into_iter().map(Stage::Serial));
    }

    // ==================== Execution ====================

    /// Run every system of `phase`, then apply their deferred commands.
    ///
    /// System errors are logged and collected; they never stop the phase.
    pub fn run_phase(&mut self, world: &mut World, phase: Phase, delta: f32) -> Result<PhaseReport> {
        if !self.pipeline.contains(phase) {
            return Err(ScheduleError::UnknownPhase(phase));
        }
        let span = tracing::info_span!("run_phase", phase = phase.name(), frame = self.frame);
        let _enter = span.enter();

        let Some(plan) = self.plans.get(&phase) else {
            return Ok(PhaseReport::empty(phase));
        };

        let mut report = PhaseReport::empty(phase);
        let mut outputs: Vec<SystemOutput> = Vec::new();
        {
            let world: &World = world;
            for stage in &plan.stages {
                report.stages += 1;
                match stage {
                    Stage::Serial(index) => outputs.extend(self.run_system(world, *index, delta)),
                    Stage::Parallel(indices) => {
                        let run = || {
                            indices
                                .par_iter()
                                .filter_map(|&index| self.run_system(world, index, delta))
                                .collect::<Vec<_>>()
                        };
                        let results = match &self.pool {
                            Some(pool) => pool.install(run),
                            None => run(),
                        };
                        outputs.extend(results);
                    }
                }
            }
        }

        report.systems_run = outputs.len();
        for output in outputs {
            let name = &self.systems[output.index].name;
            if let Err(error) = output.result {
                tracing::warn!(system = %name, %error, "system failed");
                report.failures.push(SystemFailure {
                    system: name.clone(),
                    error,
                });
            }
            if !output.commands.is_empty() {
                report.commands.merge(world.apply_commands(output.commands));
            }
        }

        tracing::trace!(
            systems = report.systems_run,
            stages = report.stages,
            failures = report.failures.len(),
            "phase complete"
        );
        Ok(report)
    }

    /// Alias of [`run_phase`](Self::run_phase).
    pub fn tick(&mut self, world: &mut World, phase: Phase, delta: f32) -> Result<PhaseReport> {
        self.run_phase(world, phase, delta)
    }

    /// Run one frame: `OnStart` on the first call, then every phase of the
    /// pipeline in order.
    pub fn progress(&mut self, world: &mut World, delta: f32) -> Result<FrameReport> {
        let mut phases = Vec::new();
        if !self.started {
            self.started = true;
            phases.push(self.run_phase(world, Phase::ON_START, delta)?);
        }
        let order: Vec<Phase> = self.pipeline.iter().collect();
        for phase in order {
            phases.push(self.run_phase(world, phase, delta)?);
        }
        let frame = self.frame;
        self.frame += 1;
        Ok(FrameReport { frame, phases })
    }

    fn run_system(&self, world: &World, index: usize, delta: f32) -> Option<SystemOutput> {
        let system = &self.systems[index];
        if !system.enabled || (self.paused && !system.run_when_paused) {
            return None;
        }
        let ctx = SystemContext::new(world, &system.query, &system.access, &system.name, delta, self.frame);
        let result = (system.run)(&ctx);
        Some(SystemOutput {
            index,
            result,
            commands: ctx.into_commands(),
        })
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("systems", &self.systems.len())
            .field("frame", &self.frame)
            .field("paused", &self.paused)
            .field("parallel", &self.pool.is_some())
            .finish()
    }
}
