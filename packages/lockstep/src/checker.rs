//! The checker: systematic testing entry point for the controlled backend.
//!
//! A [`Checker`] runs a test harness closure under the controlled scheduler
//! for a configured number of iterations, each a fresh runtime driven by the
//! strategy's decisions. The first bug stops the run and is reported with
//! its iteration, step offset, seed, and the full replayable trace.
//!
//! ```ignore
//! let report = Checker::new(CheckerConfig {
//!     iterations: 100,
//!     strategy: StrategyKind::Random,
//!     seed: Some(7),
//!     ..CheckerConfig::default()
//! })
//! .register_monitor::<ProgressSpec>()
//! .run(|env| {
//!     let server = env.create_machine::<Server>(None)?;
//!     env.send(&server, Event::new(PING))?;
//!     Ok(())
//! });
//! assert!(!report.found_bug(), "{}", report.bug.unwrap());
//! ```

use std::any::TypeId;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

use chrono::Utc;
use tracing::{debug, info};

use crate::coverage::ActivityCoverage;
use crate::error::{ActionAbort, BugReport, LockstepError};
use crate::event::{Event, OperationGroup, SendOptions};
use crate::id::MachineId;
use crate::machine::{panic_message, run_burst, Automaton, MachineCell, RunOutcome};
use crate::runtime::{self, unregister, RuntimeCommon, RuntimeLink, SendOutcome};
use crate::scheduler::{
    Gate, IterationOutcome, OpPhase, Scheduler, SchedulerConfig, HARNESS_OP,
};
use crate::strategy::{
    DfsStrategy, FairPctStrategy, IddfsStrategy, PctStrategy, PortfolioStrategy, RandomStrategy,
    ReplayStrategy, Strategy,
};
use crate::trace::{OperationKind, ScheduleTrace};

/// Strategy selection for the controlled backend.
#[derive(Debug, Clone)]
pub enum StrategyKind {
    /// Uniform random scheduling.
    Random,
    /// Probabilistic concurrency testing with the given number of priority
    /// change points.
    Pct {
        change_points: usize,
    },
    /// PCT with a round-robin fair tail.
    FairPct {
        change_points: usize,
    },
    /// Exhaustive depth-first search.
    Dfs,
    /// Iterative-deepening depth-first search.
    Iddfs,
    /// Rotate random, PCT, and fair-PCT across iterations.
    Portfolio,
    /// Replay a recorded trace exactly.
    Replay(ScheduleTrace),
}

/// Configuration for a [`Checker`] run.
#[derive(Debug, Clone)]
pub struct CheckerConfig {
    /// Number of independent schedules to explore.
    pub iterations: u32,
    /// Per-iteration bound on scheduling decisions.
    pub max_steps: u64,
    /// Strategy driving scheduling and nondeterministic choices.
    pub strategy: StrategyKind,
    /// Strategy seed; drawn from entropy when absent.
    pub seed: Option<u64>,
    /// Fingerprint every scheduling point and count distinct states.
    pub cache_program_state: bool,
    /// Report a hot monitor at deadlock as a liveness bug.
    pub liveness_checking: bool,
    /// Report a hot monitor persisting across a program-state cycle.
    /// Implies fingerprinting.
    pub cycle_detection: bool,
    /// Default the must-handle flag on every send.
    pub must_handle_by_default: bool,
    /// Include aggregated activity coverage in the report.
    pub report_activity_coverage: bool,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            iterations: 10,
            max_steps: 10_000,
            strategy: StrategyKind::Random,
            seed: None,
            cache_program_state: false,
            liveness_checking: true,
            cycle_detection: false,
            must_handle_by_default: false,
            report_activity_coverage: false,
        }
    }
}

/// Result of a [`Checker`] run.
#[derive(Debug)]
pub struct CheckReport {
    /// Iterations actually executed (the strategy may exhaust earlier).
    pub iterations_run: u32,
    /// The first bug found, if any.
    pub bug: Option<BugReport>,
    /// Aggregated coverage, when `report_activity_coverage` was set.
    pub coverage: Option<ActivityCoverage>,
    /// Distinct program states observed in the last iteration (when
    /// fingerprinting was on).
    pub distinct_states: usize,
    /// Fingerprint of the final program state of the last iteration.
    pub final_digest: Option<u64>,
    /// Schedule trace of the last iteration (the bug's trace when a bug was
    /// found).
    pub last_trace: ScheduleTrace,
    /// The seed the strategies ran with.
    pub seed: u64,
}

impl CheckReport {
    /// True if the run found a bug.
    pub fn found_bug(&self) -> bool {
        self.bug.is_some()
    }
}

impl fmt::Display for CheckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.bug {
            Some(bug) => write!(f, "{bug}"),
            None => write!(
                f,
                "no bug found in {} iterations (seed {})",
                self.iterations_run, self.seed
            ),
        }
    }
}

type MonitorInstaller = Box<dyn Fn(&dyn RuntimeLink) -> Result<(), ActionAbort> + Send + Sync>;
type Harness = dyn Fn(&ControlledHandle) -> anyhow::Result<()> + Send + Sync;

/// Systematic testing driver.
pub struct Checker {
    config: CheckerConfig,
    monitor_installers: Vec<MonitorInstaller>,
}

impl Checker {
    /// A checker with the given configuration.
    pub fn new(config: CheckerConfig) -> Self {
        Self {
            config,
            monitor_installers: Vec::new(),
        }
    }

    /// Register a monitor type for every iteration (idempotent per type).
    pub fn register_monitor<M: Automaton + Default>(mut self) -> Self {
        self.monitor_installers
            .push(Box::new(|link| link.common().monitors.register::<M>(link)));
        self
    }

    /// Run the harness under the controlled scheduler.
    ///
    /// The harness runs once per iteration as operation 0; machines it
    /// creates become further operations. The first bug ends the run.
    pub fn run(
        self,
        harness: impl Fn(&ControlledHandle) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> CheckReport {
        let seed = self.config.seed.unwrap_or_else(|| fastrand::u64(..));
        let strategy: Arc<Mutex<Box<dyn Strategy>>> = Arc::new(Mutex::new(build_strategy(
            &self.config.strategy,
            seed,
            self.config.max_steps,
        )));
        let harness: Arc<Harness> = Arc::new(harness);

        let mut coverage = ActivityCoverage::default();
        let mut report = CheckReport {
            iterations_run: 0,
            bug: None,
            coverage: None,
            distinct_states: 0,
            final_digest: None,
            last_trace: ScheduleTrace::new(),
            seed,
        };

        for iteration in 1..=self.config.iterations {
            if iteration > 1
                && !strategy
                    .lock()
                    .expect("mutex not poisoned")
                    .prepare_for_next_iteration()
            {
                info!(iteration, "strategy exhausted its search space");
                break;
            }
            debug!(iteration, "starting iteration");
            let result = self.run_iteration(
                iteration,
                Arc::clone(&strategy),
                Arc::clone(&harness),
                &mut coverage,
            );
            debug!(iteration, steps = result.steps, "iteration complete");
            report.iterations_run = iteration;
            report.distinct_states = result.distinct_states;
            report.final_digest = result.final_digest;
            report.last_trace = result.trace.clone();

            if let IterationOutcome::Bug(error) = result.outcome {
                report.bug = Some(BugReport {
                    error,
                    iteration,
                    step: result.trace.len() as u64,
                    seed,
                    trace: result.trace,
                    at: Utc::now(),
                });
                break;
            }
        }

        if self.config.report_activity_coverage {
            report.coverage = Some(coverage);
        }
        info!(%report, "check finished");
        report
    }

    fn run_iteration(
        &self,
        iteration: u32,
        strategy: Arc<Mutex<Box<dyn Strategy>>>,
        harness: Arc<Harness>,
        coverage: &mut ActivityCoverage,
    ) -> crate::scheduler::IterationResult {
        let common = RuntimeCommon::new(u64::from(iteration), self.config.must_handle_by_default);
        let monitors = Arc::clone(&common.monitors);
        let sched = Scheduler::new(
            SchedulerConfig {
                max_steps: self.config.max_steps,
                liveness_checking: self.config.liveness_checking,
                cycle_detection: self.config.cycle_detection,
                cache_program_state: self.config.cache_program_state,
            },
            strategy,
            monitors,
        );
        let core = Arc::new_cyclic(|weak| ControlledCore {
            common,
            sched,
            threads: Mutex::new(Vec::new()),
            self_ref: Weak::clone(weak),
        });

        for install in &self.monitor_installers {
            if let Err(abort) = install(core.as_ref()) {
                if !abort.is_canceled() {
                    core.sched.report_bug(abort.into_error());
                }
            }
        }

        // The harness runs as operation 0.
        let handle = ControlledHandle {
            core: Arc::clone(&core),
        };
        let harness_gate = core.sched.harness_gate();
        let harness_core = Arc::clone(&core);
        let harness_thread = std::thread::spawn(move || {
            harness_gate.acquire();
            if harness_core.sched.is_done() {
                return;
            }
            let result = catch_unwind(AssertUnwindSafe(|| (harness.as_ref())(&handle)));
            match result {
                Ok(Ok(())) => harness_core.sched.retire(HARNESS_OP),
                Ok(Err(error)) => match error.downcast::<LockstepError>() {
                    Ok(LockstepError::Canceled) => {}
                    Ok(bug) => {
                        harness_core.sched.report_bug(bug);
                    }
                    Err(other) => {
                        harness_core
                            .sched
                            .report_bug(LockstepError::AssertionFailure {
                                message: format!("test harness failed: {other:#}"),
                                machine: None,
                            });
                    }
                },
                Err(panic) => {
                    harness_core
                        .sched
                        .report_bug(LockstepError::AssertionFailure {
                            message: format!("test harness panicked: {}", panic_message(panic)),
                            machine: None,
                        });
                }
            }
        });
        core.threads
            .lock()
            .expect("mutex not poisoned")
            .push(harness_thread);

        core.sched.start();
        let result = core.sched.wait_done();

        // Join every thread; late spawns re-fill the vector, so drain until
        // it stays empty.
        loop {
            let handles: Vec<JoinHandle<()>> =
                std::mem::take(&mut *core.threads.lock().expect("mutex not poisoned"));
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                let _ = handle.join();
            }
        }

        coverage.merge(&core.common.coverage.snapshot());
        result
    }
}

fn build_strategy(kind: &StrategyKind, seed: u64, max_steps: u64) -> Box<dyn Strategy> {
    match kind {
        StrategyKind::Random => Box::new(RandomStrategy::new(seed)),
        StrategyKind::Pct { change_points } => {
            Box::new(PctStrategy::new(seed, *change_points, max_steps))
        }
        StrategyKind::FairPct { change_points } => {
            Box::new(FairPctStrategy::new(seed, *change_points, max_steps))
        }
        StrategyKind::Dfs => Box::new(DfsStrategy::new()),
        StrategyKind::Iddfs => Box::new(IddfsStrategy::new()),
        StrategyKind::Portfolio => Box::new(PortfolioStrategy::new(vec![
            Box::new(RandomStrategy::new(seed)),
            Box::new(PctStrategy::new(seed.wrapping_add(1), 3, max_steps)),
            Box::new(FairPctStrategy::new(seed.wrapping_add(2), 3, max_steps)),
        ])),
        StrategyKind::Replay(trace) => Box::new(ReplayStrategy::new(trace.clone())),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Controlled backend core
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) struct ControlledCore {
    common: RuntimeCommon,
    sched: Scheduler,
    threads: Mutex<Vec<JoinHandle<()>>>,
    self_ref: Weak<ControlledCore>,
}

fn machine_thread(core: Arc<ControlledCore>, cell: Arc<MachineCell>, gate: Arc<Gate>) {
    gate.acquire();
    if core.sched.is_done() {
        return;
    }
    let my = cell.id.value();
    loop {
        match run_burst(&cell, core.as_ref()) {
            RunOutcome::Idle => {
                if core.sched.park(my, OpPhase::Idle).is_err() {
                    break;
                }
            }
            RunOutcome::Halted => {
                core.sched.retire(my);
                break;
            }
            RunOutcome::Canceled | RunOutcome::Failed => break,
        }
    }
}

impl RuntimeLink for ControlledCore {
    fn common(&self) -> &RuntimeCommon {
        &self.common
    }

    fn point(&self, kind: OperationKind, _target: &MachineId) -> Result<(), ActionAbort> {
        self.sched.switch(kind)
    }

    fn spawn_runner(&self, cell: &Arc<MachineCell>) {
        let Some(core) = self.self_ref.upgrade() else {
            return;
        };
        let gate = self.sched.register_machine(cell);
        let cell = Arc::clone(cell);
        let handle = std::thread::spawn(move || machine_thread(core, cell, gate));
        self.threads
            .lock()
            .expect("mutex not poisoned")
            .push(handle);
    }

    fn wake_runner(&self, _cell: &Arc<MachineCell>) {
        // Enabledness is computed live from the inbox at each scheduling
        // point; the machine's parked thread resumes when granted.
    }

    fn wait_receive(&self, cell: &MachineCell) -> Result<Event, ActionAbort> {
        self.sched.park(cell.id.value(), OpPhase::Receiving)?;
        cell.inbox
            .lock()
            .expect("mutex not poisoned")
            .take_delivered()
            .ok_or_else(|| {
                self.sched.report_bug(LockstepError::AssertionFailure {
                    message: "receive resumed without a delivered event".into(),
                    machine: Some(cell.label()),
                })
            })
    }

    fn choose_bool(&self, max: u64) -> Result<bool, ActionAbort> {
        self.sched.choose_bool(max)
    }

    fn choose_int(&self, max: u64) -> Result<u64, ActionAbort> {
        self.sched.choose_int(max)
    }

    fn on_bug(&self, error: LockstepError) -> ActionAbort {
        self.sched.report_bug(error)
    }

    fn on_halt(&self, cell: &Arc<MachineCell>) {
        unregister(&self.common, cell);
    }

    fn assert_caller(&self, id: &MachineId) -> Result<(), ActionAbort> {
        match self.sched.current_machine() {
            Some(current) if current == id.value() => Ok(()),
            _ => Err(self.on_bug(LockstepError::AssertionFailure {
                message: format!("operation-group query for {id} from outside that machine"),
                machine: None,
            })),
        }
    }

    fn invoke_monitor_by_type(
        &self,
        type_id: TypeId,
        event: &Event,
    ) -> Result<(), ActionAbort> {
        self.common.monitors.invoke(self, type_id, event)
    }

    fn is_controlled(&self) -> bool {
        true
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Controlled handle (the harness API)
// ─────────────────────────────────────────────────────────────────────────────

/// Runtime facade handed to the test harness closure.
///
/// Every call is a scheduling point; the controlled scheduler may interleave
/// other machines before the effect happens.
#[derive(Clone)]
pub struct ControlledHandle {
    core: Arc<ControlledCore>,
}

impl ControlledHandle {
    fn link(&self) -> &dyn RuntimeLink {
        self.core.as_ref()
    }

    /// Create a machine of type `M`.
    pub fn create_machine<M: Automaton + Default>(
        &self,
        init: Option<Event>,
    ) -> Result<MachineId, LockstepError> {
        runtime::create_machine::<M>(self.link(), init, None, None, None)
            .map_err(ActionAbort::into_error)
    }

    /// Create a machine with a friendly name.
    pub fn create_machine_named<M: Automaton + Default>(
        &self,
        name: &str,
        init: Option<Event>,
    ) -> Result<MachineId, LockstepError> {
        runtime::create_machine::<M>(self.link(), init, None, None, Some(name))
            .map_err(ActionAbort::into_error)
    }

    /// Create a machine of type `M` with an explicit operation group.
    pub fn create_machine_grouped<M: Automaton + Default>(
        &self,
        init: Option<Event>,
        group: OperationGroup,
    ) -> Result<MachineId, LockstepError> {
        runtime::create_machine::<M>(self.link(), init, Some(group), None, None)
            .map_err(ActionAbort::into_error)
    }

    /// Controlled equivalent of `create_machine_and_execute`: the scheduler
    /// serializes all execution, so creation is already drained on demand.
    pub fn create_machine_and_execute<M: Automaton + Default>(
        &self,
        init: Option<Event>,
    ) -> Result<MachineId, LockstepError> {
        self.create_machine::<M>(init)
    }

    /// Issue a fresh unbound id for machine type `M`.
    pub fn create_machine_id<M: Automaton>(&self, friendly: Option<&str>) -> MachineId {
        runtime::create_machine_id::<M>(self.link(), friendly)
    }

    /// Bind an unbound id to a new machine of type `M`.
    pub fn bind<M: Automaton + Default>(
        &self,
        id: MachineId,
        init: Option<Event>,
    ) -> Result<MachineId, LockstepError> {
        runtime::create_machine::<M>(self.link(), init, None, Some(id), None)
            .map_err(ActionAbort::into_error)
    }

    /// Enqueue an event to `target`.
    pub fn send(&self, target: &MachineId, event: Event) -> Result<(), LockstepError> {
        self.send_with(target, event, SendOptions::default())
    }

    /// Enqueue an event to `target` with options.
    pub fn send_with(
        &self,
        target: &MachineId,
        event: Event,
        options: SendOptions,
    ) -> Result<(), LockstepError> {
        runtime::route_event(self.link(), None, target, event, options)
            .map(|_| ())
            .map_err(ActionAbort::into_error)
    }

    /// Enqueue an event; returns true when the target's handler was not
    /// already running (the event will be handled without further sends).
    pub fn send_and_execute(
        &self,
        target: &MachineId,
        event: Event,
    ) -> Result<bool, LockstepError> {
        runtime::route_event(self.link(), None, target, event, SendOptions::default())
            .map(|outcome| outcome == SendOutcome::Scheduled)
            .map_err(ActionAbort::into_error)
    }

    /// Register a monitor (idempotent per type).
    pub fn register_monitor<M: Automaton + Default>(&self) -> Result<(), LockstepError> {
        self.core
            .common
            .monitors
            .register::<M>(self.link())
            .map_err(ActionAbort::into_error)
    }

    /// Step the registered monitor of type `M` with `event`.
    pub fn invoke_monitor<M: Automaton>(&self, event: Event) -> Result<(), LockstepError> {
        self.link()
            .invoke_monitor_by_type(TypeId::of::<M>(), &event)
            .map_err(ActionAbort::into_error)
    }

    /// A strategy-controlled boolean choice, recorded for replay.
    pub fn random(&self, max: u64) -> Result<bool, LockstepError> {
        self.link().choose_bool(max).map_err(ActionAbort::into_error)
    }

    /// A strategy-controlled integer choice in `0..max`, recorded for
    /// replay.
    pub fn random_int(&self, max: u64) -> Result<u64, LockstepError> {
        self.link().choose_int(max).map_err(ActionAbort::into_error)
    }

    /// Fail the iteration if `condition` is false.
    pub fn assert(&self, condition: bool, message: impl Into<String>) -> Result<(), LockstepError> {
        if condition {
            return Ok(());
        }
        Err(self
            .core
            .on_bug(LockstepError::AssertionFailure {
                message: message.into(),
                machine: None,
            })
            .into_error())
    }

    /// The current operation group of machine `id`. Asserts that the
    /// calling operation is that machine.
    pub fn operation_group(&self, id: &MachineId) -> Result<OperationGroup, LockstepError> {
        self.core
            .assert_caller(id)
            .map_err(ActionAbort::into_error)?;
        Ok(self
            .core
            .common
            .lookup(id)
            .map(|cell| *cell.group.lock().expect("mutex not poisoned"))
            .unwrap_or(OperationGroup::NONE))
    }
}

impl fmt::Debug for ControlledHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlledHandle")
            .field("machines", &self.core.common.machines.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decl::{ActionResult, MachineBuilder, StateName};
    use crate::event::EventKind;
    use crate::machine::ActionContext;

    const STEPPING: StateName = StateName::new("Stepping");
    const OBSERVED: EventKind = EventKind::new("observed");
    const BUMP: EventKind = EventKind::new("bump");

    #[derive(Default)]
    struct Stepper {
        bumps: u32,
    }

    impl Automaton for Stepper {
        fn declare(b: &mut MachineBuilder<Self>) {
            b.state(STEPPING).start().on(BUMP, Stepper::on_bump);
        }
    }

    impl Stepper {
        fn on_bump(&mut self, ctx: &mut ActionContext<'_>, _ev: &Event) -> ActionResult {
            self.bumps += 1;
            ctx.assert(self.bumps <= 3, "too many bumps")
        }
    }

    #[derive(Default)]
    struct QuietSpec;

    impl Automaton for QuietSpec {
        fn declare(b: &mut MachineBuilder<Self>) {
            b.state(STEPPING).start().on(OBSERVED, |_, _, _| Ok(()));
        }
    }

    #[test]
    fn test_monitor_registration_is_idempotent() {
        let report = Checker::new(CheckerConfig {
            iterations: 1,
            seed: Some(1),
            ..CheckerConfig::default()
        })
        .register_monitor::<QuietSpec>()
        .register_monitor::<QuietSpec>()
        .run(|env| {
            env.register_monitor::<QuietSpec>()?;
            assert_eq!(env.core.common.monitors.len(), 1);
            Ok(())
        });
        assert!(!report.found_bug(), "{report}");
    }

    #[test]
    fn test_clean_run_reports_no_bug_and_counts_states() {
        let report = Checker::new(CheckerConfig {
            iterations: 4,
            seed: Some(2),
            cache_program_state: true,
            ..CheckerConfig::default()
        })
        .run(|env| {
            let stepper = env.create_machine::<Stepper>(None)?;
            env.send(&stepper, Event::new(BUMP))?;
            env.send(&stepper, Event::new(BUMP))?;
            Ok(())
        });

        assert!(!report.found_bug(), "{report}");
        assert_eq!(report.iterations_run, 4);
        assert!(report.distinct_states > 0);
        assert!(report.final_digest.is_some());
    }

    #[test]
    fn test_coverage_is_aggregated_when_requested() {
        let report = Checker::new(CheckerConfig {
            iterations: 2,
            seed: Some(4),
            report_activity_coverage: true,
            ..CheckerConfig::default()
        })
        .run(|env| {
            let stepper = env.create_machine::<Stepper>(None)?;
            env.send(&stepper, Event::new(BUMP))?;
            Ok(())
        });

        let coverage = report.coverage.expect("coverage requested");
        assert!(coverage.visited_state("Stepper", "Stepping"));
        assert!(coverage.visited_transition("Stepper", "Stepping", "bump"));
    }

    #[test]
    fn test_machine_assertion_bug_carries_machine_context() {
        let report = Checker::new(CheckerConfig {
            iterations: 1,
            seed: Some(8),
            ..CheckerConfig::default()
        })
        .run(|env| {
            let stepper = env.create_machine::<Stepper>(None)?;
            for _ in 0..4 {
                env.send(&stepper, Event::new(BUMP))?;
            }
            Ok(())
        });

        let bug = report.bug.expect("assertion expected after four bumps");
        match &bug.error {
            LockstepError::AssertionFailure { message, machine } => {
                assert!(message.contains("too many bumps"));
                assert!(machine.is_some(), "machine context expected");
            }
            other => panic!("expected AssertionFailure, got {other}"),
        }
    }
}
