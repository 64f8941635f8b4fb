//! The controlled scheduler: a cooperative single-runner serializer.
//!
//! Exactly one operation makes progress at a time. Every externally visible
//! step (create, send, receive, nondeterministic choice, halt) passes
//! through a scheduling point that records the decision in the trace,
//! consults the strategy for the next operation, releases the chosen
//! operation's gate, and parks the caller on its own.
//!
//! The host OS may run many threads (one per machine handler plus the test
//! harness), but the gates guarantee only one runs the observable step at
//! any instant: a thread only proceeds past a scheduling point while it
//! holds the single logical token, and every transfer releases exactly one
//! gate.
//!
//! Iterations end when no operation is enabled (normal completion, or a
//! liveness bug if a monitor is hot), when the step bound is hit, or when a
//! bug is reported; all gates are then released so every thread observes the
//! done flag and unwinds with `Canceled`.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Condvar, Mutex};

use tracing::{debug, info, trace};

use crate::error::{ActionAbort, LockstepError};
use crate::fingerprint::{CycleVerdict, StateCache};
use crate::machine::MachineCell;
use crate::monitor::MonitorRegistry;
use crate::strategy::Strategy;
use crate::trace::{Decision, OperationKind, ScheduleTrace};

/// Binary gate: one permit, condvar-backed.
///
/// `release` stores the permit if no thread is waiting, so a grant that
/// races a late `acquire` is never lost.
pub(crate) struct Gate {
    granted: Mutex<bool>,
    cv: Condvar,
}

impl Gate {
    pub(crate) fn new() -> Self {
        Self {
            granted: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn release(&self) {
        let mut granted = self.granted.lock().expect("mutex not poisoned");
        *granted = true;
        self.cv.notify_one();
    }

    pub(crate) fn acquire(&self) {
        let mut granted = self.granted.lock().expect("mutex not poisoned");
        while !*granted {
            granted = self.cv.wait(granted).expect("mutex not poisoned");
        }
        *granted = false;
    }
}

/// What a registered operation is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpPhase {
    /// Created, first run not yet granted.
    Fresh,
    /// Running, or parked at a scheduling point wanting to continue.
    Ready,
    /// Handler loop drained; runnable again once its inbox has work.
    Idle,
    /// Blocked in `receive`; runnable once an event is delivered.
    Receiving,
    /// Halted or completed; never runnable again.
    Done,
}

struct OpEntry {
    gate: Arc<Gate>,
    phase: OpPhase,
    cell: Option<Arc<MachineCell>>,
}

/// How an iteration ended.
#[derive(Debug, Clone)]
pub(crate) enum IterationOutcome {
    /// No operation enabled, no obligations outstanding.
    Completed,
    /// The per-iteration step bound was reached.
    MaxSteps,
    /// A bug was detected.
    Bug(LockstepError),
}

pub(crate) struct SchedulerConfig {
    pub(crate) max_steps: u64,
    pub(crate) liveness_checking: bool,
    pub(crate) cycle_detection: bool,
    pub(crate) cache_program_state: bool,
}

/// Operation id of the test harness.
pub(crate) const HARNESS_OP: u64 = 0;

struct SchedState {
    ops: BTreeMap<u64, OpEntry>,
    current: u64,
    steps: u64,
    trace: ScheduleTrace,
    done: bool,
    outcome: Option<IterationOutcome>,
    cache: StateCache,
    /// Counts hot-to-cold discharges, sampled at scheduling points.
    discharge_epoch: u64,
    was_hot: bool,
    final_digest: Option<u64>,
}

/// Result of one finished iteration.
pub(crate) struct IterationResult {
    pub(crate) outcome: IterationOutcome,
    pub(crate) trace: ScheduleTrace,
    pub(crate) steps: u64,
    pub(crate) distinct_states: usize,
    pub(crate) final_digest: Option<u64>,
}

pub(crate) struct Scheduler {
    state: Mutex<SchedState>,
    strategy: Arc<Mutex<Box<dyn Strategy>>>,
    completion: Gate,
    config: SchedulerConfig,
    monitors: Arc<MonitorRegistry>,
}

impl Scheduler {
    pub(crate) fn new(
        config: SchedulerConfig,
        strategy: Arc<Mutex<Box<dyn Strategy>>>,
        monitors: Arc<MonitorRegistry>,
    ) -> Self {
        let mut ops = BTreeMap::new();
        ops.insert(
            HARNESS_OP,
            OpEntry {
                gate: Arc::new(Gate::new()),
                phase: OpPhase::Ready,
                cell: None,
            },
        );
        Self {
            state: Mutex::new(SchedState {
                ops,
                current: HARNESS_OP,
                steps: 0,
                trace: ScheduleTrace::new(),
                done: false,
                outcome: None,
                cache: StateCache::new(),
                discharge_epoch: 0,
                was_hot: false,
                final_digest: None,
            }),
            strategy,
            completion: Gate::new(),
            config,
            monitors,
        }
    }

    /// Gate of the harness operation; the driver releases it to start the
    /// iteration, the harness thread acquires it.
    pub(crate) fn harness_gate(&self) -> Arc<Gate> {
        let state = self.state.lock().expect("mutex not poisoned");
        Arc::clone(&state.ops[&HARNESS_OP].gate)
    }

    /// Register a machine operation (phase `Fresh`); returns the gate its
    /// runner thread parks on.
    pub(crate) fn register_machine(&self, cell: &Arc<MachineCell>) -> Arc<Gate> {
        let gate = Arc::new(Gate::new());
        let mut state = self.state.lock().expect("mutex not poisoned");
        if state.done {
            // The iteration ended while this create was in flight; grant the
            // runner thread immediately so it observes done and exits.
            gate.release();
        }
        state.ops.insert(
            cell.id.value(),
            OpEntry {
                gate: Arc::clone(&gate),
                phase: OpPhase::Fresh,
                cell: Some(Arc::clone(cell)),
            },
        );
        trace!(op = cell.id.value(), "operation registered");
        gate
    }

    pub(crate) fn is_done(&self) -> bool {
        self.state.lock().expect("mutex not poisoned").done
    }

    /// Start the iteration by granting the harness.
    pub(crate) fn start(&self) {
        self.harness_gate().release();
    }

    /// Block the driver until the iteration finishes, then collect it.
    pub(crate) fn wait_done(&self) -> IterationResult {
        self.completion.acquire();
        let state = self.state.lock().expect("mutex not poisoned");
        IterationResult {
            outcome: state
                .outcome
                .clone()
                .unwrap_or(IterationOutcome::Completed),
            trace: state.trace.clone(),
            steps: state.steps,
            distinct_states: state.cache.len(),
            final_digest: state.final_digest,
        }
    }

    /// Scheduling point: the current operation is about to perform `kind`.
    /// Transfers control if the strategy chooses another operation.
    pub(crate) fn switch(&self, kind: OperationKind) -> Result<(), ActionAbort> {
        let my_gate = {
            let mut state = self.state.lock().expect("mutex not poisoned");
            if state.done {
                return Err(ActionAbort::canceled());
            }
            let my = state.current;
            self.pre_step_checks(&mut state)?;
            let chosen = self.choose(&mut state, my, kind)?;
            if chosen == my {
                return Ok(());
            }
            self.grant(&mut state, chosen);
            Arc::clone(&state.ops[&my].gate)
        };
        my_gate.acquire();
        if self.is_done() {
            return Err(ActionAbort::canceled());
        }
        Ok(())
    }

    /// The current operation stops being runnable (`Idle` or `Receiving`);
    /// park until it is granted again.
    pub(crate) fn park(&self, my: u64, phase: OpPhase) -> Result<(), ActionAbort> {
        let my_gate = {
            let mut state = self.state.lock().expect("mutex not poisoned");
            if state.done {
                return Err(ActionAbort::canceled());
            }
            debug_assert_eq!(state.current, my, "only the current operation parks");
            if let Some(entry) = state.ops.get_mut(&my) {
                entry.phase = phase;
            }
            self.pre_step_checks(&mut state)?;
            self.hand_off(&mut state, my)?;
            Arc::clone(&state.ops[&my].gate)
        };
        my_gate.acquire();
        if self.is_done() {
            return Err(ActionAbort::canceled());
        }
        Ok(())
    }

    /// The current operation is finished for good (halt, or harness done).
    /// Transfers the token and returns; the calling thread exits.
    pub(crate) fn retire(&self, my: u64) {
        let mut state = self.state.lock().expect("mutex not poisoned");
        if state.done {
            return;
        }
        if let Some(entry) = state.ops.get_mut(&my) {
            entry.phase = OpPhase::Done;
        }
        let _ = self.hand_off(&mut state, my);
    }

    /// Nondeterministic boolean choice, recorded in the trace.
    pub(crate) fn choose_bool(&self, max: u64) -> Result<bool, ActionAbort> {
        let mut state = self.state.lock().expect("mutex not poisoned");
        if state.done {
            return Err(ActionAbort::canceled());
        }
        let value = self
            .strategy
            .lock()
            .expect("mutex not poisoned")
            .next_boolean(max);
        let Some(value) = value else {
            return Err(self.finish_with_divergence(&mut state, "boolean choice"));
        };
        state.trace.push(Decision::Boolean { value });
        Ok(value)
    }

    /// Nondeterministic integer choice, recorded in the trace.
    pub(crate) fn choose_int(&self, max: u64) -> Result<u64, ActionAbort> {
        let mut state = self.state.lock().expect("mutex not poisoned");
        if state.done {
            return Err(ActionAbort::canceled());
        }
        let value = self
            .strategy
            .lock()
            .expect("mutex not poisoned")
            .next_integer(max);
        let Some(value) = value else {
            return Err(self.finish_with_divergence(&mut state, "integer choice"));
        };
        state.trace.push(Decision::Integer { value });
        Ok(value)
    }

    /// Route a detected bug; the first one ends the iteration.
    pub(crate) fn report_bug(&self, error: LockstepError) -> ActionAbort {
        let mut state = self.state.lock().expect("mutex not poisoned");
        if !state.done {
            self.finish(&mut state, IterationOutcome::Bug(error.clone()));
        }
        ActionAbort::bug(error)
    }

    /// The machine id of the currently scheduled operation, if it is one.
    pub(crate) fn current_machine(&self) -> Option<u64> {
        let state = self.state.lock().expect("mutex not poisoned");
        (state.current != HARNESS_OP).then_some(state.current)
    }

    // ── internals ──────────────────────────────────────────────────────────

    /// Step accounting, fingerprinting, and cycle detection. Runs before
    /// every strategy consultation.
    fn pre_step_checks(&self, state: &mut SchedState) -> Result<(), ActionAbort> {
        state.steps += 1;
        if state.steps > self.config.max_steps {
            debug!(steps = state.steps, "step bound reached");
            self.finish(state, IterationOutcome::MaxSteps);
            return Err(ActionAbort::canceled());
        }

        let hot = self.monitors.any_hot().is_some();
        if state.was_hot && !hot {
            state.discharge_epoch += 1;
        }
        state.was_hot = hot;

        if self.config.cache_program_state || self.config.cycle_detection {
            let fingerprint = self.fingerprint(state);
            let enabled_hash = {
                let mut hasher = DefaultHasher::new();
                self.enabled_ops(state).hash(&mut hasher);
                hasher.finish()
            };
            let verdict =
                state
                    .cache
                    .observe(fingerprint, enabled_hash, state.discharge_epoch, hot);
            if self.config.cycle_detection && verdict == CycleVerdict::HotCycle {
                if let Some((monitor, hot_state)) = self.monitors.any_hot() {
                    let error = LockstepError::LivenessViolation {
                        monitor,
                        state: hot_state.name(),
                        detail: "hot state persisted across a program-state cycle".into(),
                    };
                    self.finish(state, IterationOutcome::Bug(error));
                    return Err(ActionAbort::canceled());
                }
            }
        }
        Ok(())
    }

    /// Ask the strategy for the next operation and record the decision.
    fn choose(
        &self,
        state: &mut SchedState,
        current: u64,
        caller_kind: OperationKind,
    ) -> Result<u64, ActionAbort> {
        let enabled = self.enabled_ops(state);
        debug_assert!(
            enabled.contains(&current),
            "a scheduling caller is always enabled"
        );
        let chosen = self
            .strategy
            .lock()
            .expect("mutex not poisoned")
            .next_operation(&enabled, current);
        let Some(chosen) = chosen else {
            return Err(self.finish_with_divergence(state, "schedule choice"));
        };
        if !enabled.contains(&chosen) {
            let step = state.trace.len() as u64;
            let error = LockstepError::ReplayDivergence {
                step,
                detail: format!("operation {chosen} is not enabled"),
            };
            self.finish(state, IterationOutcome::Bug(error.clone()));
            return Err(ActionAbort::bug(error));
        }
        let point = self.point_of(state, chosen, current, caller_kind);
        state.trace.push(Decision::Schedule { op: chosen, point });
        trace!(op = chosen, ?point, "scheduled");
        Ok(chosen)
    }

    /// Transfer the token away from `my` after it became unrunnable.
    fn hand_off(&self, state: &mut SchedState, my: u64) -> Result<(), ActionAbort> {
        let enabled = self.enabled_ops(state);
        if enabled.is_empty() {
            self.end_of_schedule(state);
            return Err(ActionAbort::canceled());
        }
        let chosen = self
            .strategy
            .lock()
            .expect("mutex not poisoned")
            .next_operation(&enabled, my);
        let Some(chosen) = chosen else {
            return Err(self.finish_with_divergence(state, "schedule choice"));
        };
        if !enabled.contains(&chosen) {
            let step = state.trace.len() as u64;
            let error = LockstepError::ReplayDivergence {
                step,
                detail: format!("operation {chosen} is not enabled"),
            };
            self.finish(state, IterationOutcome::Bug(error.clone()));
            return Err(ActionAbort::bug(error));
        }
        let point = self.point_of(state, chosen, my, OperationKind::Stop);
        state.trace.push(Decision::Schedule { op: chosen, point });
        self.grant(state, chosen);
        Ok(())
    }

    fn grant(&self, state: &mut SchedState, chosen: u64) {
        state.current = chosen;
        if let Some(entry) = state.ops.get_mut(&chosen) {
            entry.phase = OpPhase::Ready;
            entry.gate.release();
        }
    }

    /// The operation kind a decision stands for: what the chosen operation
    /// is about to do.
    fn point_of(
        &self,
        state: &SchedState,
        chosen: u64,
        current: u64,
        caller_kind: OperationKind,
    ) -> OperationKind {
        if chosen == current {
            return caller_kind;
        }
        match state.ops.get(&chosen).map(|e| e.phase) {
            Some(OpPhase::Fresh) => OperationKind::Create,
            Some(OpPhase::Receiving) => OperationKind::Receive,
            _ => OperationKind::Send,
        }
    }

    /// Operations that can make progress, in ascending id order.
    fn enabled_ops(&self, state: &SchedState) -> Vec<u64> {
        state
            .ops
            .iter()
            .filter(|(_, entry)| match entry.phase {
                OpPhase::Fresh | OpPhase::Ready => true,
                OpPhase::Done => false,
                OpPhase::Idle => entry.cell.as_ref().is_some_and(|c| c.has_work()),
                OpPhase::Receiving => entry
                    .cell
                    .as_ref()
                    .is_some_and(|c| c.inbox.lock().expect("mutex not poisoned").has_delivered()),
            })
            .map(|(id, _)| *id)
            .collect()
    }

    /// No operation is enabled: deadlock or normal completion.
    fn end_of_schedule(&self, state: &mut SchedState) {
        if self.config.liveness_checking {
            if let Some((monitor, hot_state)) = self.monitors.any_hot() {
                self.finish(
                    state,
                    IterationOutcome::Bug(LockstepError::LivenessViolation {
                        monitor,
                        state: hot_state.name(),
                        detail: "no operation is enabled while the monitor is hot".into(),
                    }),
                );
                return;
            }
        }
        // Unreachable must-handle events are obligations that can never be
        // met.
        let mut violation = None;
        for entry in state.ops.values() {
            let Some(cell) = &entry.cell else { continue };
            if cell.is_halted() {
                continue;
            }
            if let Some(kind) = cell
                .inbox
                .lock()
                .expect("mutex not poisoned")
                .must_handle_residue()
            {
                violation = Some((cell.label(), kind.name()));
                break;
            }
        }
        if let Some((machine, kind)) = violation {
            self.finish(
                state,
                IterationOutcome::Bug(LockstepError::MustHandleViolation { machine, kind }),
            );
            return;
        }
        self.finish(state, IterationOutcome::Completed);
    }

    fn finish_with_divergence(&self, state: &mut SchedState, what: &str) -> ActionAbort {
        let step = state.trace.len() as u64;
        let error = LockstepError::ReplayDivergence {
            step,
            detail: format!("strategy could not supply a {what}"),
        };
        self.finish(state, IterationOutcome::Bug(error.clone()));
        ActionAbort::bug(error)
    }

    fn finish(&self, state: &mut SchedState, outcome: IterationOutcome) {
        if state.done {
            return;
        }
        state.done = true;
        state.final_digest = Some(self.fingerprint(state));
        info!(?outcome, steps = state.steps, "iteration finished");
        state.outcome = Some(outcome);
        // Release everything: parked threads observe the done flag and
        // unwind; the driver resumes on the completion gate.
        for entry in state.ops.values() {
            entry.gate.release();
        }
        self.completion.release();
    }

    /// Content hash of the current program state.
    fn fingerprint(&self, state: &SchedState) -> u64 {
        let mut hasher = DefaultHasher::new();
        for (id, entry) in &state.ops {
            id.hash(&mut hasher);
            std::mem::discriminant(&entry.phase).hash(&mut hasher);
            if let Some(cell) = &entry.cell {
                cell.state_digest(&mut hasher);
            }
        }
        self.monitors.state_digest(&mut hasher);
        hasher.finish()
    }
}
