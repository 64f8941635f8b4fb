//! Production backend: parallel execution on host threads.
//!
//! Handler runs are dispatched fire-and-forget onto the ambient tokio
//! blocking pool (or a plain thread when no runtime is present). Per-machine
//! serialization comes from the inbox's handler-running flag: only the
//! sender that flips it schedules a runner, the runner loops until the inbox
//! drains, then flips it back under the inbox lock.
//!
//! The `*_and_execute` variants run the handler loop synchronously in the
//! caller, so completion means the machine drained to idle or blocked in a
//! `receive`.
//!
//! # Failure
//!
//! The first bug (assertion failure, transition misuse, action panic) marks
//! the runtime failed, invokes the registered `on_failure` hook, and cancels
//! machines at their next step; further sends are dropped.

use std::any::TypeId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, error};

use crate::coverage::ActivityCoverage;
use crate::error::{ActionAbort, LockstepError};
use crate::event::{Event, OperationGroup, SendOptions};
use crate::id::MachineId;
use crate::machine::{run_burst, Automaton, MachineCell};
use crate::runtime::{
    self, unregister, RuntimeCommon, RuntimeLink, SendOutcome,
};
use crate::trace::OperationKind;

type FailureHook = Box<dyn Fn(&LockstepError) + Send + Sync>;

pub(crate) struct ProductionCore {
    common: RuntimeCommon,
    rng: Mutex<fastrand::Rng>,
    failed: AtomicBool,
    on_failure: Mutex<Option<FailureHook>>,
    self_ref: Weak<ProductionCore>,
}

impl ProductionCore {
    fn upgrade(&self) -> Option<Arc<ProductionCore>> {
        self.self_ref.upgrade()
    }

    fn random_int(&self, max: u64) -> u64 {
        self.rng
            .lock()
            .expect("mutex not poisoned")
            .u64(0..max.max(1))
    }
}

impl RuntimeLink for ProductionCore {
    fn common(&self) -> &RuntimeCommon {
        &self.common
    }

    fn point(&self, _kind: OperationKind, _target: &MachineId) -> Result<(), ActionAbort> {
        // No scheduling points in production; a failed runtime cancels
        // machines at their next step.
        if self.failed.load(Ordering::Acquire) {
            return Err(ActionAbort::canceled());
        }
        Ok(())
    }

    fn spawn_runner(&self, cell: &Arc<MachineCell>) {
        let Some(core) = self.upgrade() else {
            return;
        };
        let cell = Arc::clone(cell);
        let task = move || {
            let _ = run_burst(&cell, core.as_ref());
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(task);
            }
            Err(_) => {
                std::thread::spawn(task);
            }
        }
    }

    fn wake_runner(&self, cell: &Arc<MachineCell>) {
        self.spawn_runner(cell);
    }

    fn wait_receive(&self, cell: &MachineCell) -> Result<Event, ActionAbort> {
        let mut inbox = cell.inbox.lock().expect("mutex not poisoned");
        loop {
            if let Some(ev) = inbox.take_delivered() {
                return Ok(ev);
            }
            if self.failed.load(Ordering::Acquire) {
                return Err(ActionAbort::canceled());
            }
            inbox = cell.resume.wait(inbox).expect("mutex not poisoned");
        }
    }

    fn choose_bool(&self, max: u64) -> Result<bool, ActionAbort> {
        Ok(self.random_int(max) == 0)
    }

    fn choose_int(&self, max: u64) -> Result<u64, ActionAbort> {
        Ok(self.random_int(max))
    }

    fn on_bug(&self, bug: LockstepError) -> ActionAbort {
        if !self.failed.swap(true, Ordering::AcqRel) {
            error!(error = %bug, "runtime failure");
            if let Some(hook) = self.on_failure.lock().expect("mutex not poisoned").as_ref() {
                hook(&bug);
            }
            // Wake blocked receives so their runners observe the failure.
            for entry in self.common.machines.iter() {
                entry.value().resume.notify_all();
            }
        }
        ActionAbort::bug(bug)
    }

    fn on_halt(&self, cell: &Arc<MachineCell>) {
        unregister(&self.common, cell);
    }

    fn assert_caller(&self, _id: &MachineId) -> Result<(), ActionAbort> {
        // Only the controlled backend can verify the calling operation.
        Ok(())
    }

    fn invoke_monitor_by_type(
        &self,
        type_id: TypeId,
        event: &Event,
    ) -> Result<(), ActionAbort> {
        self.common.monitors.invoke(self, type_id, event)
    }

    fn is_controlled(&self) -> bool {
        false
    }
}

/// Builder for a [`ProductionRuntime`].
pub struct ProductionRuntimeBuilder {
    seed: Option<u64>,
    must_handle_by_default: bool,
    on_failure: Option<FailureHook>,
}

impl ProductionRuntimeBuilder {
    /// Seed the runtime-scoped PRNG for reproducible `random` sequences.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Make every send must-handle unless its options say otherwise.
    pub fn must_handle_by_default(mut self, value: bool) -> Self {
        self.must_handle_by_default = value;
        self
    }

    /// Hook invoked once with the first failure that halts the runtime.
    pub fn on_failure(mut self, hook: impl Fn(&LockstepError) + Send + Sync + 'static) -> Self {
        self.on_failure = Some(Box::new(hook));
        self
    }

    /// Build the runtime.
    pub fn build(self) -> ProductionRuntime {
        let rng = match self.seed {
            Some(seed) => fastrand::Rng::with_seed(seed),
            None => fastrand::Rng::new(),
        };
        let core = Arc::new_cyclic(|weak| ProductionCore {
            common: RuntimeCommon::new(0, self.must_handle_by_default),
            rng: Mutex::new(rng),
            failed: AtomicBool::new(false),
            on_failure: Mutex::new(self.on_failure),
            self_ref: Weak::clone(weak),
        });
        debug!("production runtime started");
        ProductionRuntime { core }
    }
}

/// The production runtime: create machines, send events, observe failures.
///
/// Cloning is cheap and every clone drives the same runtime.
///
/// # Example
///
/// ```ignore
/// let rt = ProductionRuntime::new();
/// let server = rt.create_machine_and_execute::<Server>(None)?;
/// rt.send_and_execute(&server, Event::new(PING))?;
/// ```
#[derive(Clone)]
pub struct ProductionRuntime {
    core: Arc<ProductionCore>,
}

impl ProductionRuntime {
    /// A runtime with default configuration.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Start configuring a runtime.
    pub fn builder() -> ProductionRuntimeBuilder {
        ProductionRuntimeBuilder {
            seed: None,
            must_handle_by_default: false,
            on_failure: None,
        }
    }

    fn link(&self) -> &dyn RuntimeLink {
        self.core.as_ref()
    }

    /// Create a machine of type `M`, scheduling its activation
    /// asynchronously, and return its id immediately.
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

    /// Create a machine and run its handler loop in the caller until it
    /// drains to idle (or blocks in `receive`).
    pub fn create_machine_and_execute<M: Automaton + Default>(
        &self,
        init: Option<Event>,
    ) -> Result<MachineId, LockstepError> {
        let (id, cell) =
            runtime::create_machine_deferred::<M>(self.link(), init, None, None, None)
                .map_err(ActionAbort::into_error)?;
        run_burst(&cell, self.link());
        self.check_failed()?;
        Ok(id)
    }

    /// Issue a fresh unbound id for machine type `M`.
    pub fn create_machine_id<M: Automaton>(&self, friendly: Option<&str>) -> MachineId {
        runtime::create_machine_id::<M>(self.link(), friendly)
    }

    /// Bind an id from [`ProductionRuntime::create_machine_id`] to a new
    /// machine of type `M`.
    pub fn bind<M: Automaton + Default>(
        &self,
        id: MachineId,
        init: Option<Event>,
    ) -> Result<MachineId, LockstepError> {
        runtime::create_machine::<M>(self.link(), init, None, Some(id), None)
            .map_err(ActionAbort::into_error)
    }

    /// Enqueue an event to `target` with default options.
    pub fn send(&self, target: &MachineId, event: Event) -> Result<(), LockstepError> {
        self.send_with(target, event, SendOptions::default())
    }

    /// Enqueue an event to `target`.
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

    /// Enqueue an event and, if the target's handler was not running, drain
    /// it to quiescence in the caller. Returns `true` when the event was
    /// handled synchronously, `false` when it was only enqueued.
    pub fn send_and_execute(
        &self,
        target: &MachineId,
        event: Event,
    ) -> Result<bool, LockstepError> {
        let (outcome, cell) = runtime::route_event_deferred(
            self.link(),
            None,
            target,
            event,
            SendOptions::default(),
        )
        .map_err(ActionAbort::into_error)?;
        match (outcome, cell) {
            (SendOutcome::Scheduled, Some(cell)) => {
                run_burst(&cell, self.link());
                self.check_failed()?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Register a monitor of type `M` (idempotent per type).
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

    /// A pseudo-random boolean, true with probability `1/max`.
    pub fn random(&self, max: u64) -> bool {
        self.core.random_int(max) == 0
    }

    /// A pseudo-random integer in `0..max`.
    pub fn random_int(&self, max: u64) -> u64 {
        self.core.random_int(max)
    }

    /// Fail the runtime if `condition` is false.
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

    /// The current operation group of machine `id`, if it is live.
    pub fn operation_group(&self, id: &MachineId) -> Option<OperationGroup> {
        self.core
            .common
            .lookup(id)
            .map(|cell| *cell.group.lock().expect("mutex not poisoned"))
    }

    /// True once a failure has halted the runtime.
    pub fn has_failed(&self) -> bool {
        self.core.failed.load(Ordering::Acquire)
    }

    /// A snapshot of state/transition coverage recorded so far.
    pub fn coverage(&self) -> ActivityCoverage {
        self.core.common.coverage.snapshot()
    }

    fn check_failed(&self) -> Result<(), LockstepError> {
        if self.has_failed() {
            return Err(LockstepError::Canceled);
        }
        Ok(())
    }
}

impl Default for ProductionRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProductionRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProductionRuntime")
            .field("machines", &self.core.common.machines.len())
            .field("failed", &self.has_failed())
            .finish()
    }
}
