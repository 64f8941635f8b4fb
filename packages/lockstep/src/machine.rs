//! Machine core: the `Automaton` trait, the action context, and the handler
//! run loop.
//!
//! A machine is an actor with a state stack, an inbox, and per-(state, event)
//! handlers. The run loop dequeues one event at a time, dispatches it through
//! the declaration table, applies at most one transition statement per
//! action, and re-examines the inbox from the head after every state change
//! (previously deferred kinds may have become deliverable).
//!
//! # Transition discipline
//!
//! At most one of `goto`/`push`/`pop`/`raise`/`halt` may fire during a single
//! action; a second call is [`LockstepError::TooManyTransitions`]. No
//! transition statement may appear inside an on-exit handler.
//!
//! # Panic safety
//!
//! A panic inside an action is caught at the handler-run boundary and
//! reported as an [`LockstepError::AssertionFailure`] with the panic message;
//! it never unwinds across the runtime.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};

use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::decl::{Action, ActionResult, HandlerKind, MachineBuilder, MachineDecl, StateName};
use crate::error::{ActionAbort, LockstepError};
use crate::event::{Event, EventKind, OperationGroup, SendOptions, DEFAULT, HALT, START};
use crate::id::MachineId;
use crate::inbox::{DequeueOutcome, Inbox};
use crate::runtime::{self, RuntimeLink};
use crate::trace::OperationKind;

use std::any::Any;
use std::sync::Arc;

/// A communicating state machine type.
///
/// Implementors describe their states, handlers, and transitions once in
/// [`Automaton::declare`]; the runtime constructs instances with
/// `Default::default()` and delivers any creation payload through the start
/// state's entry action.
///
/// # Example
///
/// ```ignore
/// const ACTIVE: StateName = StateName::new("Active");
/// const PING: EventKind = EventKind::new("ping");
///
/// #[derive(Default)]
/// struct Server {
///     pings: u32,
/// }
///
/// impl Automaton for Server {
///     fn declare(b: &mut MachineBuilder<Self>) {
///         b.state(ACTIVE).start().on(PING, Server::on_ping);
///     }
/// }
///
/// impl Server {
///     fn on_ping(&mut self, ctx: &mut ActionContext<'_>, ev: &Event) -> ActionResult {
///         self.pings += 1;
///         let client = ev.origin().expect("ping carries its sender");
///         ctx.send(client, Event::new(PONG))
///     }
/// }
/// ```
pub trait Automaton: Send + 'static {
    /// Describe this machine type's states and handlers.
    fn declare(b: &mut MachineBuilder<Self>)
    where
        Self: Sized;
}

/// Runner-owned mutable state: the stack and the user's behavior struct.
pub(crate) struct ExecState {
    pub(crate) stack: SmallVec<[StateName; 4]>,
    pub(crate) behavior: Box<dyn Any + Send>,
}

/// Cross-cutting view of a machine's state, readable without touching the
/// runner-owned lock. Kept in sync by the runner at every state change.
pub(crate) struct Snapshot {
    pub(crate) stack: SmallVec<[StateName; 4]>,
    pub(crate) waiting: bool,
}

/// One live machine: identity, declaration table, inbox, and execution state.
pub(crate) struct MachineCell {
    pub(crate) id: MachineId,
    pub(crate) decl: Arc<MachineDecl>,
    pub(crate) inbox: Mutex<Inbox>,
    /// Wakes a production runner blocked in `receive`.
    pub(crate) resume: Condvar,
    /// Owned exclusively by the machine's runner during a step.
    pub(crate) exec: Mutex<ExecState>,
    pub(crate) snapshot: Mutex<Snapshot>,
    pub(crate) halted: AtomicBool,
    pub(crate) group: Mutex<OperationGroup>,
    /// Creation payload, consumed by the first activation.
    pub(crate) init: Mutex<Option<Event>>,
    /// Events handled so far; fairness input for strategies.
    pub(crate) steps: AtomicU64,
}

impl MachineCell {
    pub(crate) fn new(
        id: MachineId,
        decl: Arc<MachineDecl>,
        behavior: Box<dyn Any + Send>,
        init: Option<Event>,
        group: OperationGroup,
    ) -> Self {
        Self {
            id,
            decl,
            inbox: Mutex::new(Inbox::new()),
            resume: Condvar::new(),
            exec: Mutex::new(ExecState {
                stack: SmallVec::new(),
                behavior,
            }),
            snapshot: Mutex::new(Snapshot {
                stack: SmallVec::new(),
                waiting: false,
            }),
            halted: AtomicBool::new(false),
            group: Mutex::new(group),
            init: Mutex::new(init),
            steps: AtomicU64::new(0),
        }
    }

    pub(crate) fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// True if scheduling this machine would let it make progress: creation
    /// pending, a deliverable event (or default handler), or a delivered
    /// receive.
    pub(crate) fn has_work(&self) -> bool {
        if self.is_halted() {
            return false;
        }
        let snapshot = self.snapshot.lock().expect("mutex not poisoned");
        let inbox = self.inbox.lock().expect("mutex not poisoned");
        if snapshot.waiting {
            return inbox.has_delivered();
        }
        let Some(top) = snapshot.stack.last() else {
            // Not yet activated; the creation run is pending.
            return true;
        };
        inbox.has_deliverable(self.decl.state(*top)) || self.decl.has_default_handler(&snapshot.stack)
    }

    /// Display label for errors and logs.
    pub(crate) fn label(&self) -> String {
        self.id.to_string()
    }

    /// Hash input for fingerprinting: stack, deliverable inbox kinds, flags.
    pub(crate) fn state_digest(&self, hasher: &mut impl std::hash::Hasher) {
        use std::hash::Hash;
        let snapshot = self.snapshot.lock().expect("mutex not poisoned");
        let inbox = self.inbox.lock().expect("mutex not poisoned");
        for state in &snapshot.stack {
            state.name().hash(hasher);
        }
        snapshot.waiting.hash(hasher);
        self.is_halted().hash(hasher);
        inbox.kind_digest(hasher);
    }
}

/// Why an action is running; gates which context calls are legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Entry action or do-action: one transition statement allowed.
    Handler,
    /// On-exit action: no transition statements.
    Exit,
    /// Action attached to a declared goto: the goto is the transition.
    Transition,
}

/// The transition statement recorded by an action.
pub(crate) enum Pending {
    Goto {
        target: StateName,
        carrier: Option<Event>,
    },
    Push(StateName),
    Pop,
    Raise(Event),
    Halt,
}

/// Capabilities available to actions.
///
/// An `ActionContext` is passed to every handler; it is the machine's only
/// window onto the runtime. Transition statements record a pending change
/// applied after the action returns.
pub struct ActionContext<'a> {
    link: &'a dyn RuntimeLink,
    /// `None` inside a monitor step (monitors have no inbox or identity).
    cell: Option<&'a MachineCell>,
    monitor_name: Option<&'static str>,
    state: StateName,
    phase: Phase,
    transition_taken: bool,
    pending: Option<Pending>,
}

impl<'a> ActionContext<'a> {
    fn for_machine(
        link: &'a dyn RuntimeLink,
        cell: &'a MachineCell,
        state: StateName,
        phase: Phase,
    ) -> Self {
        Self {
            link,
            cell: Some(cell),
            monitor_name: None,
            state,
            phase,
            transition_taken: matches!(phase, Phase::Transition),
            pending: None,
        }
    }

    pub(crate) fn for_monitor(
        link: &'a dyn RuntimeLink,
        monitor_name: &'static str,
        state: StateName,
        phase_is_exit: bool,
    ) -> Self {
        Self {
            link,
            cell: None,
            monitor_name: Some(monitor_name),
            state,
            phase: if phase_is_exit { Phase::Exit } else { Phase::Handler },
            transition_taken: false,
            pending: None,
        }
    }

    fn label(&self) -> String {
        match (self.cell, self.monitor_name) {
            (Some(cell), _) => cell.label(),
            (None, Some(name)) => name.to_string(),
            (None, None) => "<unknown>".to_string(),
        }
    }

    fn machine_cell(&self) -> Result<&'a MachineCell, ActionAbort> {
        self.cell.ok_or_else(|| {
            ActionAbort::bug(LockstepError::AssertionFailure {
                message: "monitors may not send, receive, or create machines".into(),
                machine: Some(self.label()),
            })
        })
    }

    fn record(&mut self, pending: Pending) -> ActionResult {
        if matches!(self.phase, Phase::Exit) {
            return Err(ActionAbort::bug(LockstepError::TransitionInsideOnExit {
                machine: self.label(),
                state: self.state.name(),
            }));
        }
        if self.transition_taken {
            return Err(ActionAbort::bug(LockstepError::TooManyTransitions {
                machine: self.label(),
                state: self.state.name(),
            }));
        }
        self.transition_taken = true;
        self.pending = Some(pending);
        Ok(())
    }

    /// This machine's id.
    ///
    /// # Panics
    ///
    /// Panics inside a monitor step; monitors have no machine identity.
    pub fn id(&self) -> &MachineId {
        &self
            .cell
            .expect("monitors have no machine id")
            .id
    }

    /// The state this action was dispatched in.
    pub fn state(&self) -> StateName {
        self.state
    }

    /// The machine's current operation group.
    pub fn operation_group(&self) -> OperationGroup {
        match self.cell {
            Some(cell) => *cell.group.lock().expect("mutex not poisoned"),
            None => OperationGroup::NONE,
        }
    }

    /// Record a transition to `target` after this action returns.
    pub fn goto(&mut self, target: StateName) -> ActionResult {
        self.record(Pending::Goto {
            target,
            carrier: None,
        })
    }

    /// Record a transition to `target`, delivering `carrier` to the entry
    /// action of the target state.
    pub fn goto_with(&mut self, target: StateName, carrier: Event) -> ActionResult {
        self.record(Pending::Goto {
            target,
            carrier: Some(carrier),
        })
    }

    /// Record a push of `target` onto the state stack.
    pub fn push(&mut self, target: StateName) -> ActionResult {
        if self.cell.is_none() {
            return Err(ActionAbort::bug(LockstepError::AssertionFailure {
                message: "monitors may not push or pop states".into(),
                machine: Some(self.label()),
            }));
        }
        self.record(Pending::Push(target))
    }

    /// Record a pop of the current state.
    pub fn pop(&mut self) -> ActionResult {
        if self.cell.is_none() {
            return Err(ActionAbort::bug(LockstepError::AssertionFailure {
                message: "monitors may not push or pop states".into(),
                machine: Some(self.label()),
            }));
        }
        self.record(Pending::Pop)
    }

    /// Inject `event` to be handled before the next inbox dequeue.
    pub fn raise(&mut self, event: Event) -> ActionResult {
        self.record(Pending::Raise(event))
    }

    /// Halt this machine after the current action.
    pub fn halt(&mut self) -> ActionResult {
        self.record(Pending::Halt)
    }

    /// Send `event` to `target` with default options.
    pub fn send(&mut self, target: &MachineId, event: Event) -> ActionResult {
        self.send_with(target, event, SendOptions::default())
    }

    /// Send `event` to `target`.
    pub fn send_with(
        &mut self,
        target: &MachineId,
        event: Event,
        options: SendOptions,
    ) -> ActionResult {
        let cell = self.machine_cell()?;
        let group = *cell.group.lock().expect("mutex not poisoned");
        runtime::route_event(
            self.link,
            Some((&cell.id, self.state.name(), group)),
            target,
            event,
            options,
        )?;
        Ok(())
    }

    /// Create a machine of type `M`, inheriting this machine's operation
    /// group unless the init event carries its own.
    pub fn create_machine<M: Automaton + Default>(
        &mut self,
        init: Option<Event>,
    ) -> Result<MachineId, ActionAbort> {
        let cell = self.machine_cell()?;
        let group = *cell.group.lock().expect("mutex not poisoned");
        runtime::create_machine::<M>(self.link, init, Some(group), None, None)
    }

    /// Block until an event of one of `kinds` is available, and return it.
    ///
    /// The matching event is taken from the inbox if already queued
    /// (bypassing deferred/ignored filters); otherwise the machine suspends
    /// until a sender delivers one.
    pub fn receive(&mut self, kinds: &[EventKind]) -> Result<Event, ActionAbort> {
        let cell = self.machine_cell()?;
        {
            let mut inbox = cell.inbox.lock().expect("mutex not poisoned");
            if let Some(ev) = inbox.take_matching(kinds) {
                *cell.group.lock().expect("mutex not poisoned") = ev.group();
                return Ok(ev);
            }
            inbox.mark_waiting(kinds.iter().copied().collect());
        }
        cell.snapshot.lock().expect("mutex not poisoned").waiting = true;
        trace!(machine = %cell.id, ?kinds, "blocked in receive");
        let result = self.link.wait_receive(cell);
        cell.snapshot.lock().expect("mutex not poisoned").waiting = false;
        let ev = result?;
        *cell.group.lock().expect("mutex not poisoned") = ev.group();
        Ok(ev)
    }

    /// A controlled boolean choice: true with probability `1/max` under the
    /// production backend, strategy-driven under the controlled one.
    pub fn random(&mut self, max: u64) -> Result<bool, ActionAbort> {
        if self.cell.is_none() {
            return Err(ActionAbort::bug(LockstepError::AssertionFailure {
                message: "monitors must be deterministic; no random choices".into(),
                machine: Some(self.label()),
            }));
        }
        self.link.choose_bool(max)
    }

    /// A controlled integer choice in `0..max`.
    pub fn random_int(&mut self, max: u64) -> Result<u64, ActionAbort> {
        if self.cell.is_none() {
            return Err(ActionAbort::bug(LockstepError::AssertionFailure {
                message: "monitors must be deterministic; no random choices".into(),
                machine: Some(self.label()),
            }));
        }
        self.link.choose_int(max)
    }

    /// Fail the execution if `condition` is false.
    pub fn assert(&mut self, condition: bool, message: impl Into<String>) -> ActionResult {
        if condition {
            return Ok(());
        }
        Err(ActionAbort::bug(LockstepError::AssertionFailure {
            message: message.into(),
            machine: Some(self.label()),
        }))
    }

    /// Step the registered monitor of type `M` with `event`.
    pub fn invoke_monitor<M: Automaton>(&mut self, event: Event) -> ActionResult {
        self.link.invoke_monitor_by_type(std::any::TypeId::of::<M>(), &event)?;
        Ok(())
    }

    pub(crate) fn take_pending(&mut self) -> Option<Pending> {
        self.pending.take()
    }

    pub(crate) fn is_controlled(&self) -> bool {
        self.link.is_controlled()
    }
}

/// How a handler run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunOutcome {
    /// Inbox drained; the handler flag is back to not-running.
    Idle,
    /// The machine halted and was unregistered.
    Halted,
    /// The scheduler canceled the iteration.
    Canceled,
    /// A bug was detected and routed.
    Failed,
}

/// Result of settling a pending transition chain.
enum Flow {
    Settled,
    Raised(Event),
    Halted,
}

enum HandlerFlow {
    Continue,
    Halted,
}

/// Run one handler burst for `cell`: activate if needed, then dequeue and
/// handle events until the inbox drains, the machine halts, or the
/// scheduler cancels.
pub(crate) fn run_burst(cell: &Arc<MachineCell>, link: &dyn RuntimeLink) -> RunOutcome {
    let mut exec = cell.exec.lock().expect("mutex not poisoned");
    match drive(cell, link, &mut exec) {
        Ok(outcome) => outcome,
        Err(abort) => {
            if abort.is_canceled() {
                RunOutcome::Canceled
            } else {
                link.on_bug(abort.into_error());
                RunOutcome::Failed
            }
        }
    }
}

fn drive(
    cell: &Arc<MachineCell>,
    link: &dyn RuntimeLink,
    exec: &mut ExecState,
) -> Result<RunOutcome, ActionAbort> {
    let decl = Arc::clone(&cell.decl);

    if exec.stack.is_empty() {
        // First activation: enter the start state, delivering the creation
        // payload to its entry action.
        let init = cell.init.lock().expect("mutex not poisoned").take();
        if let Some(ev) = &init {
            *cell.group.lock().expect("mutex not poisoned") = ev.group();
        }
        let trigger = init.unwrap_or_else(|| Event::new(START));
        debug!(machine = %cell.id, start = %decl.start, "activating");
        exec.stack.push(decl.start);
        sync_snapshot(cell, exec);
        link.common()
            .coverage
            .record_state(decl.type_name, decl.start);
        let pending = run_entry(cell, link, exec, &decl, &trigger)?;
        match settle(cell, link, exec, &decl, pending, &trigger)? {
            Flow::Settled => {}
            Flow::Raised(ev) => match handle_event(cell, link, exec, &decl, ev)? {
                HandlerFlow::Continue => {}
                HandlerFlow::Halted => return Ok(RunOutcome::Halted),
            },
            Flow::Halted => return Ok(RunOutcome::Halted),
        }
    }

    loop {
        if cell.is_halted() {
            return Ok(RunOutcome::Halted);
        }
        link.point(OperationKind::Receive, &cell.id)?;

        let top = *exec.stack.last().expect("stack non-empty while live");
        let outcome = {
            let mut inbox = cell.inbox.lock().expect("mutex not poisoned");
            inbox.try_dequeue(decl.state(top))
        };
        let event = match outcome {
            Err(kind) => {
                return Err(ActionAbort::bug(LockstepError::MustHandleViolation {
                    machine: cell.label(),
                    kind: kind.name(),
                }))
            }
            Ok(DequeueOutcome::Event(ev)) => ev,
            Ok(DequeueOutcome::Empty) => {
                if decl.has_default_handler(&exec.stack) {
                    let mut ev = Event::new(DEFAULT);
                    ev.set_group(*cell.group.lock().expect("mutex not poisoned"));
                    ev
                } else {
                    let mut inbox = cell.inbox.lock().expect("mutex not poisoned");
                    if inbox.has_deliverable(decl.state(top)) {
                        // An event arrived between the scan and this lock.
                        continue;
                    }
                    inbox.set_not_running();
                    trace!(machine = %cell.id, "idle");
                    return Ok(RunOutcome::Idle);
                }
            }
        };

        // The dequeued event's group becomes the machine's current group.
        *cell.group.lock().expect("mutex not poisoned") = event.group();
        cell.steps.fetch_add(1, Ordering::Relaxed);

        match handle_event(cell, link, exec, &decl, event)? {
            HandlerFlow::Continue => {}
            HandlerFlow::Halted => return Ok(RunOutcome::Halted),
        }
    }
}

/// Dispatch one event (and any chain of raised events) through the handler
/// table, popping unhandled states as needed.
fn handle_event(
    cell: &Arc<MachineCell>,
    link: &dyn RuntimeLink,
    exec: &mut ExecState,
    decl: &Arc<MachineDecl>,
    event: Event,
) -> Result<HandlerFlow, ActionAbort> {
    let mut current = event;
    loop {
        // Find a handler, popping states that do not handle the event.
        let handler = loop {
            let top = *exec.stack.last().expect("stack non-empty while live");
            if decl.state(top).handler(current.kind()).is_some() {
                break top;
            }
            if current.kind() == HALT {
                // An unhandled halt event halts gracefully.
                halt(cell, link, exec)?;
                return Ok(HandlerFlow::Halted);
            }
            if exec.stack.len() == 1 {
                return Err(ActionAbort::bug(LockstepError::UnhandledEvent {
                    machine: cell.label(),
                    kind: current.kind().name(),
                    state: top.name(),
                }));
            }
            run_exit(cell, link, exec, decl, &current)?;
            exec.stack.pop();
            sync_snapshot(cell, exec);
        };

        trace!(machine = %cell.id, state = %handler, kind = %current.kind(), "dispatch");
        link.common()
            .coverage
            .record_transition(decl.type_name, handler, current.kind());

        let pending = match decl.state(handler).handler(current.kind()) {
            Some(HandlerKind::Do(action)) => {
                let action = Arc::clone(action);
                run_action(cell, link, exec, &action, &current, Phase::Handler)?
            }
            Some(HandlerKind::Goto { target, action }) => {
                if let Some(action) = action {
                    let action = Arc::clone(action);
                    // The declared goto is the action's one transition.
                    run_action(cell, link, exec, &action, &current, Phase::Transition)?;
                }
                Some(Pending::Goto {
                    target: *target,
                    carrier: None,
                })
            }
            Some(HandlerKind::Push(target)) => Some(Pending::Push(*target)),
            Some(HandlerKind::Pop) => Some(Pending::Pop),
            None => unreachable!("handler located above"),
        };

        match settle(cell, link, exec, decl, pending, &current)? {
            Flow::Settled => return Ok(HandlerFlow::Continue),
            Flow::Raised(ev) => {
                current = ev;
            }
            Flow::Halted => return Ok(HandlerFlow::Halted),
        }
    }
}

/// Apply a pending transition chain: state changes run exit/entry actions,
/// entry actions may themselves record further transitions.
fn settle(
    cell: &Arc<MachineCell>,
    link: &dyn RuntimeLink,
    exec: &mut ExecState,
    decl: &Arc<MachineDecl>,
    mut pending: Option<Pending>,
    trigger: &Event,
) -> Result<Flow, ActionAbort> {
    while let Some(p) = pending.take() {
        match p {
            Pending::Raise(ev) => return Ok(Flow::Raised(ev)),
            Pending::Halt => {
                halt(cell, link, exec)?;
                return Ok(Flow::Halted);
            }
            Pending::Pop => {
                if exec.stack.len() == 1 {
                    return Err(ActionAbort::bug(LockstepError::EmptyStateStack {
                        machine: cell.label(),
                    }));
                }
                run_exit(cell, link, exec, decl, trigger)?;
                exec.stack.pop();
                sync_snapshot(cell, exec);
            }
            Pending::Push(target) => {
                exec.stack.push(target);
                sync_snapshot(cell, exec);
                link.common().coverage.record_state(decl.type_name, target);
                pending = run_entry(cell, link, exec, decl, trigger)?;
            }
            Pending::Goto { target, carrier } => {
                run_exit(cell, link, exec, decl, trigger)?;
                exec.stack.pop();
                exec.stack.push(target);
                sync_snapshot(cell, exec);
                link.common().coverage.record_state(decl.type_name, target);
                let entry_event = carrier.unwrap_or_else(|| trigger.clone());
                pending = run_entry(cell, link, exec, decl, &entry_event)?;
            }
        }
    }
    Ok(Flow::Settled)
}

fn run_entry(
    cell: &Arc<MachineCell>,
    link: &dyn RuntimeLink,
    exec: &mut ExecState,
    decl: &Arc<MachineDecl>,
    trigger: &Event,
) -> Result<Option<Pending>, ActionAbort> {
    let top = *exec.stack.last().expect("stack non-empty while live");
    let Some(action) = decl.state(top).entry.as_ref() else {
        return Ok(None);
    };
    let action = Arc::clone(action);
    run_action(cell, link, exec, &action, trigger, Phase::Handler)
}

fn run_exit(
    cell: &Arc<MachineCell>,
    link: &dyn RuntimeLink,
    exec: &mut ExecState,
    decl: &Arc<MachineDecl>,
    trigger: &Event,
) -> Result<(), ActionAbort> {
    let top = *exec.stack.last().expect("stack non-empty while live");
    let Some(action) = decl.state(top).exit.as_ref() else {
        return Ok(());
    };
    let action = Arc::clone(action);
    run_action(cell, link, exec, &action, trigger, Phase::Exit)?;
    Ok(())
}

/// Run one action with panic capture, returning its recorded transition.
fn run_action(
    cell: &Arc<MachineCell>,
    link: &dyn RuntimeLink,
    exec: &mut ExecState,
    action: &Action,
    event: &Event,
    phase: Phase,
) -> Result<Option<Pending>, ActionAbort> {
    let state = *exec.stack.last().expect("stack non-empty while live");
    let mut ctx = ActionContext::for_machine(link, cell, state, phase);
    let behavior = exec.behavior.as_mut();
    let action = action.as_ref();

    // Machine state may be inconsistent after a panic, but the machine is
    // torn down with the failing run, so it is never observed again.
    let result = catch_unwind(AssertUnwindSafe(|| action(behavior, &mut ctx, event)));
    match result {
        Ok(Ok(())) => Ok(ctx.take_pending()),
        Ok(Err(abort)) => Err(abort),
        Err(panic) => {
            let message = panic_message(panic);
            Err(ActionAbort::bug(LockstepError::AssertionFailure {
                message: format!("action panicked: {message}"),
                machine: Some(cell.label()),
            }))
        }
    }
}

/// Extract a printable message from a panic payload.
pub(crate) fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Halt the machine: must-handle residue is a violation, then the runtime
/// unregisters the machine and emits the halt notification.
fn halt(
    cell: &Arc<MachineCell>,
    link: &dyn RuntimeLink,
    exec: &mut ExecState,
) -> Result<(), ActionAbort> {
    // Flag first: senders check the flag under the inbox lock, so nothing
    // can slip into the inbox between the residue check and unregistration.
    cell.halted.store(true, Ordering::Release);
    let residue = cell
        .inbox
        .lock()
        .expect("mutex not poisoned")
        .must_handle_residue();
    if let Some(kind) = residue {
        return Err(ActionAbort::bug(LockstepError::MustHandleViolation {
            machine: cell.label(),
            kind: kind.name(),
        }));
    }
    sync_snapshot(cell, exec);
    debug!(machine = %cell.id, "halted");
    link.on_halt(cell);
    Ok(())
}

fn sync_snapshot(cell: &MachineCell, exec: &ExecState) {
    let mut snapshot = cell.snapshot.lock().expect("mutex not poisoned");
    snapshot.stack.clear();
    snapshot.stack.extend_from_slice(&exec.stack);
}
