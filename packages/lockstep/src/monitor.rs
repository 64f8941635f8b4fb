//! Specification monitors: passive observers stepped synchronously.
//!
//! A monitor is machine-shaped (states, entry/exit, do-actions, goto
//! transitions, raise) but has no inbox and no identity of its own. Events
//! reach it by direct invocation, inline with the runtime call that delivers
//! them: either an explicit `invoke_monitor`, or forwarding of a sent event
//! whose kind some monitor state declares.
//!
//! Monitor states carry a liveness temperature: `hot` while an obligation is
//! open, `cold` once discharged. The controlled scheduler reads the current
//! temperature for deadlock and cycle-based liveness checks.
//!
//! Monitors must be deterministic observers: push/pop, receive, send, and
//! random choices are rejected.

use std::any::{Any, TypeId};
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use crate::decl::{decl_of, HandlerKind, MachineDecl, StateName, Temperature};
use crate::error::{ActionAbort, LockstepError};
use crate::event::Event;
use crate::machine::{ActionContext, Automaton, Pending};
use crate::runtime::RuntimeLink;

struct MonitorState {
    current: StateName,
    behavior: Box<dyn Any + Send>,
}

/// One registered monitor instance.
pub(crate) struct MonitorEntry {
    decl: Arc<MachineDecl>,
    state: Mutex<MonitorState>,
}

impl MonitorEntry {
    fn new<M: Automaton + Default>() -> Self {
        let decl = decl_of::<M>();
        for state in decl.states.values() {
            for (kind, handler) in &state.handlers {
                if matches!(handler, HandlerKind::Push(_) | HandlerKind::Pop) {
                    panic!(
                        "{}: monitors may not declare push/pop transitions (state {}, event '{kind}')",
                        decl.type_name, state.name
                    );
                }
            }
        }
        let current = decl.start;
        Self {
            decl,
            state: Mutex::new(MonitorState {
                current,
                behavior: Box::new(M::default()),
            }),
        }
    }

    pub(crate) fn type_id(&self) -> TypeId {
        self.decl.type_id
    }

    pub(crate) fn type_name(&self) -> &'static str {
        self.decl.short_name()
    }

    /// The temperature of the monitor's current state.
    pub(crate) fn temperature(&self) -> Temperature {
        let state = self.state.lock().expect("mutex not poisoned");
        self.decl.state(state.current).temperature
    }

    /// The monitor's current state name.
    pub(crate) fn current_state(&self) -> StateName {
        self.state.lock().expect("mutex not poisoned").current
    }

    /// Hash input for fingerprinting.
    pub(crate) fn state_digest(&self, hasher: &mut impl std::hash::Hasher) {
        use std::hash::Hash;
        self.decl.type_name.hash(hasher);
        self.current_state().name().hash(hasher);
    }

    /// True if this monitor declares a handler for the event's kind in any
    /// state.
    fn watches(&self, event: &Event) -> bool {
        self.decl.handled_kinds.contains(&event.kind())
    }

    /// Run the entry action of the start state, once, at registration.
    fn activate(&self, link: &dyn RuntimeLink) -> Result<(), ActionAbort> {
        let start_event = Event::new(crate::event::START);
        let mut state = self.state.lock().expect("mutex not poisoned");
        let start = self.decl.start;
        let Some(pending) = self.run_state_action(link, &mut state, start, false, &start_event)?
        else {
            return Ok(());
        };
        match self.apply(link, &mut state, pending, &start_event)? {
            Some(raised) => self.step_locked(link, &mut state, raised),
            None => Ok(()),
        }
    }

    /// Step the monitor with one event.
    ///
    /// An event the current state does not handle is dropped (another state
    /// handles it, or the caller pre-filtered by `watches`).
    pub(crate) fn step(&self, link: &dyn RuntimeLink, event: &Event) -> Result<(), ActionAbort> {
        let mut state = self.state.lock().expect("mutex not poisoned");
        self.step_locked(link, &mut state, event.clone())
    }

    fn step_locked(
        &self,
        link: &dyn RuntimeLink,
        state: &mut MonitorState,
        event: Event,
    ) -> Result<(), ActionAbort> {
        let mut current_event = event;
        loop {
            let current = state.current;
            let Some(handler) = self.decl.state(current).handler(current_event.kind()) else {
                trace!(
                    monitor = self.type_name(),
                    state = %current,
                    kind = %current_event.kind(),
                    "monitor drops event its current state does not handle"
                );
                return Ok(());
            };
            trace!(
                monitor = self.type_name(),
                state = %current,
                kind = %current_event.kind(),
                "monitor step"
            );
            link.common()
                .coverage
                .record_transition(self.decl.type_name, current, current_event.kind());

            let pending = match handler {
                HandlerKind::Do(action) => {
                    let action = Arc::clone(action);
                    self.run_action(link, state, &action, &current_event, false)?
                }
                HandlerKind::Goto { target, action } => {
                    let target = *target;
                    if let Some(action) = action {
                        let action = Arc::clone(action);
                        self.run_action(link, state, &action, &current_event, false)?;
                    }
                    Some(Pending::Goto {
                        target,
                        carrier: None,
                    })
                }
                HandlerKind::Push(_) | HandlerKind::Pop => {
                    unreachable!("rejected at registration")
                }
            };

            let raised = match pending {
                Some(p) => self.apply(link, state, p, &current_event)?,
                None => None,
            };
            match raised {
                Some(ev) => current_event = ev,
                None => return Ok(()),
            }
        }
    }

    /// Apply a pending transition chain; returns a raised event, if any.
    fn apply(
        &self,
        link: &dyn RuntimeLink,
        state: &mut MonitorState,
        mut pending: Pending,
        trigger: &Event,
    ) -> Result<Option<Event>, ActionAbort> {
        loop {
            match pending {
                Pending::Raise(ev) => return Ok(Some(ev)),
                Pending::Goto { target, carrier } => {
                    let leaving = state.current;
                    self.run_state_action(link, state, leaving, true, trigger)?;
                    state.current = target;
                    debug!(monitor = self.type_name(), state = %target, "monitor transition");
                    link.common()
                        .coverage
                        .record_state(self.decl.type_name, target);
                    let entry_event = carrier.unwrap_or_else(|| trigger.clone());
                    match self.run_state_action(link, state, target, false, &entry_event)? {
                        Some(next) => pending = next,
                        None => return Ok(None),
                    }
                }
                Pending::Push(_) | Pending::Pop | Pending::Halt => {
                    return Err(ActionAbort::bug(LockstepError::AssertionFailure {
                        message: "monitors may not push, pop, or halt".into(),
                        machine: Some(self.type_name().to_string()),
                    }))
                }
            }
        }
    }

    /// Run a state's entry or exit action, if declared.
    fn run_state_action(
        &self,
        link: &dyn RuntimeLink,
        state: &mut MonitorState,
        name: StateName,
        is_exit: bool,
        event: &Event,
    ) -> Result<Option<Pending>, ActionAbort> {
        let decl_state = self.decl.state(name);
        let action = if is_exit {
            decl_state.exit.as_ref()
        } else {
            decl_state.entry.as_ref()
        };
        let Some(action) = action else {
            return Ok(None);
        };
        let action = Arc::clone(action);
        self.run_action(link, state, &action, event, is_exit)
    }

    fn run_action(
        &self,
        link: &dyn RuntimeLink,
        state: &mut MonitorState,
        action: &crate::decl::Action,
        event: &Event,
        is_exit: bool,
    ) -> Result<Option<Pending>, ActionAbort> {
        let mut ctx =
            ActionContext::for_monitor(link, self.decl.short_name(), state.current, is_exit);
        let behavior = state.behavior.as_mut();
        let action = action.as_ref();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            action(behavior, &mut ctx, event)
        }));
        match result {
            Ok(Ok(())) => Ok(ctx.take_pending()),
            Ok(Err(abort)) => Err(abort),
            Err(panic) => {
                let message = crate::machine::panic_message(panic);
                Err(ActionAbort::bug(LockstepError::AssertionFailure {
                    message: format!("monitor action panicked: {message}"),
                    machine: Some(self.type_name().to_string()),
                }))
            }
        }
    }
}

/// Registered monitors for one runtime instance.
#[derive(Default)]
pub(crate) struct MonitorRegistry {
    entries: Mutex<Vec<Arc<MonitorEntry>>>,
}

impl MonitorRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a monitor of type `M` and run its start entry action.
    /// Idempotent per type.
    pub(crate) fn register<M: Automaton + Default>(
        &self,
        link: &dyn RuntimeLink,
    ) -> Result<(), ActionAbort> {
        let entry = {
            let mut entries = self.entries.lock().expect("mutex not poisoned");
            if entries.iter().any(|e| e.type_id() == TypeId::of::<M>()) {
                return Ok(());
            }
            let entry = Arc::new(MonitorEntry::new::<M>());
            entries.push(Arc::clone(&entry));
            entry
        };
        debug!(monitor = entry.type_name(), "monitor registered");
        link.common()
            .coverage
            .record_state(entry.decl.type_name, entry.decl.start);
        entry.activate(link)
    }

    /// Step every monitor that watches the event's kind.
    pub(crate) fn forward(&self, link: &dyn RuntimeLink, event: &Event) -> Result<(), ActionAbort> {
        let watchers: Vec<Arc<MonitorEntry>> = {
            let entries = self.entries.lock().expect("mutex not poisoned");
            entries.iter().filter(|e| e.watches(event)).cloned().collect()
        };
        for entry in watchers {
            entry.step(link, event)?;
        }
        Ok(())
    }

    /// Step one monitor explicitly by type.
    pub(crate) fn invoke(
        &self,
        link: &dyn RuntimeLink,
        type_id: TypeId,
        event: &Event,
    ) -> Result<(), ActionAbort> {
        let entry: Option<Arc<MonitorEntry>> = {
            let entries = self.entries.lock().expect("mutex not poisoned");
            let found: Option<&Arc<MonitorEntry>> =
                entries.iter().find(|e| MonitorEntry::type_id(e) == type_id);
            found.cloned()
        };
        let Some(entry) = entry else {
            return Err(ActionAbort::bug(LockstepError::AssertionFailure {
                message: "invoke_monitor on an unregistered monitor type".into(),
                machine: None,
            }));
        };
        if !entry.watches(event) {
            return Err(ActionAbort::bug(LockstepError::UnhandledEvent {
                machine: entry.type_name().to_string(),
                kind: event.kind().name(),
                state: entry.current_state().name(),
            }));
        }
        entry.step(link, event)
    }

    /// The first monitor currently in a hot state, if any.
    pub(crate) fn any_hot(&self) -> Option<(&'static str, StateName)> {
        let entries = self.entries.lock().expect("mutex not poisoned");
        entries
            .iter()
            .find(|e| e.temperature() == Temperature::Hot)
            .map(|e| (e.type_name(), e.current_state()))
    }

    /// Hash input for fingerprinting: every monitor's current state.
    pub(crate) fn state_digest(&self, hasher: &mut impl std::hash::Hasher) {
        let entries = self.entries.lock().expect("mutex not poisoned");
        for entry in entries.iter() {
            entry.state_digest(hasher);
        }
    }

    /// Number of registered monitors.
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().expect("mutex not poisoned").len()
    }
}
