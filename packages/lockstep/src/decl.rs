//! State and machine declarations.
//!
//! A machine type describes itself once through a [`MachineBuilder`]; the
//! result is an immutable [`MachineDecl`] table (states, handlers,
//! transitions, deferred and ignored sets) cached per type in a global
//! registry. Runtime dispatch is a constant-time map lookup; nothing is
//! discovered reflectively on hot paths.
//!
//! Declaration mistakes (no start state, duplicate handlers, transitions to
//! undeclared states) are programming errors and panic when the table is
//! first built, with the machine type and state named in the message.

use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;

use crate::error::ActionAbort;
use crate::event::{Event, EventKind};
use crate::machine::{ActionContext, Automaton};

/// An interned state name.
///
/// Declare states as constants, like event kinds:
///
/// ```ignore
/// const IDLE: StateName = StateName::new("Idle");
/// const ACTIVE: StateName = StateName::new("Active");
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateName(&'static str);

impl StateName {
    /// Declare a new state name.
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    /// The state's name.
    pub const fn name(&self) -> &'static str {
        self.0
    }
}

impl fmt::Debug for StateName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StateName({})", self.0)
    }
}

impl fmt::Display for StateName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Liveness temperature of a monitor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Temperature {
    /// A liveness obligation is open while the monitor sits here.
    Hot,
    /// The obligation has been discharged.
    Cold,
    /// No liveness meaning.
    #[default]
    Neutral,
}

/// Result type for machine actions.
pub type ActionResult = Result<(), ActionAbort>;

/// A user action as registered: typed over the machine struct.
pub type UserAction<M> = fn(&mut M, &mut ActionContext<'_>, &Event) -> ActionResult;

/// A type-erased action stored in a declaration table.
pub(crate) type Action =
    Arc<dyn Fn(&mut dyn Any, &mut ActionContext<'_>, &Event) -> ActionResult + Send + Sync>;

fn erase<M: Automaton>(f: UserAction<M>) -> Action {
    Arc::new(move |behavior, ctx, ev| {
        // By construction a cell only ever holds the behavior type its
        // declaration was built for.
        let machine = behavior
            .downcast_mut::<M>()
            .expect("machine behavior type mismatch");
        f(machine, ctx, ev)
    })
}

/// How a state reacts to an event kind.
pub(crate) enum HandlerKind {
    /// Run an action in place.
    Do(Action),
    /// Transition to another state, optionally running an action first.
    Goto {
        target: StateName,
        action: Option<Action>,
    },
    /// Push another state onto the stack.
    Push(StateName),
    /// Pop the current state off the stack.
    Pop,
}

/// Immutable per-(machine type, state) descriptor.
pub(crate) struct StateDecl {
    pub(crate) name: StateName,
    pub(crate) entry: Option<Action>,
    pub(crate) exit: Option<Action>,
    pub(crate) handlers: HashMap<EventKind, HandlerKind>,
    pub(crate) deferred: HashSet<EventKind>,
    pub(crate) ignored: HashSet<EventKind>,
    pub(crate) is_start: bool,
    pub(crate) temperature: Temperature,
}

impl StateDecl {
    fn new(name: StateName) -> Self {
        Self {
            name,
            entry: None,
            exit: None,
            handlers: HashMap::new(),
            deferred: HashSet::new(),
            ignored: HashSet::new(),
            is_start: false,
            temperature: Temperature::Neutral,
        }
    }

    pub(crate) fn is_deferred(&self, kind: EventKind) -> bool {
        self.deferred.contains(&kind)
    }

    pub(crate) fn is_ignored(&self, kind: EventKind) -> bool {
        self.ignored.contains(&kind)
    }

    pub(crate) fn handler(&self, kind: EventKind) -> Option<&HandlerKind> {
        self.handlers.get(&kind)
    }
}

/// Immutable per-machine-type declaration table.
pub(crate) struct MachineDecl {
    pub(crate) type_name: &'static str,
    pub(crate) type_id: TypeId,
    pub(crate) start: StateName,
    pub(crate) states: HashMap<StateName, StateDecl>,
    /// Union of event kinds handled in any state; used for monitor
    /// forwarding on send.
    pub(crate) handled_kinds: HashSet<EventKind>,
}

impl MachineDecl {
    pub(crate) fn state(&self, name: StateName) -> &StateDecl {
        self.states
            .get(&name)
            .expect("state name validated at declaration build time")
    }

    /// Short type name without module path, for reports.
    pub(crate) fn short_name(&self) -> &'static str {
        self.type_name.rsplit("::").next().unwrap_or(self.type_name)
    }

    /// True if any state on the given stack declares a `default` handler.
    pub(crate) fn has_default_handler(&self, stack: &[StateName]) -> bool {
        stack
            .iter()
            .any(|s| self.state(*s).handlers.contains_key(&crate::event::DEFAULT))
    }
}

/// Builder passed to [`Automaton::declare`].
pub struct MachineBuilder<M: Automaton> {
    type_name: &'static str,
    states: Vec<StateDecl>,
    _marker: std::marker::PhantomData<fn(M)>,
}

impl<M: Automaton> MachineBuilder<M> {
    pub(crate) fn new() -> Self {
        Self {
            type_name: std::any::type_name::<M>(),
            states: Vec::new(),
            _marker: std::marker::PhantomData,
        }
    }

    /// Declare a state, returning a handle for attaching handlers.
    ///
    /// # Panics
    ///
    /// Panics if the state was already declared.
    pub fn state(&mut self, name: StateName) -> StateHandle<'_, M> {
        if self.states.iter().any(|s| s.name == name) {
            panic!("{}: state {name} declared twice", self.type_name);
        }
        self.states.push(StateDecl::new(name));
        let index = self.states.len() - 1;
        StateHandle {
            builder: self,
            index,
        }
    }

    fn state_mut(&mut self, index: usize) -> &mut StateDecl {
        &mut self.states[index]
    }

    pub(crate) fn build(self) -> MachineDecl {
        let type_name = self.type_name;
        let mut start = None;
        for state in &self.states {
            if state.is_start {
                if start.is_some() {
                    panic!("{type_name}: more than one start state");
                }
                start = Some(state.name);
            }
        }
        let start = match start {
            Some(s) => s,
            None => panic!("{type_name}: no start state declared"),
        };

        let declared: HashSet<StateName> = self.states.iter().map(|s| s.name).collect();
        let mut handled_kinds = HashSet::new();
        for state in &self.states {
            for (kind, handler) in &state.handlers {
                handled_kinds.insert(*kind);
                let target = match handler {
                    HandlerKind::Goto { target, .. } | HandlerKind::Push(target) => Some(*target),
                    _ => None,
                };
                if let Some(target) = target {
                    if !declared.contains(&target) {
                        panic!(
                            "{type_name}: state {} transitions on '{kind}' to undeclared state {target}",
                            state.name
                        );
                    }
                }
            }
        }

        MachineDecl {
            type_name,
            type_id: TypeId::of::<M>(),
            start,
            states: self.states.into_iter().map(|s| (s.name, s)).collect(),
            handled_kinds,
        }
    }
}

/// Handle for declaring one state's behavior.
pub struct StateHandle<'a, M: Automaton> {
    builder: &'a mut MachineBuilder<M>,
    index: usize,
}

impl<'a, M: Automaton> StateHandle<'a, M> {
    fn decl(&mut self) -> &mut StateDecl {
        self.builder.state_mut(self.index)
    }

    fn type_name(&self) -> &'static str {
        self.builder.type_name
    }

    /// Mark this state as the machine's start state.
    pub fn start(mut self) -> Self {
        self.decl().is_start = true;
        self
    }

    /// Mark this monitor state hot (liveness obligation open).
    pub fn hot(mut self) -> Self {
        self.decl().temperature = Temperature::Hot;
        self
    }

    /// Mark this monitor state cold (liveness obligation discharged).
    pub fn cold(mut self) -> Self {
        self.decl().temperature = Temperature::Cold;
        self
    }

    /// Run `action` when the state is entered.
    pub fn on_entry(mut self, action: UserAction<M>) -> Self {
        let name = self.decl().name;
        if self.decl().entry.is_some() {
            panic!("{}: state {name} has two entry actions", self.type_name());
        }
        self.decl().entry = Some(erase(action));
        self
    }

    /// Run `action` when the state is exited.
    ///
    /// Exit actions may not call transition statements.
    pub fn on_exit(mut self, action: UserAction<M>) -> Self {
        let name = self.decl().name;
        if self.decl().exit.is_some() {
            panic!("{}: state {name} has two exit actions", self.type_name());
        }
        self.decl().exit = Some(erase(action));
        self
    }

    fn insert(&mut self, kind: EventKind, handler: HandlerKind) {
        let name = self.decl().name;
        if self.decl().handlers.insert(kind, handler).is_some() {
            panic!(
                "{}: state {name} has two handlers for '{kind}'",
                self.type_name()
            );
        }
    }

    /// Run a do-action when `kind` is dequeued in this state.
    pub fn on(mut self, kind: EventKind, action: UserAction<M>) -> Self {
        self.insert(kind, HandlerKind::Do(erase(action)));
        self
    }

    /// Transition to `target` when `kind` is dequeued in this state.
    pub fn on_goto(mut self, kind: EventKind, target: StateName) -> Self {
        self.insert(
            kind,
            HandlerKind::Goto {
                target,
                action: None,
            },
        );
        self
    }

    /// Run `action`, then transition to `target`, when `kind` is dequeued.
    ///
    /// The action itself may not call further transition statements.
    pub fn on_goto_with(mut self, kind: EventKind, target: StateName, action: UserAction<M>) -> Self {
        self.insert(
            kind,
            HandlerKind::Goto {
                target,
                action: Some(erase(action)),
            },
        );
        self
    }

    /// Push `target` onto the state stack when `kind` is dequeued.
    pub fn on_push(mut self, kind: EventKind, target: StateName) -> Self {
        self.insert(kind, HandlerKind::Push(target));
        self
    }

    /// Pop this state off the stack when `kind` is dequeued.
    pub fn on_pop(mut self, kind: EventKind) -> Self {
        self.insert(kind, HandlerKind::Pop);
        self
    }

    /// Leave `kind` in the inbox while this state is current.
    pub fn defer(mut self, kind: EventKind) -> Self {
        self.decl().deferred.insert(kind);
        self
    }

    /// Drop `kind` at dequeue while this state is current.
    pub fn ignore(mut self, kind: EventKind) -> Self {
        self.decl().ignored.insert(kind);
        self
    }
}

static REGISTRY: OnceLock<DashMap<TypeId, Arc<MachineDecl>>> = OnceLock::new();

/// The cached declaration table for machine type `M`, building it on first
/// use.
pub(crate) fn decl_of<M: Automaton>() -> Arc<MachineDecl> {
    let registry = REGISTRY.get_or_init(DashMap::new);
    if let Some(decl) = registry.get(&TypeId::of::<M>()) {
        return Arc::clone(&decl);
    }
    let mut builder = MachineBuilder::<M>::new();
    M::declare(&mut builder);
    let decl = Arc::new(builder.build());
    let entry = registry.entry(TypeId::of::<M>()).or_insert(decl);
    Arc::clone(entry.value())
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDLE: StateName = StateName::new("Idle");
    const BUSY: StateName = StateName::new("Busy");
    const GO: EventKind = EventKind::new("go");
    const WORK: EventKind = EventKind::new("work");
    const NOISE: EventKind = EventKind::new("noise");

    #[derive(Default)]
    struct Widget;

    impl Automaton for Widget {
        fn declare(b: &mut MachineBuilder<Self>) {
            b.state(IDLE)
                .start()
                .on_goto(GO, BUSY)
                .defer(WORK)
                .ignore(NOISE);
            b.state(BUSY).on(WORK, |_, _, _| Ok(())).on_pop(GO);
        }
    }

    #[test]
    fn test_decl_builds_and_caches() {
        let first = decl_of::<Widget>();
        let second = decl_of::<Widget>();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.start, IDLE);
        assert_eq!(first.states.len(), 2);
    }

    #[test]
    fn test_deferred_and_ignored_sets() {
        let decl = decl_of::<Widget>();
        let idle = decl.state(IDLE);
        assert!(idle.is_deferred(WORK));
        assert!(idle.is_ignored(NOISE));
        assert!(!idle.is_deferred(GO));
    }

    #[test]
    fn test_handled_kinds_union() {
        let decl = decl_of::<Widget>();
        assert!(decl.handled_kinds.contains(&GO));
        assert!(decl.handled_kinds.contains(&WORK));
        assert!(!decl.handled_kinds.contains(&NOISE));
    }

    #[test]
    #[should_panic(expected = "no start state")]
    fn test_missing_start_panics() {
        #[derive(Default)]
        struct NoStart;
        impl Automaton for NoStart {
            fn declare(b: &mut MachineBuilder<Self>) {
                b.state(IDLE);
            }
        }
        let mut b = MachineBuilder::<NoStart>::new();
        NoStart::declare(&mut b);
        b.build();
    }

    #[test]
    #[should_panic(expected = "undeclared state")]
    fn test_goto_to_undeclared_state_panics() {
        #[derive(Default)]
        struct Dangling;
        impl Automaton for Dangling {
            fn declare(b: &mut MachineBuilder<Self>) {
                b.state(IDLE).start().on_goto(GO, BUSY);
            }
        }
        let mut b = MachineBuilder::<Dangling>::new();
        Dangling::declare(&mut b);
        b.build();
    }

    #[test]
    #[should_panic(expected = "two handlers")]
    fn test_duplicate_handler_panics() {
        #[derive(Default)]
        struct Doubled;
        impl Automaton for Doubled {
            fn declare(b: &mut MachineBuilder<Self>) {
                b.state(IDLE)
                    .start()
                    .on(GO, |_, _, _| Ok(()))
                    .on_goto(GO, IDLE);
            }
        }
        let mut b = MachineBuilder::<Doubled>::new();
        Doubled::declare(&mut b);
        b.build();
    }
}
