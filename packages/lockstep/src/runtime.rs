//! Shared runtime plumbing: the backend capability trait, the machine map,
//! and the routing paths both backends use.
//!
//! The two backends (production and controlled) implement [`RuntimeLink`];
//! the machine core and the routing functions here are written against that
//! trait only. A machine never holds a runtime reference; it carries its
//! [`MachineId`] and reaches the runtime through the link passed into its
//! handler run (arena + identifier, no cyclic ownership).

use std::any::TypeId;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info, trace, warn};

use crate::coverage::CoverageRegistry;
use crate::decl::decl_of;
use crate::error::{ActionAbort, LockstepError};
use crate::event::{Event, OperationGroup, SendOptions};
use crate::id::{IdSource, MachineId};
use crate::inbox::EnqueuePoll;
use crate::machine::{Automaton, MachineCell};
use crate::monitor::MonitorRegistry;
use crate::trace::OperationKind;

/// State shared by both backends for one runtime instance.
pub(crate) struct RuntimeCommon {
    /// Live machines, keyed by id value. Halted machines are removed.
    pub(crate) machines: DashMap<u64, Arc<MachineCell>>,
    /// Values of ids whose machines have halted; they cannot be reused.
    pub(crate) halted: DashMap<u64, ()>,
    pub(crate) ids: IdSource,
    pub(crate) generation: u64,
    pub(crate) monitors: Arc<MonitorRegistry>,
    pub(crate) coverage: CoverageRegistry,
    pub(crate) must_handle_by_default: bool,
}

impl RuntimeCommon {
    pub(crate) fn new(generation: u64, must_handle_by_default: bool) -> Self {
        Self {
            machines: DashMap::new(),
            halted: DashMap::new(),
            ids: IdSource::new(generation),
            generation,
            monitors: Arc::new(MonitorRegistry::new()),
            coverage: CoverageRegistry::new(),
            must_handle_by_default,
        }
    }

    /// The live cell for `id`, if it belongs to this runtime and has not
    /// halted.
    pub(crate) fn lookup(&self, id: &MachineId) -> Option<Arc<MachineCell>> {
        if id.generation() != self.generation {
            return None;
        }
        self.machines.get(&id.value()).map(|c| Arc::clone(&c))
    }
}

/// Backend capabilities the machine core runs against.
pub(crate) trait RuntimeLink: Send + Sync {
    fn common(&self) -> &RuntimeCommon;

    /// Scheduling point before an externally visible step. The production
    /// backend returns immediately; the controlled backend records the step,
    /// consults its strategy, and may park the caller.
    fn point(&self, kind: OperationKind, target: &MachineId) -> Result<(), ActionAbort>;

    /// Schedule the handler runner for a newly created machine.
    fn spawn_runner(&self, cell: &Arc<MachineCell>);

    /// A sender flipped the target's inbox to running; schedule a run.
    fn wake_runner(&self, cell: &Arc<MachineCell>);

    /// Block the calling runner until its pending `receive` is delivered.
    fn wait_receive(&self, cell: &MachineCell) -> Result<Event, ActionAbort>;

    /// Nondeterministic boolean: true with probability `1/max`.
    fn choose_bool(&self, max: u64) -> Result<bool, ActionAbort>;

    /// Nondeterministic integer in `0..max`.
    fn choose_int(&self, max: u64) -> Result<u64, ActionAbort>;

    /// Route a detected bug to the backend's report pipeline.
    fn on_bug(&self, error: LockstepError) -> ActionAbort;

    /// A machine halted: unregister it and emit the halt notification.
    fn on_halt(&self, cell: &Arc<MachineCell>);

    /// Controlled backend: fail unless the current operation is machine `id`.
    fn assert_caller(&self, id: &MachineId) -> Result<(), ActionAbort>;

    /// Step the registered monitor with the given type id.
    fn invoke_monitor_by_type(&self, type_id: TypeId, event: &Event)
        -> Result<(), ActionAbort>;

    /// True under the controlled backend; selects the timer model.
    fn is_controlled(&self) -> bool;
}

/// What happened to a routed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendOutcome {
    /// Enqueued behind an already-running handler.
    Enqueued,
    /// Enqueued and the handler flag flipped; a run was (or must be)
    /// scheduled.
    Scheduled,
    /// Delivered straight to a blocked `receive`.
    DeliveredToReceive,
    /// Target missing or halted; the event was dropped.
    Dropped,
}

/// Shared halt cleanup: drop the machine from the map, remember its id value
/// as dead, and emit the halt notification.
pub(crate) fn unregister(common: &RuntimeCommon, cell: &MachineCell) {
    common.machines.remove(&cell.id.value());
    common.halted.insert(cell.id.value(), ());
    info!(machine = %cell.id, "machine halted");
}

/// Route one event to its target inbox, applying operation-group
/// propagation, the must-handle default, the halted-target boundary, and
/// monitor forwarding.
pub(crate) fn route_event(
    link: &dyn RuntimeLink,
    sender: Option<(&MachineId, &'static str, OperationGroup)>,
    target: &MachineId,
    event: Event,
    options: SendOptions,
) -> Result<SendOutcome, ActionAbort> {
    let (outcome, cell) = route_event_deferred(link, sender, target, event, options)?;
    if outcome == SendOutcome::Scheduled {
        if let Some(cell) = &cell {
            link.wake_runner(cell);
        }
    }
    Ok(outcome)
}

/// Like [`route_event`] but leaves scheduling of a flipped handler to the
/// caller (the production `send_and_execute` path runs it synchronously).
pub(crate) fn route_event_deferred(
    link: &dyn RuntimeLink,
    sender: Option<(&MachineId, &'static str, OperationGroup)>,
    target: &MachineId,
    mut event: Event,
    options: SendOptions,
) -> Result<(SendOutcome, Option<Arc<MachineCell>>), ActionAbort> {
    let common = link.common();

    // Operation-group propagation: explicit option, else sender's current
    // group, else the event keeps whatever it carries (NONE by default).
    let group = options
        .group
        .or_else(|| sender.map(|(_, _, g)| g).filter(|g| g.is_some()))
        .unwrap_or(event.group());
    event.set_group(group);
    event.set_must_handle(options.must_handle.unwrap_or(common.must_handle_by_default));
    if let Some((sender_id, sender_state, _)) = sender {
        event.set_origin(sender_id.clone(), sender_state);
    }

    link.point(OperationKind::Send, target)?;

    let Some(cell) = common.lookup(target) else {
        return Ok((dropped(link, target, &event)?, None));
    };

    let for_monitors = event.clone();
    let outcome = {
        let mut inbox = cell.inbox.lock().expect("mutex not poisoned");
        if cell.is_halted() {
            drop(inbox);
            return Ok((dropped(link, target, &event)?, None));
        }
        if inbox.is_waiting() {
            match inbox.try_deliver(event) {
                None => {
                    cell.resume.notify_all();
                    SendOutcome::DeliveredToReceive
                }
                Some(bounced) => match inbox.enqueue(bounced) {
                    EnqueuePoll::HandlerNotRunning => SendOutcome::Scheduled,
                    EnqueuePoll::HandlerRunning => SendOutcome::Enqueued,
                },
            }
        } else {
            match inbox.enqueue(event) {
                EnqueuePoll::HandlerNotRunning => SendOutcome::Scheduled,
                EnqueuePoll::HandlerRunning => SendOutcome::Enqueued,
            }
        }
    };
    trace!(to = %target, kind = %for_monitors.kind(), ?outcome, "routed event");

    // Monitors watching this kind observe the send inline.
    common.monitors.forward(link, &for_monitors)?;

    Ok((outcome, Some(cell)))
}

fn dropped(
    link: &dyn RuntimeLink,
    target: &MachineId,
    event: &Event,
) -> Result<SendOutcome, ActionAbort> {
    if event.is_must_handle() {
        return Err(link.on_bug(LockstepError::MustHandleViolation {
            machine: target.to_string(),
            kind: event.kind().name(),
        }));
    }
    warn!(
        to = %target,
        target_halted = true,
        kind = %event.kind(),
        "dropping event to halted or unknown machine"
    );
    Ok(SendOutcome::Dropped)
}

/// Create a machine of type `M` and schedule its first handler run.
pub(crate) fn create_machine<M: Automaton + Default>(
    link: &dyn RuntimeLink,
    init: Option<Event>,
    group: Option<OperationGroup>,
    bound: Option<MachineId>,
    friendly: Option<&str>,
) -> Result<MachineId, ActionAbort> {
    let (id, cell) = create_machine_deferred::<M>(link, init, group, bound, friendly)?;
    link.spawn_runner(&cell);
    // The creation is observable before the created machine's first event:
    // the machine is registered and schedulable by the time the creator
    // passes this point.
    link.point(OperationKind::Create, &id)?;
    Ok(id)
}

/// Like [`create_machine`] but hands the cell back so the caller can run the
/// first handler burst itself (`create_machine_and_execute`).
pub(crate) fn create_machine_deferred<M: Automaton + Default>(
    link: &dyn RuntimeLink,
    mut init: Option<Event>,
    group: Option<OperationGroup>,
    bound: Option<MachineId>,
    friendly: Option<&str>,
) -> Result<(MachineId, Arc<MachineCell>), ActionAbort> {
    let common = link.common();
    let decl = decl_of::<M>();

    let id = match bound {
        Some(id) => {
            if id.kind() != decl.type_name {
                return Err(link.on_bug(LockstepError::MachineTypeMismatch {
                    id: id.to_string(),
                    expected: id.kind(),
                    actual: decl.type_name,
                }));
            }
            if id.generation() != common.generation
                || common.machines.contains_key(&id.value())
                || common.halted.contains_key(&id.value())
            {
                return Err(link.on_bug(LockstepError::DuplicateMachineId {
                    id: id.to_string(),
                }));
            }
            id
        }
        None => common
            .ids
            .issue(decl.type_name, friendly.map(Arc::from), None),
    };

    // Group precedence: explicit argument, else the init event's group.
    let final_group = group
        .filter(|g| g.is_some())
        .or_else(|| init.as_ref().map(|e| e.group()).filter(|g| g.is_some()))
        .unwrap_or(OperationGroup::NONE);
    if let Some(ev) = &mut init {
        ev.set_group(final_group);
    }

    let cell = Arc::new(MachineCell::new(
        id.clone(),
        decl,
        Box::new(M::default()),
        init,
        final_group,
    ));
    common.machines.insert(id.value(), Arc::clone(&cell));
    debug!(machine = %id, "machine created");
    Ok((id, cell))
}

/// Issue a fresh unbound id for machine type `M`.
pub(crate) fn create_machine_id<M: Automaton>(
    link: &dyn RuntimeLink,
    friendly: Option<&str>,
) -> MachineId {
    let decl = decl_of::<M>();
    link.common()
        .ids
        .issue(decl.type_name, friendly.map(Arc::from), None)
}
