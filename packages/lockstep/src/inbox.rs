//! Per-machine inbox.
//!
//! The inbox is a FIFO of events with the auxiliary state that makes the
//! dispatch discipline work: the handler-running flag (toggled under the
//! inbox's own lock, so the sender that flips it owns scheduling the run),
//! the receive predicates of a blocked `receive`, and the send-step cursor.
//!
//! Filtering rules at dequeue:
//! - a kind *deferred* by the current state is skipped and re-examined on
//!   the next scan;
//! - a kind *ignored* by the current state is dropped;
//! - a *must-handle* event is never deferred and never dropped; ignoring
//!   one is reported as a violation.

use std::collections::VecDeque;

use smallvec::SmallVec;
use tracing::trace;

use crate::decl::StateDecl;
use crate::event::{Event, EventKind};

/// Whether the machine's handler was running when an event was enqueued.
///
/// A sender that observes [`EnqueuePoll::HandlerNotRunning`] flipped the flag
/// and is obliged to schedule a handler run; the flip is atomic with the
/// enqueue because both happen under the inbox lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EnqueuePoll {
    /// The handler was idle; the caller must schedule a run.
    HandlerNotRunning,
    /// A handler run is already active (or scheduled).
    HandlerRunning,
}

/// Outcome of a dequeue scan.
pub(crate) enum DequeueOutcome {
    /// The first deliverable event, removed from the queue.
    Event(Event),
    /// Nothing deliverable under the current state's filters.
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchStatus {
    NotRunning,
    Running,
}

/// FIFO of events with deferred/ignored filtering and receive support.
pub(crate) struct Inbox {
    queue: VecDeque<Event>,
    status: DispatchStatus,
    /// Kinds a blocked `receive` is waiting for; `Some` means the machine is
    /// waiting-to-receive.
    awaited: Option<SmallVec<[EventKind; 2]>>,
    /// Event delivered directly to a blocked `receive`.
    delivered: Option<Event>,
    next_send_step: u64,
}

impl Inbox {
    /// A new inbox for a machine whose creation run is already scheduled.
    pub(crate) fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            // The creator schedules the first run, so senders that race with
            // creation must not schedule a second one.
            status: DispatchStatus::Running,
            awaited: None,
            delivered: None,
            next_send_step: 0,
        }
    }

    /// Append an event, stamping its send step. Returns the handler status
    /// observed at enqueue time; the status transition to running is atomic
    /// with the append.
    pub(crate) fn enqueue(&mut self, mut event: Event) -> EnqueuePoll {
        event.set_send_step(self.next_send_step);
        self.next_send_step += 1;
        trace!(kind = %event.kind(), step = event.send_step(), "enqueue");
        self.queue.push_back(event);
        match self.status {
            DispatchStatus::NotRunning => {
                self.status = DispatchStatus::Running;
                EnqueuePoll::HandlerNotRunning
            }
            DispatchStatus::Running => EnqueuePoll::HandlerRunning,
        }
    }

    /// Scan from the head for the first deliverable event under `state`'s
    /// filters, dropping ignored events along the way.
    ///
    /// Returns `Err(kind)` when a must-handle event of that kind is ignored
    /// by the current state; the caller reports the violation.
    pub(crate) fn try_dequeue(&mut self, state: &StateDecl) -> Result<DequeueOutcome, EventKind> {
        let mut index = 0;
        while index < self.queue.len() {
            let kind = self.queue[index].kind();
            let must_handle = self.queue[index].is_must_handle();
            if must_handle {
                if state.is_ignored(kind) {
                    return Err(kind);
                }
                // Must-handle overrides defer.
                let event = self.queue.remove(index).expect("index in bounds");
                return Ok(DequeueOutcome::Event(event));
            }
            if state.is_ignored(kind) {
                trace!(kind = %kind, state = %state.name, "dropping ignored event");
                self.queue.remove(index);
                continue;
            }
            if state.is_deferred(kind) {
                index += 1;
                continue;
            }
            let event = self.queue.remove(index).expect("index in bounds");
            return Ok(DequeueOutcome::Event(event));
        }
        Ok(DequeueOutcome::Empty)
    }

    /// True if a dequeue scan under `state` would yield an event.
    pub(crate) fn has_deliverable(&self, state: &StateDecl) -> bool {
        self.queue.iter().any(|ev| {
            ev.is_must_handle() || (!state.is_ignored(ev.kind()) && !state.is_deferred(ev.kind()))
        })
    }

    /// Record the kinds a blocked `receive` waits for.
    pub(crate) fn mark_waiting(&mut self, kinds: SmallVec<[EventKind; 2]>) {
        self.awaited = Some(kinds);
    }

    /// True while a `receive` is blocked on this inbox.
    pub(crate) fn is_waiting(&self) -> bool {
        self.awaited.is_some()
    }

    /// Sender-side delivery to a blocked `receive`. Returns the event back
    /// when the machine is not waiting or the kind does not match.
    pub(crate) fn try_deliver(&mut self, mut event: Event) -> Option<Event> {
        let matches = self
            .awaited
            .as_ref()
            .is_some_and(|kinds| kinds.contains(&event.kind()));
        if !matches {
            return Some(event);
        }
        event.set_send_step(self.next_send_step);
        self.next_send_step += 1;
        self.awaited = None;
        trace!(kind = %event.kind(), "delivered to blocked receive");
        self.delivered = Some(event);
        None
    }

    /// Take the event delivered to a blocked `receive`, if any.
    pub(crate) fn take_delivered(&mut self) -> Option<Event> {
        self.delivered.take()
    }

    /// True once a blocked `receive` has its event.
    pub(crate) fn has_delivered(&self) -> bool {
        self.delivered.is_some()
    }

    /// Receive fast path: remove and return the first queued event of one of
    /// the awaited kinds, bypassing deferred/ignored filters.
    pub(crate) fn take_matching(&mut self, kinds: &[EventKind]) -> Option<Event> {
        let index = self
            .queue
            .iter()
            .position(|ev| kinds.contains(&ev.kind()))?;
        self.queue.remove(index)
    }

    /// First must-handle event still owed a handler, counting the delivered
    /// slot. Used by the halt path.
    pub(crate) fn must_handle_residue(&self) -> Option<EventKind> {
        self.queue
            .iter()
            .chain(self.delivered.iter())
            .find(|ev| ev.is_must_handle())
            .map(|ev| ev.kind())
    }

    /// Flip the handler flag back to not-running. Only the runner calls this,
    /// under the inbox lock, after confirming nothing is deliverable.
    pub(crate) fn set_not_running(&mut self) {
        self.status = DispatchStatus::NotRunning;
    }

    /// Hash the queued event kinds in order. Send steps are excluded so a
    /// program that revisits the same state produces the same digest.
    pub(crate) fn kind_digest(&self, hasher: &mut impl std::hash::Hasher) {
        use std::hash::Hash;
        for ev in &self.queue {
            ev.kind().name().hash(hasher);
            ev.is_must_handle().hash(hasher);
        }
        if let Some(ev) = &self.delivered {
            "delivered".hash(hasher);
            ev.kind().name().hash(hasher);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decl::{decl_of, MachineBuilder, StateName};
    use crate::machine::Automaton;
    use smallvec::smallvec;

    const FILTERING: StateName = StateName::new("Filtering");
    const OPEN: StateName = StateName::new("Open");
    const X: EventKind = EventKind::new("x");
    const Y: EventKind = EventKind::new("y");
    const NOISE: EventKind = EventKind::new("noise");

    #[derive(Default)]
    struct Filter;

    impl Automaton for Filter {
        fn declare(b: &mut MachineBuilder<Self>) {
            b.state(FILTERING)
                .start()
                .defer(X)
                .ignore(NOISE)
                .on(Y, |_, _, _| Ok(()));
            b.state(OPEN)
                .on(X, |_, _, _| Ok(()))
                .on(Y, |_, _, _| Ok(()));
        }
    }

    fn event(kind: EventKind) -> Event {
        Event::new(kind)
    }

    #[test]
    fn test_enqueue_flips_running_flag_once() {
        let mut inbox = Inbox::new();
        // Fresh inboxes are running (creation pending).
        assert_eq!(inbox.enqueue(event(Y)), EnqueuePoll::HandlerRunning);
        inbox.set_not_running();
        assert_eq!(inbox.enqueue(event(Y)), EnqueuePoll::HandlerNotRunning);
        assert_eq!(inbox.enqueue(event(Y)), EnqueuePoll::HandlerRunning);
    }

    #[test]
    fn test_send_steps_are_sequential() {
        let mut inbox = Inbox::new();
        inbox.enqueue(event(Y));
        inbox.enqueue(event(Y));
        let decl = decl_of::<Filter>();
        let state = decl.state(FILTERING);
        let first = match inbox.try_dequeue(state).expect("no violation") {
            DequeueOutcome::Event(ev) => ev,
            DequeueOutcome::Empty => panic!("expected event"),
        };
        let second = match inbox.try_dequeue(state).expect("no violation") {
            DequeueOutcome::Event(ev) => ev,
            DequeueOutcome::Empty => panic!("expected event"),
        };
        assert_eq!(first.send_step(), 0);
        assert_eq!(second.send_step(), 1);
    }

    #[test]
    fn test_deferred_event_is_skipped_not_dropped() {
        let mut inbox = Inbox::new();
        inbox.enqueue(event(X));
        inbox.enqueue(event(Y));

        let decl = decl_of::<Filter>();
        let filtering = decl.state(FILTERING);
        match inbox.try_dequeue(filtering).expect("no violation") {
            DequeueOutcome::Event(ev) => assert_eq!(ev.kind(), Y),
            DequeueOutcome::Empty => panic!("expected y"),
        }
        // X is still queued and becomes deliverable in a state that handles it.
        let open = decl.state(OPEN);
        match inbox.try_dequeue(open).expect("no violation") {
            DequeueOutcome::Event(ev) => assert_eq!(ev.kind(), X),
            DequeueOutcome::Empty => panic!("expected x"),
        }
        assert_eq!(inbox.len(), 0);
    }

    #[test]
    fn test_ignored_event_is_dropped_at_dequeue() {
        let mut inbox = Inbox::new();
        inbox.enqueue(event(NOISE));
        inbox.enqueue(event(Y));

        let decl = decl_of::<Filter>();
        let state = decl.state(FILTERING);
        match inbox.try_dequeue(state).expect("no violation") {
            DequeueOutcome::Event(ev) => assert_eq!(ev.kind(), Y),
            DequeueOutcome::Empty => panic!("expected y"),
        }
        assert_eq!(inbox.len(), 0, "noise should be gone");
    }

    #[test]
    fn test_must_handle_overrides_defer() {
        let mut inbox = Inbox::new();
        let mut critical = event(X);
        critical.set_must_handle(true);
        inbox.enqueue(critical);

        let decl = decl_of::<Filter>();
        // X is deferred in Filtering, but must-handle wins.
        match inbox.try_dequeue(decl.state(FILTERING)).expect("no violation") {
            DequeueOutcome::Event(ev) => {
                assert_eq!(ev.kind(), X);
                assert!(ev.is_must_handle());
            }
            DequeueOutcome::Empty => panic!("must-handle event should deliver"),
        }
    }

    #[test]
    fn test_ignoring_must_handle_is_a_violation() {
        let mut inbox = Inbox::new();
        let mut critical = event(NOISE);
        critical.set_must_handle(true);
        inbox.enqueue(critical);

        let decl = decl_of::<Filter>();
        let result = inbox.try_dequeue(decl.state(FILTERING));
        assert_eq!(result.err(), Some(NOISE));
    }

    #[test]
    fn test_has_deliverable_respects_filters() {
        let mut inbox = Inbox::new();
        let decl = decl_of::<Filter>();
        assert!(!inbox.has_deliverable(decl.state(FILTERING)));

        inbox.enqueue(event(X));
        assert!(!inbox.has_deliverable(decl.state(FILTERING)));
        assert!(inbox.has_deliverable(decl.state(OPEN)));

        inbox.enqueue(event(Y));
        assert!(inbox.has_deliverable(decl.state(FILTERING)));
    }

    #[test]
    fn test_receive_delivery_path() {
        let mut inbox = Inbox::new();
        inbox.mark_waiting(smallvec![Y]);
        assert!(inbox.is_waiting());

        // Non-matching kinds bounce back to the normal enqueue path.
        let bounced = inbox.try_deliver(event(X));
        assert!(bounced.is_some());
        assert!(inbox.is_waiting());

        // Matching kind lands in the delivered slot and clears waiting.
        assert!(inbox.try_deliver(event(Y)).is_none());
        assert!(!inbox.is_waiting());
        assert!(inbox.has_delivered());
        let delivered = inbox.take_delivered().expect("delivered");
        assert_eq!(delivered.kind(), Y);
    }

    #[test]
    fn test_take_matching_bypasses_filters() {
        let mut inbox = Inbox::new();
        inbox.enqueue(event(X));
        inbox.enqueue(event(Y));
        let taken = inbox.take_matching(&[X]).expect("x queued");
        assert_eq!(taken.kind(), X);
        assert_eq!(inbox.len(), 1);
    }

    #[test]
    fn test_must_handle_residue() {
        let mut inbox = Inbox::new();
        inbox.enqueue(event(Y));
        assert_eq!(inbox.must_handle_residue(), None);

        let mut critical = event(X);
        critical.set_must_handle(true);
        inbox.enqueue(critical);
        assert_eq!(inbox.must_handle_residue(), Some(X));
    }
}
