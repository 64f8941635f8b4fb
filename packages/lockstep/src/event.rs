//! Event values and operation groups.
//!
//! An [`Event`] is the unit of communication between machines: an opaque
//! payload behind a kind tag, plus the metadata the runtime needs to route,
//! order, and account for it. Kinds are interned static names so equality is
//! a pointer-wide comparison and the same constant can be shared by sender
//! and receiver.
//!
//! # Operation groups
//!
//! Events and machines carry an [`OperationGroup`] to track causally related
//! work across the system. The group chosen at send time is, in priority
//! order: the explicit [`SendOptions`] value, the sender's current group,
//! or [`OperationGroup::NONE`]. On dequeue the event's group becomes the
//! target machine's current group.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::id::MachineId;

/// An interned event kind tag.
///
/// Kinds compare by name; declare them as constants shared between the
/// sending and receiving machine declarations:
///
/// ```ignore
/// const PING: EventKind = EventKind::new("ping");
/// const PONG: EventKind = EventKind::new("pong");
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventKind(&'static str);

impl EventKind {
    /// Declare a new event kind with the given name.
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    /// The kind's name.
    pub const fn name(&self) -> &'static str {
        self.0
    }
}

impl fmt::Debug for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventKind({})", self.0)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Reserved kind: halts the receiving machine when dequeued unhandled.
pub const HALT: EventKind = EventKind::new("halt");

/// Reserved kind: synthesized when a machine's inbox is empty but some state
/// on its stack declares a `default` handler.
pub const DEFAULT: EventKind = EventKind::new("default");

/// Reserved kind: synthesized trigger for a machine's first entry action
/// when creation supplied no init event.
pub const START: EventKind = EventKind::new("start");

/// Identifier propagated across causally related sends.
///
/// A nil-uuid sentinel ([`OperationGroup::NONE`]) marks ungrouped work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationGroup(Uuid);

impl OperationGroup {
    /// Sentinel value for ungrouped events.
    pub const NONE: Self = Self(Uuid::nil());

    /// Create a fresh random operation group.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// True for the `NONE` sentinel.
    pub fn is_none(&self) -> bool {
        self.0.is_nil()
    }

    /// True for a real group id.
    pub fn is_some(&self) -> bool {
        !self.is_none()
    }

    /// The inner UUID value.
    pub fn into_inner(self) -> Uuid {
        self.0
    }
}

impl Default for OperationGroup {
    fn default() -> Self {
        Self::NONE
    }
}

impl From<Uuid> for OperationGroup {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for OperationGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "NONE")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Options for a single send.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    /// Operation group to stamp on the event. `None` inherits the sender's
    /// current group.
    pub group: Option<OperationGroup>,
    /// Whether the event must be handled. `None` uses the runtime default.
    pub must_handle: Option<bool>,
}

impl SendOptions {
    /// Options with an explicit operation group.
    pub fn grouped(group: OperationGroup) -> Self {
        Self {
            group: Some(group),
            must_handle: None,
        }
    }

    /// Options marking the event as must-handle.
    pub fn must_handle() -> Self {
        Self {
            group: None,
            must_handle: Some(true),
        }
    }
}

/// A typed value exchanged between machines.
///
/// The payload is type-erased (the receiving handler downcasts with
/// [`Event::payload`]); the kind tag is what handlers dispatch on. Metadata
/// fields are stamped by the runtime at send and enqueue time.
#[derive(Clone)]
pub struct Event {
    kind: EventKind,
    payload: Option<Arc<dyn Any + Send + Sync>>,
    group: OperationGroup,
    origin: Option<MachineId>,
    origin_state: Option<&'static str>,
    send_step: u64,
    must_handle: bool,
}

impl Event {
    /// Create a payload-less event of the given kind.
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            payload: None,
            group: OperationGroup::NONE,
            origin: None,
            origin_state: None,
            send_step: 0,
            must_handle: false,
        }
    }

    /// Create an event carrying a payload.
    pub fn with_payload<P: Any + Send + Sync>(kind: EventKind, payload: P) -> Self {
        Self {
            payload: Some(Arc::new(payload)),
            ..Self::new(kind)
        }
    }

    /// The event's kind tag.
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Downcast the payload to a concrete type.
    pub fn payload<P: Any>(&self) -> Option<&P> {
        self.payload.as_deref().and_then(|p| p.downcast_ref())
    }

    /// The operation group riding on this event.
    pub fn group(&self) -> OperationGroup {
        self.group
    }

    /// The sending machine, if the event was sent from inside one.
    pub fn origin(&self) -> Option<&MachineId> {
        self.origin.as_ref()
    }

    /// The sender's state at send time.
    pub fn origin_state(&self) -> Option<&'static str> {
        self.origin_state
    }

    /// The per-inbox send step assigned at enqueue.
    pub fn send_step(&self) -> u64 {
        self.send_step
    }

    /// True if dropping this event, or halting with it enqueued, is a bug.
    pub fn is_must_handle(&self) -> bool {
        self.must_handle
    }

    pub(crate) fn set_group(&mut self, group: OperationGroup) {
        self.group = group;
    }

    pub(crate) fn set_origin(&mut self, id: MachineId, state: &'static str) {
        self.origin = Some(id);
        self.origin_state = Some(state);
    }

    pub(crate) fn set_send_step(&mut self, step: u64) {
        self.send_step = step;
    }

    pub(crate) fn set_must_handle(&mut self, must_handle: bool) {
        self.must_handle = must_handle;
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("kind", &self.kind.name())
            .field("group", &self.group)
            .field("send_step", &self.send_step)
            .field("must_handle", &self.must_handle)
            .finish_non_exhaustive()
    }
}
