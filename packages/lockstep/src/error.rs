//! Structured error types and bug reports.
//!
//! `LockstepError` provides pattern-matchable errors for every failure mode
//! the runtime can detect. Under the controlled backend all of them (except
//! [`LockstepError::Canceled`]) route through the scheduler's bug-report
//! pipeline and surface as a [`BugReport`]; under the production backend they
//! surface through the runtime's `on_failure` hook and halt the runtime.
//!
//! # The Error Boundary Rule
//!
//! > **Errors never cross machine boundaries as events.**
//!
//! An action that fails aborts its handler run; the failure goes to the
//! runtime, never into another machine's inbox.

use std::fmt;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::trace::ScheduleTrace;

/// Structured error type for runtime operations.
///
/// Each variant includes enough context to identify the responsible machine
/// and, where relevant, the state and event kind involved.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LockstepError {
    /// A user assertion or internal invariant failed.
    #[error("assertion failed: {message}")]
    AssertionFailure {
        /// The failing assertion text.
        message: String,
        /// The responsible machine, if the failure happened inside one.
        machine: Option<String>,
    },

    /// More than one transition statement fired during a single action.
    #[error("{machine} called a second transition statement in state {state}")]
    TooManyTransitions {
        /// The offending machine.
        machine: String,
        /// The state whose action misbehaved.
        state: &'static str,
    },

    /// A transition statement was called from inside an on-exit handler.
    #[error("{machine} called a transition statement inside on-exit of state {state}")]
    TransitionInsideOnExit {
        /// The offending machine.
        machine: String,
        /// The state being exited.
        state: &'static str,
    },

    /// A pop would have emptied the state stack.
    #[error("{machine} popped from a one-deep state stack")]
    EmptyStateStack {
        /// The offending machine.
        machine: String,
    },

    /// A machine id was bound twice, or reused after its machine halted.
    #[error("machine id {id} is already bound or belonged to a halted machine")]
    DuplicateMachineId {
        /// The rejected id.
        id: String,
    },

    /// A machine id created for one type was bound to another.
    #[error("machine id {id} was created for type {expected}, not {actual}")]
    MachineTypeMismatch {
        /// The rejected id.
        id: String,
        /// The type the id was created for.
        expected: &'static str,
        /// The type it was bound to.
        actual: &'static str,
    },

    /// A dequeued event found no handler anywhere on the state stack.
    #[error("{machine} has no handler for event '{kind}' (stack exhausted from state {state})")]
    UnhandledEvent {
        /// The machine that dequeued the event.
        machine: String,
        /// The unhandled event kind.
        kind: &'static str,
        /// The state that first failed to handle it.
        state: &'static str,
    },

    /// A must-handle event was dropped, ignored, or left enqueued at halt.
    #[error("{machine} violated must-handle for event '{kind}'")]
    MustHandleViolation {
        /// The machine that owed the event a handler.
        machine: String,
        /// The must-handle event kind.
        kind: &'static str,
    },

    /// A monitor stayed hot across a detected cycle or a deadlock.
    #[error("liveness violation: monitor {monitor} is hot in state {state}: {detail}")]
    LivenessViolation {
        /// The hot monitor's type name.
        monitor: &'static str,
        /// The hot state.
        state: &'static str,
        /// How the violation was detected (cycle or deadlock).
        detail: String,
    },

    /// A replayed schedule diverged from the recorded trace.
    ///
    /// This indicates a nondeterministic test harness, which is fatal: the
    /// whole point of a trace is that it reproduces the execution exactly.
    #[error("schedule replay diverged at step {step}: {detail}")]
    ReplayDivergence {
        /// The trace offset where reality and recording disagreed.
        step: u64,
        /// What diverged.
        detail: String,
    },

    /// The scheduler terminated the iteration cooperatively.
    ///
    /// Never a bug; handlers propagate it and the runner unwinds quietly.
    #[error("execution canceled by the scheduler")]
    Canceled,
}

impl LockstepError {
    /// True for the cooperative-cancellation sentinel.
    pub fn is_canceled(&self) -> bool {
        matches!(self, LockstepError::Canceled)
    }
}

/// Why an action aborted.
#[derive(Debug)]
pub(crate) enum AbortKind {
    /// Cooperative cancellation; unwind quietly.
    Canceled,
    /// A detected bug; already routed to the backend's report pipeline.
    Bug(LockstepError),
}

/// Abort signal propagated out of machine actions with `?`.
///
/// Actions return [`crate::ActionResult`]; any runtime call that detects a
/// bug or a cooperative cancellation returns an `ActionAbort`, which the
/// handler-run wrapper consumes. User code normally just propagates it.
#[derive(Debug)]
pub struct ActionAbort {
    pub(crate) kind: AbortKind,
}

impl ActionAbort {
    pub(crate) fn canceled() -> Self {
        Self {
            kind: AbortKind::Canceled,
        }
    }

    pub(crate) fn bug(error: LockstepError) -> Self {
        Self {
            kind: AbortKind::Bug(error),
        }
    }

    /// Abort the current action with an assertion failure.
    ///
    /// Prefer [`crate::ActionContext::assert`]; this is for failures computed
    /// outside a condition check.
    pub fn failure(message: impl Into<String>) -> Self {
        Self::bug(LockstepError::AssertionFailure {
            message: message.into(),
            machine: None,
        })
    }

    /// True if this abort is a cooperative cancellation.
    pub fn is_canceled(&self) -> bool {
        matches!(self.kind, AbortKind::Canceled)
    }

    /// Convert into the underlying error.
    pub fn into_error(self) -> LockstepError {
        match self.kind {
            AbortKind::Canceled => LockstepError::Canceled,
            AbortKind::Bug(e) => e,
        }
    }
}

impl fmt::Display for ActionAbort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            AbortKind::Canceled => write!(f, "execution canceled"),
            AbortKind::Bug(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ActionAbort {}

impl From<LockstepError> for ActionAbort {
    fn from(error: LockstepError) -> Self {
        match error {
            LockstepError::Canceled => Self::canceled(),
            other => Self::bug(other),
        }
    }
}

/// A rendered bug found by the controlled backend.
///
/// Carries everything needed to understand and reproduce the failure: the
/// structured error, the iteration and step offset where it was detected,
/// the strategy seed, and the full replayable trace.
#[derive(Debug, Clone)]
pub struct BugReport {
    /// The detected error.
    pub error: LockstepError,
    /// Which iteration of the checker found it (1-based).
    pub iteration: u32,
    /// Offset into the schedule trace at detection time.
    pub step: u64,
    /// The strategy seed for this run.
    pub seed: u64,
    /// The full schedule trace up to the failure.
    pub trace: ScheduleTrace,
    /// When the bug was detected (reporting only).
    pub at: DateTime<Utc>,
}

impl BugReport {
    /// The replayable JSON form of the trace that found this bug.
    pub fn replay_json(&self) -> String {
        self.trace.to_json()
    }
}

impl fmt::Display for BugReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bug found in iteration {} at step {} (seed {}): {}",
            self.iteration, self.step, self.seed, self.error
        )
    }
}
