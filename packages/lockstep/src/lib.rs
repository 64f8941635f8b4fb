//! # Lockstep
//!
//! A runtime for **asynchronous communicating state machines**: concurrent
//! entities that own a private inbox, dequeue events one at a time, execute
//! handlers declared per (state, event) pair, and may transition, create
//! other machines, or send events.
//!
//! Two execution backends share one surface:
//! - a **production runtime** ([`ProductionRuntime`]) running handler loops
//!   in parallel on host threads;
//! - a **controlled testing runtime** ([`Checker`]) that serializes every
//!   scheduling point and explores interleavings systematically for bug
//!   finding, liveness checking, and deterministic replay.
//!
//! ## Architecture
//!
//! ```text
//! caller ──► Runtime ──► (scheduling point) ──► target Inbox
//!                                                   │ dequeue
//!                                                   ▼
//!                                       machine handler loop
//!                                        │ goto/push/pop/raise
//!                                        │ send/create
//!                                        ▼
//!                              (scheduling point) ──► next machine
//!
//! Monitors observe sends of watched kinds inline, synchronously.
//! ```
//!
//! ## Key Invariants
//!
//! 1. **One handler per machine**: at most one handler runs per machine at
//!    any instant; the inbox's running flag is toggled under its own lock.
//! 2. **FIFO per pair**: events from the same sender to the same receiver
//!    are dequeued in send order, minus those the receiving state ignores.
//! 3. **Deferred means kept**: a deferred event stays in the inbox until
//!    the machine enters a state that does not defer it.
//! 4. **Must-handle means handled**: dropping a must-handle event, or
//!    halting with one enqueued, is a reported violation.
//! 5. **Replay is exact**: a schedule trace replayed with
//!    [`StrategyKind::Replay`] reproduces every decision or fails loudly.
//!
//! ## Example
//!
//! ```ignore
//! use lockstep::{
//!     ActionContext, ActionResult, Automaton, Checker, CheckerConfig, Event,
//!     EventKind, MachineBuilder, StateName,
//! };
//!
//! const ACTIVE: StateName = StateName::new("Active");
//! const PING: EventKind = EventKind::new("ping");
//! const PONG: EventKind = EventKind::new("pong");
//!
//! #[derive(Default)]
//! struct Server;
//!
//! impl Automaton for Server {
//!     fn declare(b: &mut MachineBuilder<Self>) {
//!         b.state(ACTIVE).start().on(PING, Server::on_ping);
//!     }
//! }
//!
//! impl Server {
//!     fn on_ping(&mut self, ctx: &mut ActionContext<'_>, ev: &Event) -> ActionResult {
//!         let client = ev.origin().expect("ping carries its sender").clone();
//!         ctx.send(&client, Event::new(PONG))
//!     }
//! }
//!
//! let report = Checker::new(CheckerConfig::default()).run(|env| {
//!     let server = env.create_machine::<Server>(None)?;
//!     env.send(&server, Event::new(PING))?;
//!     Ok(())
//! });
//! assert!(!report.found_bug());
//! ```

// Core modules
mod checker;
mod coverage;
mod decl;
mod error;
mod event;
mod fingerprint;
mod id;
mod inbox;
mod machine;
mod monitor;
mod production;
mod runtime;
mod scheduler;
mod strategy;
mod timer;
mod trace;

// End-to-end scenarios (test-only)
#[cfg(test)]
mod scenario_tests;

// Re-export event types
pub use event::{Event, EventKind, OperationGroup, SendOptions, DEFAULT, HALT, START};

// Re-export identity types
pub use id::MachineId;

// Re-export declaration surface
pub use decl::{ActionResult, MachineBuilder, StateHandle, StateName, Temperature, UserAction};

// Re-export machine surface
pub use machine::{ActionContext, Automaton};

// Re-export error types
pub use error::{ActionAbort, BugReport, LockstepError};

// Re-export the production backend
pub use production::{ProductionRuntime, ProductionRuntimeBuilder};

// Re-export the controlled backend (primary testing entry point)
pub use checker::{CheckReport, Checker, CheckerConfig, ControlledHandle, StrategyKind};

// Re-export trace types (replay files)
pub use trace::{Decision, OperationKind, ScheduleTrace};

// Re-export coverage reporting
pub use coverage::ActivityCoverage;

// Re-export the timer contract
pub use timer::{TimerArm, TIMER_ELAPSED};
