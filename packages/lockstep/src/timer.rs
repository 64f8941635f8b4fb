//! Timers, modeled as machines.
//!
//! A timer is an ordinary machine that sends [`TIMER_ELAPSED`] to its client
//! and halts. The expiry always travels through the client's inbox; no host
//! timer thread ever runs user actions.
//!
//! Under the production backend the timer sleeps for its real delay. Under
//! the controlled backend it is replaced by a nondeterministic stub that
//! decides at each scheduled turn whether to fire, exposing every timing
//! interleaving to the strategy. [`ActionContext::start_timer`] picks the
//! right model for the active backend.

use std::time::Duration;

use crate::decl::{ActionResult, MachineBuilder, StateName};
use crate::error::ActionAbort;
use crate::event::{Event, EventKind};
use crate::id::MachineId;
use crate::machine::{ActionContext, Automaton};

/// Sent to a timer's client when the timer fires.
pub const TIMER_ELAPSED: EventKind = EventKind::new("timer_elapsed");

const TICK: EventKind = EventKind::new("timer_tick");
const ARMED: StateName = StateName::new("Armed");

/// Creation payload for a timer machine.
pub struct TimerArm {
    /// Machine to notify when the timer fires.
    pub client: MachineId,
    /// Real delay; the nondeterministic stub ignores it.
    pub delay: Duration,
}

/// Production timer: sleeps for its delay on the blocking pool, fires, and
/// halts.
#[derive(Default)]
pub(crate) struct HostTimer;

impl Automaton for HostTimer {
    fn declare(b: &mut MachineBuilder<Self>) {
        b.state(ARMED).start().on_entry(HostTimer::on_armed);
    }
}

impl HostTimer {
    fn on_armed(&mut self, ctx: &mut ActionContext<'_>, ev: &Event) -> ActionResult {
        let arm = ev.payload::<TimerArm>().ok_or_else(|| {
            ActionAbort::failure("timer created without a TimerArm payload")
        })?;
        let client = arm.client.clone();
        std::thread::sleep(arm.delay);
        ctx.send(&client, Event::new(TIMER_ELAPSED))?;
        ctx.halt()
    }
}

/// Controlled timer: at each scheduled turn, nondeterministically fires or
/// keeps ticking.
#[derive(Default)]
pub(crate) struct NondetTimer {
    client: Option<MachineId>,
}

impl Automaton for NondetTimer {
    fn declare(b: &mut MachineBuilder<Self>) {
        b.state(ARMED)
            .start()
            .on_entry(NondetTimer::on_armed)
            .on(TICK, NondetTimer::on_tick);
    }
}

impl NondetTimer {
    fn on_armed(&mut self, ctx: &mut ActionContext<'_>, ev: &Event) -> ActionResult {
        let arm = ev.payload::<TimerArm>().ok_or_else(|| {
            ActionAbort::failure("timer created without a TimerArm payload")
        })?;
        self.client = Some(arm.client.clone());
        let me = ctx.id().clone();
        ctx.send(&me, Event::new(TICK))
    }

    fn on_tick(&mut self, ctx: &mut ActionContext<'_>, _ev: &Event) -> ActionResult {
        let client = self
            .client
            .clone()
            .ok_or_else(|| ActionAbort::failure("timer ticked before it was armed"))?;
        if ctx.random(2)? {
            ctx.send(&client, Event::new(TIMER_ELAPSED))?;
            return ctx.halt();
        }
        // Keep ticking through the inbox so the scheduler can interleave.
        let me = ctx.id().clone();
        ctx.send(&me, Event::new(TICK))
    }
}

impl<'a> ActionContext<'a> {
    /// Arm a timer that will send [`TIMER_ELAPSED`] to this machine.
    ///
    /// Production: fires after `delay`. Controlled: fires after a
    /// strategy-chosen number of turns.
    pub fn start_timer(&mut self, delay: Duration) -> Result<MachineId, ActionAbort> {
        let arm = TimerArm {
            client: self.id().clone(),
            delay,
        };
        let init = Event::with_payload(TIMER_ELAPSED, arm);
        if self.is_controlled() {
            self.create_machine::<NondetTimer>(Some(init))
        } else {
            self.create_machine::<HostTimer>(Some(init))
        }
    }
}
