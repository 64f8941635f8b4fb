//! End-to-end scenarios driving both the machine core and the controlled
//! scheduler: ping-pong delivery, must-handle enforcement, deferred
//! reordering, liveness cycles, receive unblocking, and replay determinism.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::decl::{ActionResult, MachineBuilder, StateName};
use crate::error::LockstepError;
use crate::event::{Event, EventKind, OperationGroup, SendOptions};
use crate::machine::{ActionContext, Automaton};
use crate::trace::{Decision, OperationKind};
use crate::{CheckReport, Checker, CheckerConfig, ControlledHandle, StrategyKind};

/// Opt-in tracing for debugging failed schedules: `RUST_LOG=lockstep=trace`.
fn init_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

// ─────────────────────────────────────────────────────────────────────────────
// Ping-pong
// ─────────────────────────────────────────────────────────────────────────────

const SERVING: StateName = StateName::new("Serving");
const CALLING: StateName = StateName::new("Calling");
const PING: EventKind = EventKind::new("ping");
const PONG: EventKind = EventKind::new("pong");

#[derive(Default)]
struct PingServer;

impl Automaton for PingServer {
    fn declare(b: &mut MachineBuilder<Self>) {
        b.state(SERVING).start().on(PING, PingServer::on_ping);
    }
}

impl PingServer {
    fn on_ping(&mut self, ctx: &mut ActionContext<'_>, ev: &Event) -> ActionResult {
        let client = ev.origin().expect("ping carries its sender").clone();
        ctx.send(&client, Event::new(PONG))
    }
}

#[derive(Default)]
struct PingClient;

impl Automaton for PingClient {
    fn declare(b: &mut MachineBuilder<Self>) {
        b.state(CALLING)
            .start()
            .on_entry(PingClient::on_start)
            .on(PONG, |_, ctx, _| ctx.halt());
    }
}

impl PingClient {
    fn on_start(&mut self, ctx: &mut ActionContext<'_>, ev: &Event) -> ActionResult {
        let server = ev.payload::<crate::MachineId>().expect("server id").clone();
        ctx.send(&server, Event::new(PING))
    }
}

/// Hot until the first pong; a second pong is a failure.
#[derive(Default)]
struct PongSpec;

const AWAITING_PONG: StateName = StateName::new("AwaitingPong");
const PONGED: StateName = StateName::new("Ponged");

impl Automaton for PongSpec {
    fn declare(b: &mut MachineBuilder<Self>) {
        b.state(AWAITING_PONG).start().hot().on_goto(PONG, PONGED);
        b.state(PONGED)
            .cold()
            .on(PONG, |_, ctx, _| ctx.assert(false, "more than one pong"));
    }
}

fn ping_pong_harness(env: &ControlledHandle) -> anyhow::Result<()> {
    let server = env.create_machine::<PingServer>(None)?;
    env.create_machine::<PingClient>(Some(Event::with_payload(PING, server)))?;
    Ok(())
}

#[test]
fn test_ping_pong_exactly_one_pong_in_every_interleaving() {
    init_logging();
    let report = Checker::new(CheckerConfig {
        iterations: 25,
        seed: Some(7),
        ..CheckerConfig::default()
    })
    .register_monitor::<PongSpec>()
    .run(ping_pong_harness);

    assert!(!report.found_bug(), "{report}");
    assert_eq!(report.iterations_run, 25);
}

// ─────────────────────────────────────────────────────────────────────────────
// Must-handle halt
// ─────────────────────────────────────────────────────────────────────────────

const QUITTING: StateName = StateName::new("Quitting");
const CRITICAL: EventKind = EventKind::new("critical");

#[derive(Default)]
struct Quitter;

impl Automaton for Quitter {
    fn declare(b: &mut MachineBuilder<Self>) {
        b.state(QUITTING).start().on_entry(|_, ctx, _| ctx.halt());
    }
}

#[test]
fn test_halting_with_must_handle_event_is_a_violation() {
    let report = Checker::new(CheckerConfig {
        iterations: 10,
        seed: Some(3),
        ..CheckerConfig::default()
    })
    .run(|env| {
        let quitter = env.create_machine::<Quitter>(None)?;
        env.send_with(&quitter, Event::new(CRITICAL), SendOptions::must_handle())?;
        Ok(())
    });

    let bug = report.bug.expect("must-handle violation expected");
    match &bug.error {
        LockstepError::MustHandleViolation { kind, .. } => assert_eq!(*kind, "critical"),
        other => panic!("expected MustHandleViolation, got {other}"),
    }
    assert!(!bug.trace.is_empty());
}

// ─────────────────────────────────────────────────────────────────────────────
// Deferred event reordering
// ─────────────────────────────────────────────────────────────────────────────

const COLLECTING: StateName = StateName::new("Collecting");
const DRAINING: StateName = StateName::new("Draining");
const X_EVENT: EventKind = EventKind::new("x");
const Y_EVENT: EventKind = EventKind::new("y");
const X_DONE: EventKind = EventKind::new("x_done");

#[derive(Default)]
struct Collector {
    saw_y: bool,
}

impl Automaton for Collector {
    fn declare(b: &mut MachineBuilder<Self>) {
        b.state(COLLECTING)
            .start()
            .defer(X_EVENT)
            .on(Y_EVENT, Collector::on_y);
        b.state(DRAINING).on(X_EVENT, Collector::on_x);
    }
}

impl Collector {
    fn on_y(&mut self, ctx: &mut ActionContext<'_>, _ev: &Event) -> ActionResult {
        self.saw_y = true;
        ctx.goto(DRAINING)
    }

    fn on_x(&mut self, ctx: &mut ActionContext<'_>, _ev: &Event) -> ActionResult {
        ctx.assert(self.saw_y, "x must be deferred until y was handled")?;
        ctx.invoke_monitor::<DrainSpec>(Event::new(X_DONE))?;
        ctx.halt()
    }
}

/// Hot until the deferred event is finally handled; catches silent drops.
#[derive(Default)]
struct DrainSpec;

const WAITING_FOR_X: StateName = StateName::new("WaitingForX");
const DRAINED: StateName = StateName::new("Drained");

impl Automaton for DrainSpec {
    fn declare(b: &mut MachineBuilder<Self>) {
        b.state(WAITING_FOR_X).start().hot().on_goto(X_DONE, DRAINED);
        b.state(DRAINED).cold();
    }
}

#[test]
fn test_deferred_event_is_reordered_not_dropped() {
    let report = Checker::new(CheckerConfig {
        iterations: 30,
        seed: Some(11),
        ..CheckerConfig::default()
    })
    .register_monitor::<DrainSpec>()
    .run(|env| {
        let collector = env.create_machine::<Collector>(None)?;
        env.send(&collector, Event::new(X_EVENT))?;
        env.send(&collector, Event::new(Y_EVENT))?;
        Ok(())
    });

    assert!(!report.found_bug(), "{report}");
}

// ─────────────────────────────────────────────────────────────────────────────
// Liveness: hot cycle
// ─────────────────────────────────────────────────────────────────────────────

const LOOPING: StateName = StateName::new("Looping");
const NUDGE: EventKind = EventKind::new("nudge");
const DONE_EVENT: EventKind = EventKind::new("done");

#[derive(Default)]
struct Looper;

impl Automaton for Looper {
    fn declare(b: &mut MachineBuilder<Self>) {
        b.state(LOOPING)
            .start()
            .on_entry(Looper::nudge_self)
            .on(NUDGE, Looper::nudge_self);
    }
}

impl Looper {
    fn nudge_self(&mut self, ctx: &mut ActionContext<'_>, _ev: &Event) -> ActionResult {
        let me = ctx.id().clone();
        ctx.send(&me, Event::new(NUDGE))
    }
}

/// Hot until a `done` that never comes.
#[derive(Default)]
struct ProgressSpec;

const WANTING: StateName = StateName::new("Wanting");
const SATISFIED: StateName = StateName::new("Satisfied");

impl Automaton for ProgressSpec {
    fn declare(b: &mut MachineBuilder<Self>) {
        b.state(WANTING).start().hot().on_goto(DONE_EVENT, SATISFIED);
        b.state(SATISFIED).cold();
    }
}

#[test]
fn test_hot_monitor_across_a_cycle_is_a_liveness_violation() {
    init_logging();
    let report = Checker::new(CheckerConfig {
        iterations: 1,
        max_steps: 200,
        seed: Some(5),
        cycle_detection: true,
        cache_program_state: true,
        ..CheckerConfig::default()
    })
    .register_monitor::<ProgressSpec>()
    .run(|env| {
        env.create_machine::<Looper>(None)?;
        Ok(())
    });

    let bug = report.bug.expect("liveness violation expected");
    match &bug.error {
        LockstepError::LivenessViolation { monitor, state, .. } => {
            assert_eq!(*monitor, "ProgressSpec");
            assert_eq!(*state, "Wanting");
        }
        other => panic!("expected LivenessViolation, got {other}"),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Receive unblocking
// ─────────────────────────────────────────────────────────────────────────────

const BLOCKED: StateName = StateName::new("Blocked");
const NUDGING: StateName = StateName::new("Nudging");
const R_EVENT: EventKind = EventKind::new("r");

#[derive(Default)]
struct BlockingReceiver;

impl Automaton for BlockingReceiver {
    fn declare(b: &mut MachineBuilder<Self>) {
        b.state(BLOCKED).start().on_entry(BlockingReceiver::on_start);
    }
}

impl BlockingReceiver {
    fn on_start(&mut self, ctx: &mut ActionContext<'_>, _ev: &Event) -> ActionResult {
        let ev = ctx.receive(&[R_EVENT])?;
        ctx.assert(ev.kind() == R_EVENT, "receive returned a non-matching event")?;
        ctx.halt()
    }
}

#[derive(Default)]
struct Unblocker;

impl Automaton for Unblocker {
    fn declare(b: &mut MachineBuilder<Self>) {
        b.state(NUDGING).start().on_entry(Unblocker::on_start);
    }
}

impl Unblocker {
    fn on_start(&mut self, ctx: &mut ActionContext<'_>, ev: &Event) -> ActionResult {
        let target = ev.payload::<crate::MachineId>().expect("receiver id").clone();
        ctx.send(&target, Event::new(R_EVENT))?;
        ctx.halt()
    }
}

#[test]
fn test_blocked_receive_is_unblocked_by_matching_send() {
    // DFS iteration 1 always picks the lowest enabled operation, which runs
    // the receiver into its blocking receive before the unblocker sends.
    let report = Checker::new(CheckerConfig {
        iterations: 1,
        strategy: StrategyKind::Dfs,
        ..CheckerConfig::default()
    })
    .run(|env| {
        let receiver = env.create_machine::<BlockingReceiver>(None)?;
        env.create_machine::<Unblocker>(Some(Event::with_payload(R_EVENT, receiver)))?;
        Ok(())
    });

    assert!(!report.found_bug(), "{report}");
    let recorded_receive = report.last_trace.iter().any(|d| {
        matches!(
            d,
            Decision::Schedule {
                op: 1,
                point: OperationKind::Receive
            }
        )
    });
    assert!(
        recorded_receive,
        "expected a Receive step for the receiver in {:?}",
        report.last_trace
    );
}

#[test]
fn test_receive_unblocks_under_random_schedules() {
    let report = Checker::new(CheckerConfig {
        iterations: 20,
        seed: Some(13),
        ..CheckerConfig::default()
    })
    .run(|env| {
        let receiver = env.create_machine::<BlockingReceiver>(None)?;
        env.create_machine::<Unblocker>(Some(Event::with_payload(R_EVENT, receiver)))?;
        Ok(())
    });
    assert!(!report.found_bug(), "{report}");
}

// ─────────────────────────────────────────────────────────────────────────────
// Replay determinism
// ─────────────────────────────────────────────────────────────────────────────

const FLIPPING: StateName = StateName::new("Flipping");
const FLIP: EventKind = EventKind::new("flip");
const HEADS: EventKind = EventKind::new("heads");

#[derive(Default)]
struct CoinFlipper;

impl Automaton for CoinFlipper {
    fn declare(b: &mut MachineBuilder<Self>) {
        b.state(FLIPPING)
            .start()
            .on_entry(CoinFlipper::flip)
            .on(FLIP, CoinFlipper::flip)
            .on(HEADS, |_, ctx, _| ctx.halt());
    }
}

impl CoinFlipper {
    fn flip(&mut self, ctx: &mut ActionContext<'_>, _ev: &Event) -> ActionResult {
        let me = ctx.id().clone();
        if ctx.random(2)? {
            ctx.send(&me, Event::new(HEADS))
        } else {
            ctx.send(&me, Event::new(FLIP))
        }
    }
}

fn coin_harness(env: &ControlledHandle) -> anyhow::Result<()> {
    env.create_machine::<CoinFlipper>(None)?;
    Ok(())
}

#[test]
fn test_replay_reproduces_final_state_digest() {
    let recorded: CheckReport = Checker::new(CheckerConfig {
        iterations: 1,
        seed: Some(99),
        cache_program_state: true,
        ..CheckerConfig::default()
    })
    .run(coin_harness);
    assert!(!recorded.found_bug(), "{recorded}");
    let digest = recorded.final_digest.expect("digest recorded");

    let replayed = Checker::new(CheckerConfig {
        iterations: 1,
        strategy: StrategyKind::Replay(recorded.last_trace.clone()),
        cache_program_state: true,
        ..CheckerConfig::default()
    })
    .run(coin_harness);

    assert!(!replayed.found_bug(), "{replayed}");
    assert_eq!(replayed.final_digest, Some(digest));
    assert_eq!(replayed.last_trace, recorded.last_trace);
}

// A race whose bug depends purely on the schedule: whichever racer's win
// arrives first decides the verdict.
const JUDGING: StateName = StateName::new("Judging");
const RACING: StateName = StateName::new("Racing");
const WIN: EventKind = EventKind::new("win");

#[derive(Default)]
struct Referee {
    first: Option<u32>,
}

impl Automaton for Referee {
    fn declare(b: &mut MachineBuilder<Self>) {
        b.state(JUDGING).start().on(WIN, Referee::on_win);
    }
}

impl Referee {
    fn on_win(&mut self, ctx: &mut ActionContext<'_>, ev: &Event) -> ActionResult {
        let racer = *ev.payload::<u32>().expect("racer index");
        if self.first.is_none() {
            self.first = Some(racer);
            ctx.assert(racer != 2, "racer two finished first")?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct Racer;

impl Automaton for Racer {
    fn declare(b: &mut MachineBuilder<Self>) {
        b.state(RACING).start().on_entry(Racer::on_start);
    }
}

impl Racer {
    fn on_start(&mut self, ctx: &mut ActionContext<'_>, ev: &Event) -> ActionResult {
        let (referee, index) = ev
            .payload::<(crate::MachineId, u32)>()
            .expect("referee and index")
            .clone();
        ctx.send_with(&referee, Event::with_payload(WIN, index), SendOptions::default())?;
        ctx.halt()
    }
}

fn race_harness(env: &ControlledHandle) -> anyhow::Result<()> {
    let referee = env.create_machine::<Referee>(None)?;
    env.create_machine::<Racer>(Some(Event::with_payload(WIN, (referee.clone(), 1u32))))?;
    env.create_machine::<Racer>(Some(Event::with_payload(WIN, (referee, 2u32))))?;
    Ok(())
}

#[test]
fn test_replay_reproduces_a_schedule_dependent_bug() {
    let recorded = Checker::new(CheckerConfig {
        iterations: 64,
        seed: Some(21),
        ..CheckerConfig::default()
    })
    .run(race_harness);
    let bug = recorded.bug.expect("race bug expected within 64 schedules");

    let replayed = Checker::new(CheckerConfig {
        iterations: 1,
        strategy: StrategyKind::Replay(bug.trace.clone()),
        ..CheckerConfig::default()
    })
    .run(race_harness);

    let replayed_bug = replayed.bug.expect("replay must reproduce the bug");
    assert_eq!(replayed_bug.error, bug.error);
}

// ─────────────────────────────────────────────────────────────────────────────
// Ordering and operation-group invariants
// ─────────────────────────────────────────────────────────────────────────────

const COUNTING: StateName = StateName::new("Counting");
const SEQ: EventKind = EventKind::new("seq");

#[derive(Default)]
struct OrderChecker {
    next: u32,
}

impl Automaton for OrderChecker {
    fn declare(b: &mut MachineBuilder<Self>) {
        b.state(COUNTING).start().on(SEQ, OrderChecker::on_seq);
    }
}

impl OrderChecker {
    fn on_seq(&mut self, ctx: &mut ActionContext<'_>, ev: &Event) -> ActionResult {
        let n = *ev.payload::<u32>().expect("sequence number");
        ctx.assert(
            n == self.next,
            format!("out of order: expected {}, got {n}", self.next),
        )?;
        self.next = n + 1;
        Ok(())
    }
}

#[test]
fn test_fifo_order_per_sender_receiver_pair() {
    let report = Checker::new(CheckerConfig {
        iterations: 20,
        seed: Some(17),
        ..CheckerConfig::default()
    })
    .run(|env| {
        let checker = env.create_machine::<OrderChecker>(None)?;
        for n in 0..5u32 {
            env.send(&checker, Event::with_payload(SEQ, n))?;
        }
        Ok(())
    });
    assert!(!report.found_bug(), "{report}");
}

const GROUPED: EventKind = EventKind::new("grouped");
const FORWARD: EventKind = EventKind::new("forward");
const RELAYING: StateName = StateName::new("Relaying");
const SINKING: StateName = StateName::new("Sinking");

#[derive(Default)]
struct GroupRelay {
    sink: Option<crate::MachineId>,
}

impl Automaton for GroupRelay {
    fn declare(b: &mut MachineBuilder<Self>) {
        b.state(RELAYING)
            .start()
            .on_entry(GroupRelay::on_start)
            .on(GROUPED, GroupRelay::on_grouped);
    }
}

impl GroupRelay {
    fn on_start(&mut self, _ctx: &mut ActionContext<'_>, ev: &Event) -> ActionResult {
        self.sink = ev.payload::<crate::MachineId>().cloned();
        Ok(())
    }

    fn on_grouped(&mut self, ctx: &mut ActionContext<'_>, ev: &Event) -> ActionResult {
        let expected = *ev.payload::<OperationGroup>().expect("group payload");
        // The dequeued event's group became this machine's current group.
        ctx.assert(
            ctx.operation_group() == expected,
            "operation group not inherited on dequeue",
        )?;
        let sink = self.sink.clone().expect("sink configured at start");
        // No explicit group: the send inherits the current one.
        ctx.send(&sink, Event::with_payload(FORWARD, expected))
    }
}

#[derive(Default)]
struct GroupSink;

impl Automaton for GroupSink {
    fn declare(b: &mut MachineBuilder<Self>) {
        b.state(SINKING).start().on(FORWARD, GroupSink::on_forward);
    }
}

impl GroupSink {
    fn on_forward(&mut self, ctx: &mut ActionContext<'_>, ev: &Event) -> ActionResult {
        let expected = *ev.payload::<OperationGroup>().expect("group payload");
        ctx.assert(
            ev.group() == expected,
            "operation group not propagated across causally related sends",
        )?;
        ctx.assert(
            ctx.operation_group() == expected,
            "operation group not inherited by the second hop",
        )
    }
}

#[test]
fn test_operation_group_rides_causally_related_sends() {
    let group = OperationGroup::new();
    let report = Checker::new(CheckerConfig {
        iterations: 10,
        seed: Some(23),
        ..CheckerConfig::default()
    })
    .run(move |env| {
        let sink = env.create_machine::<GroupSink>(None)?;
        let relay = env.create_machine::<GroupRelay>(Some(Event::with_payload(GROUPED, sink)))?;
        env.send_with(
            &relay,
            Event::with_payload(GROUPED, group),
            SendOptions::grouped(group),
        )?;
        Ok(())
    });
    assert!(!report.found_bug(), "{report}");
}

// ─────────────────────────────────────────────────────────────────────────────
// Step bound and default events
// ─────────────────────────────────────────────────────────────────────────────

const IDLING: StateName = StateName::new("Idling");

#[derive(Default)]
struct DefaultSpinner;

impl Automaton for DefaultSpinner {
    fn declare(b: &mut MachineBuilder<Self>) {
        b.state(IDLING)
            .start()
            .on(crate::event::DEFAULT, |_, _, _| Ok(()));
    }
}

#[test]
fn test_step_bound_cancels_without_reporting_a_bug() {
    let report = Checker::new(CheckerConfig {
        iterations: 2,
        max_steps: 100,
        seed: Some(29),
        ..CheckerConfig::default()
    })
    .run(|env| {
        // A default handler keeps the machine enabled forever; only the
        // step bound ends the iteration.
        env.create_machine::<DefaultSpinner>(None)?;
        Ok(())
    });

    assert!(!report.found_bug(), "{report}");
    assert_eq!(report.iterations_run, 2);
}

// ─────────────────────────────────────────────────────────────────────────────
// Nondeterministic timer
// ─────────────────────────────────────────────────────────────────────────────

const TIMING: StateName = StateName::new("Timing");

#[derive(Default)]
struct TimerClient;

impl Automaton for TimerClient {
    fn declare(b: &mut MachineBuilder<Self>) {
        b.state(TIMING)
            .start()
            .on_entry(TimerClient::on_start)
            .on(crate::TIMER_ELAPSED, |_, ctx, _| {
                ctx.invoke_monitor::<FiredSpec>(Event::new(DONE_EVENT))?;
                ctx.halt()
            });
    }
}

impl TimerClient {
    fn on_start(&mut self, ctx: &mut ActionContext<'_>, _ev: &Event) -> ActionResult {
        ctx.start_timer(std::time::Duration::from_millis(1))?;
        Ok(())
    }
}

/// Hot until the timer's expiry is handled.
#[derive(Default)]
struct FiredSpec;

const UNFIRED: StateName = StateName::new("Unfired");
const FIRED: StateName = StateName::new("Fired");

impl Automaton for FiredSpec {
    fn declare(b: &mut MachineBuilder<Self>) {
        b.state(UNFIRED).start().hot().on_goto(DONE_EVENT, FIRED);
        b.state(FIRED).cold();
    }
}

#[test]
fn test_controlled_timer_fires_through_the_inbox() {
    let report = Checker::new(CheckerConfig {
        iterations: 5,
        seed: Some(31),
        ..CheckerConfig::default()
    })
    .register_monitor::<FiredSpec>()
    .run(|env| {
        env.create_machine::<TimerClient>(None)?;
        Ok(())
    });
    assert!(!report.found_bug(), "{report}");
}

// ─────────────────────────────────────────────────────────────────────────────
// Transition misuse
// ─────────────────────────────────────────────────────────────────────────────

const SHALLOW: StateName = StateName::new("Shallow");
const FIRST: StateName = StateName::new("First");
const SECOND: StateName = StateName::new("Second");
const POKE: EventKind = EventKind::new("poke");

#[derive(Default)]
struct OverPopper;

impl Automaton for OverPopper {
    fn declare(b: &mut MachineBuilder<Self>) {
        b.state(SHALLOW).start().on(POKE, |_, ctx, _| ctx.pop());
    }
}

#[test]
fn test_pop_from_one_deep_stack_is_rejected() {
    let report = Checker::new(CheckerConfig {
        iterations: 1,
        seed: Some(41),
        ..CheckerConfig::default()
    })
    .run(|env| {
        let machine = env.create_machine::<OverPopper>(None)?;
        env.send(&machine, Event::new(POKE))?;
        Ok(())
    });

    match report.bug.map(|b| b.error) {
        Some(LockstepError::EmptyStateStack { .. }) => {}
        other => panic!("expected EmptyStateStack, got {other:?}"),
    }
}

#[derive(Default)]
struct DoubleMover;

impl Automaton for DoubleMover {
    fn declare(b: &mut MachineBuilder<Self>) {
        b.state(FIRST).start().on(POKE, |_, ctx, _| {
            ctx.goto(SECOND)?;
            ctx.raise(Event::new(POKE))
        });
        b.state(SECOND);
    }
}

#[test]
fn test_second_transition_statement_in_one_action_is_rejected() {
    let report = Checker::new(CheckerConfig {
        iterations: 1,
        seed: Some(43),
        ..CheckerConfig::default()
    })
    .run(|env| {
        let machine = env.create_machine::<DoubleMover>(None)?;
        env.send(&machine, Event::new(POKE))?;
        Ok(())
    });

    match report.bug.map(|b| b.error) {
        Some(LockstepError::TooManyTransitions { state, .. }) => assert_eq!(state, "First"),
        other => panic!("expected TooManyTransitions, got {other:?}"),
    }
}

#[derive(Default)]
struct ExitMover;

impl Automaton for ExitMover {
    fn declare(b: &mut MachineBuilder<Self>) {
        b.state(FIRST)
            .start()
            .on_exit(|_, ctx, _| ctx.goto(FIRST))
            .on_goto(POKE, SECOND);
        b.state(SECOND);
    }
}

#[test]
fn test_transition_inside_on_exit_is_rejected() {
    let report = Checker::new(CheckerConfig {
        iterations: 1,
        seed: Some(47),
        ..CheckerConfig::default()
    })
    .run(|env| {
        let machine = env.create_machine::<ExitMover>(None)?;
        env.send(&machine, Event::new(POKE))?;
        Ok(())
    });

    match report.bug.map(|b| b.error) {
        Some(LockstepError::TransitionInsideOnExit { state, .. }) => assert_eq!(state, "First"),
        other => panic!("expected TransitionInsideOnExit, got {other:?}"),
    }
}

#[derive(Default)]
struct Deaf;

impl Automaton for Deaf {
    fn declare(b: &mut MachineBuilder<Self>) {
        b.state(FIRST).start();
    }
}

#[test]
fn test_unhandled_event_exhausts_the_stack() {
    let report = Checker::new(CheckerConfig {
        iterations: 1,
        seed: Some(53),
        ..CheckerConfig::default()
    })
    .run(|env| {
        let machine = env.create_machine::<Deaf>(None)?;
        env.send(&machine, Event::new(POKE))?;
        Ok(())
    });

    match report.bug.map(|b| b.error) {
        Some(LockstepError::UnhandledEvent { kind, state, .. }) => {
            assert_eq!(kind, "poke");
            assert_eq!(state, "First");
        }
        other => panic!("expected UnhandledEvent, got {other:?}"),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Harness assertions surface as bugs with traces
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_harness_assertion_becomes_a_bug_report() {
    let calls = Arc::new(AtomicU32::new(0));
    let calls_in = Arc::clone(&calls);
    let report = Checker::new(CheckerConfig {
        iterations: 3,
        seed: Some(37),
        ..CheckerConfig::default()
    })
    .run(move |env| {
        calls_in.fetch_add(1, Ordering::Relaxed);
        env.assert(false, "harness says no")?;
        Ok(())
    });

    let bug = report.bug.expect("assertion bug expected");
    match &bug.error {
        LockstepError::AssertionFailure { message, .. } => {
            assert!(message.contains("harness says no"))
        }
        other => panic!("expected AssertionFailure, got {other}"),
    }
    assert_eq!(bug.iteration, 1, "first iteration should already fail");
    assert_eq!(calls.load(Ordering::Relaxed), 1);

    // The replayable form round-trips.
    let json = bug.replay_json();
    assert_eq!(
        crate::ScheduleTrace::from_json(&json).expect("valid trace json"),
        bug.trace
    );
}
