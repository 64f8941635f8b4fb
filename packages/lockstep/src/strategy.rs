//! Scheduling strategies for the controlled backend.
//!
//! A [`Strategy`] supplies every decision the controlled scheduler makes:
//! which enabled operation runs next, and the value of each nondeterministic
//! boolean/integer choice. All randomness is strategy-owned and seeded from
//! configuration; the runtime never consults the host clock or a global PRNG
//! for logic.
//!
//! Implementations:
//! - [`RandomStrategy`]: uniform random walk over enabled operations.
//! - [`PctStrategy`]: probabilistic concurrency testing, random priorities
//!   with `d - 1` priority change points per schedule.
//! - [`FairPctStrategy`]: PCT prefix, then a round-robin fair tail so
//!   lasso-shaped liveness counterexamples can close their cycles.
//! - [`DfsStrategy`]: exhaustive depth-first enumeration of scheduling and
//!   value choices.
//! - [`IddfsStrategy`]: iterative deepening over [`DfsStrategy`].
//! - [`PortfolioStrategy`]: rotates member strategies across iterations.
//! - [`ReplayStrategy`]: returns exactly the decisions of a recorded trace;
//!   any divergence is fatal to the replay.

use std::collections::HashMap;

use crate::trace::{Decision, ScheduleTrace};

/// Supplies scheduling and nondeterministic-choice decisions.
///
/// `next_operation` receives the enabled set in ascending operation-id order
/// and the currently running operation. Returning `None` means the strategy
/// cannot continue this schedule (only meaningful for replay).
pub(crate) trait Strategy: Send {
    fn name(&self) -> &'static str;

    fn next_operation(&mut self, enabled: &[u64], current: u64) -> Option<u64>;

    /// A boolean choice, true with probability roughly `1/max`.
    fn next_boolean(&mut self, max: u64) -> Option<bool>;

    /// An integer choice in `0..max`.
    fn next_integer(&mut self, max: u64) -> Option<u64>;

    /// Reset for a new iteration. Returns false when the search space is
    /// exhausted and no further iterations are useful.
    fn prepare_for_next_iteration(&mut self) -> bool;
}

// ─────────────────────────────────────────────────────────────────────────────
// Random
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) struct RandomStrategy {
    rng: fastrand::Rng,
}

impl RandomStrategy {
    pub(crate) fn new(seed: u64) -> Self {
        Self {
            rng: fastrand::Rng::with_seed(seed),
        }
    }
}

impl Strategy for RandomStrategy {
    fn name(&self) -> &'static str {
        "random"
    }

    fn next_operation(&mut self, enabled: &[u64], _current: u64) -> Option<u64> {
        Some(enabled[self.rng.usize(0..enabled.len())])
    }

    fn next_boolean(&mut self, max: u64) -> Option<bool> {
        Some(self.rng.u64(0..max.max(1)) == 0)
    }

    fn next_integer(&mut self, max: u64) -> Option<u64> {
        Some(self.rng.u64(0..max.max(1)))
    }

    fn prepare_for_next_iteration(&mut self) -> bool {
        true
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// PCT
// ─────────────────────────────────────────────────────────────────────────────

/// Probabilistic concurrency testing. Operations get random priorities; the
/// highest-priority enabled operation always runs, except at `depth - 1`
/// random change points where the current leader is demoted below everyone.
pub(crate) struct PctStrategy {
    rng: fastrand::Rng,
    depth: usize,
    max_steps: u64,
    priorities: HashMap<u64, i64>,
    change_points: Vec<u64>,
    lowest: i64,
    step: u64,
}

impl PctStrategy {
    pub(crate) fn new(seed: u64, depth: usize, max_steps: u64) -> Self {
        let mut strategy = Self {
            rng: fastrand::Rng::with_seed(seed),
            depth,
            max_steps: max_steps.max(1),
            priorities: HashMap::new(),
            change_points: Vec::new(),
            lowest: 0,
            step: 0,
        };
        strategy.draw_change_points();
        strategy
    }

    fn draw_change_points(&mut self) {
        self.change_points.clear();
        for _ in 1..self.depth.max(1) {
            self.change_points.push(self.rng.u64(0..self.max_steps));
        }
    }

    fn priority_of(&mut self, op: u64) -> i64 {
        if let Some(p) = self.priorities.get(&op) {
            return *p;
        }
        let p = self.rng.i64(1..1_000_000);
        self.priorities.insert(op, p);
        p
    }

    fn pick(&mut self, enabled: &[u64]) -> u64 {
        let mut best = enabled[0];
        let mut best_priority = self.priority_of(best);
        for &op in &enabled[1..] {
            let p = self.priority_of(op);
            if p > best_priority {
                best = op;
                best_priority = p;
            }
        }
        best
    }
}

impl Strategy for PctStrategy {
    fn name(&self) -> &'static str {
        "pct"
    }

    fn next_operation(&mut self, enabled: &[u64], _current: u64) -> Option<u64> {
        self.step += 1;
        if self.change_points.contains(&self.step) {
            // Demote the current leader below every other operation.
            let leader = self.pick(enabled);
            self.lowest -= 1;
            self.priorities.insert(leader, self.lowest);
        }
        Some(self.pick(enabled))
    }

    fn next_boolean(&mut self, max: u64) -> Option<bool> {
        Some(self.rng.u64(0..max.max(1)) == 0)
    }

    fn next_integer(&mut self, max: u64) -> Option<u64> {
        Some(self.rng.u64(0..max.max(1)))
    }

    fn prepare_for_next_iteration(&mut self) -> bool {
        self.priorities.clear();
        self.lowest = 0;
        self.step = 0;
        self.draw_change_points();
        true
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// FairPCT
// ─────────────────────────────────────────────────────────────────────────────

/// PCT for a bounded prefix, then round-robin over enabled operations.
///
/// The fair tail guarantees every continuously enabled operation eventually
/// runs, which cycle-based liveness detection needs to close its lassos.
pub(crate) struct FairPctStrategy {
    pct: PctStrategy,
    fair_after: u64,
    step: u64,
    last: u64,
}

impl FairPctStrategy {
    pub(crate) fn new(seed: u64, depth: usize, max_steps: u64) -> Self {
        Self {
            pct: PctStrategy::new(seed, depth, max_steps),
            fair_after: (max_steps / 2).max(1),
            step: 0,
            last: 0,
        }
    }
}

impl Strategy for FairPctStrategy {
    fn name(&self) -> &'static str {
        "fair-pct"
    }

    fn next_operation(&mut self, enabled: &[u64], current: u64) -> Option<u64> {
        self.step += 1;
        if self.step <= self.fair_after {
            return self.pct.next_operation(enabled, current);
        }
        // Round-robin: the smallest enabled op id above the last choice,
        // wrapping to the smallest overall.
        let chosen = enabled
            .iter()
            .copied()
            .find(|&op| op > self.last)
            .unwrap_or(enabled[0]);
        self.last = chosen;
        Some(chosen)
    }

    fn next_boolean(&mut self, max: u64) -> Option<bool> {
        self.pct.next_boolean(max)
    }

    fn next_integer(&mut self, max: u64) -> Option<u64> {
        self.pct.next_integer(max)
    }

    fn prepare_for_next_iteration(&mut self) -> bool {
        self.step = 0;
        self.last = 0;
        self.pct.prepare_for_next_iteration()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// DFS / IDDFS
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum DfsChoice {
    Op(u64),
    Bool(bool),
    Int(u64),
}

struct DfsLevel {
    options: Vec<DfsChoice>,
    index: usize,
}

/// Exhaustive depth-first enumeration of schedules and value choices.
///
/// Each decision point becomes a level holding every option; iterations
/// advance the deepest level with untried options and truncate below it.
/// With partial-order-equivalent schedules this revisits states, which the
/// scheduler's fingerprint cache is there to absorb.
pub(crate) struct DfsStrategy {
    stack: Vec<DfsLevel>,
    depth: usize,
    /// Depth bound; decisions past it follow the first option unrecorded.
    bound: Option<usize>,
    /// True if any decision this schedule ran past the bound.
    truncated: bool,
}

impl DfsStrategy {
    pub(crate) fn new() -> Self {
        Self {
            stack: Vec::new(),
            depth: 0,
            bound: None,
            truncated: false,
        }
    }

    fn bounded(bound: usize) -> Self {
        Self {
            bound: Some(bound),
            ..Self::new()
        }
    }

    fn choose(&mut self, options: Vec<DfsChoice>) -> DfsChoice {
        if let Some(bound) = self.bound {
            if self.depth >= bound {
                self.truncated = true;
                self.depth += 1;
                return options[0].clone();
            }
        }
        let choice = if self.depth < self.stack.len() {
            let level = &self.stack[self.depth];
            level.options[level.index].clone()
        } else {
            let choice = options[0].clone();
            self.stack.push(DfsLevel { options, index: 0 });
            choice
        };
        self.depth += 1;
        choice
    }

    fn reset(&mut self) {
        self.stack.clear();
        self.depth = 0;
        self.truncated = false;
    }
}

impl Strategy for DfsStrategy {
    fn name(&self) -> &'static str {
        "dfs"
    }

    fn next_operation(&mut self, enabled: &[u64], _current: u64) -> Option<u64> {
        let options = enabled.iter().copied().map(DfsChoice::Op).collect();
        match self.choose(options) {
            DfsChoice::Op(op) => Some(op),
            _ => None,
        }
    }

    fn next_boolean(&mut self, _max: u64) -> Option<bool> {
        let options = vec![DfsChoice::Bool(false), DfsChoice::Bool(true)];
        match self.choose(options) {
            DfsChoice::Bool(b) => Some(b),
            _ => None,
        }
    }

    fn next_integer(&mut self, max: u64) -> Option<u64> {
        let options = (0..max.max(1)).map(DfsChoice::Int).collect();
        match self.choose(options) {
            DfsChoice::Int(v) => Some(v),
            _ => None,
        }
    }

    fn prepare_for_next_iteration(&mut self) -> bool {
        self.depth = 0;
        self.truncated = false;
        while let Some(last) = self.stack.last_mut() {
            if last.index + 1 < last.options.len() {
                last.index += 1;
                return true;
            }
            self.stack.pop();
        }
        false
    }
}

/// Iterative deepening: DFS bounded at increasing depths, restarting the
/// enumeration each time the bounded search space is exhausted while some
/// schedule was truncated.
pub(crate) struct IddfsStrategy {
    dfs: DfsStrategy,
    bound: usize,
    any_truncated: bool,
}

impl IddfsStrategy {
    const INITIAL_BOUND: usize = 16;

    pub(crate) fn new() -> Self {
        Self {
            dfs: DfsStrategy::bounded(Self::INITIAL_BOUND),
            bound: Self::INITIAL_BOUND,
            any_truncated: false,
        }
    }
}

impl Strategy for IddfsStrategy {
    fn name(&self) -> &'static str {
        "iddfs"
    }

    fn next_operation(&mut self, enabled: &[u64], current: u64) -> Option<u64> {
        let op = self.dfs.next_operation(enabled, current);
        self.any_truncated |= self.dfs.truncated;
        op
    }

    fn next_boolean(&mut self, max: u64) -> Option<bool> {
        let b = self.dfs.next_boolean(max);
        self.any_truncated |= self.dfs.truncated;
        b
    }

    fn next_integer(&mut self, max: u64) -> Option<u64> {
        let v = self.dfs.next_integer(max);
        self.any_truncated |= self.dfs.truncated;
        v
    }

    fn prepare_for_next_iteration(&mut self) -> bool {
        if self.dfs.prepare_for_next_iteration() {
            return true;
        }
        if self.any_truncated {
            self.bound *= 2;
            self.dfs = DfsStrategy::bounded(self.bound);
            self.any_truncated = false;
            return true;
        }
        false
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Portfolio
// ─────────────────────────────────────────────────────────────────────────────

/// Rotates through member strategies, one per iteration.
pub(crate) struct PortfolioStrategy {
    members: Vec<Box<dyn Strategy>>,
    current: usize,
}

impl PortfolioStrategy {
    pub(crate) fn new(members: Vec<Box<dyn Strategy>>) -> Self {
        assert!(!members.is_empty(), "portfolio needs at least one member");
        Self {
            members,
            current: 0,
        }
    }

    fn active(&mut self) -> &mut Box<dyn Strategy> {
        &mut self.members[self.current]
    }
}

impl Strategy for PortfolioStrategy {
    fn name(&self) -> &'static str {
        "portfolio"
    }

    fn next_operation(&mut self, enabled: &[u64], current: u64) -> Option<u64> {
        self.active().next_operation(enabled, current)
    }

    fn next_boolean(&mut self, max: u64) -> Option<bool> {
        self.active().next_boolean(max)
    }

    fn next_integer(&mut self, max: u64) -> Option<u64> {
        self.active().next_integer(max)
    }

    fn prepare_for_next_iteration(&mut self) -> bool {
        for _ in 0..self.members.len() {
            self.current = (self.current + 1) % self.members.len();
            if self.active().prepare_for_next_iteration() {
                return true;
            }
        }
        false
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Replay
// ─────────────────────────────────────────────────────────────────────────────

/// Replays a recorded trace decision-for-decision.
///
/// Returns `None` when the trace runs out or the decision kinds disagree;
/// the scheduler reports that as [`crate::LockstepError::ReplayDivergence`].
pub(crate) struct ReplayStrategy {
    trace: ScheduleTrace,
    cursor: usize,
}

impl ReplayStrategy {
    pub(crate) fn new(trace: ScheduleTrace) -> Self {
        Self { trace, cursor: 0 }
    }
}

impl Strategy for ReplayStrategy {
    fn name(&self) -> &'static str {
        "replay"
    }

    fn next_operation(&mut self, _enabled: &[u64], _current: u64) -> Option<u64> {
        match self.trace.get(self.cursor) {
            Some(Decision::Schedule { op, .. }) => {
                self.cursor += 1;
                Some(*op)
            }
            _ => None,
        }
    }

    fn next_boolean(&mut self, _max: u64) -> Option<bool> {
        match self.trace.get(self.cursor) {
            Some(Decision::Boolean { value }) => {
                self.cursor += 1;
                Some(*value)
            }
            _ => None,
        }
    }

    fn next_integer(&mut self, _max: u64) -> Option<u64> {
        match self.trace.get(self.cursor) {
            Some(Decision::Integer { value }) => {
                self.cursor += 1;
                Some(*value)
            }
            _ => None,
        }
    }

    fn prepare_for_next_iteration(&mut self) -> bool {
        // A trace replays exactly once.
        false
    }
}
