//! Activity coverage: which states and (state, event) transitions ran.
//!
//! Recorded unconditionally (the cost is a hash-set insert per dispatch) and
//! reported when `report_activity_coverage` is set in the checker
//! configuration or requested from the production runtime.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Mutex;

use crate::decl::StateName;
use crate::event::EventKind;

/// Aggregated state and transition coverage.
///
/// Entries are `(machine type, state)` and `(machine type, state, event
/// kind)`, keyed by short type names.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ActivityCoverage {
    states: BTreeSet<(String, &'static str)>,
    transitions: BTreeSet<(String, &'static str, &'static str)>,
}

impl ActivityCoverage {
    /// Number of distinct states entered.
    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    /// Number of distinct (state, event) dispatches.
    pub fn transition_count(&self) -> usize {
        self.transitions.len()
    }

    /// True if the given machine type entered the given state.
    pub fn visited_state(&self, machine_type: &str, state: &str) -> bool {
        self.states
            .iter()
            .any(|(m, s)| m == machine_type && *s == state)
    }

    /// True if the given machine type dispatched `kind` in `state`.
    pub fn visited_transition(&self, machine_type: &str, state: &str, kind: &str) -> bool {
        self.transitions
            .iter()
            .any(|(m, s, k)| m == machine_type && *s == state && *k == kind)
    }

    /// Merge another coverage set into this one.
    pub(crate) fn merge(&mut self, other: &ActivityCoverage) {
        self.states.extend(other.states.iter().cloned());
        self.transitions.extend(other.transitions.iter().cloned());
    }
}

impl fmt::Display for ActivityCoverage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "activity coverage: {} states, {} transitions",
            self.states.len(),
            self.transitions.len()
        )?;
        for (machine, state) in &self.states {
            writeln!(f, "  state {machine}.{state}")?;
        }
        for (machine, state, kind) in &self.transitions {
            writeln!(f, "  transition {machine}.{state} on '{kind}'")?;
        }
        Ok(())
    }
}

/// Shared recorder; one per runtime instance.
#[derive(Default)]
pub(crate) struct CoverageRegistry {
    data: Mutex<ActivityCoverage>,
}

impl CoverageRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_state(&self, machine_type: &'static str, state: StateName) {
        let short = machine_type.rsplit("::").next().unwrap_or(machine_type);
        self.data
            .lock()
            .expect("mutex not poisoned")
            .states
            .insert((short.to_string(), state.name()));
    }

    pub(crate) fn record_transition(
        &self,
        machine_type: &'static str,
        state: StateName,
        kind: EventKind,
    ) {
        let short = machine_type.rsplit("::").next().unwrap_or(machine_type);
        self.data
            .lock()
            .expect("mutex not poisoned")
            .transitions
            .insert((short.to_string(), state.name(), kind.name()));
    }

    pub(crate) fn snapshot(&self) -> ActivityCoverage {
        self.data.lock().expect("mutex not poisoned").clone()
    }
}
