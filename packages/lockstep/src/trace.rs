//! Append-only schedule traces.
//!
//! Every decision the controlled scheduler makes (which operation runs next,
//! which boolean or integer a nondeterministic choice returned) is recorded
//! as a [`Decision`]. The resulting [`ScheduleTrace`] is sufficient to replay
//! an execution deterministically with the `Replay` strategy, and it
//! round-trips through JSON so a failing schedule can be stored next to the
//! test that found it.

use serde::{Deserialize, Serialize};

/// The externally visible operation a scheduled step performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    /// A machine creation is pending.
    Create,
    /// The operation will enqueue or process an event.
    Send,
    /// The operation resumes from (or enters) a blocking receive.
    Receive,
    /// The operation is halting or going idle.
    Stop,
}

/// A single recorded scheduler decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    /// The strategy chose which operation runs next.
    Schedule {
        /// Operation id of the chosen schedulable (machine id value; 0 is the
        /// test harness).
        op: u64,
        /// What the chosen operation was about to do.
        point: OperationKind,
    },
    /// A nondeterministic boolean choice.
    Boolean { value: bool },
    /// A nondeterministic integer choice.
    Integer { value: u64 },
}

/// An append-only sequence of scheduler decisions.
///
/// The index of a decision in the sequence is its step offset; bug reports
/// reference offsets into the trace that produced them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleTrace {
    decisions: Vec<Decision>,
}

impl ScheduleTrace {
    /// Create an empty trace.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a decision.
    pub(crate) fn push(&mut self, decision: Decision) {
        self.decisions.push(decision);
    }

    /// Number of recorded decisions.
    pub fn len(&self) -> usize {
        self.decisions.len()
    }

    /// True if no decisions have been recorded.
    pub fn is_empty(&self) -> bool {
        self.decisions.is_empty()
    }

    /// The decision at `index`, if recorded.
    pub fn get(&self, index: usize) -> Option<&Decision> {
        self.decisions.get(index)
    }

    /// Iterate over the recorded decisions in order.
    pub fn iter(&self) -> impl Iterator<Item = &Decision> {
        self.decisions.iter()
    }

    /// Serialize the trace to its replayable JSON form.
    pub fn to_json(&self) -> String {
        // A trace is plain data; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Parse a trace from its replayable JSON form.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_records_in_order() {
        let mut trace = ScheduleTrace::new();
        trace.push(Decision::Schedule {
            op: 1,
            point: OperationKind::Create,
        });
        trace.push(Decision::Boolean { value: true });
        trace.push(Decision::Schedule {
            op: 2,
            point: OperationKind::Send,
        });

        assert_eq!(trace.len(), 3);
        assert_eq!(
            trace.get(1),
            Some(&Decision::Boolean { value: true })
        );
    }

    #[test]
    fn test_trace_json_round_trip() {
        let mut trace = ScheduleTrace::new();
        trace.push(Decision::Schedule {
            op: 0,
            point: OperationKind::Send,
        });
        trace.push(Decision::Integer { value: 7 });
        trace.push(Decision::Schedule {
            op: 3,
            point: OperationKind::Receive,
        });

        let json = trace.to_json();
        let parsed = ScheduleTrace::from_json(&json).expect("valid trace json");
        assert_eq!(parsed, trace);
    }

    #[test]
    fn test_empty_trace() {
        let trace = ScheduleTrace::new();
        assert!(trace.is_empty());
        assert_eq!(trace.get(0), None);

        let parsed = ScheduleTrace::from_json(&trace.to_json()).expect("valid");
        assert!(parsed.is_empty());
    }
}
