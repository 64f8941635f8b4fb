//! Program-state fingerprints and the visited-state cache.
//!
//! A fingerprint is a content hash over the ordered tuple of per-machine
//! cached state (state stack, deliverable inbox kinds, flags) plus every
//! monitor's current state. Equal fingerprints imply equal cached state;
//! hash collisions are accepted as a false-positive risk, the same trade the
//! partial visited-state representation makes in exhaustive model checkers.
//!
//! The cache serves two purposes:
//! - counting distinct program states visited (`cache_program_state`);
//! - cycle-based liveness detection (`cycle_detection`): revisiting a
//!   fingerprint with the same enabled set, with a monitor hot at both
//!   visits and no hot-to-cold discharge in between, is a lasso on which the
//!   obligation can never be met.

use std::collections::HashMap;

/// Verdict for one observed program state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CycleVerdict {
    /// First visit.
    New,
    /// Seen before, but no open liveness obligation spans the cycle.
    Revisited,
    /// Seen before with the same enabled set and discharge epoch while a
    /// monitor is hot: a liveness lasso.
    HotCycle,
}

struct CacheEntry {
    enabled_hash: u64,
    epoch: u64,
    hot: bool,
}

/// Bounded-per-iteration cache of visited fingerprints.
#[derive(Default)]
pub(crate) struct StateCache {
    seen: HashMap<u64, CacheEntry>,
}

impl StateCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Observe the current program state.
    ///
    /// `epoch` counts hot-to-cold discharges; a repeat fingerprint only
    /// closes a hot cycle if no discharge happened between the visits.
    pub(crate) fn observe(
        &mut self,
        fingerprint: u64,
        enabled_hash: u64,
        epoch: u64,
        hot: bool,
    ) -> CycleVerdict {
        match self.seen.get(&fingerprint) {
            None => {
                self.seen.insert(
                    fingerprint,
                    CacheEntry {
                        enabled_hash,
                        epoch,
                        hot,
                    },
                );
                CycleVerdict::New
            }
            Some(entry) => {
                if hot && entry.hot && entry.enabled_hash == enabled_hash && entry.epoch == epoch {
                    CycleVerdict::HotCycle
                } else {
                    CycleVerdict::Revisited
                }
            }
        }
    }

    /// Number of distinct fingerprints observed.
    pub(crate) fn len(&self) -> usize {
        self.seen.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_visit_is_new() {
        let mut cache = StateCache::new();
        assert_eq!(cache.observe(1, 10, 0, false), CycleVerdict::New);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_cold_revisit_is_not_a_cycle() {
        let mut cache = StateCache::new();
        cache.observe(1, 10, 0, false);
        assert_eq!(cache.observe(1, 10, 0, false), CycleVerdict::Revisited);
    }

    #[test]
    fn test_hot_revisit_same_epoch_is_a_cycle() {
        let mut cache = StateCache::new();
        cache.observe(7, 10, 0, true);
        assert_eq!(cache.observe(7, 10, 0, true), CycleVerdict::HotCycle);
    }

    #[test]
    fn test_discharge_between_visits_breaks_the_cycle() {
        let mut cache = StateCache::new();
        cache.observe(7, 10, 0, true);
        // A hot-to-cold transition bumped the epoch before the revisit.
        assert_eq!(cache.observe(7, 10, 1, true), CycleVerdict::Revisited);
    }

    #[test]
    fn test_different_enabled_set_breaks_the_cycle() {
        let mut cache = StateCache::new();
        cache.observe(7, 10, 0, true);
        assert_eq!(cache.observe(7, 11, 0, true), CycleVerdict::Revisited);
    }
}
