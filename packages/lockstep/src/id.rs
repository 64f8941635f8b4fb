//! Machine identity.
//!
//! A [`MachineId`] is a stable, equality-comparable handle for a machine.
//! Ids are issued from a per-runtime monotonic counter and stamped with the
//! runtime's generation, so `(value, generation)` is globally unique and an
//! id from one checker iteration can never be confused with an id from
//! another.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A stable identifier for a machine.
///
/// Bound to at most one machine over its lifetime; after that machine halts
/// the id cannot be rebound or reused.
#[derive(Clone)]
pub struct MachineId {
    value: u64,
    generation: u64,
    kind: &'static str,
    friendly: Option<Arc<str>>,
    endpoint: Option<Arc<str>>,
}

impl MachineId {
    pub(crate) fn new(
        value: u64,
        generation: u64,
        kind: &'static str,
        friendly: Option<Arc<str>>,
        endpoint: Option<Arc<str>>,
    ) -> Self {
        Self {
            value,
            generation,
            kind,
            friendly,
            endpoint,
        }
    }

    /// The monotonic value component.
    pub fn value(&self) -> u64 {
        self.value
    }

    /// The owning runtime's generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The machine type's name.
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// The optional friendly name given at creation.
    pub fn friendly_name(&self) -> Option<&str> {
        self.friendly.as_deref()
    }

    /// The optional endpoint label.
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    /// Short type name without module path, for display.
    fn short_kind(&self) -> &'static str {
        self.kind.rsplit("::").next().unwrap_or(self.kind)
    }
}

// Identity is (value, generation); names and labels are decoration.
impl PartialEq for MachineId {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value && self.generation == other.generation
    }
}

impl Eq for MachineId {}

impl Hash for MachineId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value.hash(state);
        self.generation.hash(state);
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.friendly {
            Some(name) => write!(f, "{name}({})", self.value),
            None => write!(f, "{}({})", self.short_kind(), self.value),
        }
    }
}

impl fmt::Debug for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MachineId")
            .field("value", &self.value)
            .field("generation", &self.generation)
            .field("kind", &self.short_kind())
            .finish_non_exhaustive()
    }
}

/// Per-runtime id issuer.
///
/// Value 0 is reserved for the controlled backend's test harness operation.
pub(crate) struct IdSource {
    counter: AtomicU64,
    generation: u64,
}

impl IdSource {
    pub(crate) fn new(generation: u64) -> Self {
        Self {
            counter: AtomicU64::new(1),
            generation,
        }
    }

    pub(crate) fn issue(
        &self,
        kind: &'static str,
        friendly: Option<Arc<str>>,
        endpoint: Option<Arc<str>>,
    ) -> MachineId {
        let value = self.counter.fetch_add(1, Ordering::Relaxed);
        MachineId::new(value, self.generation, kind, friendly, endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_monotonic_and_unique() {
        let source = IdSource::new(1);
        let a = source.issue("test::Client", None, None);
        let b = source.issue("test::Client", None, None);
        assert_ne!(a, b);
        assert!(b.value() > a.value());
    }

    #[test]
    fn test_equality_is_value_and_generation() {
        let a = MachineId::new(1, 1, "x::A", None, None);
        let same = MachineId::new(1, 1, "y::B", Some("other".into()), None);
        let other_gen = MachineId::new(1, 2, "x::A", None, None);
        assert_eq!(a, same);
        assert_ne!(a, other_gen);
    }

    #[test]
    fn test_display_uses_friendly_name() {
        let plain = MachineId::new(7, 1, "demo::machines::Server", None, None);
        assert_eq!(plain.to_string(), "Server(7)");

        let named = MachineId::new(8, 1, "demo::machines::Server", Some("primary".into()), None);
        assert_eq!(named.to_string(), "primary(8)");
    }

    #[test]
    fn test_hash_matches_equality() {
        use std::collections::HashSet;

        let mut set = HashSet::new();
        set.insert(MachineId::new(1, 1, "a", None, None));
        set.insert(MachineId::new(1, 1, "b", None, None));
        set.insert(MachineId::new(2, 1, "a", None, None));
        assert_eq!(set.len(), 2);
    }
}
