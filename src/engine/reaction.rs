//! Per-instance reaction state.
//!
//! A reaction instance is one dynamic occurrence of a `React` node. Its
//! recorded current value survives across passes; whether a pass re-fires
//! the update expression or replays the recorded value is decided against
//! the triggering emission number.

use rustc_hash::FxHashMap;

use crate::engine::value::Value;
use crate::syntax::NodeId;

/// Identity of a reaction instance: creating node + dynamic occurrence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ReactionKey {
    pub node: NodeId,
    pub occurrence: u32,
}

/// State carried by a live reaction instance.
#[derive(Clone, Debug)]
pub struct ReactionState {
    /// Value produced by the most recent fire (initial or update).
    pub current: Value,
    /// Highest emission number of the trigger stream consumed so far.
    pub seen: u64,
}

/// Outcome of `ReactChoose`, consumed by `ReactCommit` in the same frame.
#[derive(Clone, Copy, Debug)]
pub struct ReactionDecision {
    pub key: ReactionKey,
    /// `Some(n)` when the body result must be recorded with `seen = n`;
    /// `None` when the pass replayed the existing current value.
    pub commit: Option<u64>,
}

/// All live reaction instances, keyed by `(node, occurrence)`.
#[derive(Debug, Default)]
pub struct ReactionTable {
    states: FxHashMap<ReactionKey, ReactionState>,
}

impl ReactionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: ReactionKey) -> Option<&ReactionState> {
        self.states.get(&key)
    }

    pub fn record(&mut self, key: ReactionKey, current: Value, seen: u64) {
        self.states.insert(key, ReactionState { current, seen });
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinct_occurrences_hold_distinct_state() {
        let mut table = ReactionTable::new();
        let first = ReactionKey { node: NodeId(7), occurrence: 0 };
        let second = ReactionKey { node: NodeId(7), occurrence: 1 };

        table.record(first, Value::number(NodeId(7), 1.0), 0);
        table.record(second, Value::number(NodeId(7), 2.0), 0);

        assert_eq!(table.len(), 2);
        assert_ne!(
            table.get(first).unwrap().current,
            table.get(second).unwrap().current
        );
    }

    #[test]
    fn record_replaces_previous_state() {
        let mut table = ReactionTable::new();
        let key = ReactionKey { node: NodeId(3), occurrence: 0 };

        table.record(key, Value::number(NodeId(3), 1.0), 0);
        table.record(key, Value::number(NodeId(3), 2.0), 1);

        let state = table.get(key).unwrap();
        assert_eq!(state.seen, 1);
        assert_eq!(state.current, Value::number(NodeId(3), 2.0));
    }
}
