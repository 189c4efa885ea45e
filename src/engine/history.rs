//! Append-only history of whole-program results.
//!
//! Each completed evaluation pass records every source's root value under a
//! monotonically increasing evaluation index. Time travel (undo/redo,
//! scrubbing) is pure index movement over this log; the evaluator is never
//! run backward and recorded entries are never mutated.

use tracing::error;

use crate::engine::SourceId;
use crate::engine::value::Value;

/// One recorded snapshot: the root value of every source at that index.
#[derive(Clone, Debug)]
pub struct HistoryEntry {
    index: u64,
    values: Vec<(SourceId, Value)>,
}

impl HistoryEntry {
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn value_for(&self, source: SourceId) -> Option<&Value> {
        self.values
            .iter()
            .find(|(id, _)| *id == source)
            .map(|(_, value)| value)
    }

    pub fn values(&self) -> &[(SourceId, Value)] {
        &self.values
    }
}

/// The log itself. Grows monotonically while live; cleared only on full
/// teardown (drop).
#[derive(Debug, Default)]
pub struct History {
    entries: Vec<HistoryEntry>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a snapshot. `index` must be the next unused index; a gap or
    /// reuse is an internal invariant violation, logged and refused rather
    /// than corrupting the log.
    pub fn record(&mut self, index: u64, values: Vec<(SourceId, Value)>) {
        if index != self.entries.len() as u64 {
            error!(index, expected = self.entries.len(), "non-monotonic history record refused");
            return;
        }
        self.entries.push(HistoryEntry { index, values });
    }

    /// Snapshot at `index`. Stable: the same entry on every call.
    pub fn at(&self, index: u64) -> Option<&HistoryEntry> {
        self.entries.get(index as usize)
    }

    /// Index of the newest entry, if any.
    pub fn latest_index(&self) -> Option<u64> {
        self.entries.last().map(HistoryEntry::index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }
}
