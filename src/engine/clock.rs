//! Virtual clock driving clock streams deterministically.
//!
//! Time only advances when the host asks it to, so timer-driven programs
//! run instantly and reproducibly in tests and headless hosts. Real-time
//! hosts advance it from their frame loop.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::engine::stream::StreamKey;

/// Pending tick for one clock stream.
#[derive(Debug, Clone)]
struct TickEntry {
    /// When the tick fires (virtual time in ms).
    fire_at_ms: u64,
    key: StreamKey,
    /// Interval for re-scheduling.
    interval_ms: f64,
}

impl PartialEq for TickEntry {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at_ms == other.fire_at_ms
    }
}

impl Eq for TickEntry {}

impl PartialOrd for TickEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TickEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap: smaller fire_at_ms comes first
        other.fire_at_ms.cmp(&self.fire_at_ms)
    }
}

/// Deadline heap over all registered clock streams.
#[derive(Debug, Default)]
pub struct VirtualClock {
    current_time_ms: u64,
    pending: BinaryHeap<TickEntry>,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now_ms(&self) -> u64 {
        self.current_time_ms
    }

    /// Schedule the first tick of a clock stream.
    pub fn register(&mut self, key: StreamKey, interval_ms: f64) {
        let fire_at_ms = self.current_time_ms + interval_ms.max(1.0) as u64;
        self.pending.push(TickEntry { fire_at_ms, key, interval_ms });
    }

    /// Advance virtual time, returning every `(stream, fire time)` that came
    /// due, in firing order. Repeating ticks are re-scheduled immediately so
    /// cascading fires land within a single advance.
    pub fn advance_by(&mut self, ms: u64) -> Vec<(StreamKey, u64)> {
        let target_time = self.current_time_ms + ms;
        let mut fired = Vec::new();

        while let Some(entry) = self.pending.peek() {
            if entry.fire_at_ms > target_time {
                break;
            }
            let entry = self.pending.pop().expect("peeked entry present");
            fired.push((entry.key, entry.fire_at_ms));
            self.pending.push(TickEntry {
                fire_at_ms: entry.fire_at_ms + entry.interval_ms.max(1.0) as u64,
                key: entry.key,
                interval_ms: entry.interval_ms,
            });
        }

        self.current_time_ms = target_time;
        fired
    }

    pub fn has_pending_ticks(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Time until the next tick fires, if any clock is registered.
    pub fn time_to_next_tick(&self) -> Option<u64> {
        self.pending
            .peek()
            .map(|entry| entry.fire_at_ms.saturating_sub(self.current_time_ms))
    }

    /// Drop every pending tick. Used by evaluator teardown.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syntax::NodeId;

    fn key() -> StreamKey {
        StreamKey { node: NodeId(0), occurrence: 0 }
    }

    #[test]
    fn starts_at_zero() {
        let clock = VirtualClock::new();
        assert_eq!(clock.now_ms(), 0);
        assert!(clock.time_to_next_tick().is_none());
    }

    #[test]
    fn tick_fires_at_deadline() {
        let mut clock = VirtualClock::new();
        clock.register(key(), 1000.0);

        assert!(clock.advance_by(500).is_empty());
        let fired = clock.advance_by(500);
        assert_eq!(fired, vec![(key(), 1000)]);

        // Re-scheduled: fires again one interval later.
        let fired = clock.advance_by(1000);
        assert_eq!(fired, vec![(key(), 2000)]);
    }

    #[test]
    fn multiple_fires_in_single_advance() {
        let mut clock = VirtualClock::new();
        clock.register(key(), 100.0);

        let fired = clock.advance_by(350);
        assert_eq!(fired.len(), 3);
        assert_eq!(fired[0].1, 100);
        assert_eq!(fired[2].1, 300);
    }

    #[test]
    fn time_to_next_tick_tracks_advance() {
        let mut clock = VirtualClock::new();
        clock.register(key(), 1000.0);
        assert_eq!(clock.time_to_next_tick(), Some(1000));

        clock.advance_by(300);
        assert_eq!(clock.time_to_next_tick(), Some(700));
    }
}
