//! Stream registry: stable identity for streams across re-evaluation.
//!
//! Keyed by `(creating node, occurrence)`, never by pointer identity, so
//! re-walking the same program text resolves to the same live stream and a
//! different dynamic occurrence mints a distinct one.

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::engine::SourceId;
use crate::engine::stream::{Stream, StreamKey};

/// Owner of every live stream plus the subscription table that maps a
/// stream to the sources re-evaluated by its emissions.
#[derive(Debug, Default)]
pub struct StreamRegistry {
    streams: FxHashMap<StreamKey, Stream>,
    subscribers: FxHashMap<StreamKey, Vec<SourceId>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the stream registered under `key`, creating and registering
    /// `factory()` on first encounter. The boolean reports creation, which
    /// is the caller's cue to run start-side effects exactly once.
    pub fn get_or_create(
        &mut self,
        key: StreamKey,
        factory: impl FnOnce() -> Stream,
    ) -> (&mut Stream, bool) {
        let mut created = false;
        let stream = self.streams.entry(key).or_insert_with(|| {
            created = true;
            factory()
        });
        if created {
            debug!(node = key.node.0, occurrence = key.occurrence, "stream created");
        }
        (stream, created)
    }

    pub fn get(&self, key: StreamKey) -> Option<&Stream> {
        self.streams.get(&key)
    }

    pub fn get_mut(&mut self, key: StreamKey) -> Option<&mut Stream> {
        self.streams.get_mut(&key)
    }

    /// Record that `source` must re-evaluate when `key` emits.
    pub fn subscribe(&mut self, key: StreamKey, source: SourceId) {
        let subscribers = self.subscribers.entry(key).or_default();
        if !subscribers.contains(&source) {
            subscribers.push(source);
        }
    }

    pub fn subscribers(&self, key: StreamKey) -> &[SourceId] {
        self.subscribers
            .get(&key)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Stop every stream. Idempotent; the streams stay registered so late
    /// emissions can be recognized (and dropped) by key.
    pub fn stop_all(&mut self) {
        for stream in self.streams.values_mut() {
            stream.stop();
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = StreamKey> + '_ {
        self.streams.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syntax::{NodeId, SourceKind};

    fn key(node: u32, occurrence: u32) -> StreamKey {
        StreamKey { node: NodeId(node), occurrence }
    }

    fn clock(key: StreamKey) -> Stream {
        Stream::new(key, SourceKind::Clock { interval_ms: 100.0 }, 8)
    }

    #[test]
    fn same_key_resolves_to_same_stream() {
        let mut registry = StreamRegistry::new();
        let k = key(5, 0);

        let (first, created) = registry.get_or_create(k, || clock(k));
        assert!(created);
        let first_id = first.debug_id();

        let (again, created) = registry.get_or_create(k, || clock(k));
        assert!(!created);
        assert_eq!(again.debug_id(), first_id);
    }

    #[test]
    fn different_occurrence_mints_distinct_stream() {
        let mut registry = StreamRegistry::new();
        let (first, _) = registry.get_or_create(key(5, 0), || clock(key(5, 0)));
        let first_id = first.debug_id();
        let (second, created) = registry.get_or_create(key(5, 1), || clock(key(5, 1)));

        assert!(created);
        assert_ne!(second.debug_id(), first_id);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn subscriptions_deduplicate() {
        let mut registry = StreamRegistry::new();
        let k = key(1, 0);
        registry.subscribe(k, SourceId(0));
        registry.subscribe(k, SourceId(0));
        registry.subscribe(k, SourceId(1));

        assert_eq!(registry.subscribers(k), &[SourceId(0), SourceId(1)]);
    }

    #[test]
    fn stop_all_cascades() {
        let mut registry = StreamRegistry::new();
        for occurrence in 0..3 {
            let k = key(2, occurrence);
            let (stream, _) = registry.get_or_create(k, || clock(k));
            stream.start();
        }

        registry.stop_all();
        registry.stop_all();
        assert!(registry.keys().all(|k| !registry.get(k).unwrap().is_running()));
    }
}
