//! Streams: named, time-ordered external inputs.
//!
//! A stream's semantic identity is its `(creating node, occurrence)` key;
//! the ulid is a debug identity for logs and monitoring only. External
//! drivers never touch streams directly; they emit `Sample`s through a
//! `DriverHandle`, which marshals onto the single evaluation thread via the
//! evaluator's emission channel.

use std::collections::VecDeque;
use std::sync::Arc;

use futures_channel::mpsc;
use ulid::Ulid;

use crate::engine::value::{Exception, Value, ValueKind};
use crate::syntax::{NodeId, SourceKind, Unit};

/// Identity of a live stream: creating node + per-pass occurrence index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub node: NodeId,
    pub occurrence: u32,
}

/// Plain reading emitted by an external driver.
///
/// Drivers may live on other threads, so samples carry no engine-internal
/// sharing; they become `Value`s on the evaluation thread.
#[derive(Clone, Debug, PartialEq)]
pub enum Sample {
    Number { magnitude: f64, unit: Option<Unit> },
    Text(String),
    Bool(bool),
    None,
    List(Vec<Sample>),
    Structure { type_name: String, fields: Vec<(String, Sample)> },
    /// Driver-level failure (rejected permission, failed fetch). Becomes an
    /// exception value and flows through the same channel as any reading.
    Error(String),
}

impl Sample {
    pub fn milliseconds(magnitude: f64) -> Self {
        Sample::Number { magnitude, unit: Some(Unit::Milliseconds) }
    }

    /// Convert to a value attributed to the stream's creating node.
    pub fn into_value(self, origin: NodeId) -> Value {
        match self {
            Sample::Number { magnitude, unit } => {
                Value::new(origin, ValueKind::Number { magnitude, unit })
            }
            Sample::Text(text) => Value::text(origin, text.as_str()),
            Sample::Bool(b) => Value::boolean(origin, b),
            Sample::None => Value::none(origin),
            Sample::List(items) => {
                let items = items.into_iter().map(|s| s.into_value(origin)).collect();
                Value::new(origin, ValueKind::List(Arc::new(items)))
            }
            Sample::Structure { type_name, fields } => {
                let fields = fields
                    .into_iter()
                    .map(|(name, sample)| {
                        (Arc::<str>::from(name.as_str()), sample.into_value(origin))
                    })
                    .collect();
                Value::new(
                    origin,
                    ValueKind::Structure {
                        type_name: type_name.as_str().into(),
                        fields: Arc::new(fields),
                    },
                )
            }
            Sample::Error(message) => Value::exception(
                origin,
                Exception::Message { message: message.as_str().into() },
            ),
        }
    }
}

/// One driver notification in flight to the evaluation thread.
#[derive(Clone, Debug)]
pub struct Emission {
    pub key: StreamKey,
    pub sample: Sample,
}

/// Clone-able handle an external driver uses to feed a stream.
///
/// All feedback (device callbacks, network completions, physics-computed
/// motion) enters through this one path; there is no privileged
/// back-channel into the engine.
#[derive(Clone, Debug)]
pub struct DriverHandle {
    key: StreamKey,
    sender: mpsc::UnboundedSender<Emission>,
}

impl DriverHandle {
    pub(crate) fn new(key: StreamKey, sender: mpsc::UnboundedSender<Emission>) -> Self {
        Self { key, sender }
    }

    pub fn key(&self) -> StreamKey {
        self.key
    }

    /// Enqueue a reading. Returns `false` when the evaluator is gone; the
    /// reading is dropped either way once the stream has been stopped.
    pub fn emit(&self, sample: Sample) -> bool {
        self.sender
            .unbounded_send(Emission { key: self.key, sample })
            .is_ok()
    }
}

/// A live stream instance.
#[derive(Debug)]
pub struct Stream {
    key: StreamKey,
    debug_id: Ulid,
    source: SourceKind,
    readings: VecDeque<Value>,
    history_bound: usize,
    latest: Option<Value>,
    emission_count: u64,
    running: bool,
    start_count: u32,
}

impl Stream {
    pub fn new(key: StreamKey, source: SourceKind, history_bound: usize) -> Self {
        Self {
            key,
            debug_id: Ulid::new(),
            source,
            readings: VecDeque::new(),
            history_bound,
            latest: None,
            emission_count: 0,
            running: false,
            start_count: 0,
        }
    }

    pub fn key(&self) -> StreamKey {
        self.key
    }

    pub fn debug_id(&self) -> Ulid {
        self.debug_id
    }

    pub fn source(&self) -> &SourceKind {
        &self.source
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn latest(&self) -> Option<&Value> {
        self.latest.as_ref()
    }

    pub fn emission_count(&self) -> u64 {
        self.emission_count
    }

    /// How many times `start` actually started the stream. Stays at one for
    /// the stream's whole life unless it is explicitly restarted.
    pub fn start_count(&self) -> u32 {
        self.start_count
    }

    pub fn readings(&self) -> impl Iterator<Item = &Value> {
        self.readings.iter()
    }

    /// Begin producing. A no-op while already running.
    pub fn start(&mut self) {
        if !self.running {
            self.running = true;
            self.start_count += 1;
        }
    }

    /// Stop producing and release the external driver. Idempotent; late
    /// `add` calls after this return `None` and change nothing.
    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Append a reading, update `latest`, and return the emission number.
    /// Readings on a stopped stream are refused.
    pub fn add(&mut self, value: Value) -> Option<u64> {
        if !self.running {
            return None;
        }
        self.emission_count += 1;
        self.readings.push_back(value.clone());
        while self.readings.len() > self.history_bound {
            self.readings.pop_front();
        }
        self.latest = Some(value);
        Some(self.emission_count)
    }

    /// Reading strict consumers see before any emission, when the source
    /// defines one. Clocks start at zero; device and network streams stay
    /// silent until their driver speaks.
    pub fn initial_value(&self) -> Option<Value> {
        match self.source {
            SourceKind::Clock { .. } => Some(Value::number_with_unit(
                self.key.node,
                0.0,
                Unit::Milliseconds,
            )),
            _ => None,
        }
    }

    /// Whether every present-time read must produce a fresh value.
    pub fn is_sampled(&self) -> bool {
        matches!(self.source, SourceKind::Random)
    }

    /// Draw a fresh sample and record it as a reading. Only meaningful for
    /// sampled sources, and only called while evaluating in the present;
    /// history inspection never reaches this path.
    pub fn sample_fresh(&mut self) -> Value {
        let value = Value::number(self.key.node, random_unit());
        self.emission_count += 1;
        self.readings.push_back(value.clone());
        while self.readings.len() > self.history_bound {
            self.readings.pop_front();
        }
        self.latest = Some(value.clone());
        value
    }
}

/// Uniform draw from [0, 1).
fn random_unit() -> f64 {
    let mut bytes = [0u8; 8];
    if getrandom::fill(&mut bytes).is_err() {
        // Entropy source unavailable; degrade to a fixed midpoint rather
        // than failing evaluation.
        return 0.5;
    }
    let bits = u64::from_le_bytes(bytes) >> 11;
    bits as f64 / (1u64 << 53) as f64
}
