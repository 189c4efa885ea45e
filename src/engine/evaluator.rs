//! The evaluator: orchestrates frames, streams, reactions, and history.
//!
//! All program state is mutated on this one thread. External drivers reach
//! the engine only through the emission channel, drained at the evaluator's
//! own entry points (`step`, `flush`, `advance_clock`), so emissions are
//! processed strictly in delivery order and no two passes ever interleave.

use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;

use futures_channel::mpsc;
use rustc_hash::FxHashMap;
use tracing::{debug, error, trace, warn};

use crate::basis::BasisRegistry;
use crate::engine::SourceId;
use crate::engine::clock::VirtualClock;
use crate::engine::frame::{Frame, FrameState, Scope};
use crate::engine::history::{History, HistoryEntry};
use crate::engine::reaction::{ReactionDecision, ReactionKey, ReactionTable};
use crate::engine::registry::StreamRegistry;
use crate::engine::snapshot::HistorySnapshot;
use crate::engine::step::Step;
use crate::engine::stream::{DriverHandle, Emission, Sample, Stream, StreamKey};
use crate::engine::value::{Closure, Exception, Value, ValueKind, compare_numbers};
use crate::syntax::{BinaryOp, ExprKind, Node, NodeId, SourceKind, UnaryOp, Unit};

/// Host-level API misuse. Language-level failures are Exception values and
/// never surface here.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("evaluator already stopped")]
    Stopped,
    #[error("no stream registered under ({0:?})")]
    UnknownStream(StreamKey),
    #[error("history index {0} was never recorded")]
    UnrecordedIndex(u64),
}

/// Evaluation limits and bounds.
#[derive(Clone, Copy, Debug)]
pub struct EvaluatorOptions {
    /// Maximum frame stack depth per pass.
    pub max_frames: usize,
    /// Readings retained per stream.
    pub stream_history: usize,
}

impl Default for EvaluatorOptions {
    fn default() -> Self {
        Self { max_frames: 512, stream_history: 64 }
    }
}

/// Where reads are answered from: the live frontier or a scrubbed index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Cursor {
    Live,
    At(u64),
}

/// An in-flight (possibly suspended) evaluation pass of one source.
struct PassRun {
    frames: Vec<Frame>,
    /// Per-pass dynamic occurrence counters, keyed by creating node.
    occurrences: FxHashMap<NodeId, u32>,
    /// The emission that caused this pass, if it is a reactive one.
    trigger: Option<(StreamKey, u64)>,
    /// Stream this pass is parked on, if suspended.
    waiting_on: Option<StreamKey>,
    /// Scope holding the pass's top-level binds; flattened on completion.
    root_scope: Rc<Scope>,
}

/// One top-level source hosted by the evaluator.
struct SourceState {
    root: Arc<Node>,
    label: Arc<str>,
    run: Option<PassRun>,
    /// Top-level bindings of the last completed pass; reaction updates
    /// resolve through these when a name is not yet bound in the new pass.
    previous_bindings: FxHashMap<Arc<str>, Value>,
    current: Option<Value>,
}

/// Scheduled work: one entry per pass, processed strictly in order.
#[derive(Clone, Copy, Debug)]
enum PassTrigger {
    Initial { source: SourceId },
    Resume { source: SourceId, key: StreamKey },
    Emission { source: SourceId, key: StreamKey, number: u64 },
}

enum DriveOutcome {
    Completed(Value),
    Suspended(StreamKey),
}

/// Result of executing one step against the current frame.
enum StepFlow {
    /// Optionally push a value, advance the cursor.
    Advance(Option<Value>),
    /// Push a child frame. `repeat` keeps the cursor on this step so it
    /// runs again when the child resolves (element-wise iteration).
    Push { node: Arc<Node>, scope: Rc<Scope>, repeat: bool },
    /// Park the pass until the stream produces a reading.
    Suspend(StreamKey),
}

/// Everything a step can touch besides its own frame.
struct StepCtx<'a> {
    options: &'a EvaluatorOptions,
    basis: &'a BasisRegistry,
    registry: &'a mut StreamRegistry,
    reactions: &'a mut ReactionTable,
    clock: &'a mut VirtualClock,
    source: SourceId,
    label: &'a Arc<str>,
    previous: &'a FxHashMap<Arc<str>, Value>,
    occurrences: &'a mut FxHashMap<NodeId, u32>,
    trigger: Option<(StreamKey, u64)>,
}

/// The reactive evaluator.
pub struct Evaluator {
    options: EvaluatorOptions,
    basis: BasisRegistry,
    sources: Vec<SourceState>,
    registry: StreamRegistry,
    reactions: ReactionTable,
    history: History,
    clock: VirtualClock,
    emissions_tx: mpsc::UnboundedSender<Emission>,
    emissions_rx: mpsc::UnboundedReceiver<Emission>,
    pending: VecDeque<PassTrigger>,
    eval_count: u64,
    cursor: Cursor,
    started: bool,
    stopped: bool,
}

impl Evaluator {
    pub fn new(basis: BasisRegistry) -> Self {
        Self::with_options(basis, EvaluatorOptions::default())
    }

    pub fn with_options(basis: BasisRegistry, options: EvaluatorOptions) -> Self {
        let (emissions_tx, emissions_rx) = mpsc::unbounded();
        Self {
            options,
            basis,
            sources: Vec::new(),
            registry: StreamRegistry::new(),
            reactions: ReactionTable::new(),
            history: History::new(),
            clock: VirtualClock::new(),
            emissions_tx,
            emissions_rx,
            pending: VecDeque::new(),
            eval_count: 0,
            cursor: Cursor::Live,
            started: false,
            stopped: false,
        }
    }

    /// Register a top-level source. Sources evaluate independently; an
    /// exception in one never disturbs its siblings.
    pub fn add_source(&mut self, root: Arc<Node>) -> SourceId {
        let id = SourceId(self.sources.len());
        self.sources.push(SourceState {
            root,
            label: format!("source-{}", id.0).into(),
            run: None,
            previous_bindings: FxHashMap::default(),
            current: None,
        });
        if self.started && !self.stopped {
            self.pending.push_back(PassTrigger::Initial { source: id });
        }
        id
    }

    /// Run the initial pass of every source. Idempotent while live.
    pub fn start(&mut self) -> Result<(), EngineError> {
        if self.stopped {
            return Err(EngineError::Stopped);
        }
        if self.started {
            return Ok(());
        }
        self.started = true;
        for index in 0..self.sources.len() {
            self.pending.push_back(PassTrigger::Initial { source: SourceId(index) });
        }
        self.flush();
        Ok(())
    }

    /// Drain driver emissions and run at most one pending pass.
    pub fn step(&mut self) -> bool {
        self.drain_emissions();
        match self.pending.pop_front() {
            Some(trigger) => {
                self.run_trigger(trigger);
                true
            }
            None => false,
        }
    }

    /// Run every pending pass (and any that arrive while doing so) to
    /// completion. Each emission keeps its own sequential pass.
    pub fn flush(&mut self) {
        loop {
            self.drain_emissions();
            let Some(trigger) = self.pending.pop_front() else {
                break;
            };
            self.run_trigger(trigger);
        }
    }

    /// Stop the evaluator: cascade `stop` to every stream, clear scheduled
    /// work, and abandon parked passes. Idempotent. History is retained
    /// until drop; late driver callbacks are dropped silently.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.registry.stop_all();
        self.clock.clear();
        self.pending.clear();
        for source in &mut self.sources {
            source.run = None;
        }
        debug!("evaluator stopped");
    }

    /// Advance virtual time, emitting due clock ticks through the same
    /// channel external drivers use. Call `flush` to process them.
    pub fn advance_clock(&mut self, ms: u64) {
        if self.stopped {
            return;
        }
        for (key, at_ms) in self.clock.advance_by(ms) {
            let running = self.registry.get(key).is_some_and(Stream::is_running);
            if !running {
                continue;
            }
            let emission = Emission { key, sample: Sample::milliseconds(at_ms as f64) };
            let _ = self.emissions_tx.unbounded_send(emission);
        }
    }

    /// Handle an external driver uses to feed `key`. The stream must exist,
    /// i.e. the program must have reached its creating node once.
    pub fn driver_handle(&self, key: StreamKey) -> Result<DriverHandle, EngineError> {
        if self.registry.get(key).is_none() {
            return Err(EngineError::UnknownStream(key));
        }
        Ok(DriverHandle::new(key, self.emissions_tx.clone()))
    }

    /// Current value of a source: the live frontier, or the scrubbed
    /// history entry while time-traveling.
    pub fn latest_value(&self, source: SourceId) -> Option<Value> {
        match self.cursor {
            Cursor::Live => self.sources.get(source.0)?.current.clone(),
            Cursor::At(index) => self.history.at(index)?.value_for(source).cloned(),
        }
    }

    /// Display string of `latest_value`, for the rendering layer.
    pub fn display_value(&self, source: SourceId) -> Option<String> {
        self.latest_value(source).map(|value| value.to_display_string())
    }

    /// Latest reading of a stream, for the rendering layer's per-stream
    /// subscription. Never samples; reading it is pure.
    pub fn stream_latest(&self, key: StreamKey) -> Option<Value> {
        self.registry.get(key)?.latest().cloned()
    }

    /// Shared view of a live stream (running flag, reading history) for the
    /// rendering/monitoring layer.
    pub fn stream(&self, key: StreamKey) -> Option<&Stream> {
        self.registry.get(key)
    }

    /// Keys of every live stream, in stable order.
    pub fn stream_keys(&self) -> Vec<StreamKey> {
        let mut keys: Vec<_> = self.registry.keys().collect();
        keys.sort_by_key(|key| (key.node, key.occurrence));
        keys
    }

    pub fn stream_count(&self) -> usize {
        self.registry.len()
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn history_at(&self, index: u64) -> Result<&HistoryEntry, EngineError> {
        self.history.at(index).ok_or(EngineError::UnrecordedIndex(index))
    }

    pub fn history_snapshot(&self) -> HistorySnapshot {
        HistorySnapshot::from_history(&self.history)
    }

    /// Index reads are answered from: the scrub position, or the frontier.
    pub fn current_history_index(&self) -> Option<u64> {
        match self.cursor {
            Cursor::Live => self.history.latest_index(),
            Cursor::At(index) => Some(index),
        }
    }

    /// Move reads to a recorded index. Pure index movement; nothing re-runs.
    pub fn scrub_to(&mut self, index: u64) -> Result<(), EngineError> {
        if self.history.at(index).is_none() {
            return Err(EngineError::UnrecordedIndex(index));
        }
        self.cursor = Cursor::At(index);
        Ok(())
    }

    /// Step one entry back in history.
    pub fn undo(&mut self) -> Option<u64> {
        let current = self.current_history_index()?;
        let target = current.checked_sub(1)?;
        self.cursor = Cursor::At(target);
        Some(target)
    }

    /// Step one entry forward; reaching the frontier resumes live reads.
    pub fn redo(&mut self) -> Option<u64> {
        let frontier = self.history.latest_index()?;
        match self.cursor {
            Cursor::Live => None,
            Cursor::At(index) if index < frontier => {
                let target = index + 1;
                self.cursor = if target == frontier { Cursor::Live } else { Cursor::At(target) };
                Some(target)
            }
            Cursor::At(_) => {
                self.cursor = Cursor::Live;
                None
            }
        }
    }

    /// Return reads to the live frontier.
    pub fn resume_live(&mut self) {
        self.cursor = Cursor::Live;
    }

    // --- Emission intake ---

    fn drain_emissions(&mut self) {
        while let Ok(Some(Emission { key, sample })) = self.emissions_rx.try_next() {
            if self.stopped {
                debug!(node = key.node.0, "emission after stop dropped");
                continue;
            }
            let Some(stream) = self.registry.get_mut(key) else {
                warn!(node = key.node.0, occurrence = key.occurrence, "emission for unknown stream dropped");
                continue;
            };
            let value = sample.into_value(key.node);
            let Some(number) = stream.add(value) else {
                trace!(node = key.node.0, "late emission on stopped stream dropped");
                continue;
            };

            let Self { sources, registry, pending, .. } = self;
            // Parked passes waiting on this stream resume first, then the
            // emission gets its own reactive pass per subscribed source.
            for (index, source) in sources.iter().enumerate() {
                if let Some(run) = &source.run {
                    if run.waiting_on == Some(key) {
                        pending.push_back(PassTrigger::Resume { source: SourceId(index), key });
                    }
                }
            }
            for &source in registry.subscribers(key) {
                if sources[source.0].run.is_none() {
                    pending.push_back(PassTrigger::Emission { source, key, number });
                }
            }
        }
    }

    // --- Pass machinery ---

    fn run_trigger(&mut self, trigger: PassTrigger) {
        match trigger {
            PassTrigger::Initial { source } => {
                if self.sources[source.0].run.is_some() {
                    warn!(source = source.0, "initial pass requested while a pass is in flight");
                    return;
                }
                self.begin_pass(source, None);
                self.drive_and_finish(source);
            }
            PassTrigger::Emission { source, key, number } => {
                if self.sources[source.0].run.is_some() {
                    // The parked pass will read the fresh latest when its
                    // own stream speaks; this emission keeps no pass.
                    trace!(source = source.0, "reactive pass skipped: source is suspended");
                    return;
                }
                self.begin_pass(source, Some((key, number)));
                self.drive_and_finish(source);
            }
            PassTrigger::Resume { source, key } => {
                let Some(run) = self.sources[source.0].run.as_mut() else {
                    return;
                };
                if run.waiting_on != Some(key) {
                    return;
                }
                run.waiting_on = None;
                if let Some(frame) = run.frames.last_mut() {
                    frame.state = FrameState::Active;
                }
                self.drive_and_finish(source);
            }
        }
    }

    fn begin_pass(&mut self, source: SourceId, trigger: Option<(StreamKey, u64)>) {
        let state = &mut self.sources[source.0];
        let frame = Frame::new(state.root.clone(), Scope::root());
        let root_scope = frame.scope.clone();
        state.run = Some(PassRun {
            frames: vec![frame],
            occurrences: FxHashMap::default(),
            trigger,
            waiting_on: None,
            root_scope,
        });
        trace!(source = source.0, reactive = trigger.is_some(), "pass started");
    }

    fn drive_and_finish(&mut self, source: SourceId) {
        match self.drive(source) {
            DriveOutcome::Completed(value) => self.finish_pass(source, value),
            DriveOutcome::Suspended(key) => {
                trace!(source = source.0, node = key.node.0, "pass suspended on silent stream");
            }
        }
    }

    /// Pop/execute steps until the stack empties or a step suspends.
    /// Re-entrant: a resumed pass continues at the exact frame and step it
    /// parked on, so completed side-effecting steps never run twice.
    fn drive(&mut self, source: SourceId) -> DriveOutcome {
        loop {
            let Self {
                options, basis, sources, registry, reactions, clock, ..
            } = self;
            let SourceState { run, previous_bindings, label, .. } = &mut sources[source.0];
            let run = run.as_mut().expect("pass in flight");

            let finished = run.frames.last().map(Frame::steps_exhausted);
            match finished {
                None => {
                    return DriveOutcome::Completed(internal_fault(
                        NodeId(0),
                        "frame stack drained without a result",
                    ));
                }
                Some(true) => {
                    let mut frame = run.frames.pop().expect("frame present");
                    let value = frame
                        .operands
                        .pop()
                        .unwrap_or_else(|| Value::none(frame.node.id));
                    frame.state = if value.is_exception() {
                        FrameState::Failed
                    } else {
                        FrameState::Resolved
                    };
                    match run.frames.last_mut() {
                        Some(parent) => parent.operands.push(value),
                        None => return DriveOutcome::Completed(value),
                    }
                    continue;
                }
                Some(false) => {}
            }

            let PassRun { frames, occurrences, trigger, waiting_on, .. } = run;
            let frame = frames.last_mut().expect("frame present");
            frame.state = FrameState::Active;
            let step = frame.steps[frame.cursor].clone();

            let mut ctx = StepCtx {
                options,
                basis,
                registry,
                reactions,
                clock,
                source,
                label,
                previous: previous_bindings,
                occurrences,
                trigger: *trigger,
            };

            match exec_step(&mut ctx, frame, step) {
                StepFlow::Advance(value) => {
                    if let Some(value) = value {
                        frame.operands.push(value);
                    }
                    frame.cursor += 1;
                }
                StepFlow::Push { node, scope, repeat } => {
                    if !repeat {
                        frame.cursor += 1;
                    }
                    if frames.len() >= options.max_frames {
                        let exception = Value::exception(
                            node.id,
                            Exception::Message {
                                message: format!(
                                    "evaluation depth limit of {} frames reached",
                                    options.max_frames
                                )
                                .into(),
                            },
                        );
                        frames
                            .last_mut()
                            .expect("frame present")
                            .operands
                            .push(exception);
                    } else {
                        frames.push(Frame::new(node, scope));
                    }
                }
                StepFlow::Suspend(key) => {
                    frame.state = FrameState::Suspended;
                    *waiting_on = Some(key);
                    return DriveOutcome::Suspended(key);
                }
            }
        }
    }

    fn finish_pass(&mut self, source: SourceId, value: Value) {
        let state = &mut self.sources[source.0];
        let run = state.run.take().expect("pass in flight");
        state.previous_bindings = run.root_scope.local_bindings();
        state.current = Some(value);

        let snapshot = self
            .sources
            .iter()
            .enumerate()
            .map(|(index, state)| {
                let value = state
                    .current
                    .clone()
                    .unwrap_or_else(|| Value::none(state.root.id));
                (SourceId(index), value)
            })
            .collect();
        self.history.record(self.eval_count, snapshot);
        trace!(source = source.0, index = self.eval_count, "pass recorded");
        self.eval_count += 1;
    }
}

impl std::fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Evaluator")
            .field("sources", &self.sources.len())
            .field("streams", &self.registry.len())
            .field("history", &self.history.len())
            .field("stopped", &self.stopped)
            .finish()
    }
}

// --- Step execution ---

fn next_occurrence(occurrences: &mut FxHashMap<NodeId, u32>, node: NodeId) -> u32 {
    let counter = occurrences.entry(node).or_insert(0);
    let occurrence = *counter;
    *counter += 1;
    occurrence
}

fn internal_fault(origin: NodeId, what: &str) -> Value {
    error!(detail = what, "internal invariant violation");
    Value::exception(
        origin,
        Exception::Message { message: format!("internal error: {what}").into() },
    )
}

/// Resolve a stream handle to a reading. Non-handles pass through.
/// `Err(key)` means the stream is silent and the pass must park.
fn read_stream(
    registry: &mut StreamRegistry,
    value: &Value,
    origin: NodeId,
) -> Result<Value, StreamKey> {
    let Some(key) = value.as_stream() else {
        return Ok(value.clone());
    };
    let Some(stream) = registry.get_mut(key) else {
        return Ok(internal_fault(origin, "stream handle without a registered stream"));
    };
    // Always-fresh sources produce a new reading on every present-time
    // read. Passes only ever run in the present; history inspection is a
    // pure log lookup and never reaches this path.
    if stream.is_sampled() && stream.is_running() {
        return Ok(stream.sample_fresh());
    }
    if let Some(latest) = stream.latest() {
        return Ok(latest.clone());
    }
    if let Some(initial) = stream.initial_value() {
        return Ok(initial);
    }
    Err(key)
}

fn value_exception(origin: NodeId, message: String) -> Value {
    Value::exception(origin, Exception::Value { message: message.into() })
}

/// A runtime kind check failed even though upstream checking passed.
fn type_exception(origin: NodeId, message: String) -> Value {
    Value::exception(origin, Exception::Type { message: message.into() })
}

fn exec_step(ctx: &mut StepCtx<'_>, frame: &mut Frame, step: Step) -> StepFlow {
    let node = frame.node.clone();
    match step {
        Step::Eval(child) => {
            StepFlow::Push { node: child, scope: frame.scope.clone(), repeat: false }
        }

        Step::Literal => {
            let value = match &node.kind {
                ExprKind::Number { magnitude, unit } => {
                    Value::new(node.id, ValueKind::Number { magnitude: *magnitude, unit: *unit })
                }
                ExprKind::Text(text) => Value::text(node.id, text.as_ref()),
                ExprKind::Bool(b) => Value::boolean(node.id, *b),
                ExprKind::NoneLiteral => Value::none(node.id),
                _ => internal_fault(node.id, "literal step on a non-literal node"),
            };
            StepFlow::Advance(Some(value))
        }

        Step::MakeList(count) => match take_operands(frame, count, node.id) {
            Ok(items) => StepFlow::Advance(Some(Value::new(
                node.id,
                ValueKind::List(Arc::new(items)),
            ))),
            Err(fault) => StepFlow::Advance(Some(fault)),
        },

        Step::MakeSet(count) => match take_operands(frame, count, node.id) {
            Ok(items) => StepFlow::Advance(Some(Value::new(
                node.id,
                ValueKind::Set(Arc::new(dedup_structural(items))),
            ))),
            Err(fault) => StepFlow::Advance(Some(fault)),
        },

        Step::MakeMap(count) => match take_operands(frame, count * 2, node.id) {
            Ok(flat) => {
                let mut entries: Vec<(Value, Value)> = Vec::with_capacity(count);
                let mut flat = flat.into_iter();
                while let (Some(key), Some(value)) = (flat.next(), flat.next()) {
                    match entries.iter_mut().find(|(k, _)| k.structural_eq(&key)) {
                        // Later duplicate keys win.
                        Some(entry) => entry.1 = value,
                        None => entries.push((key, value)),
                    }
                }
                StepFlow::Advance(Some(Value::new(node.id, ValueKind::Map(Arc::new(entries)))))
            }
            Err(fault) => StepFlow::Advance(Some(fault)),
        },

        Step::MakeStructure(count) => {
            let ExprKind::Structure { type_name, fields } = &node.kind else {
                return StepFlow::Advance(Some(internal_fault(
                    node.id,
                    "structure step on a non-structure node",
                )));
            };
            match take_operands(frame, count, node.id) {
                Ok(values) => {
                    let fields = fields
                        .iter()
                        .map(|(name, _)| name.clone())
                        .zip(values)
                        .collect::<Vec<_>>();
                    StepFlow::Advance(Some(Value::new(
                        node.id,
                        ValueKind::Structure {
                            type_name: type_name.clone(),
                            fields: Arc::new(fields),
                        },
                    )))
                }
                Err(fault) => StepFlow::Advance(Some(fault)),
            }
        }

        Step::GetField(field) => {
            let Some(top) = frame.operands.last() else {
                return StepFlow::Advance(Some(internal_fault(node.id, "field access without a subject")));
            };
            let subject = match read_stream(ctx.registry, top, node.id) {
                Ok(value) => value,
                Err(key) => return StepFlow::Suspend(key),
            };
            frame.operands.pop();
            if subject.is_exception() {
                return StepFlow::Advance(Some(subject));
            }
            let value = match subject.kind() {
                ValueKind::Structure { type_name, fields } => fields
                    .iter()
                    .find(|(name, _)| name.as_ref() == field.as_ref())
                    .map(|(_, value)| value.clone())
                    .unwrap_or_else(|| {
                        value_exception(node.id, format!("{type_name} has no field `{field}`"))
                    }),
                _ => value_exception(
                    node.id,
                    format!("field `{field}` of a non-structure {}", subject.to_display_string()),
                ),
            };
            StepFlow::Advance(Some(value))
        }

        Step::Resolve(name) => {
            let value = frame
                .scope
                .resolve(&name)
                .or_else(|| ctx.previous.get(&name).cloned())
                .unwrap_or_else(|| {
                    Value::exception(
                        node.id,
                        Exception::Name { name: name.clone(), scope: ctx.label.clone() },
                    )
                });
            StepFlow::Advance(Some(value))
        }

        Step::BindName(name) => {
            let Some(value) = frame.operands.pop() else {
                return StepFlow::Advance(Some(internal_fault(node.id, "bind without a value")));
            };
            frame.scope.insert(name, value);
            StepFlow::Advance(None)
        }

        Step::ApplyUnary(op) => {
            let Some(top) = frame.operands.last() else {
                return StepFlow::Advance(Some(internal_fault(node.id, "unary without an operand")));
            };
            let operand = match read_stream(ctx.registry, top, node.id) {
                Ok(value) => value,
                Err(key) => return StepFlow::Suspend(key),
            };
            frame.operands.pop();
            // Exceptions propagate, whether they arrived as operands or as
            // stream readings.
            if operand.is_exception() {
                return StepFlow::Advance(Some(operand));
            }
            StepFlow::Advance(Some(apply_unary(node.id, op, operand)))
        }

        Step::ApplyBinary(op) => {
            let len = frame.operands.len();
            if len < 2 {
                return StepFlow::Advance(Some(internal_fault(node.id, "binary without operands")));
            }
            let left = match read_stream(ctx.registry, &frame.operands[len - 2], node.id) {
                Ok(value) => value,
                Err(key) => return StepFlow::Suspend(key),
            };
            let right = match read_stream(ctx.registry, &frame.operands[len - 1], node.id) {
                Ok(value) => value,
                Err(key) => return StepFlow::Suspend(key),
            };
            frame.operands.truncate(len - 2);
            // Exceptions propagate left-first, whether they arrived as
            // operands or as stream readings.
            if left.is_exception() {
                return StepFlow::Advance(Some(left));
            }
            if right.is_exception() {
                return StepFlow::Advance(Some(right));
            }
            StepFlow::Advance(Some(apply_binary(node.id, op, left, right)))
        }

        Step::ConvertUnit(unit) => {
            let Some(top) = frame.operands.last() else {
                return StepFlow::Advance(Some(internal_fault(node.id, "convert without an operand")));
            };
            let operand = match read_stream(ctx.registry, top, node.id) {
                Ok(value) => value,
                Err(key) => return StepFlow::Suspend(key),
            };
            frame.operands.pop();
            if operand.is_exception() {
                return StepFlow::Advance(Some(operand));
            }
            StepFlow::Advance(Some(convert_unit(node.id, operand, unit)))
        }

        Step::MakeFunction => {
            let ExprKind::Function { parameters, body } = &node.kind else {
                return StepFlow::Advance(Some(internal_fault(
                    node.id,
                    "function step on a non-function node",
                )));
            };
            let closure = Closure {
                parameters: parameters.clone(),
                body: body.clone(),
                captured: frame.scope.clone(),
            };
            StepFlow::Advance(Some(Value::new(node.id, ValueKind::Function(Rc::new(closure)))))
        }

        Step::ApplyCall { argc } => {
            let len = frame.operands.len();
            if len < argc + 1 {
                return StepFlow::Advance(Some(internal_fault(node.id, "call without operands")));
            }
            let callee_ix = len - argc - 1;
            let callee = match read_stream(ctx.registry, &frame.operands[callee_ix], node.id) {
                Ok(value) => value,
                Err(key) => return StepFlow::Suspend(key),
            };
            let exception = if callee.is_exception() {
                Some(callee.clone())
            } else {
                frame.operands[callee_ix + 1..].iter().find(|v| v.is_exception()).cloned()
            };
            if let Some(exception) = exception {
                frame.operands.truncate(callee_ix);
                return StepFlow::Advance(Some(exception));
            }
            let ValueKind::Function(closure) = callee.kind() else {
                frame.operands.truncate(callee_ix);
                return StepFlow::Advance(Some(type_exception(
                    node.id,
                    format!("call of a non-function {}", callee.to_display_string()),
                )));
            };
            let closure = closure.clone();
            if closure.parameters.len() != argc {
                frame.operands.truncate(callee_ix);
                return StepFlow::Advance(Some(value_exception(
                    node.id,
                    format!(
                        "function expects {} arguments, got {argc}",
                        closure.parameters.len()
                    ),
                )));
            }
            let arguments = frame.operands.split_off(callee_ix + 1);
            frame.operands.truncate(callee_ix);
            // Arguments keep stream handles: a function body may use a
            // passed stream as a reaction trigger.
            let scope = Scope::child(&closure.captured);
            for (parameter, argument) in closure.parameters.iter().zip(arguments) {
                scope.insert(parameter.clone(), argument);
            }
            StepFlow::Push { node: closure.body.clone(), scope, repeat: false }
        }

        Step::CallBasis { argc } => {
            let ExprKind::BasisCall { type_name, function, .. } = &node.kind else {
                return StepFlow::Advance(Some(internal_fault(
                    node.id,
                    "basis step on a non-basis node",
                )));
            };
            let len = frame.operands.len();
            if len < argc {
                return StepFlow::Advance(Some(internal_fault(node.id, "basis call without operands")));
            }
            // Natives are total over plain values; readings are resolved
            // before the call, suspending if one is still silent.
            let mut arguments = Vec::with_capacity(argc);
            for operand in &frame.operands[len - argc..] {
                match read_stream(ctx.registry, operand, node.id) {
                    Ok(value) => arguments.push(value),
                    Err(key) => return StepFlow::Suspend(key),
                }
            }
            frame.operands.truncate(len - argc);
            if let Some(exception) = arguments.iter().find(|v| v.is_exception()) {
                return StepFlow::Advance(Some(exception.clone()));
            }
            let value = match ctx.basis.lookup(type_name, function) {
                Some(native) => native(node.id, &arguments),
                None => {
                    warn!(%type_name, %function, "unknown basis function");
                    Value::exception(
                        node.id,
                        Exception::Message {
                            message: format!("unknown basis function {type_name}/{function}").into(),
                        },
                    )
                }
            };
            StepFlow::Advance(Some(value))
        }

        Step::TranslateNext => {
            if frame.operands.len() < 2 {
                return StepFlow::Advance(Some(internal_fault(node.id, "translate without operands")));
            }
            if frame.counter == 0 {
                // First execution: resolve the subject reading and validate
                // shapes. Invalid shapes poison the transform slot so the
                // finish step yields the exception.
                let subject = match read_stream(ctx.registry, &frame.operands[0], node.id) {
                    Ok(value) => value,
                    Err(key) => return StepFlow::Suspend(key),
                };
                frame.operands[0] = subject;
                if !frame.operands[0].is_exception() && !frame.operands[1].is_exception() {
                    let subject_ok = matches!(
                        frame.operands[0].kind(),
                        ValueKind::List(_) | ValueKind::Set(_)
                    );
                    let transform_ok = match frame.operands[1].kind() {
                        ValueKind::Function(closure) => closure.parameters.len() == 1,
                        _ => false,
                    };
                    if !subject_ok {
                        frame.operands[1] = value_exception(
                            node.id,
                            format!(
                                "translate over a non-collection {}",
                                frame.operands[0].to_display_string()
                            ),
                        );
                    } else if !transform_ok {
                        frame.operands[1] = value_exception(
                            node.id,
                            "translate expects a one-parameter function".to_string(),
                        );
                    }
                }
            }
            if frame.operands[0].is_exception() || frame.operands[1].is_exception() {
                return StepFlow::Advance(None);
            }
            let items = match frame.operands[0].kind() {
                ValueKind::List(items) | ValueKind::Set(items) => items.clone(),
                _ => return StepFlow::Advance(Some(internal_fault(node.id, "translate subject changed shape"))),
            };
            if frame.counter >= items.len() {
                return StepFlow::Advance(None);
            }
            let element = items[frame.counter].clone();
            frame.counter += 1;
            let ValueKind::Function(closure) = frame.operands[1].kind() else {
                return StepFlow::Advance(Some(internal_fault(node.id, "translate transform changed shape")));
            };
            let scope = Scope::child(&closure.captured);
            scope.insert(closure.parameters[0].clone(), element);
            StepFlow::Push { node: closure.body.clone(), scope, repeat: true }
        }

        Step::TranslateFinish => {
            if frame.operands.len() < 2 {
                return StepFlow::Advance(Some(internal_fault(node.id, "translate finish without operands")));
            }
            let results = frame.operands.split_off(2);
            let transform = frame.operands.pop().expect("transform present");
            let subject = frame.operands.pop().expect("subject present");
            if subject.is_exception() {
                return StepFlow::Advance(Some(subject));
            }
            if transform.is_exception() {
                return StepFlow::Advance(Some(transform));
            }
            let value = match subject.kind() {
                ValueKind::Set(_) => {
                    Value::new(node.id, ValueKind::Set(Arc::new(dedup_structural(results))))
                }
                _ => Value::new(node.id, ValueKind::List(Arc::new(results))),
            };
            StepFlow::Advance(Some(value))
        }

        Step::ReactChoose => {
            let ExprKind::React { initial, update, .. } = &node.kind else {
                return StepFlow::Advance(Some(internal_fault(
                    node.id,
                    "reaction step on a non-reaction node",
                )));
            };
            let Some(trigger_value) = frame.operands.pop() else {
                return StepFlow::Advance(Some(internal_fault(node.id, "reaction without a trigger")));
            };
            if trigger_value.is_exception() {
                frame.reaction = None;
                return StepFlow::Advance(Some(trigger_value));
            }
            let Some(stream_key) = trigger_value.as_stream() else {
                frame.reaction = None;
                return StepFlow::Advance(Some(type_exception(
                    node.id,
                    format!(
                        "reaction trigger must be a stream, got {}",
                        trigger_value.to_display_string()
                    ),
                )));
            };
            let occurrence = next_occurrence(ctx.occurrences, node.id);
            let key = ReactionKey { node: node.id, occurrence };
            ctx.registry.subscribe(stream_key, ctx.source);
            let emission_count = ctx
                .registry
                .get(stream_key)
                .map(|stream| stream.emission_count())
                .unwrap_or(0);

            match ctx.reactions.get(key) {
                None => {
                    // First evaluation: run the initial expression against
                    // the stream's present state.
                    frame.reaction =
                        Some(ReactionDecision { key, commit: Some(emission_count) });
                    StepFlow::Push { node: initial.clone(), scope: frame.scope.clone(), repeat: false }
                }
                Some(state) => {
                    let fired = match ctx.trigger {
                        Some((trigger_key, number))
                            if trigger_key == stream_key && number > state.seen =>
                        {
                            Some(number)
                        }
                        _ => None,
                    };
                    match fired {
                        Some(number) => {
                            frame.reaction = Some(ReactionDecision { key, commit: Some(number) });
                            StepFlow::Push {
                                node: update.clone(),
                                scope: frame.scope.clone(),
                                repeat: false,
                            }
                        }
                        // Not this instance's emission: replay the
                        // recorded current value unchanged.
                        None => {
                            frame.reaction = None;
                            StepFlow::Advance(Some(state.current.clone()))
                        }
                    }
                }
            }
        }

        Step::ReactCommit => {
            let Some(value) = frame.operands.pop() else {
                return StepFlow::Advance(Some(internal_fault(node.id, "reaction commit without a body")));
            };
            if let Some(decision) = frame.reaction.take() {
                if let Some(seen) = decision.commit {
                    ctx.reactions.record(decision.key, value.clone(), seen);
                }
            }
            StepFlow::Advance(Some(value))
        }

        Step::AcquireSource => {
            let ExprKind::Source(kind) = &node.kind else {
                return StepFlow::Advance(Some(internal_fault(
                    node.id,
                    "acquire step on a non-source node",
                )));
            };
            let occurrence = next_occurrence(ctx.occurrences, node.id);
            let key = StreamKey { node: node.id, occurrence };
            let history_bound = ctx.options.stream_history;
            let (stream, created) = ctx
                .registry
                .get_or_create(key, || Stream::new(key, kind.clone(), history_bound));
            if created {
                // Start-side effects run exactly once, on first encounter.
                stream.start();
                if let SourceKind::Clock { interval_ms } = kind {
                    ctx.clock.register(key, *interval_ms);
                }
            }
            ctx.registry.subscribe(key, ctx.source);
            StepFlow::Advance(Some(Value::new(node.id, ValueKind::Stream(key))))
        }
    }
}

/// Pop the top `count` operands, preserving their order.
fn take_operands(frame: &mut Frame, count: usize, origin: NodeId) -> Result<Vec<Value>, Value> {
    let len = frame.operands.len();
    if len < count {
        return Err(internal_fault(origin, "operand stack underflow"));
    }
    Ok(frame.operands.split_off(len - count))
}

fn dedup_structural(items: Vec<Value>) -> Vec<Value> {
    let mut unique: Vec<Value> = Vec::with_capacity(items.len());
    for item in items {
        if !unique.iter().any(|existing| existing.structural_eq(&item)) {
            unique.push(item);
        }
    }
    unique
}

fn apply_unary(origin: NodeId, op: UnaryOp, operand: Value) -> Value {
    match op {
        UnaryOp::Not => match operand.kind() {
            ValueKind::Bool(b) => Value::boolean(origin, !b),
            _ => value_exception(
                origin,
                format!("not of a non-boolean {}", operand.to_display_string()),
            ),
        },
        UnaryOp::Negate => match operand.kind() {
            ValueKind::Number { magnitude, unit } => {
                Value::new(origin, ValueKind::Number { magnitude: -magnitude, unit: *unit })
            }
            _ => value_exception(
                origin,
                format!("negate of a non-number {}", operand.to_display_string()),
            ),
        },
    }
}

fn apply_binary(origin: NodeId, op: BinaryOp, left: Value, right: Value) -> Value {
    use BinaryOp::*;
    match op {
        Equal => Value::boolean(origin, left.structural_eq(&right)),
        NotEqual => Value::boolean(origin, !left.structural_eq(&right)),
        Greater | GreaterOrEqual | Less | LessOrEqual => match compare_numbers(&left, &right) {
            Some(ordering) => {
                let holds = match op {
                    Greater => ordering.is_gt(),
                    GreaterOrEqual => ordering.is_ge(),
                    Less => ordering.is_lt(),
                    _ => ordering.is_le(),
                };
                Value::boolean(origin, holds)
            }
            None => value_exception(
                origin,
                format!(
                    "cannot order {} against {}",
                    left.to_display_string(),
                    right.to_display_string()
                ),
            ),
        },
        And | Or => match (left.kind(), right.kind()) {
            (ValueKind::Bool(l), ValueKind::Bool(r)) => {
                Value::boolean(origin, if matches!(op, And) { *l && *r } else { *l || *r })
            }
            _ => value_exception(
                origin,
                format!(
                    "logic on non-booleans {} and {}",
                    left.to_display_string(),
                    right.to_display_string()
                ),
            ),
        },
        Add => match (left.kind(), right.kind()) {
            (ValueKind::Text(l), ValueKind::Text(r)) => {
                Value::text(origin, format!("{l}{r}").as_str())
            }
            _ => numeric_binary(origin, op, left, right),
        },
        Subtract | Multiply | Divide => numeric_binary(origin, op, left, right),
    }
}

fn numeric_binary(origin: NodeId, op: BinaryOp, left: Value, right: Value) -> Value {
    let (
        ValueKind::Number { magnitude: lm, unit: lu },
        ValueKind::Number { magnitude: rm, unit: ru },
    ) = (left.kind(), right.kind())
    else {
        return value_exception(
            origin,
            format!(
                "arithmetic on {} and {}",
                left.to_display_string(),
                right.to_display_string()
            ),
        );
    };
    let incompatible = value_exception(
        origin,
        format!(
            "incompatible units {} and {}",
            left.to_display_string(),
            right.to_display_string()
        ),
    );
    let sign = if matches!(op, BinaryOp::Subtract) { -1.0 } else { 1.0 };
    match op {
        BinaryOp::Add | BinaryOp::Subtract => match (lu, ru) {
            (None, None) => Value::number(origin, lm + sign * rm),
            // Same dimension required; the result keeps the left unit.
            (Some(l), Some(r)) if l.dimension() == r.dimension() => {
                let magnitude = lm + sign * (rm * r.base_scale() / l.base_scale());
                Value::new(origin, ValueKind::Number { magnitude, unit: Some(*l) })
            }
            _ => incompatible,
        },
        BinaryOp::Multiply => match (lu, ru) {
            // Compound units are out of the value model's scope.
            (Some(_), Some(_)) => incompatible,
            (Some(unit), None) | (None, Some(unit)) => {
                Value::new(origin, ValueKind::Number { magnitude: lm * rm, unit: Some(*unit) })
            }
            (None, None) => Value::number(origin, lm * rm),
        },
        BinaryOp::Divide => {
            if *rm == 0.0 {
                return value_exception(origin, "division by zero".to_string());
            }
            match (lu, ru) {
                (Some(l), Some(r)) if l.dimension() == r.dimension() => {
                    Value::number(origin, (lm * l.base_scale()) / (rm * r.base_scale()))
                }
                (Some(unit), None) => {
                    Value::new(origin, ValueKind::Number { magnitude: lm / rm, unit: Some(*unit) })
                }
                (None, None) => Value::number(origin, lm / rm),
                _ => incompatible,
            }
        }
        _ => internal_fault(origin, "non-arithmetic operator in numeric path"),
    }
}

fn convert_unit(origin: NodeId, operand: Value, target: Unit) -> Value {
    match operand.kind() {
        ValueKind::Number { magnitude, unit } => match unit {
            Some(unit) if unit.dimension() == target.dimension() => {
                let magnitude = magnitude * unit.base_scale() / target.base_scale();
                Value::new(origin, ValueKind::Number { magnitude, unit: Some(target) })
            }
            Some(_) => value_exception(
                origin,
                format!(
                    "cannot convert {} to {}",
                    operand.to_display_string(),
                    target.symbol()
                ),
            ),
            // A plain number adopts the target unit.
            None => Value::new(
                origin,
                ValueKind::Number { magnitude: *magnitude, unit: Some(target) },
            ),
        },
        _ => value_exception(
            origin,
            format!("cannot convert {} to {}", operand.to_display_string(), target.symbol()),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syntax::NodeBuilder;

    fn evaluator() -> Evaluator {
        Evaluator::new(BasisRegistry::with_defaults())
    }

    #[test]
    fn literal_program_evaluates_to_its_value() {
        let mut b = NodeBuilder::new();
        let root = b.number(42.0);

        let mut ev = evaluator();
        let source = ev.add_source(root);
        ev.start().unwrap();

        assert_eq!(ev.latest_value(source).unwrap(), Value::number(NodeId(0), 42.0));
        assert_eq!(ev.current_history_index(), Some(0));
    }

    #[test]
    fn undefined_name_yields_name_exception_not_a_crash() {
        let mut b = NodeBuilder::new();
        let root = b.reference("nowhere");

        let mut ev = evaluator();
        let source = ev.add_source(root);
        ev.start().unwrap();

        let value = ev.latest_value(source).unwrap();
        assert!(value.is_exception());
        assert!(value.to_display_string().contains("nowhere"));
    }

    #[test]
    fn sibling_sources_survive_a_failing_one() {
        let mut b = NodeBuilder::new();
        let broken = b.reference("missing");
        let healthy = b.number(7.0);

        let mut ev = evaluator();
        let bad = ev.add_source(broken);
        let good = ev.add_source(healthy);
        ev.start().unwrap();

        assert!(ev.latest_value(bad).unwrap().is_exception());
        assert_eq!(ev.latest_value(good).unwrap(), Value::number(NodeId(0), 7.0));
    }

    #[test]
    fn device_stream_suspends_until_first_emission() {
        let mut b = NodeBuilder::new();
        let mic = b.source(SourceKind::Microphone);
        let threshold = b.number(0.5);
        let root = b.binary(BinaryOp::Greater, mic, threshold);

        let mut ev = evaluator();
        let source = ev.add_source(root);
        ev.start().unwrap();

        // Parked: no reading, no initial value, no completed pass.
        assert!(ev.latest_value(source).is_none());
        let key = ev.stream_keys()[0];

        let handle = ev.driver_handle(key).unwrap();
        assert!(handle.emit(Sample::Number { magnitude: 0.9, unit: None }));
        ev.flush();

        assert_eq!(ev.latest_value(source).unwrap(), Value::boolean(NodeId(0), true));
    }

    #[test]
    fn structure_fields_project_by_name() {
        let mut b = NodeBuilder::new();
        let x = b.number(3.0);
        let y = b.number(4.0);
        let point = b.node(ExprKind::Structure {
            type_name: "Point".into(),
            fields: vec![("x".into(), x), ("y".into(), y)],
        });
        let root = b.node(ExprKind::Field { subject: point, field: "y".into() });

        let mut ev = evaluator();
        let source = ev.add_source(root);
        ev.start().unwrap();

        assert_eq!(ev.latest_value(source).unwrap(), Value::number(NodeId(0), 4.0));
    }

    #[test]
    fn missing_field_is_a_value_exception() {
        let mut b = NodeBuilder::new();
        let x = b.number(3.0);
        let point = b.node(ExprKind::Structure {
            type_name: "Point".into(),
            fields: vec![("x".into(), x)],
        });
        let root = b.node(ExprKind::Field { subject: point, field: "z".into() });

        let mut ev = evaluator();
        let source = ev.add_source(root);
        ev.start().unwrap();

        let value = ev.latest_value(source).unwrap();
        assert!(value.is_exception());
        assert!(value.to_display_string().contains("no field `z`"));
    }

    #[test]
    fn conversion_rescales_into_the_target_unit() {
        let mut b = NodeBuilder::new();
        let elapsed = b.number_with_unit(1500.0, Unit::Milliseconds);
        let root = b.node(ExprKind::Convert { operand: elapsed, unit: Unit::Seconds });

        let mut ev = evaluator();
        let source = ev.add_source(root);
        ev.start().unwrap();

        assert_eq!(ev.display_value(source).unwrap(), "1.5s");
    }

    #[test]
    fn depth_limit_becomes_an_exception_value() {
        let mut b = NodeBuilder::new();
        // f: ƒ(x) f(x), unbounded recursion.
        let inner_callee = b.reference("f");
        let inner_arg = b.reference("x");
        let body = b.call(inner_callee, vec![inner_arg]);
        let f = b.function(&["x"], body);
        let callee = b.reference("f");
        let arg = b.number(1.0);
        let call = b.call(callee, vec![arg]);
        let root = b.block(vec![("f", f)], call);

        let mut ev = Evaluator::with_options(
            BasisRegistry::with_defaults(),
            EvaluatorOptions { max_frames: 32, stream_history: 8 },
        );
        let source = ev.add_source(root);
        ev.start().unwrap();

        let value = ev.latest_value(source).unwrap();
        assert!(value.is_exception());
        assert!(value.to_display_string().contains("depth limit"));
    }

    #[test]
    fn stop_then_flush_is_a_no_op() {
        let mut b = NodeBuilder::new();
        let root = b.clock(100.0);

        let mut ev = evaluator();
        ev.add_source(root);
        ev.start().unwrap();
        let entries = ev.history().len();

        ev.stop();
        ev.stop();
        ev.advance_clock(1000);
        ev.flush();

        assert_eq!(ev.history().len(), entries);
    }
}
