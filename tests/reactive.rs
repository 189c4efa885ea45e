//! Reactive end-to-end scenarios: stream identity, reaction ordering,
//! suspension, time travel, and teardown.

use std::sync::Arc;

use pretty_assertions::assert_eq;

use rill::syntax::{BinaryOp, NodeBuilder, NodeId, SourceKind, Unit};
use rill::{BasisRegistry, Evaluator, Sample, StreamKey, Value, ValueKind};

fn evaluator() -> Evaluator {
    Evaluator::new(BasisRegistry::with_defaults())
}

fn find_stream(ev: &Evaluator, pred: impl Fn(&SourceKind) -> bool) -> StreamKey {
    ev.stream_keys()
        .into_iter()
        .find(|&key| pred(ev.stream(key).unwrap().source()))
        .expect("stream present")
}

fn text(s: &str) -> Value {
    Value::text(NodeId(0), s)
}

fn list(items: Vec<Value>) -> Value {
    Value::new(NodeId(0), ValueKind::List(Arc::new(items)))
}

/// `Time() > 0ms` is false until the bound clock emits a later reading.
#[test]
fn clock_comparison_flips_after_tick() {
    let mut b = NodeBuilder::new();
    let clock = b.clock(100.0);
    let zero = b.number_with_unit(0.0, Unit::Milliseconds);
    let program = b.binary(BinaryOp::Greater, clock, zero);

    let mut ev = evaluator();
    let source = ev.add_source(program);
    ev.start().unwrap();
    assert_eq!(ev.display_value(source).unwrap(), "false");

    ev.advance_clock(100);
    ev.flush();
    assert_eq!(ev.display_value(source).unwrap(), "true");

    // History keeps both passes, and lookups are idempotent.
    let earlier = ev.history_at(0).unwrap().value_for(source).unwrap().clone();
    assert_eq!(earlier, Value::boolean(NodeId(0), false));
    assert_eq!(
        ev.history_at(0).unwrap().value_for(source).unwrap(),
        &earlier
    );
}

/// `a: 1 … ∆ Time() … a + 1` then `a`: each emission re-runs the update
/// against the previous pass's binding of `a`.
#[test]
fn named_reaction_increments_from_previous_value() {
    let mut b = NodeBuilder::new();
    let initial = b.number(1.0);
    let trigger = b.clock(1000.0);
    let prev = b.reference("a");
    let one = b.number(1.0);
    let update = b.binary(BinaryOp::Add, prev, one);
    let reaction = b.react(initial, trigger, update);
    let result = b.reference("a");
    let program = b.block(vec![("a", reaction)], result);

    let mut ev = evaluator();
    let source = ev.add_source(program);
    ev.start().unwrap();
    assert_eq!(ev.display_value(source).unwrap(), "1");

    ev.advance_clock(1000);
    ev.flush();
    assert_eq!(ev.display_value(source).unwrap(), "2");

    ev.advance_clock(1000);
    ev.flush();
    assert_eq!(ev.display_value(source).unwrap(), "3");

    // Earlier indices still answer with the values of their own passes.
    assert_eq!(
        ev.history_at(0).unwrap().value_for(source).unwrap(),
        &Value::number(NodeId(0), 1.0)
    );
    assert_eq!(
        ev.history_at(1).unwrap().value_for(source).unwrap(),
        &Value::number(NodeId(0), 2.0)
    );
}

/// `mult(2, 1 … ∆ Time() … 2)`: reactions propagate through call frames.
#[test]
fn reaction_inside_call_argument_updates() {
    let mut b = NodeBuilder::new();
    let two = b.number(2.0);
    let initial = b.number(1.0);
    let trigger = b.clock(1000.0);
    let update = b.number(2.0);
    let reaction = b.react(initial, trigger, update);
    let program = b.basis_call("Math", "mult", vec![two, reaction]);

    let mut ev = evaluator();
    let source = ev.add_source(program);
    ev.start().unwrap();
    assert_eq!(ev.display_value(source).unwrap(), "2");

    ev.advance_clock(1000);
    ev.flush();
    assert_eq!(ev.display_value(source).unwrap(), "4");
}

/// `['hi' 'ho'].translate(ƒ(val) val … ∆ time … 'no')`: reactive
/// re-evaluation is structural: every element's instance updates.
#[test]
fn reaction_inside_translate_updates_every_element() {
    let mut b = NodeBuilder::new();
    let time = b.clock(1000.0);
    let hi = b.text("hi");
    let ho = b.text("ho");
    let subject = b.list(vec![hi, ho]);
    let initial = b.reference("val");
    let trigger = b.reference("time");
    let update = b.text("no");
    let reaction = b.react(initial, trigger, update);
    let transform = b.function(&["val"], reaction);
    let translated = b.translate(subject, transform);
    let program = b.block(vec![("time", time)], translated);

    let mut ev = evaluator();
    let source = ev.add_source(program);
    ev.start().unwrap();
    assert_eq!(
        ev.latest_value(source).unwrap(),
        list(vec![text("hi"), text("ho")])
    );

    ev.advance_clock(1000);
    ev.flush();
    assert_eq!(
        ev.latest_value(source).unwrap(),
        list(vec![text("no"), text("no")])
    );
}

/// Re-walking the same creating node resolves to the identical stream
/// instance across reactive passes.
#[test]
fn stream_identity_is_stable_across_passes() {
    let mut b = NodeBuilder::new();
    let clock = b.clock(100.0);
    let zero = b.number_with_unit(0.0, Unit::Milliseconds);
    let program = b.binary(BinaryOp::Greater, clock, zero);

    let mut ev = evaluator();
    ev.add_source(program);
    ev.start().unwrap();

    assert_eq!(ev.stream_count(), 1);
    let key = ev.stream_keys()[0];
    let debug_id = ev.stream(key).unwrap().debug_id();

    for _ in 0..3 {
        ev.advance_clock(100);
        ev.flush();
    }

    // Same key, same instance, started exactly once.
    assert_eq!(ev.stream_count(), 1);
    assert_eq!(ev.stream(key).unwrap().debug_id(), debug_id);
    assert_eq!(ev.stream(key).unwrap().start_count(), 1);
}

/// A second dynamic occurrence of the same creating node mints a distinct
/// stream.
#[test]
fn distinct_occurrences_create_distinct_streams() {
    let mut b = NodeBuilder::new();
    let a = b.text("a");
    let b_ = b.text("b");
    let subject = b.list(vec![a, b_]);
    let body = b.clock(50.0);
    let transform = b.function(&["v"], body);
    let program = b.translate(subject, transform);

    let mut ev = evaluator();
    ev.add_source(program);
    ev.start().unwrap();

    let keys = ev.stream_keys();
    assert_eq!(keys.len(), 2);
    assert_eq!(keys[0].node, keys[1].node);
    assert_eq!(keys[0].occurrence, 0);
    assert_eq!(keys[1].occurrence, 1);
}

/// Reaction monotonicity over an externally driven stream: each emission's
/// pass records its own history entry, and earlier entries stay put.
#[test]
fn reaction_monotonicity_and_history() {
    let mut b = NodeBuilder::new();
    let mic = b.source(SourceKind::Microphone);
    let initial = b.number(0.0);
    let trigger = b.reference("m");
    let reading = b.reference("m");
    let update = b.basis_call("Math", "sum", vec![reading]);
    let reaction = b.react(initial, trigger, update);
    let result = b.reference("r");
    let program = b.block(vec![("m", mic), ("r", reaction)], result);

    let mut ev = evaluator();
    let source = ev.add_source(program);
    ev.start().unwrap();
    assert_eq!(ev.display_value(source).unwrap(), "0");

    let key = find_stream(&ev, |kind| matches!(kind, SourceKind::Microphone));
    let handle = ev.driver_handle(key).unwrap();

    handle.emit(Sample::Number { magnitude: 5.0, unit: None });
    ev.flush();
    assert_eq!(ev.display_value(source).unwrap(), "5");

    handle.emit(Sample::Number { magnitude: 7.0, unit: None });
    ev.flush();
    assert_eq!(ev.display_value(source).unwrap(), "7");

    // The entry recorded under the first emission is unchanged.
    assert_eq!(
        ev.history_at(1).unwrap().value_for(source).unwrap(),
        &Value::number(NodeId(0), 5.0)
    );
}

/// Two emissions delivered before one flush still get one pass each, in
/// emission order.
#[test]
fn batched_emissions_each_get_their_own_pass() {
    let mut b = NodeBuilder::new();
    let mic = b.source(SourceKind::Microphone);
    let initial = b.number(0.0);
    let trigger = b.reference("m");
    let reading = b.reference("m");
    let update = b.basis_call("Math", "sum", vec![reading]);
    let reaction = b.react(initial, trigger, update);
    let result = b.reference("r");
    let program = b.block(vec![("m", mic), ("r", reaction)], result);

    let mut ev = evaluator();
    let source = ev.add_source(program);
    ev.start().unwrap();
    let before = ev.history().len();

    let key = find_stream(&ev, |kind| matches!(kind, SourceKind::Microphone));
    let handle = ev.driver_handle(key).unwrap();
    handle.emit(Sample::Number { magnitude: 5.0, unit: None });
    handle.emit(Sample::Number { magnitude: 7.0, unit: None });
    ev.flush();

    assert_eq!(ev.history().len(), before + 2);
    assert_eq!(ev.display_value(source).unwrap(), "7");
}

/// A completed start-side effect is not re-run when the pass suspends on a
/// different step and later resumes.
#[test]
fn suspension_resumes_without_rerunning_side_effects() {
    let mut b = NodeBuilder::new();
    let clock = b.clock(100.0);
    let mic = b.source(SourceKind::Microphone);
    let threshold = b.number(0.5);
    let listening = b.binary(BinaryOp::Greater, mic, threshold);
    let program = b.block(vec![("t", clock)], listening);

    let mut ev = evaluator();
    let source = ev.add_source(program);
    ev.start().unwrap();

    // The clock started before the pass parked on the silent microphone.
    assert!(ev.latest_value(source).is_none());
    assert_eq!(ev.stream_count(), 2);
    let clock_key = find_stream(&ev, |kind| matches!(kind, SourceKind::Clock { .. }));
    assert_eq!(ev.stream(clock_key).unwrap().start_count(), 1);

    let mic_key = find_stream(&ev, |kind| matches!(kind, SourceKind::Microphone));
    let handle = ev.driver_handle(mic_key).unwrap();
    handle.emit(Sample::Number { magnitude: 0.9, unit: None });
    ev.flush();

    assert_eq!(ev.display_value(source).unwrap(), "true");
    // Resumption continued mid-pass: no re-acquire, no second start.
    assert_eq!(ev.stream_count(), 2);
    assert_eq!(ev.stream(clock_key).unwrap().start_count(), 1);
    assert_eq!(clock_key.occurrence, 0);
}

/// A failing driver emits an error sample; the program completes with the
/// exception as its value instead of crashing or staying parked forever.
#[test]
fn driver_failure_surfaces_as_exception_value() {
    let mut b = NodeBuilder::new();
    let fetch = b.source(SourceKind::Fetch { url: "https://example.com/data".into() });
    let threshold = b.number(10.0);
    let program = b.binary(BinaryOp::Greater, fetch, threshold);

    let mut ev = evaluator();
    let source = ev.add_source(program);
    ev.start().unwrap();
    // Parked until the fetch resolves one way or the other.
    assert!(ev.latest_value(source).is_none());

    let key = find_stream(&ev, |kind| matches!(kind, SourceKind::Fetch { .. }));
    let handle = ev.driver_handle(key).unwrap();
    handle.emit(Sample::Error("fetch failed: connection refused".into()));
    ev.flush();

    let value = ev.latest_value(source).unwrap();
    assert!(value.is_exception());
    assert!(value.to_display_string().contains("connection refused"));
}

/// `stop` cascades to every stream, is idempotent, and late driver
/// callbacks change nothing.
#[test]
fn stop_is_idempotent_and_drops_late_callbacks() {
    let mut b = NodeBuilder::new();
    let mic = b.source(SourceKind::Microphone);
    let initial = b.number(0.0);
    let trigger = b.reference("m");
    let reading = b.reference("m");
    let update = b.basis_call("Math", "sum", vec![reading]);
    let reaction = b.react(initial, trigger, update);
    let result = b.reference("r");
    let program = b.block(vec![("m", mic), ("r", reaction)], result);

    let mut ev = evaluator();
    let source = ev.add_source(program);
    ev.start().unwrap();

    let key = find_stream(&ev, |kind| matches!(kind, SourceKind::Microphone));
    let handle = ev.driver_handle(key).unwrap();
    handle.emit(Sample::Number { magnitude: 5.0, unit: None });
    ev.flush();

    let entries = ev.history().len();
    let latest = ev.latest_value(source).unwrap();

    ev.stop();
    ev.stop();
    assert!(!ev.stream(key).unwrap().is_running());

    // In-flight callback lands after stop: silently dropped.
    handle.emit(Sample::Number { magnitude: 9.0, unit: None });
    ev.flush();

    assert_eq!(ev.history().len(), entries);
    assert_eq!(ev.latest_value(source).unwrap(), latest);
    assert_eq!(ev.stream_latest(key).unwrap(), Value::number(NodeId(0), 5.0));
}

/// Undo/redo is pure index movement over the recorded log.
#[test]
fn scrubbing_is_pure_index_movement() {
    let mut b = NodeBuilder::new();
    let clock = b.clock(100.0);
    let zero = b.number_with_unit(0.0, Unit::Milliseconds);
    let program = b.binary(BinaryOp::Greater, clock, zero);

    let mut ev = evaluator();
    let source = ev.add_source(program);
    ev.start().unwrap();
    ev.advance_clock(100);
    ev.flush();

    assert_eq!(ev.display_value(source).unwrap(), "true");
    assert_eq!(ev.current_history_index(), Some(1));

    assert_eq!(ev.undo(), Some(0));
    assert_eq!(ev.display_value(source).unwrap(), "false");
    // Reading a historical index twice answers identically.
    assert_eq!(ev.display_value(source).unwrap(), "false");

    assert_eq!(ev.redo(), Some(1));
    assert_eq!(ev.display_value(source).unwrap(), "true");
    assert_eq!(ev.current_history_index(), Some(1));

    ev.scrub_to(0).unwrap();
    assert_eq!(ev.current_history_index(), Some(0));
    assert!(ev.scrub_to(99).is_err());
    ev.resume_live();
    assert_eq!(ev.display_value(source).unwrap(), "true");
}

/// An always-fresh stream samples on present-time reads but never while
/// history is being inspected.
#[test]
fn sampled_stream_is_fresh_in_present_and_pure_in_history() {
    let mut b = NodeBuilder::new();
    let random = b.source(SourceKind::Random);
    let program = b.basis_call("Math", "sum", vec![random]);

    let mut ev = evaluator();
    let source = ev.add_source(program);
    ev.start().unwrap();

    let value = ev.latest_value(source).unwrap();
    let magnitude = value.base_magnitude().unwrap();
    assert!((0.0..1.0).contains(&magnitude));

    let key = find_stream(&ev, |kind| matches!(kind, SourceKind::Random));
    let sampled = ev.stream(key).unwrap().emission_count();
    assert_eq!(sampled, 1);

    // Inspecting history performs no sampling.
    ev.scrub_to(0).unwrap();
    let first = ev.latest_value(source).unwrap();
    let second = ev.latest_value(source).unwrap();
    assert_eq!(first, second);
    assert_eq!(ev.stream(key).unwrap().emission_count(), sampled);
}
