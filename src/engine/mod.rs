//! Reactive evaluation engine.
//!
//! Expressions execute on an explicit step/continuation stack so evaluation
//! can pause on a silent stream and resume at the exact step later. Streams
//! are registered under `(node, occurrence)` keys, reactions re-run the
//! affected source per emission, and every completed pass is appended to the
//! time-travel history.

pub mod clock;
pub mod evaluator;
pub mod frame;
pub mod history;
pub mod reaction;
pub mod registry;
pub mod snapshot;
pub mod step;
pub mod stream;
pub mod value;

/// Identifier of one top-level source hosted by the evaluator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(pub usize);
