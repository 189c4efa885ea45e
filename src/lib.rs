//! Rill: a reactive evaluation engine.
//!
//! The engine consumes a finalized expression tree, executes it on an
//! explicit step/continuation stack, keeps long-lived streams stable across
//! re-evaluation, re-runs the affected source per stream emission, and
//! records every completed pass in a scrubbable time-travel history.

pub mod basis;
pub mod engine;
pub mod syntax;

pub use basis::BasisRegistry;
pub use engine::SourceId;
pub use engine::evaluator::{EngineError, Evaluator, EvaluatorOptions};
pub use engine::stream::{DriverHandle, Sample, StreamKey};
pub use engine::value::{Exception, Value, ValueKind};
