//! Step sequencer: compiles a node into its ordered continuation units.
//!
//! `sequence` is a pure, total function of the node's shape: the match is
//! exhaustive over `ExprKind`, so the compiler enforces coverage of every
//! construct. Malformed *shapes* (wrong arity, wrong operand kind) are not
//! sequencing errors; they surface as Exception values when the step
//! executes.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::syntax::{BinaryOp, ExprKind, Node, UnaryOp, Unit};

/// Ordered step list for one frame. Small expressions stay inline.
pub type Steps = SmallVec<[Step; 6]>;

/// One continuation unit.
///
/// Executing a step against the current frame either yields a value, pushes
/// child frames, or suspends the pass on a silent stream.
#[derive(Clone, Debug)]
pub enum Step {
    /// Descend into a subexpression (pushes a child frame).
    Eval(Arc<Node>),
    /// Materialize the frame node's own literal.
    Literal,
    /// Pop `n` element values, push a list.
    MakeList(usize),
    /// Pop `n` element values, push a set (duplicates collapse).
    MakeSet(usize),
    /// Pop `n` key/value pairs, push a map (later duplicate keys win).
    MakeMap(usize),
    /// Pop `n` field values, push a structure (names from the node).
    MakeStructure(usize),
    /// Pop a structure, push one of its fields.
    GetField(Arc<str>),
    /// Push the value bound to a name.
    Resolve(Arc<str>),
    /// Pop a value and bind it in the frame scope.
    BindName(Arc<str>),
    ApplyUnary(UnaryOp),
    ApplyBinary(BinaryOp),
    ConvertUnit(Unit),
    /// Capture the frame scope into a closure value.
    MakeFunction,
    /// Pop callee + `argc` arguments, push the body frame.
    ApplyCall { argc: usize },
    /// Pop `argc` arguments, invoke the native basis callable.
    CallBasis { argc: usize },
    /// Push one element-transform frame per collection element.
    TranslateNext,
    /// Collect element results back into the collection shape.
    TranslateFinish,
    /// Decide whether the reaction replays, runs its initial expression, or
    /// re-fires its update expression for the triggering emission.
    ReactChoose,
    /// Record the reaction body's value as the instance's current value.
    ReactCommit,
    /// Resolve `(node, occurrence)` to a live stream, starting it on first
    /// encounter, and push the stream handle.
    AcquireSource,
}

/// Derive the step sequence for a node.
pub fn sequence(node: &Arc<Node>) -> Steps {
    let mut steps = Steps::new();
    match &node.kind {
        ExprKind::Number { .. }
        | ExprKind::Text(_)
        | ExprKind::Bool(_)
        | ExprKind::NoneLiteral => steps.push(Step::Literal),
        ExprKind::List(elements) => {
            for element in elements {
                steps.push(Step::Eval(element.clone()));
            }
            steps.push(Step::MakeList(elements.len()));
        }
        ExprKind::SetOf(elements) => {
            for element in elements {
                steps.push(Step::Eval(element.clone()));
            }
            steps.push(Step::MakeSet(elements.len()));
        }
        ExprKind::MapOf(entries) => {
            for (key, value) in entries {
                steps.push(Step::Eval(key.clone()));
                steps.push(Step::Eval(value.clone()));
            }
            steps.push(Step::MakeMap(entries.len()));
        }
        ExprKind::Structure { fields, .. } => {
            for (_, initializer) in fields {
                steps.push(Step::Eval(initializer.clone()));
            }
            steps.push(Step::MakeStructure(fields.len()));
        }
        ExprKind::Field { subject, field } => {
            steps.push(Step::Eval(subject.clone()));
            steps.push(Step::GetField(field.clone()));
        }
        ExprKind::Reference(name) => steps.push(Step::Resolve(name.clone())),
        ExprKind::Block { binds, result } => {
            for (name, value) in binds {
                steps.push(Step::Eval(value.clone()));
                steps.push(Step::BindName(name.clone()));
            }
            steps.push(Step::Eval(result.clone()));
        }
        ExprKind::Unary { op, operand } => {
            steps.push(Step::Eval(operand.clone()));
            steps.push(Step::ApplyUnary(*op));
        }
        ExprKind::Binary { op, left, right } => {
            steps.push(Step::Eval(left.clone()));
            steps.push(Step::Eval(right.clone()));
            steps.push(Step::ApplyBinary(*op));
        }
        ExprKind::Convert { operand, unit } => {
            steps.push(Step::Eval(operand.clone()));
            steps.push(Step::ConvertUnit(*unit));
        }
        ExprKind::Function { .. } => steps.push(Step::MakeFunction),
        ExprKind::Call { callee, arguments } => {
            steps.push(Step::Eval(callee.clone()));
            for argument in arguments {
                steps.push(Step::Eval(argument.clone()));
            }
            steps.push(Step::ApplyCall { argc: arguments.len() });
        }
        ExprKind::BasisCall { arguments, .. } => {
            for argument in arguments {
                steps.push(Step::Eval(argument.clone()));
            }
            steps.push(Step::CallBasis { argc: arguments.len() });
        }
        ExprKind::Translate { subject, transform } => {
            steps.push(Step::Eval(subject.clone()));
            steps.push(Step::Eval(transform.clone()));
            steps.push(Step::TranslateNext);
            steps.push(Step::TranslateFinish);
        }
        ExprKind::React { trigger, .. } => {
            steps.push(Step::Eval(trigger.clone()));
            steps.push(Step::ReactChoose);
            steps.push(Step::ReactCommit);
        }
        ExprKind::Source(_) => steps.push(Step::AcquireSource),
    }
    steps
}
