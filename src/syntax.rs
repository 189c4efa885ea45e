//! Boundary types for the finalized expression tree.
//!
//! The upstream compiler (parser + type checker) hands the engine an
//! immutable, already-resolved node tree. The engine never re-parses or
//! re-checks it; these types are the contract.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Compiler-assigned stable identifier for a node.
///
/// Survives re-evaluation: the same program position always carries the same
/// id, which is what stream identity is keyed on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

/// One node of the finalized expression tree.
///
/// Nodes are shared immutably via `Arc`; closures and history keep them
/// alive without copying.
#[derive(Debug)]
pub struct Node {
    pub id: NodeId,
    pub kind: ExprKind,
}

/// The closed set of expression shapes the engine evaluates.
///
/// The step sequencer matches exhaustively over this enum, so adding a
/// variant is a compile error until every consumer handles it.
#[derive(Debug)]
pub enum ExprKind {
    /// Numeric literal, optionally dimensioned (`1`, `0ms`, `3kg`).
    Number { magnitude: f64, unit: Option<Unit> },
    /// Text literal.
    Text(Arc<str>),
    /// Boolean literal.
    Bool(bool),
    /// The empty value.
    NoneLiteral,
    /// Ordered list of element expressions.
    List(Vec<Arc<Node>>),
    /// Unordered set of element expressions (duplicates collapse).
    SetOf(Vec<Arc<Node>>),
    /// Key/value map; later duplicate keys win.
    MapOf(Vec<(Arc<Node>, Arc<Node>)>),
    /// Structure literal with its defining type name and field initializers.
    Structure {
        type_name: Arc<str>,
        fields: Vec<(Arc<str>, Arc<Node>)>,
    },
    /// Field projection out of a structure value.
    Field { subject: Arc<Node>, field: Arc<str> },
    /// Reference to a lexical binding.
    Reference(Arc<str>),
    /// Sequence of named binds followed by the result expression.
    Block {
        binds: Vec<(Arc<str>, Arc<Node>)>,
        result: Arc<Node>,
    },
    /// Unary operation.
    Unary { op: UnaryOp, operand: Arc<Node> },
    /// Binary operation.
    Binary {
        op: BinaryOp,
        left: Arc<Node>,
        right: Arc<Node>,
    },
    /// Unit conversion (`elapsed -> seconds`).
    Convert { operand: Arc<Node>, unit: Unit },
    /// Function literal; captures the defining scope.
    Function {
        parameters: Vec<Arc<str>>,
        body: Arc<Node>,
    },
    /// Call of a function value.
    Call {
        callee: Arc<Node>,
        arguments: Vec<Arc<Node>>,
    },
    /// Call of a native basis function, addressed by `(type, function)`.
    BasisCall {
        type_name: Arc<str>,
        function: Arc<str>,
        arguments: Vec<Arc<Node>>,
    },
    /// Element-wise transform of a collection through a function value.
    Translate {
        subject: Arc<Node>,
        transform: Arc<Node>,
    },
    /// Reaction: `initial … ∆ trigger … update`.
    ///
    /// Evaluates to `initial` until the trigger stream emits, then to
    /// `update` re-evaluated once per emission.
    React {
        initial: Arc<Node>,
        trigger: Arc<Node>,
        update: Arc<Node>,
    },
    /// Borrow of an external time-varying source; evaluates to a stream.
    Source(SourceKind),
}

/// External sources a program can borrow as streams.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceKind {
    /// Clock ticking every `interval_ms`; reads as elapsed time.
    Clock { interval_ms: f64 },
    /// Pointer position.
    Pointer,
    /// Microphone input level.
    Microphone,
    /// Keystroke events.
    Keyboard,
    /// One-shot network fetch of `url`.
    Fetch { url: Arc<str> },
    /// Physics-driven motion fed back by the host.
    Motion,
    /// Always-fresh sampler; every read in the present produces a new value.
    Random,
}

/// Unary operator set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Negate,
}

/// Binary operator set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Equal,
    NotEqual,
    Greater,
    GreaterOrEqual,
    Less,
    LessOrEqual,
    And,
    Or,
}

/// Dimensioned units carried by numbers.
///
/// Units are an opaque numeric capability: the engine only needs dimension
/// compatibility checks and base-scale conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Unit {
    Milliseconds,
    Seconds,
    Minutes,
    Meters,
    Centimeters,
    Kilograms,
    Grams,
    Degrees,
    Radians,
}

/// Physical dimension of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
    Time,
    Length,
    Mass,
    Angle,
}

impl Unit {
    pub fn dimension(&self) -> Dimension {
        match self {
            Unit::Milliseconds | Unit::Seconds | Unit::Minutes => Dimension::Time,
            Unit::Meters | Unit::Centimeters => Dimension::Length,
            Unit::Kilograms | Unit::Grams => Dimension::Mass,
            Unit::Degrees | Unit::Radians => Dimension::Angle,
        }
    }

    /// Scale factor to the dimension's base unit (ms, m, kg, rad).
    pub fn base_scale(&self) -> f64 {
        match self {
            Unit::Milliseconds => 1.0,
            Unit::Seconds => 1_000.0,
            Unit::Minutes => 60_000.0,
            Unit::Meters => 1.0,
            Unit::Centimeters => 0.01,
            Unit::Kilograms => 1.0,
            Unit::Grams => 0.001,
            Unit::Radians => 1.0,
            Unit::Degrees => core::f64::consts::PI / 180.0,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Unit::Milliseconds => "ms",
            Unit::Seconds => "s",
            Unit::Minutes => "min",
            Unit::Meters => "m",
            Unit::Centimeters => "cm",
            Unit::Kilograms => "kg",
            Unit::Grams => "g",
            Unit::Degrees => "deg",
            Unit::Radians => "rad",
        }
    }
}

/// Helper for embedders and tests that assemble trees by hand.
///
/// Assigns node ids the way the compiler does: one fresh id per node, in
/// construction order.
#[derive(Default)]
pub struct NodeBuilder {
    next_id: u32,
}

impl NodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&mut self, kind: ExprKind) -> Arc<Node> {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        Arc::new(Node { id, kind })
    }

    pub fn number(&mut self, magnitude: f64) -> Arc<Node> {
        self.node(ExprKind::Number { magnitude, unit: None })
    }

    pub fn number_with_unit(&mut self, magnitude: f64, unit: Unit) -> Arc<Node> {
        self.node(ExprKind::Number { magnitude, unit: Some(unit) })
    }

    pub fn text(&mut self, text: &str) -> Arc<Node> {
        self.node(ExprKind::Text(text.into()))
    }

    pub fn boolean(&mut self, value: bool) -> Arc<Node> {
        self.node(ExprKind::Bool(value))
    }

    pub fn reference(&mut self, name: &str) -> Arc<Node> {
        self.node(ExprKind::Reference(name.into()))
    }

    pub fn list(&mut self, elements: Vec<Arc<Node>>) -> Arc<Node> {
        self.node(ExprKind::List(elements))
    }

    pub fn binary(&mut self, op: BinaryOp, left: Arc<Node>, right: Arc<Node>) -> Arc<Node> {
        self.node(ExprKind::Binary { op, left, right })
    }

    pub fn block(&mut self, binds: Vec<(&str, Arc<Node>)>, result: Arc<Node>) -> Arc<Node> {
        let binds = binds
            .into_iter()
            .map(|(name, value)| (Arc::<str>::from(name), value))
            .collect();
        self.node(ExprKind::Block { binds, result })
    }

    pub fn function(&mut self, parameters: &[&str], body: Arc<Node>) -> Arc<Node> {
        let parameters = parameters.iter().map(|p| Arc::<str>::from(*p)).collect();
        self.node(ExprKind::Function { parameters, body })
    }

    pub fn call(&mut self, callee: Arc<Node>, arguments: Vec<Arc<Node>>) -> Arc<Node> {
        self.node(ExprKind::Call { callee, arguments })
    }

    pub fn basis_call(
        &mut self,
        type_name: &str,
        function: &str,
        arguments: Vec<Arc<Node>>,
    ) -> Arc<Node> {
        self.node(ExprKind::BasisCall {
            type_name: type_name.into(),
            function: function.into(),
            arguments,
        })
    }

    pub fn translate(&mut self, subject: Arc<Node>, transform: Arc<Node>) -> Arc<Node> {
        self.node(ExprKind::Translate { subject, transform })
    }

    pub fn react(&mut self, initial: Arc<Node>, trigger: Arc<Node>, update: Arc<Node>) -> Arc<Node> {
        self.node(ExprKind::React { initial, trigger, update })
    }

    pub fn source(&mut self, kind: SourceKind) -> Arc<Node> {
        self.node(ExprKind::Source(kind))
    }

    pub fn clock(&mut self, interval_ms: f64) -> Arc<Node> {
        self.source(SourceKind::Clock { interval_ms })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_assigns_fresh_ids() {
        let mut b = NodeBuilder::new();
        let one = b.number(1.0);
        let two = b.number(2.0);
        assert_ne!(one.id, two.id);
    }

    #[test]
    fn unit_conversion_scales() {
        let seconds = Unit::Seconds;
        assert_eq!(seconds.dimension(), Dimension::Time);
        assert_eq!(seconds.base_scale(), 1_000.0);
        assert_ne!(Unit::Seconds.base_scale(), Unit::Minutes.base_scale());
    }
}
