//! Runtime value model.
//!
//! Values are immutable, structurally compared, and carry the node that
//! created them plus a monotonically increasing identity counter for
//! explanation and debugging. Failures are ordinary `Exception` values,
//! never host-level panics.

use std::cmp::Ordering;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use crate::engine::frame::Scope;
use crate::engine::stream::StreamKey;
use crate::syntax::{Node, NodeId, Unit};

static NEXT_VALUE_ID: AtomicU64 = AtomicU64::new(0);

/// Monotonic identity counter stamped on every freshly created value.
///
/// Clones share the id; only construction mints a new one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub u64);

impl ValueId {
    fn next() -> Self {
        Self(NEXT_VALUE_ID.fetch_add(1, AtomicOrdering::Relaxed))
    }
}

/// A runtime value: identity, provenance, and the tagged payload.
#[derive(Clone, Debug)]
pub struct Value {
    id: ValueId,
    origin: NodeId,
    kind: ValueKind,
}

/// The closed set of value shapes.
#[derive(Clone, Debug)]
pub enum ValueKind {
    /// Magnitude plus optional dimensioned unit.
    Number { magnitude: f64, unit: Option<Unit> },
    Text(Arc<str>),
    Bool(bool),
    None,
    List(Arc<Vec<Value>>),
    /// Unique elements, insertion order irrelevant.
    Set(Arc<Vec<Value>>),
    /// Unique keys, insertion order irrelevant.
    Map(Arc<Vec<(Value, Value)>>),
    /// Named field bindings plus the defining type's name.
    Structure {
        type_name: Arc<str>,
        fields: Arc<Vec<(Arc<str>, Value)>>,
    },
    /// Closure: body node plus the captured scope chain.
    Function(Rc<Closure>),
    /// First-class handle to a live stream in the registry.
    Stream(StreamKey),
    /// Tagged failure value; flows through evaluation like any other value.
    Exception(Exception),
}

/// A function value: parameters, body, and the scope it closed over.
///
/// The captured scope is the surviving remnant of the frame that created the
/// closure; shared ownership keeps it alive past the frame's pop.
#[derive(Debug)]
pub struct Closure {
    pub parameters: Vec<Arc<str>>,
    pub body: Arc<Node>,
    pub captured: Rc<Scope>,
}

/// Failure taxonomy. All variants are values, not control flow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Exception {
    /// Reference to an undefined binding.
    Name { name: Arc<str>, scope: Arc<str> },
    /// An operation received a value of unexpected shape.
    Value { message: Arc<str> },
    /// Native/basis-level failure with a human-readable message.
    Message { message: Arc<str> },
    /// Runtime shape check failed despite upstream checking.
    Type { message: Arc<str> },
}

impl Exception {
    pub fn describe(&self) -> String {
        match self {
            Exception::Name { name, scope } => {
                format!("unknown name `{name}` in {scope}")
            }
            Exception::Value { message } => format!("value error: {message}"),
            Exception::Message { message } => message.to_string(),
            Exception::Type { message } => format!("type error: {message}"),
        }
    }
}

impl Value {
    pub fn new(origin: NodeId, kind: ValueKind) -> Self {
        Self { id: ValueId::next(), origin, kind }
    }

    pub fn id(&self) -> ValueId {
        self.id
    }

    /// The node that created this value.
    pub fn origin(&self) -> NodeId {
        self.origin
    }

    pub fn kind(&self) -> &ValueKind {
        &self.kind
    }

    pub fn number(origin: NodeId, magnitude: f64) -> Self {
        Self::new(origin, ValueKind::Number { magnitude, unit: None })
    }

    pub fn number_with_unit(origin: NodeId, magnitude: f64, unit: Unit) -> Self {
        Self::new(origin, ValueKind::Number { magnitude, unit: Some(unit) })
    }

    pub fn text(origin: NodeId, text: impl Into<Arc<str>>) -> Self {
        Self::new(origin, ValueKind::Text(text.into()))
    }

    pub fn boolean(origin: NodeId, value: bool) -> Self {
        Self::new(origin, ValueKind::Bool(value))
    }

    pub fn none(origin: NodeId) -> Self {
        Self::new(origin, ValueKind::None)
    }

    pub fn exception(origin: NodeId, exception: Exception) -> Self {
        Self::new(origin, ValueKind::Exception(exception))
    }

    pub fn is_exception(&self) -> bool {
        matches!(self.kind, ValueKind::Exception(_))
    }

    pub fn as_stream(&self) -> Option<StreamKey> {
        match &self.kind {
            ValueKind::Stream(key) => Some(*key),
            _ => None,
        }
    }

    /// Magnitude in the unit's base scale, for dimension-aware arithmetic.
    pub fn base_magnitude(&self) -> Option<f64> {
        match &self.kind {
            ValueKind::Number { magnitude, unit } => {
                Some(magnitude * unit.map_or(1.0, |u| u.base_scale()))
            }
            _ => None,
        }
    }

    /// Structural equality; identity and provenance are ignored.
    pub fn structural_eq(&self, other: &Value) -> bool {
        self.kind.structural_eq(&other.kind)
    }

    /// Display string for the rendering layer and text interpolation.
    pub fn to_display_string(&self) -> String {
        match &self.kind {
            ValueKind::Number { magnitude, unit } => {
                let body = format_magnitude(*magnitude);
                match unit {
                    Some(unit) => format!("{body}{}", unit.symbol()),
                    None => body,
                }
            }
            ValueKind::Text(text) => text.to_string(),
            ValueKind::Bool(b) => b.to_string(),
            ValueKind::None => String::new(),
            ValueKind::List(items) => {
                let parts: Vec<_> = items.iter().map(Value::to_display_string).collect();
                format!("[{}]", parts.join(" "))
            }
            ValueKind::Set(items) => {
                let parts: Vec<_> = items.iter().map(Value::to_display_string).collect();
                format!("{{{}}}", parts.join(" "))
            }
            ValueKind::Map(entries) => {
                let parts: Vec<_> = entries
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k.to_display_string(), v.to_display_string()))
                    .collect();
                format!("{{{}}}", parts.join(" "))
            }
            ValueKind::Structure { type_name, fields } => {
                let parts: Vec<_> = fields
                    .iter()
                    .map(|(name, value)| format!("{name}: {}", value.to_display_string()))
                    .collect();
                format!("{type_name}[{}]", parts.join(" "))
            }
            ValueKind::Function(_) => "ƒ".to_string(),
            ValueKind::Stream(key) => format!("stream({}, {})", key.node.0, key.occurrence),
            ValueKind::Exception(exception) => format!("!{}", exception.describe()),
        }
    }
}

fn format_magnitude(magnitude: f64) -> String {
    if magnitude.fract() == 0.0 && magnitude.abs() < 1e15 {
        format!("{}", magnitude as i64)
    } else {
        format!("{magnitude}")
    }
}

/// Compare two numbers across compatible units. `None` when either operand
/// is not a number or the dimensions differ.
pub fn compare_numbers(left: &Value, right: &Value) -> Option<Ordering> {
    let (ValueKind::Number { unit: lu, .. }, ValueKind::Number { unit: ru, .. }) =
        (left.kind(), right.kind())
    else {
        return None;
    };
    let compatible = match (lu, ru) {
        (None, None) => true,
        (Some(a), Some(b)) => a.dimension() == b.dimension(),
        _ => false,
    };
    if !compatible {
        return None;
    }
    left.base_magnitude()?.partial_cmp(&right.base_magnitude()?)
}

impl ValueKind {
    pub fn structural_eq(&self, other: &ValueKind) -> bool {
        match (self, other) {
            (
                ValueKind::Number { magnitude: lm, unit: lu },
                ValueKind::Number { magnitude: rm, unit: ru },
            ) => {
                let compatible = match (lu, ru) {
                    (None, None) => true,
                    (Some(a), Some(b)) => a.dimension() == b.dimension(),
                    _ => false,
                };
                compatible
                    && lm * lu.map_or(1.0, |u| u.base_scale())
                        == rm * ru.map_or(1.0, |u| u.base_scale())
            }
            (ValueKind::Text(l), ValueKind::Text(r)) => l == r,
            (ValueKind::Bool(l), ValueKind::Bool(r)) => l == r,
            (ValueKind::None, ValueKind::None) => true,
            (ValueKind::List(l), ValueKind::List(r)) => {
                l.len() == r.len() && l.iter().zip(r.iter()).all(|(a, b)| a.structural_eq(b))
            }
            // Sets hold unique elements, so same length + containment suffices.
            (ValueKind::Set(l), ValueKind::Set(r)) => {
                l.len() == r.len()
                    && l.iter().all(|a| r.iter().any(|b| a.structural_eq(b)))
            }
            (ValueKind::Map(l), ValueKind::Map(r)) => {
                l.len() == r.len()
                    && l.iter().all(|(lk, lv)| {
                        r.iter()
                            .any(|(rk, rv)| lk.structural_eq(rk) && lv.structural_eq(rv))
                    })
            }
            (
                ValueKind::Structure { type_name: lt, fields: lf },
                ValueKind::Structure { type_name: rt, fields: rf },
            ) => {
                lt == rt
                    && lf.len() == rf.len()
                    && lf.iter().all(|(name, lv)| {
                        rf.iter()
                            .any(|(rname, rv)| name == rname && lv.structural_eq(rv))
                    })
            }
            // Functions compare by closure identity; there is no structural
            // notion of function equality in the language.
            (ValueKind::Function(l), ValueKind::Function(r)) => Rc::ptr_eq(l, r),
            (ValueKind::Stream(l), ValueKind::Stream(r)) => l == r,
            (ValueKind::Exception(l), ValueKind::Exception(r)) => l == r,
            _ => false,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.structural_eq(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> NodeId {
        NodeId(0)
    }

    #[test]
    fn value_ids_are_monotonic() {
        let a = Value::number(origin(), 1.0);
        let b = Value::number(origin(), 1.0);
        assert!(b.id() > a.id());
        // Clones share identity.
        assert_eq!(a.clone().id(), a.id());
    }

    #[test]
    fn numbers_compare_across_units() {
        let half_second = Value::number_with_unit(origin(), 0.5, Unit::Seconds);
        let same_in_ms = Value::number_with_unit(origin(), 500.0, Unit::Milliseconds);
        assert_eq!(half_second, same_in_ms);
        assert_eq!(
            compare_numbers(&half_second, &same_in_ms),
            Some(Ordering::Equal)
        );

        let mass = Value::number_with_unit(origin(), 0.5, Unit::Kilograms);
        assert_ne!(half_second, mass);
        assert_eq!(compare_numbers(&half_second, &mass), None);
    }

    #[test]
    fn sets_ignore_insertion_order() {
        let a = Value::new(
            origin(),
            ValueKind::Set(Arc::new(vec![
                Value::number(origin(), 1.0),
                Value::number(origin(), 2.0),
            ])),
        );
        let b = Value::new(
            origin(),
            ValueKind::Set(Arc::new(vec![
                Value::number(origin(), 2.0),
                Value::number(origin(), 1.0),
            ])),
        );
        assert_eq!(a, b);
    }

    #[test]
    fn display_trims_integral_magnitudes() {
        assert_eq!(Value::number(origin(), 2.0).to_display_string(), "2");
        assert_eq!(
            Value::number_with_unit(origin(), 0.0, Unit::Milliseconds).to_display_string(),
            "0ms"
        );
        assert_eq!(Value::number(origin(), 2.5).to_display_string(), "2.5");
    }

    #[test]
    fn exceptions_are_values_not_errors() {
        let exc = Value::exception(
            origin(),
            Exception::Name { name: "a".into(), scope: "main".into() },
        );
        assert!(exc.is_exception());
        assert_eq!(exc.to_display_string(), "!unknown name `a` in main");
    }
}
