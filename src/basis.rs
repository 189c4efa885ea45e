//! Native basis function boundary.
//!
//! The basis library is an external collaborator: the engine only needs a
//! lookup from `(type name, function name)` to a total native callable.
//! Totality means a native never panics and never throws: failures come
//! back as Exception values through the normal channel.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::engine::value::{Exception, Value, ValueKind};
use crate::syntax::NodeId;

/// A native callable. `origin` is the calling node, used to attribute
/// produced values.
pub type BasisFn = fn(origin: NodeId, args: &[Value]) -> Value;

/// Lookup table for native basis functions.
#[derive(Default)]
pub struct BasisRegistry {
    functions: FxHashMap<(Arc<str>, Arc<str>), BasisFn>,
}

impl BasisRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with the built-in natives tests rely on.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("Math", "mult", math_mult);
        registry.register("Math", "sum", math_sum);
        registry.register("Text", "join", text_join);
        registry.register("List", "count", list_count);
        registry
    }

    pub fn register(&mut self, type_name: &str, function: &str, f: BasisFn) {
        self.functions.insert((type_name.into(), function.into()), f);
    }

    pub fn lookup(&self, type_name: &str, function: &str) -> Option<BasisFn> {
        self.functions
            .get(&(Arc::<str>::from(type_name), Arc::<str>::from(function)))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

fn number_args(origin: NodeId, args: &[Value], who: &str) -> Result<Vec<f64>, Value> {
    args.iter()
        .map(|arg| {
            arg.base_magnitude().ok_or_else(|| {
                Value::exception(
                    origin,
                    Exception::Value {
                        message: format!("{who} expects numbers, got {}", arg.to_display_string())
                            .into(),
                    },
                )
            })
        })
        .collect()
}

/// Product of all arguments.
fn math_mult(origin: NodeId, args: &[Value]) -> Value {
    match number_args(origin, args, "Math/mult") {
        Ok(numbers) => Value::number(origin, numbers.iter().product()),
        Err(exception) => exception,
    }
}

/// Sum of all arguments.
fn math_sum(origin: NodeId, args: &[Value]) -> Value {
    match number_args(origin, args, "Math/sum") {
        Ok(numbers) => Value::number(origin, numbers.iter().sum()),
        Err(exception) => exception,
    }
}

/// Concatenate text arguments.
fn text_join(origin: NodeId, args: &[Value]) -> Value {
    let mut joined = String::new();
    for arg in args {
        match arg.kind() {
            ValueKind::Text(text) => joined.push_str(text),
            _ => joined.push_str(&arg.to_display_string()),
        }
    }
    Value::text(origin, joined.as_str())
}

/// Element count of a list or set.
fn list_count(origin: NodeId, args: &[Value]) -> Value {
    match args {
        [single] => match single.kind() {
            ValueKind::List(items) | ValueKind::Set(items) => {
                Value::number(origin, items.len() as f64)
            }
            _ => Value::exception(
                origin,
                Exception::Value {
                    message: format!(
                        "List/count expects a collection, got {}",
                        single.to_display_string()
                    )
                    .into(),
                },
            ),
        },
        _ => Value::exception(
            origin,
            Exception::Value { message: "List/count expects one argument".into() },
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_finds_registered_natives() {
        let registry = BasisRegistry::with_defaults();
        assert!(registry.lookup("Math", "mult").is_some());
        assert!(registry.lookup("Math", "missing").is_none());
    }

    #[test]
    fn natives_are_total() {
        let registry = BasisRegistry::with_defaults();
        let mult = registry.lookup("Math", "mult").unwrap();

        // Bad shapes come back as Exception values, never panics.
        let bad = mult(NodeId(0), &[Value::text(NodeId(0), "nope")]);
        assert!(bad.is_exception());

        let good = mult(
            NodeId(0),
            &[Value::number(NodeId(0), 2.0), Value::number(NodeId(0), 3.0)],
        );
        assert_eq!(good, Value::number(NodeId(0), 6.0));
    }
}
