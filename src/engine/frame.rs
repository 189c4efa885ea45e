//! Evaluation frames and lexical scopes.
//!
//! Frames form an explicit stack owned by the evaluator; user-level
//! evaluation never recurses on the native call stack, which is what makes
//! pausing on a silent stream and resuming at the exact step possible.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::engine::reaction::ReactionDecision;
use crate::engine::step::{Steps, sequence};
use crate::engine::value::Value;
use crate::syntax::{ExprKind, Node};

/// One link of the lexical scope chain.
///
/// Scopes are shared: a closure keeps its defining scope alive after the
/// frame that created it was popped. Binding insertion happens through
/// interior mutability because the owning frame and any captured closures
/// hold the same `Rc`.
#[derive(Debug)]
pub struct Scope {
    bindings: RefCell<FxHashMap<Arc<str>, Value>>,
    parent: Option<Rc<Scope>>,
}

impl Scope {
    pub fn root() -> Rc<Self> {
        Rc::new(Self { bindings: RefCell::new(FxHashMap::default()), parent: None })
    }

    pub fn child(parent: &Rc<Scope>) -> Rc<Self> {
        Rc::new(Self {
            bindings: RefCell::new(FxHashMap::default()),
            parent: Some(parent.clone()),
        })
    }

    pub fn insert(&self, name: Arc<str>, value: Value) {
        self.bindings.borrow_mut().insert(name, value);
    }

    /// Walk the chain from innermost to outermost.
    pub fn resolve(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.bindings.borrow().get(name) {
            return Some(value.clone());
        }
        self.parent.as_ref().and_then(|parent| parent.resolve(name))
    }

    /// Clone of the local bindings only (no parent chain).
    pub fn local_bindings(&self) -> FxHashMap<Arc<str>, Value> {
        self.bindings.borrow().clone()
    }
}

/// Lifecycle of a frame on the stack.
///
/// `Pending → Active → {Suspended ⇄ Active} → Resolved | Failed`.
/// `Failed` still delivers its exception to the parent as an ordinary value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameState {
    Pending,
    Active,
    Suspended,
    Resolved,
    Failed,
}

/// One activation record: the node under evaluation, its scope, the step
/// cursor, and the operand stack the steps work against.
#[derive(Debug)]
pub struct Frame {
    pub node: Arc<Node>,
    pub scope: Rc<Scope>,
    pub steps: Steps,
    pub cursor: usize,
    pub operands: Vec<Value>,
    /// Iteration scratch for element-wise steps (translate).
    pub counter: usize,
    /// Set by `ReactChoose`, consumed by `ReactCommit`.
    pub reaction: Option<ReactionDecision>,
    pub state: FrameState,
}

impl Frame {
    /// Build a frame for a node. Blocks open their own scope so binds stay
    /// local; every other node shares the parent scope.
    pub fn new(node: Arc<Node>, scope: Rc<Scope>) -> Self {
        let scope = match node.kind {
            ExprKind::Block { .. } => Scope::child(&scope),
            _ => scope,
        };
        let steps = sequence(&node);
        Self {
            node,
            scope,
            steps,
            cursor: 0,
            operands: Vec::new(),
            counter: 0,
            reaction: None,
            state: FrameState::Pending,
        }
    }

    pub fn steps_exhausted(&self) -> bool {
        self.cursor >= self.steps.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syntax::{NodeBuilder, NodeId};

    #[test]
    fn scope_chain_resolution() {
        let root = Scope::root();
        root.insert("a".into(), Value::number(NodeId(0), 1.0));
        let child = Scope::child(&root);
        child.insert("b".into(), Value::number(NodeId(1), 2.0));

        assert!(child.resolve("a").is_some());
        assert!(child.resolve("b").is_some());
        assert!(root.resolve("b").is_none());
        assert!(child.resolve("c").is_none());
    }

    #[test]
    fn inner_binding_shadows_outer() {
        let root = Scope::root();
        root.insert("x".into(), Value::number(NodeId(0), 1.0));
        let child = Scope::child(&root);
        child.insert("x".into(), Value::number(NodeId(1), 2.0));

        let resolved = child.resolve("x").unwrap();
        assert_eq!(resolved, Value::number(NodeId(1), 2.0));
    }

    #[test]
    fn block_frames_open_a_fresh_scope() {
        let mut b = NodeBuilder::new();
        let one = b.number(1.0);
        let result = b.reference("a");
        let block = b.block(vec![("a", one)], result);

        let outer = Scope::root();
        let frame = Frame::new(block, outer.clone());
        frame.scope.insert("a".into(), Value::number(NodeId(0), 1.0));

        // The bind landed in the block scope, not the outer one.
        assert!(outer.resolve("a").is_none());
        assert!(frame.scope.resolve("a").is_some());
        assert_eq!(frame.state, FrameState::Pending);
    }
}
