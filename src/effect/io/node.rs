//! The untyped effect tree walked by the interpreter.
//!
//! Every [`IO`](super::IO) wraps one [`Node`]. Values and errors travel through
//! the tree type-erased (`Box<dyn Any + Send>`), the typed facade in
//! `io/mod.rs` inserts the downcasts at the points where it knows the types.
//!
//! Each variant owns its operands. A node's tag alone decides how the
//! interpreter dispatches it.
//!
//! Trees can be arbitrarily deep, so they are never torn down by recursive
//! drop glue: operands live in [`Child`] boxes, and both `Child` and `IO`
//! hand the nodes they drop to [`dispose`], which flattens the teardown
//! into a loop over a per-thread worklist.

use std::any::Any;
use std::cell::RefCell;

use super::super::error::Error;
use super::super::fiber::Resumer;
use super::Poll;

/// A type-erased effect result.
pub(crate) type Value = Box<dyn Any + Send>;

pub(crate) type Thunk = Box<dyn FnOnce() -> Result<Value, Error> + Send>;
pub(crate) type DeferFn = Box<dyn FnOnce() -> Node + Send>;
pub(crate) type MapFn = Box<dyn FnOnce(Value) -> Value + Send>;
pub(crate) type BindFn = Box<dyn FnOnce(Value) -> Node + Send>;
pub(crate) type HandlerFn = Box<dyn FnOnce(Error) -> Node + Send>;
pub(crate) type RegisterFn = Box<dyn FnOnce(Resumer) -> Option<Node> + Send>;
pub(crate) type MaskedFn = Box<dyn FnOnce(Poll) -> Node + Send>;

pub(crate) enum Node {
    /// An already computed value.
    Pure(Value),
    /// A declared failure.
    Fail(Error),
    /// A synchronous side effect.
    Delay(Thunk),
    /// Builds the next node lazily.
    Defer(DeferFn),
    Map(Child, MapFn),
    FlatMap(Child, BindFn),
    HandleErrorWith(Child, HandlerFn),
    /// Reifies the failure channel of the child into a `Result` value.
    Attempt(Child),
    /// The only suspension point: hands a resumer to the registration
    /// function, which may return a finalizer to run if the wait is canceled.
    Async(RegisterFn),
    Uncancelable(MaskedFn),
    /// Lifts the mask of uncancelable region `.0` for the duration of the
    /// child, if that region is the innermost one still masking.
    Unmask(u64, Child),
    /// Runs the finalizer if the child is canceled.
    OnCancel(Child, Child),
    /// Forks the child into a new fiber on the current scheduler.
    Start(Child),
    /// Yields the rest of the turn to other ready fibers.
    Cede,
    /// Requests cancellation of the running fiber.
    Canceled,
}

impl Node {
    pub(crate) fn unit() -> Self {
        Self::Pure(unit_value())
    }
}

/// A boxed operand of a [`Node`].
pub(crate) struct Child(Box<Node>);

impl Child {
    pub(crate) fn new(node: Node) -> Self {
        Self(Box::new(node))
    }

    pub(crate) fn into_node(mut self) -> Node {
        std::mem::replace(&mut *self.0, Node::Cede)
    }
}

impl Drop for Child {
    fn drop(&mut self) {
        dispose(std::mem::replace(&mut *self.0, Node::Cede));
    }
}

thread_local! {
    /// Nodes waiting to be dropped by the teardown loop running on this
    /// thread. `None` while no teardown is in progress.
    static DISPOSAL: RefCell<Option<Vec<Node>>> = const { RefCell::new(None) };
}

/// Drops `node` without recursing on the native stack.
///
/// The outermost call runs the teardown loop. Nested calls, made while
/// that loop drops a node whose operands reach `dispose` again, only push
/// onto the worklist, so the stack depth stays constant however deep the
/// tree is.
pub(crate) fn dispose(node: Node) {
    if matches!(node, Node::Cede | Node::Canceled) {
        return;
    }

    let first = DISPOSAL.try_with(move |slot| {
        let mut slot = slot.borrow_mut();
        match slot.as_mut() {
            Some(worklist) => {
                worklist.push(node);
                None
            }
            None => {
                *slot = Some(Vec::new());
                Some(node)
            }
        }
    });

    // On `Err` the thread-local is already gone and the node was dropped
    // in place with the closure.
    if let Ok(Some(first)) = first {
        drop(first);
        while let Some(next) = DISPOSAL
            .try_with(|slot| slot.borrow_mut().as_mut().and_then(Vec::pop))
            .ok()
            .flatten()
        {
            drop(next);
        }
        let _ = DISPOSAL.try_with(|slot| slot.borrow_mut().take());
    }
}

pub(crate) fn unit_value() -> Value {
    Box::new(())
}

/// Recovers the concrete type of an erased value.
///
/// # Panics
///
/// Panics if `A` is not the type the value was erased from. The typed facade
/// only builds trees where the types line up, so this marks a library bug.
pub(crate) fn downcast<A: 'static>(value: Value) -> A {
    *value
        .downcast::<A>()
        .expect("Type mismatch in effect value")
}
