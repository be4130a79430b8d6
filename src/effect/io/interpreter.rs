//! Trampolined interpreter for the effect tree.
//!
//! The interpreter never recurses on the native stack. It keeps the current
//! [`Step`] in a local variable and pushes pending work onto an explicit
//! frame stack owned by the fiber:
//!
//! - descending into `Map`/`FlatMap`/`HandleErrorWith` pushes the function
//!   together with its tag, `Attempt` pushes only the tag;
//! - on success, `Map` applies its function, `FlatMap` re-enters descent on
//!   the node it returns, `Handle` frames are discarded and `Attempt` wraps
//!   the value in `Ok`;
//! - on failure, `Map`/`FlatMap` frames are discarded, `Handle` re-enters
//!   descent on the handler's node and `Attempt` turns the error into an
//!   `Err` *value*, switching back to the success protocol.
//!
//! Bookkeeping frames (`Unmask`, `Remask`, `PopFinalizer`) run on both paths.
//!
//! A turn ends when the frame stack is empty (the fiber completed), when an
//! `Async` node suspends the fiber, or when the fiber yields its turn.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use smallvec::SmallVec;

use super::super::error::Error;
use super::super::fiber::{FiberCore, Resumer};
use super::super::outcome::Outcome;
use super::super::runtime::Scheduler;
use super::Poll;
use super::node::{BindFn, Child, HandlerFn, MapFn, Node, Value, unit_value};

const FRAME_INLINE_CAPACITY: usize = 16;

/// Source of uncancelable region identities. Shared by all fibers, so a
/// `Poll` carried into another fiber never matches a region there either.
static NEXT_REGION: AtomicU64 = AtomicU64::new(0);

fn next_region() -> u64 {
    NEXT_REGION.fetch_add(1, Ordering::Relaxed)
}

/// A pending continuation, tagged by what it does on each path.
pub(crate) enum Frame {
    Map(MapFn),
    FlatMap(BindFn),
    Handle(HandlerFn),
    Attempt,
    /// Leaving an uncancelable region.
    Unmask,
    /// Leaving a `poll` window; region `.0` masks again.
    Remask(u64),
    /// Leaving an `on_cancel` scope; its finalizer is no longer needed.
    PopFinalizer,
}

/// What the interpreter does next.
pub(crate) enum Step {
    Descend(Node),
    Succeed(Value),
    Fail(Error),
    /// Unwind the fiber: drop its frames and run its finalizers.
    Cancel,
}

/// Per-fiber interpreter state, parked in the fiber between turns.
pub(crate) struct Stack {
    frames: SmallVec<[Frame; FRAME_INLINE_CAPACITY]>,
    finalizers: Vec<Node>,
    /// Identities of the uncancelable regions currently masking the fiber,
    /// innermost last. The fiber is cancelable when this is empty.
    masks: Vec<u64>,
}

impl Stack {
    pub(crate) fn new() -> Self {
        Self {
            frames: SmallVec::new(),
            finalizers: Vec::new(),
            masks: Vec::new(),
        }
    }

    fn is_masked(&self) -> bool {
        !self.masks.is_empty()
    }
}

/// Why a turn ended.
pub(crate) enum Exit {
    /// The fiber is waiting for an async callback.
    Suspended,
    /// The fiber gave up its turn and continues with the step.
    Yielded(Step),
    /// The fiber reached a terminal outcome.
    Completed(Outcome<Value>),
}

fn guard<T>(function: impl FnOnce() -> T) -> Result<T, Error> {
    catch_unwind(AssertUnwindSafe(function)).map_err(Error::from_panic)
}

fn descend_or_fail(result: Result<Node, Error>) -> Step {
    match result {
        Ok(node) => Step::Descend(node),
        Err(error) => Step::Fail(error),
    }
}

/// Builds the node that runs the finalizers newest first, logging and
/// swallowing their failures.
fn finalizer_chain(finalizers: Vec<Node>) -> Node {
    let mut chain = Node::unit();
    for finalizer in finalizers {
        let guarded = Node::HandleErrorWith(
            Child::new(finalizer),
            Box::new(|_error| {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %_error, "finalizer failed during cancellation");
                Node::unit()
            }),
        );
        chain = Node::FlatMap(Child::new(guarded), Box::new(move |_| chain));
    }
    chain
}

/// Runs one turn of `fiber` starting from `step`.
///
/// `budget` bounds the number of steps before the fiber yields; `0` disables
/// the bound.
#[allow(clippy::too_many_lines)]
pub(crate) fn run(
    fiber: &Arc<FiberCore>,
    scheduler: &Scheduler,
    stack: &mut Stack,
    mut step: Step,
    budget: usize,
) -> Exit {
    let mut steps = 0_usize;

    loop {
        if budget > 0 {
            steps += 1;
            if steps > budget {
                return Exit::Yielded(step);
            }
        }

        step = match step {
            Step::Descend(node) => match node {
                Node::Pure(value) => Step::Succeed(value),
                Node::Fail(error) => Step::Fail(error),
                Node::Delay(thunk) => match guard(thunk) {
                    Ok(Ok(value)) => Step::Succeed(value),
                    Ok(Err(error)) | Err(error) => Step::Fail(error),
                },
                Node::Defer(thunk) => descend_or_fail(guard(thunk)),
                Node::Map(source, function) => {
                    stack.frames.push(Frame::Map(function));
                    Step::Descend(source.into_node())
                }
                Node::FlatMap(source, function) => {
                    stack.frames.push(Frame::FlatMap(function));
                    Step::Descend(source.into_node())
                }
                Node::HandleErrorWith(source, handler) => {
                    stack.frames.push(Frame::Handle(handler));
                    Step::Descend(source.into_node())
                }
                Node::Attempt(source) => {
                    stack.frames.push(Frame::Attempt);
                    Step::Descend(source.into_node())
                }
                Node::Async(register) => {
                    if !stack.is_masked() && fiber.cancel_requested() {
                        Step::Cancel
                    } else {
                        let epoch = fiber.begin_suspension(scheduler, !stack.is_masked());
                        let resumer = Resumer::new(fiber, epoch);
                        match guard(|| register(resumer)) {
                            Ok(finalizer) => {
                                if let Some(finalizer) = finalizer {
                                    stack.finalizers.push(finalizer);
                                    stack.frames.push(Frame::PopFinalizer);
                                }
                                return Exit::Suspended;
                            }
                            Err(error) => {
                                if !fiber.abort_suspension(scheduler, epoch) {
                                    // The callback already resumed the fiber.
                                    return Exit::Suspended;
                                }
                                Step::Fail(error)
                            }
                        }
                    }
                }
                Node::Uncancelable(body) => {
                    let region = next_region();
                    stack.masks.push(region);
                    stack.frames.push(Frame::Unmask);
                    descend_or_fail(guard(|| body(Poll::new(region))))
                }
                Node::Unmask(region, body) => {
                    if stack.masks.last() == Some(&region) {
                        stack.masks.pop();
                        stack.frames.push(Frame::Remask(region));
                        if !stack.is_masked() && fiber.cancel_requested() {
                            Step::Cancel
                        } else {
                            Step::Descend(body.into_node())
                        }
                    } else {
                        Step::Descend(body.into_node())
                    }
                }
                Node::OnCancel(body, finalizer) => {
                    stack.finalizers.push(finalizer.into_node());
                    stack.frames.push(Frame::PopFinalizer);
                    Step::Descend(body.into_node())
                }
                Node::Start(body) => {
                    let child = scheduler.spawn(body.into_node());
                    Step::Succeed(Box::new(child))
                }
                Node::Cede => {
                    if !stack.is_masked() && fiber.cancel_requested() {
                        Step::Cancel
                    } else {
                        return Exit::Yielded(Step::Succeed(unit_value()));
                    }
                }
                Node::Canceled => {
                    fiber.request_self_cancel();
                    if !stack.is_masked() {
                        Step::Cancel
                    } else {
                        Step::Succeed(unit_value())
                    }
                }
            },

            Step::Succeed(value) => match stack.frames.pop() {
                None => {
                    if fiber.is_finalizing() {
                        return Exit::Completed(Outcome::Canceled);
                    }
                    return Exit::Completed(Outcome::Succeeded(value));
                }
                Some(Frame::Map(function)) => match guard(|| function(value)) {
                    Ok(mapped) => Step::Succeed(mapped),
                    Err(error) => Step::Fail(error),
                },
                Some(Frame::FlatMap(function)) => descend_or_fail(guard(|| function(value))),
                Some(Frame::Handle(_)) => Step::Succeed(value),
                Some(Frame::Attempt) => Step::Succeed(Box::new(Ok::<Value, Error>(value))),
                Some(Frame::Unmask) => {
                    stack.masks.pop();
                    if !stack.is_masked() && fiber.cancel_requested() {
                        Step::Cancel
                    } else {
                        Step::Succeed(value)
                    }
                }
                Some(Frame::Remask(region)) => {
                    stack.masks.push(region);
                    Step::Succeed(value)
                }
                Some(Frame::PopFinalizer) => {
                    stack.finalizers.pop();
                    Step::Succeed(value)
                }
            },

            Step::Fail(error) => match stack.frames.pop() {
                None => {
                    if fiber.is_finalizing() {
                        return Exit::Completed(Outcome::Canceled);
                    }
                    return Exit::Completed(Outcome::Errored(error));
                }
                Some(Frame::Map(_) | Frame::FlatMap(_)) => Step::Fail(error),
                Some(Frame::Handle(handler)) => descend_or_fail(guard(|| handler(error))),
                Some(Frame::Attempt) => Step::Succeed(Box::new(Err::<Value, Error>(error))),
                Some(Frame::Unmask) => {
                    stack.masks.pop();
                    if !stack.is_masked() && fiber.cancel_requested() {
                        Step::Cancel
                    } else {
                        Step::Fail(error)
                    }
                }
                Some(Frame::Remask(region)) => {
                    stack.masks.push(region);
                    Step::Fail(error)
                }
                Some(Frame::PopFinalizer) => {
                    stack.finalizers.pop();
                    Step::Fail(error)
                }
            },

            Step::Cancel => {
                fiber.begin_finalizing();
                stack.frames.clear();
                // Finalizers run masked, in a region no `Poll` can lift.
                stack.masks.clear();
                stack.masks.push(next_region());
                let finalizers = std::mem::take(&mut stack.finalizers);
                Step::Descend(finalizer_chain(finalizers))
            }
        };
    }
}
