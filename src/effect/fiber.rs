//! Fibers: lightweight, cooperatively scheduled runs of an effect.
//!
//! A fiber owns its interpreter stack, a cancellation flag, a finalizer stack
//! and an outcome cell. It is created by [`IO::start`](super::IO::start),
//! moves to a terminal [`Outcome`] exactly once, and only then notifies the
//! fibers waiting on it.
//!
//! # Cancellation States
//!
//! ```text
//! Unset --cancel--> Requested --observed--> Finalizing --finalizers done--> Canceled
//! ```
//!
//! A request is observed only at an `Async` boundary, at `cede`, when a `poll`
//! window opens, or when an uncancelable region exits. A fiber is never
//! stopped in the middle of a step.
//!
//! # Ownership
//!
//! The scheduler owns every fiber that has not completed, either in its run
//! queue or in its set of parked fibers. A fiber refers back to its
//! scheduler, and a [`Callback`] to its fiber, only weakly, so a fiber that
//! is still suspended when its run ends is freed together with the run.

use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::error::Error;
use super::io::IO;
use super::io::interpreter::{self, Exit, Stack, Step};
use super::io::node::{Node, Value, downcast};
use super::outcome::Outcome;
use super::runtime::{Scheduler, SchedulerRef};

/// Identifier of a fiber, unique within its runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(pub(crate) u64);

impl fmt::Display for FiberId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "fiber-{}", self.0)
    }
}

// =============================================================================
// Fiber Core
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CancelState {
    Unset,
    Requested,
    Finalizing,
    Canceled,
}

enum Status {
    /// In the run queue, or currently running a turn.
    Active,
    /// Waiting for the resumer of suspension `epoch`.
    Suspended { epoch: u64, cancelable: bool },
    Done,
}

enum OutcomeCell {
    Pending,
    Ready(Outcome<Value>),
    Taken,
}

type Listener = Box<dyn FnOnce() + Send>;

struct FiberState {
    cancel: CancelState,
    status: Status,
    stack: Option<Stack>,
    pending: Option<Step>,
    outcome: OutcomeCell,
    listeners: Vec<(u64, Listener)>,
    next_listener: u64,
    next_epoch: u64,
}

impl FiberState {
    fn waits_on(&self, epoch: u64) -> bool {
        matches!(self.status, Status::Suspended { epoch: current, .. } if current == epoch)
    }
}

/// The shared, type-erased part of a fiber.
pub(crate) struct FiberCore {
    id: FiberId,
    scheduler: SchedulerRef,
    state: Mutex<FiberState>,
}

impl FiberCore {
    pub(crate) fn new(id: FiberId, scheduler: SchedulerRef, root: Node) -> Arc<Self> {
        Arc::new(Self {
            id,
            scheduler,
            state: Mutex::new(FiberState {
                cancel: CancelState::Unset,
                status: Status::Active,
                stack: Some(Stack::new()),
                pending: Some(Step::Descend(root)),
                outcome: OutcomeCell::Pending,
                listeners: Vec::new(),
                next_listener: 0,
                next_epoch: 0,
            }),
        })
    }

    pub(crate) const fn id(&self) -> FiberId {
        self.id
    }

    /// Runs the fiber until it suspends, yields or completes.
    pub(crate) fn run_turn(self: &Arc<Self>, scheduler: &Scheduler) {
        let (stack, step) = {
            let mut state = self.state.lock();
            (state.stack.take(), state.pending.take())
        };
        let (Some(mut stack), Some(step)) = (stack, step) else {
            return;
        };

        let budget = scheduler.auto_yield_threshold();
        match interpreter::run(self, scheduler, &mut stack, step, budget) {
            Exit::Suspended => {
                self.state.lock().stack = Some(stack);
            }
            Exit::Yielded(step) => {
                {
                    let mut state = self.state.lock();
                    state.stack = Some(stack);
                    state.pending = Some(step);
                    state.status = Status::Active;
                }
                scheduler.schedule(Arc::clone(self));
            }
            Exit::Completed(outcome) => self.complete(outcome),
        }
    }

    fn complete(&self, outcome: Outcome<Value>) {
        let listeners = {
            let mut state = self.state.lock();
            if outcome.is_canceled() {
                state.cancel = CancelState::Canceled;
            }
            state.status = Status::Done;
            state.outcome = OutcomeCell::Ready(outcome);
            std::mem::take(&mut state.listeners)
        };

        #[cfg(feature = "tracing")]
        tracing::trace!(fiber = %self.id, "fiber completed");

        for (_, listener) in listeners {
            listener();
        }
    }

    /// Parks the fiber with `scheduler` and opens a new suspension, whose
    /// epoch is returned for the resumer.
    pub(crate) fn begin_suspension(
        self: &Arc<Self>,
        scheduler: &Scheduler,
        cancelable: bool,
    ) -> u64 {
        scheduler.park(Arc::clone(self));
        let mut state = self.state.lock();
        let epoch = state.next_epoch;
        state.next_epoch += 1;
        state.status = Status::Suspended { epoch, cancelable };
        epoch
    }

    /// Undoes `begin_suspension` when registration failed. Returns `false`
    /// if the suspension was already resumed.
    pub(crate) fn abort_suspension(&self, scheduler: &Scheduler, epoch: u64) -> bool {
        {
            let mut state = self.state.lock();
            if !state.waits_on(epoch) {
                return false;
            }
            state.status = Status::Active;
        }
        scheduler.unpark(self.id);
        true
    }

    /// Ends suspension `epoch` and queues the fiber to continue with the
    /// step built from `payload`. The payload is handed back if that
    /// suspension is already over or the run has ended.
    fn resume<T>(
        self: &Arc<Self>,
        epoch: u64,
        payload: T,
        into_step: impl FnOnce(T) -> Step,
    ) -> Result<(), T> {
        let Some(scheduler) = self.scheduler.upgrade() else {
            return Err(payload);
        };
        {
            let mut state = self.state.lock();
            if !state.waits_on(epoch) {
                return Err(payload);
            }
            state.pending = Some(into_step(payload));
            state.status = Status::Active;
        }
        scheduler.wake(self);
        Ok(())
    }

    fn is_waiting_on(&self, epoch: u64) -> bool {
        self.state.lock().waits_on(epoch)
    }

    pub(crate) fn cancel_requested(&self) -> bool {
        self.state.lock().cancel == CancelState::Requested
    }

    pub(crate) fn is_finalizing(&self) -> bool {
        self.state.lock().cancel == CancelState::Finalizing
    }

    pub(crate) fn begin_finalizing(&self) {
        self.state.lock().cancel = CancelState::Finalizing;

        #[cfg(feature = "tracing")]
        tracing::debug!(fiber = %self.id, "running finalizers of canceled fiber");
    }

    pub(crate) fn request_self_cancel(&self) {
        let mut state = self.state.lock();
        if state.cancel == CancelState::Unset {
            state.cancel = CancelState::Requested;
        }
    }

    /// Records a cancellation request and wakes the fiber if it is waiting in
    /// a cancelable region.
    pub(crate) fn request_cancel(self: &Arc<Self>) {
        let wake = {
            let mut state = self.state.lock();
            if matches!(state.status, Status::Done) {
                return;
            }
            if state.cancel == CancelState::Unset {
                state.cancel = CancelState::Requested;
            }
            let interrupt = matches!(state.status, Status::Suspended { cancelable: true, .. })
                && state.cancel == CancelState::Requested;
            if interrupt {
                state.pending = Some(Step::Cancel);
                state.status = Status::Active;
            }
            interrupt
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(fiber = %self.id, interrupting = wake, "cancellation requested");

        if wake && let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.wake(self);
        }
    }

    /// Calls `listener` once the fiber has completed. Returns a handle for
    /// [`FiberCore::remove_listener`] if the fiber is still running.
    pub(crate) fn on_complete(&self, listener: Listener) -> Option<u64> {
        let mut state = self.state.lock();
        if matches!(state.status, Status::Done) {
            drop(state);
            listener();
            return None;
        }
        let id = state.next_listener;
        state.next_listener += 1;
        state.listeners.push((id, listener));
        Some(id)
    }

    pub(crate) fn remove_listener(&self, id: u64) {
        self.state
            .lock()
            .listeners
            .retain(|(listener_id, _)| *listener_id != id);
    }

    pub(crate) fn is_done(&self) -> bool {
        matches!(self.state.lock().status, Status::Done)
    }

    /// Takes the outcome of a completed fiber. `None` while it still runs.
    pub(crate) fn take_outcome(&self) -> Option<Outcome<Value>> {
        let mut state = self.state.lock();
        match std::mem::replace(&mut state.outcome, OutcomeCell::Taken) {
            OutcomeCell::Pending => {
                state.outcome = OutcomeCell::Pending;
                None
            }
            OutcomeCell::Ready(outcome) => Some(outcome),
            OutcomeCell::Taken => Some(Outcome::Errored(Error::message(
                "fiber outcome was already consumed",
            ))),
        }
    }
}

/// Waits until `core` has completed, without consuming its outcome.
pub(crate) fn await_completion(core: Arc<FiberCore>) -> IO<()> {
    IO::async_(move |callback: Callback<()>| {
        let listener = core.on_complete(Box::new(move || {
            let _ = callback.succeed(());
        }));
        listener.map(|id| IO::delay(move || core.remove_listener(id)))
    })
}

// =============================================================================
// Resumer and Callback
// =============================================================================

/// The right to end one particular suspension of a fiber.
///
/// The suspension ends once, under the fiber's lock: whoever gets there
/// first (the async callback, or a cancellation request) decides how the
/// fiber continues, and every later attempt fails. The fiber is held
/// weakly, so a resumer parked in a queue or a timer never keeps it alive.
pub(crate) struct Resumer {
    fiber: Weak<FiberCore>,
    epoch: u64,
}

impl Resumer {
    pub(crate) fn new(fiber: &Arc<FiberCore>, epoch: u64) -> Self {
        Self {
            fiber: Arc::downgrade(fiber),
            epoch,
        }
    }

    fn resume<T>(&self, payload: T, into_step: impl FnOnce(T) -> Step) -> Result<(), T> {
        match self.fiber.upgrade() {
            Some(fiber) => fiber.resume(self.epoch, payload, into_step),
            None => Err(payload),
        }
    }

    fn is_pending(&self) -> bool {
        self.fiber
            .upgrade()
            .is_some_and(|fiber| fiber.is_waiting_on(self.epoch))
    }

    fn fiber_id(&self) -> Option<FiberId> {
        self.fiber.upgrade().map(|fiber| fiber.id())
    }
}

/// Resumes a fiber suspended in [`IO::async_`](super::IO::async_).
///
/// A callback delivers at most one result. Delivery fails when the fiber no
/// longer waits for it, because it was canceled or an earlier delivery won;
/// the result is then handed back to the caller so no value is lost.
///
/// Callbacks are `Send`: they may be completed from any thread.
pub struct Callback<A> {
    resumer: Resumer,
    _result: PhantomData<fn(A)>,
}

impl<A: Send + 'static> Callback<A> {
    pub(crate) fn new(resumer: Resumer) -> Self {
        Self {
            resumer,
            _result: PhantomData,
        }
    }

    /// Resumes the fiber with `result`.
    ///
    /// # Errors
    ///
    /// Returns the result back if the fiber is no longer waiting.
    pub fn complete(self, result: Result<A, Error>) -> Result<(), Result<A, Error>> {
        self.resumer.resume(result, |result| match result {
            Ok(value) => Step::Succeed(Box::new(value)),
            Err(error) => Step::Fail(error),
        })
    }

    /// Resumes the fiber with a value.
    ///
    /// # Errors
    ///
    /// Returns the value back if the fiber is no longer waiting.
    pub fn succeed(self, value: A) -> Result<(), A> {
        self.resumer
            .resume(value, |value| Step::Succeed(Box::new(value)))
    }

    /// Resumes the fiber with a failure. Returns whether it was delivered.
    pub fn fail(self, error: Error) -> bool {
        self.complete(Err(error)).is_ok()
    }

    /// Returns `true` while the fiber still waits for this callback.
    pub fn is_pending(&self) -> bool {
        self.resumer.is_pending()
    }
}

impl<A> fmt::Debug for Callback<A> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Callback")
            .field("fiber", &self.resumer.fiber_id())
            .field("pending", &self.resumer.is_pending())
            .finish()
    }
}

// =============================================================================
// Fiber Handle
// =============================================================================

/// A handle to a running fiber, returned by [`IO::start`](super::IO::start).
///
/// The handle is the only way to observe the fiber's value, so
/// [`Fiber::join`] consumes it. [`Fiber::cancel`] only borrows it: a parent
/// typically prepares the cancel action before joining.
///
/// # Examples
///
/// ```rust
/// use strand::effect::{IO, Outcome};
///
/// let program = IO::<i32>::never()
///     .start()
///     .flat_map(|fiber| fiber.cancel().then(fiber.join()));
/// assert_eq!(program.run_unsafe(), Ok(Outcome::Canceled));
/// ```
pub struct Fiber<A> {
    core: Arc<FiberCore>,
    _result: PhantomData<fn() -> A>,
}

impl<A: Send + 'static> Fiber<A> {
    pub(crate) const fn from_core(core: Arc<FiberCore>) -> Self {
        Self {
            core,
            _result: PhantomData,
        }
    }

    pub(crate) const fn core(&self) -> &Arc<FiberCore> {
        &self.core
    }

    /// Returns this fiber's identifier.
    pub fn id(&self) -> FiberId {
        self.core.id()
    }

    /// Waits for the fiber to finish and returns how it ended.
    pub fn join(self) -> IO<Outcome<A>> {
        let core = self.core;
        await_completion(Arc::clone(&core)).flat_map(move |()| {
            IO::delay(move || {
                core.take_outcome()
                    .map_or_else(
                        || Outcome::Errored(Error::message("fiber completed without an outcome")),
                        |outcome| outcome.map(downcast::<A>),
                    )
            })
        })
    }

    /// Waits for the fiber's value. Failures are re-raised in the joining
    /// fiber; if the joined fiber was canceled, the join never completes.
    pub fn join_with_never(self) -> IO<A> {
        self.join_with(IO::never())
    }

    /// Like [`Fiber::join_with_never`], but runs `on_canceled` if the joined
    /// fiber was canceled.
    pub fn join_with(self, on_canceled: IO<A>) -> IO<A> {
        self.join().flat_map(move |outcome| match outcome {
            Outcome::Succeeded(value) => IO::pure(value),
            Outcome::Errored(error) => IO::raise_error(error),
            Outcome::Canceled => on_canceled,
        })
    }

    /// Requests cancellation and waits until the fiber has run its
    /// finalizers. Completes immediately if the fiber already finished.
    pub fn cancel(&self) -> IO<()> {
        let core = Arc::clone(&self.core);
        IO::uncancelable(move |_| {
            let waited = Arc::clone(&core);
            IO::delay(move || core.request_cancel()).then(await_completion(waited))
        })
    }

    /// Returns `true` once the fiber has reached its outcome.
    pub fn is_done(&self) -> bool {
        self.core.is_done()
    }
}

impl<A> fmt::Debug for Fiber<A> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.debug_struct("Fiber").field("id", &self.core.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::{Queue, Runtime};

    #[test]
    fn test_fiber_id_display() {
        assert_eq!(FiberId(3).to_string(), "fiber-3");
    }

    #[test]
    fn test_callback_succeed_delivers_once() {
        let program = IO::async_(|callback: Callback<i32>| {
            assert!(callback.is_pending());
            assert!(callback.succeed(5).is_ok());
            None
        });
        assert_eq!(Runtime::new().run_sync(program), Ok(5));
    }

    #[test]
    fn test_callback_fail_delivers_error() {
        let program = IO::<i32>::async_(|callback| {
            assert!(callback.fail(Error::message("nope")));
            None
        });
        assert_eq!(Runtime::new().run_sync(program), Err(Error::message("nope")));
    }

    #[test]
    fn test_join_of_completed_fiber() {
        let program = IO::pure(1)
            .start()
            .flat_map(|fiber| IO::cede().then(fiber.join()));
        assert_eq!(Runtime::new().run_sync(program), Ok(Outcome::Succeeded(1)));
    }

    #[test]
    fn test_cancel_of_completed_fiber_is_noop() {
        let program = IO::pure(1).start().flat_map(|fiber| {
            IO::cede()
                .then(fiber.cancel())
                .then(fiber.join())
        });
        assert_eq!(Runtime::new().run_sync(program), Ok(Outcome::Succeeded(1)));
    }

    #[test]
    fn test_suspended_fiber_is_freed_when_the_run_ends() {
        let program = IO::<()>::never()
            .start()
            .fmap(|fiber| Arc::downgrade(fiber.core()));
        let fiber = Runtime::new().run_sync(program).unwrap();
        assert_eq!(fiber.strong_count(), 0);
    }

    #[test]
    fn test_fiber_blocked_on_a_queue_it_captures_is_freed() {
        let queue = Queue::<i32>::unbounded();
        let forward = queue.clone();
        let blocked = queue.take().flat_map(move |value| forward.offer(value));
        let program = blocked
            .start()
            .flat_map(|fiber| IO::cede().as_value(Arc::downgrade(fiber.core())));

        let fiber = Runtime::new().run_sync(program).unwrap();
        drop(queue);
        assert_eq!(fiber.strong_count(), 0);
    }

    #[test]
    fn test_callback_after_the_run_hands_the_value_back() {
        let stash = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&stash);
        let program = IO::<i32>::async_(move |callback| {
            *slot.lock() = Some(callback);
            None
        })
        .start()
        .flat_map(|_| IO::cede());
        Runtime::new().run_sync(program).unwrap();

        let callback = stash.lock().take().unwrap();
        assert!(!callback.is_pending());
        assert_eq!(callback.succeed(9), Err(9));
    }

    #[test]
    fn test_join_with_uses_fallback_on_cancel() {
        let program = IO::<i32>::never().start().flat_map(|fiber| {
            fiber
                .cancel()
                .then(fiber.join_with(IO::pure(-1)))
        });
        assert_eq!(Runtime::new().run_sync(program), Ok(-1));
    }
}
