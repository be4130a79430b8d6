//! The cooperative scheduler and the host boundary.
//!
//! A [`Runtime`] runs one root effect at a time on a single logical thread:
//! fibers are interleaved only where they suspend (`async_`, `cede`) or when
//! they exhaust their per-turn step budget. There is no parallel execution of
//! interpreter turns within a run.
//!
//! The run queue is driven from [`RunFuture::poll`]. Callbacks completed from
//! other threads push the resumed fiber onto the queue and wake the future,
//! so a run can be awaited on any executor or blocked on with
//! [`Runtime::run_sync`].
//!
//! The scheduler owns every unfinished fiber of its run: ready fibers sit in
//! the run queue, suspended ones are parked until a callback or a
//! cancellation wakes them. Dropping the [`RunFuture`] drops both sets, and
//! with them the fibers that never finished.
//!
//! # Examples
//!
//! ```rust
//! use strand::effect::{IO, Runtime, RuntimeConfig};
//!
//! let runtime = Runtime::with_config(RuntimeConfig::new().auto_yield_threshold(64));
//! let program = IO::pure(20).flat_map(|x| IO::delay(move || x + 22));
//! assert_eq!(runtime.run_sync(program), Ok(42));
//! ```

#[cfg(feature = "async")]
pub(crate) mod bridge;

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;

use super::error::Error;
use super::fiber::{FiberCore, FiberId};
use super::io::IO;
use super::io::node::{Node, downcast};
use super::outcome::Outcome;

// =============================================================================
// Configuration
// =============================================================================

/// Default number of interpreter steps a fiber may take per turn.
pub const DEFAULT_AUTO_YIELD_THRESHOLD: usize = 1024;

/// Tuning knobs of a [`Runtime`].
///
/// # Examples
///
/// ```rust
/// use strand::effect::RuntimeConfig;
///
/// let config = RuntimeConfig::new().auto_yield_threshold(0);
/// assert_eq!(config.get_auto_yield_threshold(), 0);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    auto_yield_threshold: usize,
}

impl RuntimeConfig {
    /// Creates the default configuration.
    pub const fn new() -> Self {
        Self {
            auto_yield_threshold: DEFAULT_AUTO_YIELD_THRESHOLD,
        }
    }

    /// Sets how many steps a fiber runs before it is moved to the back of
    /// the run queue. `0` lets a fiber run until it suspends.
    #[must_use]
    pub const fn auto_yield_threshold(mut self, steps: usize) -> Self {
        self.auto_yield_threshold = steps;
        self
    }

    /// Returns the configured step budget per turn.
    pub const fn get_auto_yield_threshold(&self) -> usize {
        self.auto_yield_threshold
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Scheduler
// =============================================================================

struct SchedulerInner {
    ready: Mutex<VecDeque<Arc<FiberCore>>>,
    parked: Mutex<HashMap<FiberId, Arc<FiberCore>>>,
    waker: Mutex<Option<Waker>>,
    next_fiber_id: AtomicU64,
    config: RuntimeConfig,
}

/// The run queue shared by all fibers of one run.
#[derive(Clone)]
pub(crate) struct Scheduler {
    inner: Arc<SchedulerInner>,
}

/// A fiber's link back to its scheduler. It does not keep the run alive.
pub(crate) struct SchedulerRef {
    inner: Weak<SchedulerInner>,
}

impl SchedulerRef {
    /// Returns the scheduler, or `None` once its run has ended.
    pub(crate) fn upgrade(&self) -> Option<Scheduler> {
        self.inner.upgrade().map(|inner| Scheduler { inner })
    }
}

impl Scheduler {
    fn new(config: RuntimeConfig) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                ready: Mutex::new(VecDeque::new()),
                parked: Mutex::new(HashMap::new()),
                waker: Mutex::new(None),
                next_fiber_id: AtomicU64::new(0),
                config,
            }),
        }
    }

    pub(crate) fn auto_yield_threshold(&self) -> usize {
        self.inner.config.auto_yield_threshold
    }

    /// Creates a fiber running `root` and queues it.
    pub(crate) fn spawn(&self, root: Node) -> Arc<FiberCore> {
        let id = FiberId(self.inner.next_fiber_id.fetch_add(1, Ordering::Relaxed));
        let scheduler = SchedulerRef {
            inner: Arc::downgrade(&self.inner),
        };
        let fiber = FiberCore::new(id, scheduler, root);

        #[cfg(feature = "tracing")]
        tracing::trace!(fiber = %id, "fiber spawned");

        self.schedule(Arc::clone(&fiber));
        fiber
    }

    pub(crate) fn schedule(&self, fiber: Arc<FiberCore>) {
        self.inner.ready.lock().push_back(fiber);
        if let Some(waker) = self.inner.waker.lock().as_ref() {
            waker.wake_by_ref();
        }
    }

    /// Keeps a suspended fiber alive until it is woken or the run ends.
    pub(crate) fn park(&self, fiber: Arc<FiberCore>) {
        self.inner.parked.lock().insert(fiber.id(), fiber);
    }

    pub(crate) fn unpark(&self, id: FiberId) {
        let fiber = self.inner.parked.lock().remove(&id);
        drop(fiber);
    }

    /// Moves a resumed fiber from the parked set to the run queue.
    pub(crate) fn wake(&self, fiber: &Arc<FiberCore>) {
        self.unpark(fiber.id());
        self.schedule(Arc::clone(fiber));
    }

    /// Releases every fiber still owned by the run.
    fn shutdown(&self) {
        let ready = std::mem::take(&mut *self.inner.ready.lock());
        let parked = std::mem::take(&mut *self.inner.parked.lock());
        self.inner.waker.lock().take();

        #[cfg(feature = "tracing")]
        tracing::trace!(
            ready = ready.len(),
            parked = parked.len(),
            "run ended with unfinished fibers"
        );

        drop(ready);
        drop(parked);
    }

    fn register_waker(&self, waker: &Waker) {
        let mut slot = self.inner.waker.lock();
        match slot.as_ref() {
            Some(current) if current.will_wake(waker) => {}
            _ => *slot = Some(waker.clone()),
        }
    }

    /// Runs turns until no fiber is ready.
    fn run_ready(&self) {
        loop {
            let next = self.inner.ready.lock().pop_front();
            let Some(fiber) = next else {
                break;
            };
            fiber.run_turn(self);
        }
    }
}

// =============================================================================
// Runtime
// =============================================================================

/// Entry point for running effects.
///
/// Each run gets its own scheduler, so independent runs never share fibers
/// or run queues.
#[derive(Debug, Clone, Copy, Default)]
pub struct Runtime {
    config: RuntimeConfig,
}

impl Runtime {
    /// Creates a runtime with the default configuration.
    pub const fn new() -> Self {
        Self {
            config: RuntimeConfig::new(),
        }
    }

    /// Creates a runtime with the given configuration.
    pub const fn with_config(config: RuntimeConfig) -> Self {
        Self { config }
    }

    /// Returns this runtime's configuration.
    pub const fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Starts `io` as the root fiber and returns a future of its result.
    ///
    /// The effect makes progress only while the future is polled. A canceled
    /// root fiber resolves to an error for which
    /// [`Error::is_canceled`] holds.
    pub fn run_async<A: Send + 'static>(&self, io: IO<A>) -> RunFuture<A> {
        let scheduler = Scheduler::new(self.config);
        let root = scheduler.spawn(io.into_node());
        RunFuture {
            scheduler,
            root,
            _result: PhantomData,
        }
    }

    /// Runs `io` to completion, blocking the current thread while the root
    /// fiber waits for callbacks.
    ///
    /// Do not call this from inside an async task whose executor must keep
    /// running to complete the effect; await [`Runtime::run_async`] there.
    ///
    /// # Errors
    ///
    /// Returns the error the root fiber failed with, or a canceled error if it
    /// was canceled.
    pub fn run_sync<A: Send + 'static>(&self, io: IO<A>) -> Result<A, Error> {
        futures::executor::block_on(self.run_async(io))
    }
}

/// The future returned by [`Runtime::run_async`].
///
/// Polling it runs every ready fiber of the run, then reports the root
/// fiber's result if it has one.
#[must_use = "an effect does nothing until its run future is polled"]
pub struct RunFuture<A> {
    scheduler: Scheduler,
    root: Arc<FiberCore>,
    _result: PhantomData<fn() -> A>,
}

impl<A: 'static> Future for RunFuture<A> {
    type Output = Result<A, Error>;

    fn poll(self: Pin<&mut Self>, context: &mut Context<'_>) -> Poll<Self::Output> {
        self.scheduler.register_waker(context.waker());
        self.scheduler.run_ready();
        match self.root.take_outcome() {
            None => Poll::Pending,
            Some(Outcome::Succeeded(value)) => Poll::Ready(Ok(downcast::<A>(value))),
            Some(Outcome::Errored(error)) => Poll::Ready(Err(error)),
            Some(Outcome::Canceled) => Poll::Ready(Err(Error::canceled())),
        }
    }
}

impl<A> Drop for RunFuture<A> {
    fn drop(&mut self) {
        self.scheduler.shutdown();
    }
}

impl<A> std::fmt::Debug for RunFuture<A> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RunFuture")
            .field("root", &self.root.id())
            .finish_non_exhaustive()
    }
}
