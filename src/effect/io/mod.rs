//! The `IO` effect type.
//!
//! An [`IO<A>`] is a *description* of a computation that may perform side
//! effects, fail with an [`Error`], suspend waiting for a callback, fork
//! fibers, or be canceled, and that eventually produces an `A`. Building an
//! `IO` never runs anything; effects happen only when a
//! [`Runtime`](super::Runtime) interprets it.
//!
//! # Stack Safety
//!
//! Sequencing is interpreted by a trampoline with an explicit continuation
//! stack, so left- and right-nested chains of [`IO::flat_map`] of any depth
//! run in constant native stack. Dropping an `IO`, run or not, is just as
//! flat.
//!
//! # Cancellation and Masking
//!
//! A fiber may be asked to cancel at any time, but it only observes the
//! request at a suspension point, at a [`IO::cede`], or when it leaves an
//! uncancelable region. [`IO::uncancelable`] masks cancellation for its body
//! and hands the body a [`Poll`] that can re-enable it for a sub-effect.
//!
//! # Examples
//!
//! ```rust
//! use strand::effect::IO;
//!
//! let program = IO::pure(10)
//!     .flat_map(|x| IO::delay(move || x * 2))
//!     .handle_error(|_| 0);
//! assert_eq!(program.run_unsafe(), Ok(20));
//! ```

mod bracket;
mod concurrent;
pub(crate) mod interpreter;
pub(crate) mod node;

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use super::error::Error;
use super::fiber::{Callback, Fiber, FiberCore};
use super::runtime::{RunFuture, Runtime};
use node::{Child, Node, Value, downcast};

pub(crate) use bracket::{OnceFinalizer, raise_after_release};

// =============================================================================
// Poll
// =============================================================================

/// The capability to re-enable cancellation inside an uncancelable region.
///
/// A `Poll` is only obtained from [`IO::uncancelable`]. Applying it to an
/// effect restores the cancelability that was in force *outside* that region
/// for the duration of the effect. Every region has its own identity, and a
/// `Poll` only acts while its region is the innermost one masking the fiber:
/// a `Poll` from an inner region has no effect while an outer region is
/// still masking, and a `Poll` that escaped its region is a no-op in every
/// later region, including one entered at the same nesting depth.
///
/// # Examples
///
/// ```rust
/// use strand::effect::IO;
///
/// let program = IO::uncancelable(|poll| {
///     IO::pure(1).flat_map(move |x| poll.apply(IO::pure(x + 1)))
/// });
/// assert_eq!(program.run_unsafe(), Ok(2));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Poll {
    region: u64,
}

impl Poll {
    pub(crate) const fn new(region: u64) -> Self {
        Self { region }
    }

    /// Runs `io` with the cancelability in force outside this poll's region.
    pub fn apply<A: Send + 'static>(self, io: IO<A>) -> IO<A> {
        IO::from_node(Node::Unmask(self.region, Child::new(io.into_node())))
    }
}

// =============================================================================
// IO Type Definition
// =============================================================================

/// A lazily evaluated, cancelable effect producing an `A`.
///
/// See the [module documentation](self) for an overview.
#[must_use = "IO does nothing until it is run"]
pub struct IO<A> {
    node: Node,
    _result: PhantomData<fn() -> A>,
}

impl<A> IO<A> {
    pub(crate) const fn from_node(node: Node) -> Self {
        Self {
            node,
            _result: PhantomData,
        }
    }

    pub(crate) fn into_node(mut self) -> Node {
        std::mem::replace(&mut self.node, Node::Cede)
    }
}

impl<A> Drop for IO<A> {
    fn drop(&mut self) {
        node::dispose(std::mem::replace(&mut self.node, Node::Cede));
    }
}

// =============================================================================
// Constructors
// =============================================================================

impl<A: Send + 'static> IO<A> {
    /// Wraps an already computed value.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use strand::effect::IO;
    ///
    /// assert_eq!(IO::pure(42).run_unsafe(), Ok(42));
    /// ```
    pub fn pure(value: A) -> Self {
        Self::from_node(Node::Pure(Box::new(value)))
    }

    /// An effect that fails with `error`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use strand::effect::{Error, IO};
    ///
    /// let failed: IO<i32> = IO::raise_error(Error::message("boom"));
    /// assert_eq!(failed.run_unsafe(), Err(Error::message("boom")));
    /// ```
    pub fn raise_error(error: impl Into<Error>) -> Self {
        Self::from_node(Node::Fail(error.into()))
    }

    /// Suspends a synchronous side effect.
    ///
    /// The thunk runs every time the effect runs. A panic inside it fails the
    /// effect instead of unwinding through the runtime.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::sync::atomic::{AtomicUsize, Ordering};
    /// use std::sync::Arc;
    /// use strand::effect::IO;
    ///
    /// let counter = Arc::new(AtomicUsize::new(0));
    /// let handle = Arc::clone(&counter);
    /// let io = IO::delay(move || handle.fetch_add(1, Ordering::SeqCst));
    ///
    /// assert_eq!(counter.load(Ordering::SeqCst), 0);
    /// assert_eq!(io.run_unsafe(), Ok(0));
    /// assert_eq!(counter.load(Ordering::SeqCst), 1);
    /// ```
    pub fn delay<F>(thunk: F) -> Self
    where
        F: FnOnce() -> A + Send + 'static,
    {
        Self::from_node(Node::Delay(Box::new(move || Ok(Box::new(thunk()) as Value))))
    }

    /// Alias for [`IO::delay`].
    pub fn new<F>(thunk: F) -> Self
    where
        F: FnOnce() -> A + Send + 'static,
    {
        Self::delay(thunk)
    }

    /// Suspends a fallible synchronous side effect; an `Err` fails the effect.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use strand::effect::IO;
    ///
    /// let parsed = IO::try_delay(|| "12".parse::<i32>().map_err(|e| e.to_string()));
    /// assert_eq!(parsed.run_unsafe(), Ok(12));
    /// ```
    pub fn try_delay<F, E>(thunk: F) -> Self
    where
        F: FnOnce() -> Result<A, E> + Send + 'static,
        E: Into<Error>,
    {
        Self::from_node(Node::Delay(Box::new(move || {
            thunk()
                .map(|value| Box::new(value) as Value)
                .map_err(Into::into)
        })))
    }

    /// Builds the effect to run lazily, when this one runs.
    pub fn defer<F>(thunk: F) -> Self
    where
        F: FnOnce() -> Self + Send + 'static,
    {
        Self::from_node(Node::Defer(Box::new(move || thunk().into_node())))
    }

    /// Suspends the fiber until `register`'s [`Callback`] is completed.
    ///
    /// `register` runs once, when the effect runs. It may hand the callback
    /// to another thread, timer or queue; the fiber resumes with the first
    /// result delivered to it. If `register` returns a finalizer, it runs when
    /// the fiber is canceled while still waiting and must deregister the
    /// callback.
    ///
    /// A fiber suspended here observes cancellation only if the effect is not
    /// masked.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use strand::effect::{Callback, IO};
    ///
    /// let io = IO::async_(|callback: Callback<i32>| {
    ///     std::thread::spawn(move || {
    ///         let _ = callback.succeed(5);
    ///     });
    ///     None
    /// });
    /// assert_eq!(io.run_unsafe(), Ok(5));
    /// ```
    pub fn async_<F>(register: F) -> Self
    where
        F: FnOnce(Callback<A>) -> Option<IO<()>> + Send + 'static,
    {
        Self::from_node(Node::Async(Box::new(move |resumer| {
            register(Callback::new(resumer)).map(IO::into_node)
        })))
    }

    /// Runs `body` with cancellation masked.
    ///
    /// Cancellation requests that arrive while the body runs take effect when
    /// the region is left, unless the body re-enables them for a sub-effect
    /// with the supplied [`Poll`].
    pub fn uncancelable<F>(body: F) -> Self
    where
        F: FnOnce(Poll) -> Self + Send + 'static,
    {
        Self::from_node(Node::Uncancelable(Box::new(move |poll| body(poll).into_node())))
    }

    /// An effect that never completes. It can still be canceled.
    pub fn never() -> Self {
        Self::async_(|_callback| None)
    }
}

impl IO<()> {
    /// The effect that does nothing and succeeds with `()`.
    pub fn unit() -> Self {
        Self::pure(())
    }

    /// Gives other ready fibers a chance to run before continuing.
    ///
    /// A pending cancellation request is observed here.
    pub fn cede() -> Self {
        Self::from_node(Node::Cede)
    }

    /// Requests cancellation of the current fiber.
    ///
    /// Outside an uncancelable region the fiber stops here and runs its
    /// finalizers. Inside one the request is recorded and takes effect when
    /// the region ends.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use strand::effect::IO;
    ///
    /// let result = IO::canceled().then(IO::pure(1)).run_unsafe();
    /// assert!(result.is_err_and(|error| error.is_canceled()));
    /// ```
    pub fn canceled() -> Self {
        Self::from_node(Node::Canceled)
    }
}

// =============================================================================
// Sequencing
// =============================================================================

impl<A: Send + 'static> IO<A> {
    /// Transforms the result with a pure function.
    pub fn fmap<B, F>(self, function: F) -> IO<B>
    where
        B: Send + 'static,
        F: FnOnce(A) -> B + Send + 'static,
    {
        IO::from_node(Node::Map(
            Child::new(self.into_node()),
            Box::new(move |value| Box::new(function(downcast::<A>(value))) as Value),
        ))
    }

    /// Sequences an effect that depends on this one's result.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use strand::effect::IO;
    ///
    /// let io = IO::pure(1).flat_map(|x| IO::pure(x + 1));
    /// assert_eq!(io.run_unsafe(), Ok(2));
    /// ```
    pub fn flat_map<B, F>(self, function: F) -> IO<B>
    where
        B: Send + 'static,
        F: FnOnce(A) -> IO<B> + Send + 'static,
    {
        IO::from_node(Node::FlatMap(
            Child::new(self.into_node()),
            Box::new(move |value| function(downcast::<A>(value)).into_node()),
        ))
    }

    /// Alias for [`IO::flat_map`].
    pub fn and_then<B, F>(self, function: F) -> IO<B>
    where
        B: Send + 'static,
        F: FnOnce(A) -> IO<B> + Send + 'static,
    {
        self.flat_map(function)
    }

    /// Runs `next` after this effect, discarding this effect's result.
    pub fn then<B: Send + 'static>(self, next: IO<B>) -> IO<B> {
        self.flat_map(move |_| next)
    }

    /// Discards the result.
    pub fn void(self) -> IO<()> {
        self.fmap(|_| ())
    }

    /// Replaces the result with `value`.
    pub fn as_value<B: Send + 'static>(self, value: B) -> IO<B> {
        self.fmap(move |_| value)
    }

    /// Runs both effects in sequence and combines their results.
    pub fn map2<B, C, F>(self, other: IO<B>, function: F) -> IO<C>
    where
        B: Send + 'static,
        C: Send + 'static,
        F: FnOnce(A, B) -> C + Send + 'static,
    {
        self.flat_map(move |a| other.fmap(move |b| function(a, b)))
    }

    /// Runs both effects in sequence and pairs their results.
    pub fn product<B: Send + 'static>(self, other: IO<B>) -> IO<(A, B)> {
        self.map2(other, |a, b| (a, b))
    }
}

// =============================================================================
// Error Handling
// =============================================================================

impl<A: Send + 'static> IO<A> {
    /// Recovers from a failure by switching to the effect `handler` returns.
    ///
    /// Cancellation is not a failure and is never handled here.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use strand::effect::{Error, IO};
    ///
    /// let io = IO::<i32>::raise_error(Error::message("boom"))
    ///     .handle_error_with(|_| IO::pure(0));
    /// assert_eq!(io.run_unsafe(), Ok(0));
    /// ```
    pub fn handle_error_with<F>(self, handler: F) -> Self
    where
        F: FnOnce(Error) -> Self + Send + 'static,
    {
        Self::from_node(Node::HandleErrorWith(
            Child::new(self.into_node()),
            Box::new(move |error| handler(error).into_node()),
        ))
    }

    /// Recovers from a failure with a pure function.
    pub fn handle_error<F>(self, handler: F) -> Self
    where
        F: FnOnce(Error) -> A + Send + 'static,
    {
        self.handle_error_with(move |error| Self::pure(handler(error)))
    }

    /// Exposes the failure channel as a value.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use strand::effect::{Error, IO};
    ///
    /// let io = IO::<i32>::raise_error(Error::message("boom")).attempt();
    /// assert_eq!(io.run_unsafe(), Ok(Err(Error::message("boom"))));
    /// ```
    pub fn attempt(self) -> IO<Result<A, Error>> {
        IO::from_node(Node::Map(
            Child::new(Node::Attempt(Child::new(self.into_node()))),
            Box::new(|value| {
                let result = downcast::<Result<Value, Error>>(value);
                Box::new(result.map(downcast::<A>)) as Value
            }),
        ))
    }

    /// Folds both channels into a value with pure functions.
    pub fn redeem<B, R, F>(self, recover: R, map: F) -> IO<B>
    where
        B: Send + 'static,
        R: FnOnce(Error) -> B + Send + 'static,
        F: FnOnce(A) -> B + Send + 'static,
    {
        self.attempt().fmap(move |result| match result {
            Ok(value) => map(value),
            Err(error) => recover(error),
        })
    }

    /// Folds both channels into a new effect.
    pub fn redeem_with<B, R, F>(self, recover: R, bind: F) -> IO<B>
    where
        B: Send + 'static,
        R: FnOnce(Error) -> IO<B> + Send + 'static,
        F: FnOnce(A) -> IO<B> + Send + 'static,
    {
        self.attempt().flat_map(move |result| match result {
            Ok(value) => bind(value),
            Err(error) => recover(error),
        })
    }

    /// Registers `finalizer` to run if this effect is canceled.
    ///
    /// The finalizer runs masked. It does not run on success or failure.
    pub fn on_cancel(self, finalizer: IO<()>) -> Self {
        Self::from_node(Node::OnCancel(
            Child::new(self.into_node()),
            Child::new(finalizer.into_node()),
        ))
    }
}

// =============================================================================
// Fibers
// =============================================================================

impl<A: Send + 'static> IO<A> {
    /// Starts this effect in a new fiber and returns its handle immediately.
    ///
    /// The child is queued on the current run's scheduler; it is not
    /// canceled when the parent finishes.
    pub fn start(self) -> IO<Fiber<A>> {
        IO::from_node(Node::Map(
            Child::new(Node::Start(Child::new(self.into_node()))),
            Box::new(|value| Box::new(Fiber::<A>::from_core(downcast::<Arc<FiberCore>>(value))) as Value),
        ))
    }
}

// =============================================================================
// Running
// =============================================================================

impl<A: Send + 'static> IO<A> {
    /// Runs the effect on a fresh default [`Runtime`], blocking the current
    /// thread until it finishes.
    ///
    /// # Errors
    ///
    /// Returns the error the effect failed with. Cancellation of the effect
    /// is reported as an error for which [`Error::is_canceled`] holds.
    pub fn run_unsafe(self) -> Result<A, Error> {
        Runtime::new().run_sync(self)
    }

    /// Runs the effect on a fresh default [`Runtime`] as a future.
    pub fn run_unsafe_async(self) -> RunFuture<A> {
        Runtime::new().run_async(self)
    }
}

// =============================================================================
// Tokio Bridge
// =============================================================================

#[cfg(feature = "async")]
impl<A: Send + 'static> IO<A> {
    /// Suspends the fiber until the future built by `factory` resolves.
    ///
    /// The future runs as a task on a global tokio runtime and is aborted if
    /// the fiber is canceled while waiting.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use strand::effect::IO;
    ///
    /// let io = IO::from_future(|| async { 6 * 7 });
    /// assert_eq!(io.run_unsafe(), Ok(42));
    /// ```
    pub fn from_future<F, Fut>(factory: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = A> + Send + 'static,
    {
        super::runtime::bridge::from_future(factory)
    }

    /// Races this effect against a timer. Returns `None` if the timer wins;
    /// this effect is then canceled.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::time::Duration;
    /// use strand::effect::IO;
    ///
    /// let io = IO::<i32>::never().timeout(Duration::from_millis(10));
    /// assert_eq!(io.run_unsafe(), Ok(None));
    /// ```
    pub fn timeout(self, duration: std::time::Duration) -> IO<Option<A>> {
        self.race(IO::sleep(duration))
            .fmap(|winner| winner.left())
    }
}

#[cfg(feature = "async")]
impl IO<()> {
    /// Suspends the fiber for `duration`.
    pub fn sleep(duration: std::time::Duration) -> Self {
        Self::from_future(move || tokio::time::sleep(duration))
    }
}

// =============================================================================
// Display
// =============================================================================

impl<A> fmt::Display for IO<A> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "<IO>")
    }
}

impl<A> fmt::Debug for IO<A> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "<IO>")
    }
}
