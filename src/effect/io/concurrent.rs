//! Structured concurrency: `race_pair`, `race` and `both`.
//!
//! Each combinator starts its two effects as fibers inside an uncancelable
//! region and waits, cancelably, for the first of them to complete. If the
//! waiting fiber is itself canceled, both children are canceled and awaited
//! before it finishes. `race` and `both` never leak a child fiber: whatever
//! happens, the loser or the sibling is canceled or joined before they
//! return.

use std::sync::Arc;

use parking_lot::Mutex;

use super::super::fiber::{Callback, Fiber, FiberCore, await_completion};
use super::super::outcome::Outcome;
use super::{IO, Poll};
use crate::control::Either;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Left,
    Right,
}

/// Completes with the side of the first fiber to finish.
fn first_completed(left: Arc<FiberCore>, right: Arc<FiberCore>) -> IO<Side> {
    IO::async_(move |callback: Callback<Side>| {
        let slot = Arc::new(Mutex::new(Some(callback)));
        let notify = |side: Side| {
            let slot = Arc::clone(&slot);
            Box::new(move || {
                if let Some(callback) = slot.lock().take() {
                    let _ = callback.succeed(side);
                }
            })
        };
        let left_listener = left.on_complete(notify(Side::Left));
        let right_listener = right.on_complete(notify(Side::Right));
        Some(IO::delay(move || {
            if let Some(id) = left_listener {
                left.remove_listener(id);
            }
            if let Some(id) = right_listener {
                right.remove_listener(id);
            }
        }))
    })
}

/// Requests cancellation of both fibers, then waits for both to finish.
fn cancel_both(left: Arc<FiberCore>, right: Arc<FiberCore>) -> IO<()> {
    let (left_waited, right_waited) = (Arc::clone(&left), Arc::clone(&right));
    IO::delay(move || {
        left.request_cancel();
        right.request_cancel();
    })
    .then(await_completion(left_waited))
    .then(await_completion(right_waited))
}

/// Cancels the current fiber from inside a region that `poll` belongs to.
fn cancel_self<A: Send + 'static>(poll: Poll) -> IO<A> {
    poll.apply(IO::canceled()).then(IO::never())
}

/// Waits for `fiber`, canceling it if the waiting fiber is canceled.
fn join_cancelable<A: Send + 'static>(poll: Poll, fiber: Fiber<A>) -> IO<Outcome<A>> {
    let cancel = fiber.cancel();
    poll.apply(fiber.join()).on_cancel(cancel)
}

/// Starts both effects and hands the first completed side to `on_left` or
/// `on_right`, still inside the uncancelable region.
fn supervise<A, B, C, L, R>(left: IO<A>, right: IO<B>, on_left: L, on_right: R) -> IO<C>
where
    A: Send + 'static,
    B: Send + 'static,
    C: Send + 'static,
    L: FnOnce(Poll, Outcome<A>, Fiber<B>) -> IO<C> + Send + 'static,
    R: FnOnce(Poll, Fiber<A>, Outcome<B>) -> IO<C> + Send + 'static,
{
    IO::uncancelable(move |poll| {
        left.start().flat_map(move |left_fiber| {
            right.start().flat_map(move |right_fiber| {
                let left_core = Arc::clone(left_fiber.core());
                let right_core = Arc::clone(right_fiber.core());
                poll.apply(first_completed(Arc::clone(&left_core), Arc::clone(&right_core)))
                    .on_cancel(cancel_both(left_core, right_core))
                    .flat_map(move |side| match side {
                        Side::Left => left_fiber
                            .join()
                            .flat_map(move |outcome| on_left(poll, outcome, right_fiber)),
                        Side::Right => right_fiber
                            .join()
                            .flat_map(move |outcome| on_right(poll, left_fiber, outcome)),
                    })
            })
        })
    })
}

impl<A: Send + 'static> IO<A> {
    /// Runs both effects concurrently and returns as soon as one completes,
    /// with that one's outcome and the other one's still running fiber.
    ///
    /// The caller owns the returned fiber and is responsible for joining or
    /// canceling it. If the racing fiber is canceled while both are still
    /// running, both children are canceled.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use strand::control::Either;
    /// use strand::effect::{IO, Outcome};
    ///
    /// let io = IO::pure(1)
    ///     .race_pair(IO::<i32>::never())
    ///     .flat_map(|winner| match winner {
    ///         Either::Left((outcome, loser)) => loser.cancel().as_value(outcome),
    ///         Either::Right((loser, _)) => loser.cancel().as_value(Outcome::Canceled),
    ///     });
    /// assert_eq!(io.run_unsafe(), Ok(Outcome::Succeeded(1)));
    /// ```
    pub fn race_pair<B: Send + 'static>(
        self,
        other: IO<B>,
    ) -> IO<Either<(Outcome<A>, Fiber<B>), (Fiber<A>, Outcome<B>)>> {
        supervise(
            self,
            other,
            |_, outcome, fiber| IO::pure(Either::Left((outcome, fiber))),
            |_, fiber, outcome| IO::pure(Either::Right((fiber, outcome))),
        )
    }

    /// Runs both effects concurrently and returns the first result.
    ///
    /// The loser is canceled and awaited. If the first effect to finish
    /// failed, the other is canceled and the error is raised. If it was
    /// canceled, the race waits for the other one instead; only when both
    /// are canceled is the racing fiber canceled too.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use strand::control::Either;
    /// use strand::effect::IO;
    ///
    /// let io = IO::<i32>::never().race(IO::pure("fast"));
    /// assert_eq!(io.run_unsafe(), Ok(Either::Right("fast")));
    /// ```
    pub fn race<B: Send + 'static>(self, other: IO<B>) -> IO<Either<A, B>> {
        supervise(
            self,
            other,
            |poll, outcome, loser| match outcome {
                Outcome::Succeeded(value) => loser.cancel().as_value(Either::Left(value)),
                Outcome::Errored(error) => loser.cancel().then(IO::raise_error(error)),
                Outcome::Canceled => join_cancelable(poll, loser).flat_map(move |other| {
                    settle(poll, other.map(Either::Right))
                }),
            },
            |poll, loser, outcome| match outcome {
                Outcome::Succeeded(value) => loser.cancel().as_value(Either::Right(value)),
                Outcome::Errored(error) => loser.cancel().then(IO::raise_error(error)),
                Outcome::Canceled => join_cancelable(poll, loser).flat_map(move |other| {
                    settle(poll, other.map(Either::Left))
                }),
            },
        )
    }

    /// Runs both effects concurrently and pairs their results.
    ///
    /// If either fails, the other is canceled and the error is raised. If
    /// either is canceled, the other is canceled and then the pairing fiber
    /// is canceled as well.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use strand::effect::IO;
    ///
    /// let io = IO::delay(|| 1).both(IO::delay(|| "two"));
    /// assert_eq!(io.run_unsafe(), Ok((1, "two")));
    /// ```
    pub fn both<B: Send + 'static>(self, other: IO<B>) -> IO<(A, B)> {
        supervise(
            self,
            other,
            |poll, outcome, sibling| match outcome {
                Outcome::Succeeded(a) => join_cancelable(poll, sibling)
                    .flat_map(move |other| settle(poll, other.map(move |b| (a, b)))),
                Outcome::Errored(error) => sibling.cancel().then(IO::raise_error(error)),
                Outcome::Canceled => sibling.cancel().then(cancel_self(poll)),
            },
            |poll, sibling, outcome| match outcome {
                Outcome::Succeeded(b) => join_cancelable(poll, sibling)
                    .flat_map(move |other| settle(poll, other.map(move |a| (a, b)))),
                Outcome::Errored(error) => sibling.cancel().then(IO::raise_error(error)),
                Outcome::Canceled => sibling.cancel().then(cancel_self(poll)),
            },
        )
    }

    /// Alias for [`IO::both`].
    pub fn par<B: Send + 'static>(self, other: IO<B>) -> IO<(A, B)> {
        self.both(other)
    }
}

/// Turns the outcome of the fiber that finished last into the result.
fn settle<C: Send + 'static>(poll: Poll, outcome: Outcome<C>) -> IO<C> {
    match outcome {
        Outcome::Succeeded(value) => IO::pure(value),
        Outcome::Errored(error) => IO::raise_error(error),
        Outcome::Canceled => cancel_self(poll),
    }
}
