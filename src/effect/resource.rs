//! Composable acquire/release scopes.
//!
//! A [`Resource<A>`] describes how to obtain an `A` and how to give it back.
//! Nothing is acquired until the resource is used: [`Resource::use_`]
//! allocates every step of the resource in order, runs the body, and then
//! releases every step that was actually allocated in reverse order, on
//! success, on failure and on cancellation alike.
//!
//! # Ordering
//!
//! For `r1.flat_map(|_| r2).flat_map(|_| r3)` the releases run `r3`, `r2`,
//! `r1`. If a step fails to allocate, only the steps before it are
//! released.
//!
//! # Release Failures
//!
//! Every release in a scope is attempted even if an earlier one failed. The
//! first failure is raised, the later ones are attached to it as suppressed
//! errors. When the scope itself failed, its error takes priority and the
//! release failures are suppressed.
//!
//! # Examples
//!
//! ```rust
//! use std::sync::{Arc, Mutex};
//! use strand::effect::{IO, Resource};
//!
//! let log = Arc::new(Mutex::new(Vec::new()));
//! let step = |name: &'static str, log: Arc<Mutex<Vec<String>>>| {
//!     let release_log = Arc::clone(&log);
//!     Resource::make(
//!         IO::delay(move || {
//!             log.lock().unwrap().push(format!("open {name}"));
//!             name
//!         }),
//!         move |name| IO::delay(move || release_log.lock().unwrap().push(format!("close {name}"))),
//!     )
//! };
//!
//! let scope = step("db", Arc::clone(&log))
//!     .flat_map({
//!         let log = Arc::clone(&log);
//!         move |_| step("cache", log)
//!     });
//! assert_eq!(scope.use_(|name| IO::pure(name.len())).run_unsafe(), Ok(5));
//! assert_eq!(
//!     *log.lock().unwrap(),
//!     vec!["open db", "open cache", "close cache", "close db"]
//! );
//! ```

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use super::error::Error;
use super::io::{IO, OnceFinalizer, Poll, raise_after_release};
use super::outcome::ExitCase;

/// The release action of an allocated resource.
pub type Release = Box<dyn FnOnce(ExitCase) -> IO<()> + Send>;

type Allocate<A> = Box<dyn FnOnce(Poll) -> IO<(A, Release)> + Send>;

fn no_release() -> Release {
    Box::new(|_| IO::unit())
}

/// Raises the first release failure with the second one suppressed.
fn settle_releases(first: Result<(), Error>, second: Result<(), Error>) -> IO<()> {
    match (first, second) {
        (Ok(()), Ok(())) => IO::unit(),
        (Err(error), Ok(())) | (Ok(()), Err(error)) => IO::raise_error(error),
        (Err(error), Err(later)) => {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %error, suppressed = %later, "several releases failed");
            IO::raise_error(error.with_suppressed(later))
        }
    }
}

/// Releases `inner`, then `outer`, attempting both.
fn chain_releases(inner: Release, outer: Release) -> Release {
    Box::new(move |case: ExitCase| {
        let outer_case = case.clone();
        inner(case).attempt().flat_map(move |inner_result| {
            outer(outer_case)
                .attempt()
                .flat_map(move |outer_result| settle_releases(inner_result, outer_result))
        })
    })
}

/// Runs whichever releases the two halves of a parallel allocation stored.
fn release_slots(
    left: Arc<Mutex<Option<Release>>>,
    right: Arc<Mutex<Option<Release>>>,
    case: ExitCase,
) -> IO<()> {
    IO::defer(move || {
        let run = |slot: &Mutex<Option<Release>>, case: ExitCase| {
            let release = slot.lock().take();
            release.map_or_else(IO::unit, |release| release(case)).attempt()
        };
        let left_release = run(&left, case.clone());
        let right_release = run(&right, case);
        left_release
            .both(right_release)
            .flat_map(|(left_result, right_result)| settle_releases(left_result, right_result))
    })
}

// =============================================================================
// Resource Type Definition
// =============================================================================

/// A scope that acquires an `A` and guarantees its release.
///
/// See the [module documentation](self) for the release guarantees.
#[must_use = "a resource does nothing until it is used"]
pub struct Resource<A> {
    allocate: Allocate<A>,
}

impl<A: Send + 'static> Resource<A> {
    fn from_allocate<F>(allocate: F) -> Self
    where
        F: FnOnce(Poll) -> IO<(A, Release)> + Send + 'static,
    {
        Self {
            allocate: Box::new(allocate),
        }
    }

    // =========================================================================
    // Constructors
    // =========================================================================

    /// A resource holding `value`, with nothing to release.
    pub fn pure(value: A) -> Self {
        Self::eval(IO::pure(value))
    }

    /// A resource whose value comes from running `io`, with nothing to
    /// release.
    pub fn eval(io: IO<A>) -> Self {
        Self::from_allocate(move |_| io.fmap(|value| (value, no_release())))
    }

    /// A resource acquired by `acquire` and released by `release`.
    ///
    /// Acquisition is uncancelable. `release` receives a clone of the
    /// acquired value and runs exactly once if acquisition succeeded.
    pub fn make<R>(acquire: IO<A>, release: R) -> Self
    where
        A: Clone,
        R: FnOnce(A) -> IO<()> + Send + 'static,
    {
        Self::make_case(acquire, move |value, _| release(value))
    }

    /// Like [`Resource::make`], but `release` learns how the scope ended.
    pub fn make_case<R>(acquire: IO<A>, release: R) -> Self
    where
        A: Clone,
        R: FnOnce(A, ExitCase) -> IO<()> + Send + 'static,
    {
        Self::make_full(move |_| acquire, release)
    }

    /// Like [`Resource::make_case`], but acquisition receives the [`Poll`] of
    /// the allocating region and may use it to make parts of itself
    /// cancelable.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use strand::effect::{IO, Resource};
    ///
    /// let resource = Resource::make_full(
    ///     |poll| poll.apply(IO::pure(3)),
    ///     |_, _| IO::unit(),
    /// );
    /// assert_eq!(resource.use_(|x| IO::pure(x * 2)).run_unsafe(), Ok(6));
    /// ```
    pub fn make_full<F, R>(acquire: F, release: R) -> Self
    where
        A: Clone,
        F: FnOnce(Poll) -> IO<A> + Send + 'static,
        R: FnOnce(A, ExitCase) -> IO<()> + Send + 'static,
    {
        Self::from_allocate(move |poll| {
            acquire(poll).fmap(move |value| {
                let held = value.clone();
                let release: Release = Box::new(move |case| release(held, case));
                (value, release)
            })
        })
    }

    // =========================================================================
    // Composition
    // =========================================================================

    /// Transforms the value without touching acquisition or release.
    pub fn fmap<B, F>(self, function: F) -> Resource<B>
    where
        B: Send + 'static,
        F: FnOnce(A) -> B + Send + 'static,
    {
        self.flat_map(move |value| Resource::eval(IO::delay(move || function(value))))
    }

    /// Acquires a second resource that depends on this one.
    ///
    /// The second resource is released before this one. If it fails to
    /// allocate, or the allocation is canceled, this one is released right
    /// away.
    pub fn flat_map<B, F>(self, function: F) -> Resource<B>
    where
        B: Send + 'static,
        F: FnOnce(A) -> Resource<B> + Send + 'static,
    {
        Resource::from_allocate(move |poll| {
            (self.allocate)(poll).flat_map(move |(value, release)| {
                let first = OnceFinalizer::new(release);
                let on_cancel = first.clone().run(ExitCase::Canceled);
                IO::defer(move || (function(value).allocate)(poll))
                    .on_cancel(on_cancel)
                    .attempt()
                    .flat_map(move |allocated| match allocated {
                        Ok((next, next_release)) => {
                            let release: Release = Box::new(move |case| first.run(case));
                            IO::pure((next, chain_releases(next_release, release)))
                        }
                        Err(error) => {
                            let release = first.run(ExitCase::Errored(error.clone()));
                            raise_after_release(error, release)
                        }
                    })
            })
        })
    }

    /// Allocates both resources concurrently and pairs their values.
    ///
    /// Each side stores its release as soon as its own allocation is done,
    /// so if the other side fails or the allocation is canceled, whatever was
    /// acquired is still released. The two releases also run concurrently.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use strand::effect::{IO, Resource};
    ///
    /// let pair = Resource::pure(1).both(Resource::pure("one"));
    /// assert_eq!(pair.use_(IO::pure).run_unsafe(), Ok((1, "one")));
    /// ```
    pub fn both<B: Send + 'static>(self, other: Resource<B>) -> Resource<(A, B)> {
        Resource::from_allocate(move |poll| {
            let left_slot = Arc::new(Mutex::new(None));
            let right_slot = Arc::new(Mutex::new(None));
            let left = self.allocate_into(Arc::clone(&left_slot));
            let right = other.allocate_into(Arc::clone(&right_slot));

            let (cancel_left, cancel_right) = (Arc::clone(&left_slot), Arc::clone(&right_slot));
            poll.apply(left.both(right))
                .on_cancel(release_slots(cancel_left, cancel_right, ExitCase::Canceled))
                .attempt()
                .flat_map(move |allocated| match allocated {
                    Ok(pair) => {
                        let release: Release =
                            Box::new(move |case| release_slots(left_slot, right_slot, case));
                        IO::pure((pair, release))
                    }
                    Err(error) => {
                        let release =
                            release_slots(left_slot, right_slot, ExitCase::Errored(error.clone()));
                        raise_after_release(error, release)
                    }
                })
        })
    }

    /// Allocates in an uncancelable region of its own fiber and parks the
    /// release in `slot` before the region ends.
    fn allocate_into(self, slot: Arc<Mutex<Option<Release>>>) -> IO<A> {
        IO::uncancelable(move |poll| {
            (self.allocate)(poll).fmap(move |(value, release)| {
                *slot.lock() = Some(release);
                value
            })
        })
    }

    // =========================================================================
    // Running
    // =========================================================================

    /// Allocates the resource, runs `body` with its value, and releases it.
    ///
    /// Allocation and release are uncancelable; `body` is cancelable if the
    /// surrounding context is.
    pub fn use_<B, F>(self, body: F) -> IO<B>
    where
        B: Send + 'static,
        F: FnOnce(A) -> IO<B> + Send + 'static,
    {
        IO::uncancelable(move |poll| {
            (self.allocate)(poll).flat_map(move |(value, release)| {
                poll.apply(IO::defer(move || body(value))).guarantee_case(release)
            })
        })
    }

    /// Runs `io` inside the scope, ignoring the value.
    pub fn surround<B: Send + 'static>(self, io: IO<B>) -> IO<B> {
        self.use_(move |_| io)
    }

    /// Allocates the resource and hands back its value together with an
    /// effect that releases it. The caller becomes responsible for running
    /// that effect exactly once.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use strand::effect::{IO, Resource};
    ///
    /// let io = Resource::make(IO::pure(5), |_| IO::unit())
    ///     .allocated()
    ///     .flat_map(|(value, close)| close.as_value(value));
    /// assert_eq!(io.run_unsafe(), Ok(5));
    /// ```
    pub fn allocated(self) -> IO<(A, IO<()>)> {
        self.allocated_case().fmap(|(value, release)| {
            let close = IO::uncancelable(move |_| release(ExitCase::Succeeded));
            (value, close)
        })
    }

    /// Like [`Resource::allocated`], but the caller chooses the [`ExitCase`]
    /// passed to the release.
    pub fn allocated_case(self) -> IO<(A, Release)> {
        IO::uncancelable(move |poll| (self.allocate)(poll))
    }
}

impl<A> fmt::Debug for Resource<A> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "<Resource>")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    type Log = Arc<Mutex<Vec<String>>>;

    fn tracked(log: &Log, name: &'static str) -> Resource<&'static str> {
        let (acquire_log, release_log) = (Arc::clone(log), Arc::clone(log));
        Resource::make(
            IO::delay(move || {
                acquire_log.lock().push(format!("acquire {name}"));
                name
            }),
            move |name| IO::delay(move || release_log.lock().push(format!("release {name}"))),
        )
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().clone()
    }

    #[rstest]
    fn use_releases_after_success() {
        let log = Log::default();
        let io = tracked(&log, "a").use_(|name| IO::pure(name.to_uppercase()));
        assert_eq!(io.run_unsafe(), Ok("A".to_string()));
        assert_eq!(entries(&log), vec!["acquire a", "release a"]);
    }

    #[rstest]
    fn use_releases_after_body_error() {
        let log = Log::default();
        let io = tracked(&log, "a").use_(|_| IO::<()>::raise_error("body failed"));
        assert_eq!(io.run_unsafe(), Err(Error::message("body failed")));
        assert_eq!(entries(&log), vec!["acquire a", "release a"]);
    }

    #[rstest]
    fn flat_map_releases_in_reverse_order() {
        let log = Log::default();
        let (second, third) = (Arc::clone(&log), Arc::clone(&log));
        let scope = tracked(&log, "a")
            .flat_map(move |_| tracked(&second, "b"))
            .flat_map(move |_| tracked(&third, "c"));
        assert_eq!(scope.surround(IO::unit()).run_unsafe(), Ok(()));
        assert_eq!(
            entries(&log),
            vec!["acquire a", "acquire b", "acquire c", "release c", "release b", "release a"]
        );
    }

    #[rstest]
    fn failed_step_releases_only_what_was_acquired() {
        let log = Log::default();
        let second = Arc::clone(&log);
        let scope = tracked(&log, "a")
            .flat_map(move |_| tracked(&second, "b"))
            .flat_map(|_| Resource::<&str>::eval(IO::raise_error("acquire c failed")));
        let result = scope.surround(IO::pure(1)).run_unsafe();
        assert_eq!(result, Err(Error::message("acquire c failed")));
        assert_eq!(
            entries(&log),
            vec!["acquire a", "acquire b", "release b", "release a"]
        );
    }

    #[rstest]
    fn release_failure_does_not_stop_outer_release() {
        let log = Log::default();
        let scope = tracked(&log, "outer")
            .flat_map(|_| Resource::make(IO::pure(()), |()| IO::raise_error("inner release failed")));
        let result = scope.surround(IO::pure(1)).run_unsafe();
        assert_eq!(result, Err(Error::message("inner release failed")));
        assert_eq!(entries(&log), vec!["acquire outer", "release outer"]);
    }

    #[rstest]
    fn body_error_keeps_priority_over_release_error() {
        let scope = Resource::make(IO::pure(()), |()| IO::raise_error("release failed"));
        let error = scope
            .use_(|()| IO::<i32>::raise_error("body failed"))
            .run_unsafe()
            .unwrap_err();
        assert_eq!(error.to_string(), "body failed");
        assert_eq!(error.suppressed(), &[Error::message("release failed")]);
    }

    #[rstest]
    fn cancellation_of_body_releases() {
        let log = Log::default();
        let io = tracked(&log, "a").use_(|_| IO::canceled().then(IO::pure(0)));
        assert!(io.run_unsafe().is_err_and(|error| error.is_canceled()));
        assert_eq!(entries(&log), vec!["acquire a", "release a"]);
    }

    #[rstest]
    fn make_case_sees_exit_case() {
        let seen = Arc::new(Mutex::new(None));
        let recorded = Arc::clone(&seen);
        let scope = Resource::make_case(IO::pure(()), move |(), case| {
            IO::delay(move || *recorded.lock() = Some(case))
        });
        let _ = scope.use_(|()| IO::<()>::raise_error("boom")).run_unsafe();
        assert_eq!(*seen.lock(), Some(ExitCase::Errored(Error::message("boom"))));
    }

    #[rstest]
    fn fmap_keeps_release() {
        let log = Log::default();
        let io = tracked(&log, "a").fmap(str::len).use_(IO::pure);
        assert_eq!(io.run_unsafe(), Ok(1));
        assert_eq!(entries(&log), vec!["acquire a", "release a"]);
    }

    #[rstest]
    fn both_releases_acquired_side_when_other_fails() {
        let log = Log::default();
        let scope = tracked(&log, "left")
            .both(Resource::<i32>::eval(IO::cede().then(IO::raise_error("right failed"))));
        let result = scope.surround(IO::unit()).run_unsafe();
        assert_eq!(result, Err(Error::message("right failed")));
        assert_eq!(entries(&log), vec!["acquire left", "release left"]);
    }

    #[rstest]
    fn both_releases_both_sides() {
        let log = Log::default();
        let scope = tracked(&log, "left").both(tracked(&log, "right"));
        assert_eq!(scope.use_(IO::pure).run_unsafe(), Ok(("left", "right")));

        let mut recorded = entries(&log);
        recorded.sort();
        assert_eq!(
            recorded,
            vec!["acquire left", "acquire right", "release left", "release right"]
        );
    }

    #[rstest]
    fn allocated_defers_release_to_caller() {
        let log = Log::default();
        let check = Arc::clone(&log);
        let io = tracked(&log, "a").allocated().flat_map(move |(name, close)| {
            let before = entries(&check);
            close.fmap(move |()| (name, before))
        });
        let (name, before) = io.run_unsafe().unwrap();
        assert_eq!(name, "a");
        assert_eq!(before, vec!["acquire a"]);
        assert_eq!(entries(&log), vec!["acquire a", "release a"]);
    }
}
