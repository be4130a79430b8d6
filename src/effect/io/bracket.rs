//! Finalization combinators: `guarantee`, `on_error` and `bracket`.
//!
//! All of them are built from `uncancelable`, `on_cancel` and `attempt`; there
//! is no dedicated node for them in the effect tree.
//!
//! When a release action fails while an error is already propagating, the
//! original error wins and the release failure is attached to it as a
//! suppressed error.

use std::sync::Arc;

use parking_lot::Mutex;

use super::super::error::Error;
use super::super::outcome::ExitCase;
use super::IO;

/// A finalizer that may be reached from several exit paths but runs once.
pub(crate) struct OnceFinalizer<F> {
    slot: Arc<Mutex<Option<F>>>,
}

impl<F> Clone for OnceFinalizer<F> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<F> OnceFinalizer<F>
where
    F: FnOnce(ExitCase) -> IO<()> + Send + 'static,
{
    pub(crate) fn new(finalizer: F) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(finalizer))),
        }
    }

    pub(crate) fn run(self, case: ExitCase) -> IO<()> {
        IO::defer(move || {
            let finalizer = self.slot.lock().take();
            finalizer.map_or_else(IO::unit, |finalizer| finalizer(case))
        })
    }
}

/// Re-raises `error`, keeping `release`'s failure as a suppressed error.
pub(crate) fn raise_after_release<A: Send + 'static>(error: Error, release: IO<()>) -> IO<A> {
    release.attempt().flat_map(move |released| match released {
        Ok(()) => IO::raise_error(error),
        Err(release_error) => {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                error = %error,
                release_error = %release_error,
                "release failed while an error was propagating"
            );
            IO::raise_error(error.with_suppressed(release_error))
        }
    })
}

impl<A: Send + 'static> IO<A> {
    /// Runs `finalizer` after this effect, however it ends.
    ///
    /// The finalizer runs masked. If it fails after a success, its error
    /// becomes the result.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::sync::atomic::{AtomicBool, Ordering};
    /// use std::sync::Arc;
    /// use strand::effect::{Error, IO};
    ///
    /// let closed = Arc::new(AtomicBool::new(false));
    /// let flag = Arc::clone(&closed);
    /// let io = IO::<i32>::raise_error(Error::message("boom"))
    ///     .guarantee(IO::delay(move || flag.store(true, Ordering::SeqCst)));
    ///
    /// assert!(io.run_unsafe().is_err());
    /// assert!(closed.load(Ordering::SeqCst));
    /// ```
    pub fn guarantee(self, finalizer: IO<()>) -> Self {
        self.guarantee_case(move |_| finalizer)
    }

    /// Like [`IO::guarantee`], but the finalizer learns how the effect ended.
    pub fn guarantee_case<F>(self, finalizer: F) -> Self
    where
        F: FnOnce(ExitCase) -> IO<()> + Send + 'static,
    {
        let finalizer = OnceFinalizer::new(finalizer);
        IO::uncancelable(move |poll| {
            let on_cancel = finalizer.clone().run(ExitCase::Canceled);
            poll.apply(self)
                .on_cancel(on_cancel)
                .attempt()
                .flat_map(move |result| match result {
                    Ok(value) => finalizer.run(ExitCase::Succeeded).as_value(value),
                    Err(error) => {
                        let release = finalizer.run(ExitCase::Errored(error.clone()));
                        raise_after_release(error, release)
                    }
                })
        })
    }

    /// Runs `handler` when this effect fails, then re-raises the error.
    ///
    /// A failure of the handler itself is attached to the original error as
    /// a suppressed error.
    pub fn on_error<F>(self, handler: F) -> Self
    where
        F: FnOnce(Error) -> IO<()> + Send + 'static,
    {
        self.handle_error_with(move |error| {
            let release = handler(error.clone());
            raise_after_release(error, release)
        })
    }

    /// Acquires a resource with this effect, uses it, and always releases it.
    ///
    /// Acquisition and release are uncancelable; `use_` is cancelable if the
    /// surrounding context is. `release` runs exactly once if acquisition
    /// succeeded and never if it did not.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::sync::{Arc, Mutex};
    /// use strand::effect::IO;
    ///
    /// let log = Arc::new(Mutex::new(Vec::new()));
    /// let (acquire_log, release_log) = (Arc::clone(&log), Arc::clone(&log));
    ///
    /// let io = IO::delay(move || {
    ///     acquire_log.lock().unwrap().push("open");
    ///     7
    /// })
    /// .bracket(
    ///     |handle| IO::pure(handle * 6),
    ///     move |_| IO::delay(move || release_log.lock().unwrap().push("close")),
    /// );
    ///
    /// assert_eq!(io.run_unsafe(), Ok(42));
    /// assert_eq!(*log.lock().unwrap(), vec!["open", "close"]);
    /// ```
    pub fn bracket<B, U, R>(self, use_: U, release: R) -> IO<B>
    where
        A: Clone,
        B: Send + 'static,
        U: FnOnce(A) -> IO<B> + Send + 'static,
        R: FnOnce(A) -> IO<()> + Send + 'static,
    {
        self.bracket_case(use_, move |resource, _| release(resource))
    }

    /// Like [`IO::bracket`], but `release` learns how `use_` ended.
    pub fn bracket_case<B, U, R>(self, use_: U, release: R) -> IO<B>
    where
        A: Clone,
        B: Send + 'static,
        U: FnOnce(A) -> IO<B> + Send + 'static,
        R: FnOnce(A, ExitCase) -> IO<()> + Send + 'static,
    {
        IO::uncancelable(move |poll| {
            self.flat_map(move |resource| {
                let held = resource.clone();
                poll.apply(IO::defer(move || use_(resource)))
                    .guarantee_case(move |case| release(held, case))
            })
        })
    }
}
