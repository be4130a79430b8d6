//! Effect system: a cancelable IO monad and its fiber runtime.
//!
//! This module provides:
//!
//! - [`IO`]: a description of a computation with side effects, interpreted
//!   by a stack-safe trampoline
//! - [`Fiber`]: a handle to an effect running concurrently on the same
//!   cooperative scheduler
//! - [`Resource`]: acquire/release scopes with guaranteed, LIFO-ordered release
//! - [`Queue`]: FIFO queues whose blocking operations suspend fibers
//! - [`Runtime`]: the entry point that runs an `IO` to completion
//!
//! # Failure Model
//!
//! An effect ends in one of three ways, reported by [`Outcome`]:
//!
//! - it succeeds with a value;
//! - it fails with an [`Error`], either raised explicitly or caught from a
//!   panic in user code;
//! - it is canceled. Cancellation is not an error: `attempt` and
//!   `handle_error_with` never observe it.
//!
//! # Examples
//!
//! ```rust
//! use strand::effect::{IO, Queue, Resource};
//!
//! let queue = Queue::unbounded();
//! let scope = Resource::make(IO::pure(queue.clone()), |queue| queue.offer("closed"));
//!
//! let program = scope
//!     .use_(|queue| queue.offer("used"))
//!     .then(queue.try_take_all());
//! assert_eq!(program.run_unsafe(), Ok(vec!["used", "closed"]));
//! ```

mod error;
mod fiber;
mod io;
mod outcome;
mod queue;
mod resource;
mod runtime;

pub use error::{Error, ErrorKind};
pub use fiber::{Callback, Fiber, FiberId};
pub use io::{IO, Poll};
pub use outcome::{ExitCase, Outcome};
pub use queue::{Queue, QueueError, QueuePolicy};
pub use resource::{Release, Resource};
pub use runtime::{DEFAULT_AUTO_YIELD_THRESHOLD, RunFuture, Runtime, RuntimeConfig};

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(IO<i32>: Send);
    assert_impl_all!(Fiber<String>: Send, Sync);
    assert_impl_all!(Queue<i32>: Send, Sync, Clone);
    assert_impl_all!(Resource<i32>: Send);
    assert_impl_all!(Error: Send, Sync, Clone, std::error::Error);
    assert_impl_all!(QueueError: std::error::Error);
    assert_impl_all!(Runtime: Send, Sync, Copy);
}
