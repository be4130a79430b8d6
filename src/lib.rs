//! # strand
//!
//! A cancelable effect runtime for Rust: a description-then-interpret IO
//! monad with a stack-safe trampolined interpreter, and a cooperative fiber
//! layer built on it.
//!
//! ## Overview
//!
//! - **Effects**: [`IO`](effect::IO) values describe computations; nothing runs
//!   until a [`Runtime`](effect::Runtime) interprets them
//! - **Fibers**: `start`, `join` and `cancel`, with masking through
//!   `uncancelable` and `Poll`
//! - **Structured concurrency**: `race`, `race_pair` and `both`, which never
//!   leave child fibers running
//! - **Resources**: acquire/release scopes with exactly-once, LIFO release
//! - **Queues**: bounded, unbounded, dropping and circular FIFO queues with
//!   fiber-level backpressure
//!
//! ## Feature Flags
//!
//! - `async` (default): bridge to tokio, providing `IO::sleep`,
//!   `IO::from_future` and `IO::timeout`
//! - `tracing` (default): emit `tracing` events for fiber lifecycle,
//!   cancellation and failed finalizers
//! - `full`: enable all features
//!
//! ## Example
//!
//! ```rust
//! use strand::prelude::*;
//!
//! let program = IO::pure(20)
//!     .both(IO::delay(|| 22))
//!     .fmap(|(a, b)| a + b);
//! assert_eq!(Runtime::new().run_sync(program), Ok(42));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
// Note: Disabling redundant_closure_for_method_calls due to clippy 0.1.92 panic bug
#![allow(clippy::redundant_closure_for_method_calls)]

/// Prelude module for convenient imports.
///
/// Re-exports commonly used types.
///
/// # Usage
///
/// ```rust
/// use strand::prelude::*;
/// ```
pub mod prelude {
    pub use crate::control::*;
    pub use crate::effect::*;
}

pub mod control;
pub mod effect;
