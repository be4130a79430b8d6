//! Control structures shared by the effect system.
//!
//! - [`Either`]: a value that is one of two alternatives, used to report
//!   which side of a race finished first

mod either;

pub use either::Either;
