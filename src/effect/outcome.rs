//! Terminal states of fibers and scopes.
//!
//! A fiber ends in exactly one of three states: it produced a value, it
//! failed, or it was canceled. Cancellation is a state of its own and is never
//! reported through `attempt` or `handle_error_with`.

use super::error::Error;

/// The terminal state of a fiber, as observed by [`Fiber::join`](super::Fiber::join).
///
/// # Examples
///
/// ```rust
/// use strand::effect::{IO, Outcome};
///
/// let joined = IO::pure(7).start().flat_map(|fiber| fiber.join());
/// assert_eq!(joined.run_unsafe(), Ok(Outcome::Succeeded(7)));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<A> {
    /// The fiber completed with a value.
    Succeeded(A),
    /// The fiber failed with an error.
    Errored(Error),
    /// The fiber was canceled and its finalizers have run.
    Canceled,
}

impl<A> Outcome<A> {
    /// Returns `true` for [`Outcome::Succeeded`].
    pub const fn is_succeeded(&self) -> bool {
        matches!(self, Self::Succeeded(_))
    }

    /// Returns `true` for [`Outcome::Errored`].
    pub const fn is_errored(&self) -> bool {
        matches!(self, Self::Errored(_))
    }

    /// Returns `true` for [`Outcome::Canceled`].
    pub const fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    /// Transforms the success value.
    pub fn map<B, F>(self, function: F) -> Outcome<B>
    where
        F: FnOnce(A) -> B,
    {
        match self {
            Self::Succeeded(value) => Outcome::Succeeded(function(value)),
            Self::Errored(error) => Outcome::Errored(error),
            Self::Canceled => Outcome::Canceled,
        }
    }

    /// Forgets the value, keeping how the fiber ended.
    pub fn exit_case(&self) -> ExitCase {
        match self {
            Self::Succeeded(_) => ExitCase::Succeeded,
            Self::Errored(error) => ExitCase::Errored(error.clone()),
            Self::Canceled => ExitCase::Canceled,
        }
    }
}

/// How a guarded region was left, as seen by finalizers and release actions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitCase {
    /// The region completed normally.
    Succeeded,
    /// The region failed with an error.
    Errored(Error),
    /// The fiber running the region was canceled.
    Canceled,
}

impl ExitCase {
    /// Returns `true` for [`ExitCase::Canceled`].
    pub const fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_map_only_touches_success() {
        assert_eq!(Outcome::Succeeded(2).map(|x| x * 10), Outcome::Succeeded(20));
        assert_eq!(
            Outcome::<i32>::Errored(Error::message("e")).map(|x| x * 10),
            Outcome::Errored(Error::message("e"))
        );
        assert_eq!(Outcome::<i32>::Canceled.map(|x| x * 10), Outcome::Canceled);
    }

    #[test]
    fn test_outcome_exit_case() {
        assert_eq!(Outcome::Succeeded(()).exit_case(), ExitCase::Succeeded);
        assert_eq!(
            Outcome::<()>::Errored(Error::message("e")).exit_case(),
            ExitCase::Errored(Error::message("e"))
        );
        assert!(Outcome::<()>::Canceled.exit_case().is_canceled());
    }

    #[test]
    fn test_outcome_predicates() {
        assert!(Outcome::Succeeded(1).is_succeeded());
        assert!(Outcome::<i32>::Errored(Error::message("e")).is_errored());
        assert!(Outcome::<i32>::Canceled.is_canceled());
    }
}
