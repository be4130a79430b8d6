//! Error values carried by failed effects.
//!
//! An [`IO`](super::IO) that fails carries an [`Error`]. The error is cheap to
//! clone (the payload is reference counted) so it can be handed to several
//! observers, e.g. a release action and the caller of `use_`.
//!
//! # Kinds
//!
//! - [`ErrorKind::Raised`]: a declared failure wrapping any
//!   `std::error::Error + Send + Sync`.
//! - [`ErrorKind::Message`]: a declared failure described by text only.
//! - [`ErrorKind::Panicked`]: a synchronous defect. A closure passed to
//!   `delay`, `fmap`, `flat_map` or an error handler panicked and the
//!   interpreter converted the panic into a failure.
//! - [`ErrorKind::Canceled`]: only produced at the host boundary, when the
//!   root fiber finished with a canceled outcome. Inside the effect language
//!   cancellation is never an error.
//!
//! # Suppressed Errors
//!
//! When a release action fails while an original failure is already
//! propagating, the original error wins and the release failure is attached
//! to it as a suppressed error.
//!
//! ```rust
//! use strand::effect::Error;
//!
//! let original = Error::message("query failed");
//! let release = Error::message("connection close failed");
//! let combined = original.with_suppressed(release.clone());
//!
//! assert_eq!(combined.to_string(), "query failed");
//! assert_eq!(combined.suppressed(), &[release]);
//! ```

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// The cause of an [`Error`].
#[derive(Clone)]
pub enum ErrorKind {
    /// A declared failure wrapping an error value.
    Raised(Arc<dyn std::error::Error + Send + Sync>),
    /// A declared failure described by a message.
    Message(Arc<str>),
    /// A panic caught while running a user closure.
    Panicked(Arc<str>),
    /// The root fiber was canceled.
    Canceled,
}

/// The failure value of an effect.
///
/// # Equality
///
/// Two errors are equal when they have the same kind and render the same
/// message. Wrapped error values are additionally equal when they share the
/// same allocation.
///
/// # Examples
///
/// ```rust
/// use strand::effect::{Error, IO};
///
/// let failing: IO<i32> = IO::raise_error(Error::message("boom"));
/// assert_eq!(failing.run_unsafe(), Err(Error::message("boom")));
/// ```
#[derive(Clone)]
pub struct Error {
    kind: ErrorKind,
    suppressed: Vec<Error>,
}

impl Error {
    /// Wraps an error value.
    pub fn new<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::from_kind(ErrorKind::Raised(Arc::new(error)))
    }

    /// Creates an error from a message.
    pub fn message(message: impl Into<String>) -> Self {
        Self::from_kind(ErrorKind::Message(Arc::from(message.into())))
    }

    /// The error reported when the root fiber of a run was canceled.
    pub fn canceled() -> Self {
        Self::from_kind(ErrorKind::Canceled)
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(string) = payload.downcast_ref::<&str>() {
            (*string).to_string()
        } else if let Some(string) = payload.downcast_ref::<String>() {
            string.clone()
        } else {
            "Unknown panic".to_string()
        };
        Self::from_kind(ErrorKind::Panicked(Arc::from(message)))
    }

    const fn from_kind(kind: ErrorKind) -> Self {
        Self {
            kind,
            suppressed: Vec::new(),
        }
    }

    /// Returns the cause of this error.
    pub const fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Returns `true` if this error came from a caught panic.
    pub const fn is_panic(&self) -> bool {
        matches!(self.kind, ErrorKind::Panicked(_))
    }

    /// Returns `true` if this error reports a canceled run.
    pub const fn is_canceled(&self) -> bool {
        matches!(self.kind, ErrorKind::Canceled)
    }

    /// Attempts to view the wrapped error value as `E`.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        match &self.kind {
            ErrorKind::Raised(error) => error.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// Returns the errors suppressed while this one was propagating.
    pub fn suppressed(&self) -> &[Self] {
        &self.suppressed
    }

    /// Attaches an error that must not hide this one.
    #[must_use]
    pub fn with_suppressed(mut self, error: Self) -> Self {
        self.suppressed.push(error);
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ErrorKind::Raised(error) => write!(formatter, "{error}"),
            ErrorKind::Message(message) => write!(formatter, "{message}"),
            ErrorKind::Panicked(message) => write!(formatter, "panicked: {message}"),
            ErrorKind::Canceled => write!(formatter, "fiber was canceled"),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            ErrorKind::Raised(_) => "Raised",
            ErrorKind::Message(_) => "Message",
            ErrorKind::Panicked(_) => "Panicked",
            ErrorKind::Canceled => "Canceled",
        };
        formatter
            .debug_struct("Error")
            .field("kind", &kind)
            .field("message", &self.to_string())
            .field("suppressed", &self.suppressed)
            .finish()
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        let same_kind = match (&self.kind, &other.kind) {
            (ErrorKind::Raised(left), ErrorKind::Raised(right)) => {
                Arc::ptr_eq(left, right) || left.to_string() == right.to_string()
            }
            (ErrorKind::Message(left), ErrorKind::Message(right))
            | (ErrorKind::Panicked(left), ErrorKind::Panicked(right)) => left == right,
            (ErrorKind::Canceled, ErrorKind::Canceled) => true,
            _ => false,
        };
        same_kind && self.suppressed == other.suppressed
    }
}

impl Eq for Error {}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ErrorKind::Raised(error) => Some(error.as_ref()),
            _ => None,
        }
    }
}

impl From<&str> for Error {
    fn from(message: &str) -> Self {
        Self::message(message)
    }
}

impl From<String> for Error {
    fn from(message: String) -> Self {
        Self::message(message)
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Self::new(error)
    }
}
