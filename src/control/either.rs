//! The winner of a race.
//!
//! [`IO::race`](crate::effect::IO::race) resolves to `Left` when its first
//! effect finished first and to `Right` when the second one did.
//! [`IO::race_pair`](crate::effect::IO::race_pair) tags its richer result
//! the same way.
//!
//! # Examples
//!
//! ```rust
//! use strand::control::Either;
//!
//! let winner: Either<i32, String> = Either::Right("fast".to_string());
//! let described = winner.fold(|n| format!("number {n}"), |s| format!("string {s}"));
//! assert_eq!(described, "string fast");
//! ```

/// One of two alternatives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Either<L, R> {
    /// The first alternative.
    Left(L),
    /// The second alternative.
    Right(R),
}

impl<L, R> Either<L, R> {
    /// The first alternative, if this is one.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use strand::control::Either;
    ///
    /// let first: Either<i32, ()> = Either::Left(1);
    /// assert_eq!(first.left(), Some(1));
    /// ```
    #[inline]
    pub fn left(self) -> Option<L> {
        match self {
            Self::Left(value) => Some(value),
            Self::Right(_) => None,
        }
    }

    /// The second alternative, if this is one.
    #[inline]
    pub fn right(self) -> Option<R> {
        match self {
            Self::Left(_) => None,
            Self::Right(value) => Some(value),
        }
    }

    /// Reduces either alternative to a `T`.
    pub fn fold<T>(self, on_left: impl FnOnce(L) -> T, on_right: impl FnOnce(R) -> T) -> T {
        match self {
            Self::Left(value) => on_left(value),
            Self::Right(value) => on_right(value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Either::Left(3), Some(3), None)]
    #[case(Either::Right("x"), None, Some("x"))]
    fn extraction(
        #[case] either: Either<i32, &'static str>,
        #[case] left: Option<i32>,
        #[case] right: Option<&'static str>,
    ) {
        assert_eq!(either.left(), left);
        assert_eq!(either.right(), right);
    }

    #[rstest]
    fn fold_picks_the_matching_branch() {
        let winner: Either<i32, i32> = Either::Left(2);
        assert_eq!(winner.fold(|n| n * 10, |n| n), 20);
    }
}
