//! Asynchronous FIFO queues with backpressure.
//!
//! A [`Queue`] moves values between fibers. Blocking operations suspend the
//! calling fiber instead of an OS thread: a `take` on an empty queue parks the
//! taker until an element arrives, and an `offer` on a full
//! [`QueuePolicy::Bounded`] queue parks the offerer until space frees up.
//!
//! # Policies
//!
//! | policy           | `offer` when full              | `try_offer` when full |
//! |------------------|--------------------------------|-----------------------|
//! | `Bounded(n)`     | suspends until space           | `false`               |
//! | `Unbounded`      | never full                     | `true`                |
//! | `Dropping(n)`    | returns, element discarded     | `false`               |
//! | `CircularBuffer` | evicts the oldest, accepts     | `true`                |
//!
//! `Bounded(0)` is a rendezvous channel: every offer waits for a taker and
//! hands its element over directly.
//!
//! # Cancellation
//!
//! A pending `offer` or `take` that is canceled removes itself from the
//! waiter list. Its element is never delivered and no other element is lost
//! or duplicated.
//!
//! # Examples
//!
//! ```rust
//! use strand::effect::{IO, Queue};
//!
//! let queue = Queue::bounded(2);
//! let producer = queue.offer(1).then(queue.offer(2)).then(queue.offer(3));
//! let consumer = queue
//!     .take()
//!     .map2(queue.take(), |a, b| vec![a, b])
//!     .map2(queue.take(), |mut taken, c| {
//!         taken.push(c);
//!         taken
//!     });
//!
//! let program = producer.start().flat_map(move |fiber| {
//!     consumer.flat_map(move |taken| fiber.join_with_never().as_value(taken))
//! });
//! assert_eq!(program.run_unsafe(), Ok(vec![1, 2, 3]));
//! ```

use std::collections::VecDeque;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use super::fiber::Callback;
use super::io::IO;

// =============================================================================
// Policy and Errors
// =============================================================================

/// What a queue does when it is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueuePolicy {
    /// Holds at most `n` elements; `offer` suspends while full.
    Bounded(usize),
    /// Never full.
    Unbounded,
    /// Holds at most `n` elements; new elements are discarded while full.
    Dropping(usize),
    /// Holds at most `n` elements; the oldest is evicted to make room.
    CircularBuffer(usize),
}

impl QueuePolicy {
    /// Returns the maximum number of buffered elements, or `None` for
    /// [`QueuePolicy::Unbounded`].
    pub const fn capacity(&self) -> Option<usize> {
        match self {
            Self::Bounded(capacity) | Self::Dropping(capacity) | Self::CircularBuffer(capacity) => {
                Some(*capacity)
            }
            Self::Unbounded => None,
        }
    }

    fn validate(self) -> Result<Self, QueueError> {
        match self {
            Self::Dropping(0) | Self::CircularBuffer(0) => Err(QueueError::InvalidCapacity(self)),
            _ => Ok(self),
        }
    }
}

impl fmt::Display for QueuePolicy {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bounded(capacity) => write!(formatter, "bounded({capacity})"),
            Self::Unbounded => write!(formatter, "unbounded"),
            Self::Dropping(capacity) => write!(formatter, "dropping({capacity})"),
            Self::CircularBuffer(capacity) => write!(formatter, "circular_buffer({capacity})"),
        }
    }
}

/// Errors that can occur when constructing a [`Queue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// The policy needs a capacity greater than zero.
    ///
    /// Only [`QueuePolicy::Bounded`] accepts a capacity of zero.
    InvalidCapacity(QueuePolicy),
}

impl fmt::Display for QueueError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidCapacity(policy) => {
                write!(formatter, "invalid queue policy {policy}: capacity must be greater than 0")
            }
        }
    }
}

impl Error for QueueError {}

// =============================================================================
// Queue State
// =============================================================================

struct QueueState<A> {
    buffer: VecDeque<A>,
    /// Suspended `take` calls, oldest first.
    takers: VecDeque<(u64, Callback<A>)>,
    /// Suspended `offer` calls with their elements, oldest first.
    offerers: VecDeque<(u64, A, Callback<()>)>,
    next_waiter: u64,
}

impl<A: Send + 'static> QueueState<A> {
    fn new() -> Self {
        Self {
            buffer: VecDeque::new(),
            takers: VecDeque::new(),
            offerers: VecDeque::new(),
            next_waiter: 0,
        }
    }

    fn next_waiter_id(&mut self) -> u64 {
        let id = self.next_waiter;
        self.next_waiter += 1;
        id
    }

    /// Hands `value` to the oldest live taker, or gives it back.
    fn hand_to_taker(&mut self, mut value: A) -> Result<(), A> {
        while let Some((_, taker)) = self.takers.pop_front() {
            match taker.succeed(value) {
                Ok(()) => return Ok(()),
                Err(returned) => value = returned,
            }
        }
        Err(value)
    }

    /// Releases the oldest live offerer and returns its element.
    fn release_offerer(&mut self) -> Option<A> {
        while let Some((_, value, offerer)) = self.offerers.pop_front() {
            if offerer.succeed(()).is_ok() {
                return Some(value);
            }
        }
        None
    }

    /// Accepts `value` without suspending if the policy allows it.
    ///
    /// Returns the value back only if it has to wait for space.
    fn offer_now(&mut self, policy: QueuePolicy, value: A) -> Result<bool, A> {
        let value = match self.hand_to_taker(value) {
            Ok(()) => return Ok(true),
            Err(value) => value,
        };
        match policy {
            QueuePolicy::Unbounded => {
                self.buffer.push_back(value);
                Ok(true)
            }
            QueuePolicy::Bounded(capacity) => {
                if self.buffer.len() < capacity {
                    self.buffer.push_back(value);
                    Ok(true)
                } else {
                    Err(value)
                }
            }
            QueuePolicy::Dropping(capacity) => {
                if self.buffer.len() < capacity {
                    self.buffer.push_back(value);
                    Ok(true)
                } else {
                    #[cfg(feature = "tracing")]
                    tracing::trace!(capacity, "dropping queue is full, element discarded");
                    Ok(false)
                }
            }
            QueuePolicy::CircularBuffer(capacity) => {
                if self.buffer.len() >= capacity {
                    self.buffer.pop_front();
                    #[cfg(feature = "tracing")]
                    tracing::trace!(capacity, "circular queue is full, oldest element evicted");
                }
                self.buffer.push_back(value);
                Ok(true)
            }
        }
    }

    /// Takes the next element without suspending, if there is one.
    fn take_now(&mut self) -> Option<A> {
        match self.buffer.pop_front() {
            Some(value) => {
                if let Some(waiting) = self.release_offerer() {
                    self.buffer.push_back(waiting);
                }
                Some(value)
            }
            None => self.release_offerer(),
        }
    }
}

// =============================================================================
// Queue
// =============================================================================

/// A FIFO queue shared between fibers.
///
/// Cloning a `Queue` yields another handle to the same queue.
pub struct Queue<A> {
    policy: QueuePolicy,
    state: Arc<Mutex<QueueState<A>>>,
}

impl<A> Clone for Queue<A> {
    fn clone(&self) -> Self {
        Self {
            policy: self.policy,
            state: Arc::clone(&self.state),
        }
    }
}

impl<A: Send + 'static> Queue<A> {
    /// Creates a queue with the given policy.
    ///
    /// # Panics
    ///
    /// Panics if a dropping or circular policy has a capacity of zero.
    /// Use [`Queue::try_new`] to handle the error instead.
    pub fn new(policy: QueuePolicy) -> Self {
        Self::try_new(policy).expect("Invalid queue policy")
    }

    /// Creates a queue with the given policy.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidCapacity`] if a dropping or circular
    /// policy has a capacity of zero.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use strand::effect::{Queue, QueueError, QueuePolicy};
    ///
    /// assert!(Queue::<i32>::try_new(QueuePolicy::Bounded(0)).is_ok());
    /// assert_eq!(
    ///     Queue::<i32>::try_new(QueuePolicy::Dropping(0)).unwrap_err(),
    ///     QueueError::InvalidCapacity(QueuePolicy::Dropping(0))
    /// );
    /// ```
    pub fn try_new(policy: QueuePolicy) -> Result<Self, QueueError> {
        let policy = policy.validate()?;
        Ok(Self {
            policy,
            state: Arc::new(Mutex::new(QueueState::new())),
        })
    }

    /// A queue holding at most `capacity` elements. `offer` suspends while
    /// it is full. A capacity of zero makes every offer wait for a taker.
    pub fn bounded(capacity: usize) -> Self {
        Self::new(QueuePolicy::Bounded(capacity))
    }

    /// A queue that never refuses an element.
    pub fn unbounded() -> Self {
        Self::new(QueuePolicy::Unbounded)
    }

    /// A queue that discards new elements while it is full.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn dropping(capacity: usize) -> Self {
        Self::new(QueuePolicy::Dropping(capacity))
    }

    /// Fallible version of [`Queue::dropping`].
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidCapacity`] if `capacity` is zero.
    pub fn try_dropping(capacity: usize) -> Result<Self, QueueError> {
        Self::try_new(QueuePolicy::Dropping(capacity))
    }

    /// A queue that evicts its oldest element to make room for a new one.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn circular_buffer(capacity: usize) -> Self {
        Self::new(QueuePolicy::CircularBuffer(capacity))
    }

    /// Fallible version of [`Queue::circular_buffer`].
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidCapacity`] if `capacity` is zero.
    pub fn try_circular_buffer(capacity: usize) -> Result<Self, QueueError> {
        Self::try_new(QueuePolicy::CircularBuffer(capacity))
    }

    /// Returns the queue's policy.
    pub const fn policy(&self) -> QueuePolicy {
        self.policy
    }

    /// Returns the maximum number of buffered elements, or `None` if the
    /// queue is unbounded.
    pub const fn capacity(&self) -> Option<usize> {
        self.policy.capacity()
    }

    // =========================================================================
    // Producers
    // =========================================================================

    /// Adds `value` to the queue.
    ///
    /// On a full bounded queue the fiber suspends until a taker makes room.
    /// Dropping and circular queues never suspend; see the
    /// [module documentation](self) for what they do when full.
    pub fn offer(&self, value: A) -> IO<()> {
        let queue = self.clone();
        IO::defer(move || {
            let result = queue.state.lock().offer_now(queue.policy, value);
            match result {
                Ok(_) => IO::unit(),
                Err(value) => queue.offer_suspended(value),
            }
        })
    }

    fn offer_suspended(self, value: A) -> IO<()> {
        IO::async_(move |callback: Callback<()>| {
            let mut state = self.state.lock();
            let value = match state.offer_now(self.policy, value) {
                Ok(_) => {
                    let _ = callback.succeed(());
                    return None;
                }
                Err(value) => value,
            };
            let id = state.next_waiter_id();
            state.offerers.push_back((id, value, callback));
            drop(state);

            let queue = Arc::clone(&self.state);
            Some(IO::delay(move || {
                queue.lock().offerers.retain(|(waiter, _, _)| *waiter != id);
            }))
        })
    }

    /// Adds `value` if that is possible without suspending.
    ///
    /// Returns whether the element was accepted. A circular queue always
    /// accepts, evicting its oldest element if needed.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use strand::effect::Queue;
    ///
    /// let queue = Queue::bounded(1);
    /// let io = queue.try_offer(1).map2(queue.try_offer(2), |first, second| (first, second));
    /// assert_eq!(io.run_unsafe(), Ok((true, false)));
    /// ```
    pub fn try_offer(&self, value: A) -> IO<bool> {
        let queue = self.clone();
        IO::delay(move || queue.state.lock().offer_now(queue.policy, value).unwrap_or(false))
    }

    // =========================================================================
    // Consumers
    // =========================================================================

    /// Removes and returns the oldest element, suspending while the queue is
    /// empty.
    pub fn take(&self) -> IO<A> {
        let queue = self.clone();
        IO::defer(move || {
            let taken = queue.state.lock().take_now();
            match taken {
                Some(value) => IO::pure(value),
                None => queue.take_suspended(),
            }
        })
    }

    fn take_suspended(self) -> IO<A> {
        IO::async_(move |callback: Callback<A>| {
            let mut state = self.state.lock();
            if let Some(value) = state.take_now() {
                if let Err(value) = callback.succeed(value) {
                    state.buffer.push_front(value);
                }
                return None;
            }
            let id = state.next_waiter_id();
            state.takers.push_back((id, callback));
            drop(state);

            let queue = Arc::clone(&self.state);
            Some(IO::delay(move || {
                queue.lock().takers.retain(|(waiter, _)| *waiter != id);
            }))
        })
    }

    /// Removes and returns the oldest element if there is one.
    pub fn try_take(&self) -> IO<Option<A>> {
        let queue = self.clone();
        IO::delay(move || queue.state.lock().take_now())
    }

    /// Removes every element that is available without suspending, including
    /// those of suspended offerers, in FIFO order.
    pub fn try_take_all(&self) -> IO<Vec<A>> {
        let queue = self.clone();
        IO::delay(move || {
            let mut state = queue.state.lock();
            std::iter::from_fn(|| state.take_now()).collect()
        })
    }

    /// Returns the number of buffered elements.
    pub fn size(&self) -> IO<usize> {
        let queue = self.clone();
        IO::delay(move || queue.state.lock().buffer.len())
    }

    /// Returns `true` if no element is buffered.
    pub fn is_empty(&self) -> IO<bool> {
        self.size().fmap(|size| size == 0)
    }
}

impl<A> fmt::Debug for Queue<A> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Queue")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn offer_all(queue: &Queue<i32>, values: &[i32]) -> IO<()> {
        values
            .iter()
            .fold(IO::unit(), |io, value| io.then(queue.offer(*value)))
    }

    #[rstest]
    #[case(QueuePolicy::Bounded(0), true)]
    #[case(QueuePolicy::Bounded(3), true)]
    #[case(QueuePolicy::Unbounded, true)]
    #[case(QueuePolicy::Dropping(0), false)]
    #[case(QueuePolicy::Dropping(1), true)]
    #[case(QueuePolicy::CircularBuffer(0), false)]
    #[case(QueuePolicy::CircularBuffer(1), true)]
    fn test_capacity_validation(#[case] policy: QueuePolicy, #[case] valid: bool) {
        assert_eq!(Queue::<i32>::try_new(policy).is_ok(), valid);
    }

    #[rstest]
    #[should_panic(expected = "Invalid queue policy")]
    fn test_circular_buffer_zero_panics() {
        let _ = Queue::<i32>::circular_buffer(0);
    }

    #[rstest]
    fn test_error_display_names_policy() {
        let error = QueueError::InvalidCapacity(QueuePolicy::Dropping(0));
        assert_eq!(
            error.to_string(),
            "invalid queue policy dropping(0): capacity must be greater than 0"
        );
    }

    #[rstest]
    #[case(Queue::bounded(3))]
    #[case(Queue::unbounded())]
    #[case(Queue::dropping(3))]
    #[case(Queue::circular_buffer(3))]
    fn test_fifo_order(#[case] queue: Queue<i32>) {
        let io = offer_all(&queue, &[1, 2, 3]).then(queue.try_take_all());
        assert_eq!(io.run_unsafe(), Ok(vec![1, 2, 3]));
    }

    #[rstest]
    fn test_dropping_discards_new_elements() {
        let queue = Queue::dropping(2);
        let io = offer_all(&queue, &[1, 2, 3])
            .then(queue.try_offer(4))
            .flat_map({
                let queue = queue.clone();
                move |accepted| queue.try_take_all().fmap(move |taken| (accepted, taken))
            });
        assert_eq!(io.run_unsafe(), Ok((false, vec![1, 2])));
    }

    #[rstest]
    fn test_circular_buffer_evicts_oldest() {
        let queue = Queue::circular_buffer(2);
        let io = offer_all(&queue, &[1, 2, 3])
            .then(queue.try_offer(4))
            .flat_map({
                let queue = queue.clone();
                move |accepted| queue.try_take_all().fmap(move |taken| (accepted, taken))
            });
        assert_eq!(io.run_unsafe(), Ok((true, vec![3, 4])));
    }

    #[rstest]
    fn test_try_take_on_empty_queue() {
        let queue = Queue::<i32>::unbounded();
        assert_eq!(queue.try_take().run_unsafe(), Ok(None));
        assert_eq!(queue.is_empty().run_unsafe(), Ok(true));
    }

    #[rstest]
    fn test_take_suspends_until_offer() {
        let queue = Queue::unbounded();
        let taker = queue.take();
        let io = taker
            .start()
            .flat_map({
                let queue = queue.clone();
                move |fiber| IO::cede().then(queue.offer(7)).then(fiber.join_with_never())
            });
        assert_eq!(io.run_unsafe(), Ok(7));
    }

    #[rstest]
    fn test_bounded_offer_suspends_until_take() {
        let queue = Queue::bounded(1);
        let io = queue
            .offer(1)
            .then(queue.offer(2).start())
            .flat_map({
                let queue = queue.clone();
                move |offerer| {
                    IO::cede()
                        .then(queue.size())
                        .flat_map(move |size_while_blocked| {
                            queue.take().flat_map(move |first| {
                                offerer
                                    .join_with_never()
                                    .then(queue.try_take_all())
                                    .fmap(move |rest| (size_while_blocked, first, rest))
                            })
                        })
                }
            });
        assert_eq!(io.run_unsafe(), Ok((1, 1, vec![2])));
    }

    #[rstest]
    fn test_canceled_offer_leaves_queue_consistent() {
        let queue = Queue::bounded(1);
        let io = queue
            .offer(1)
            .then(queue.offer(2).start())
            .flat_map({
                let queue = queue.clone();
                move |offerer| {
                    IO::cede()
                        .then(offerer.cancel())
                        .then(queue.size())
                        .flat_map(move |size| {
                            queue
                                .take()
                                .then(queue.try_offer(3))
                                .flat_map(move |accepted| {
                                    queue.try_take_all().fmap(move |rest| (size, accepted, rest))
                                })
                        })
                }
            });
        assert_eq!(io.run_unsafe(), Ok((1, true, vec![3])));
    }

    #[rstest]
    fn test_canceled_take_does_not_swallow_elements() {
        let queue = Queue::unbounded();
        let io = queue
            .take()
            .start()
            .flat_map({
                let queue = queue.clone();
                move |taker| {
                    IO::cede()
                        .then(taker.cancel())
                        .then(queue.offer(5))
                        .then(queue.try_take())
                }
            });
        assert_eq!(io.run_unsafe(), Ok(Some(5)));
    }
}
