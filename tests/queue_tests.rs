//! Integration tests for `Queue`: ordering, overflow policies, rendezvous
//! hand-off and cancellation of suspended operations.

use proptest::prelude::*;
use rstest::rstest;
use strand::effect::{IO, Outcome, Queue, QueueError, QueuePolicy};

fn offer_all(queue: &Queue<i32>, values: impl IntoIterator<Item = i32>) -> IO<()> {
    values
        .into_iter()
        .fold(IO::unit(), |io, value| io.then(queue.offer(value)))
}

// =============================================================================
// Ordering
// =============================================================================

#[rstest]
#[case(QueuePolicy::Bounded(8))]
#[case(QueuePolicy::Unbounded)]
#[case(QueuePolicy::Dropping(8))]
#[case(QueuePolicy::CircularBuffer(8))]
fn test_elements_come_out_in_offer_order(#[case] policy: QueuePolicy) {
    let queue = Queue::new(policy);
    let io = offer_all(&queue, 1..=5).then(queue.try_take_all());
    assert_eq!(io.run_unsafe(), Ok(vec![1, 2, 3, 4, 5]));
}

const FIFO_CAPACITY: usize = 32;

fn take_n(queue: &Queue<i32>, count: usize) -> IO<Vec<i32>> {
    (0..count).fold(IO::pure(Vec::new()), |io, _| {
        let queue = queue.clone();
        io.flat_map(move |mut taken| {
            queue.take().fmap(move |value| {
                taken.push(value);
                taken
            })
        })
    })
}

proptest! {
    /// With room for every element, each policy hands elements out in the
    /// order they were offered.
    #[test]
    fn prop_queue_fifo(values in prop::collection::vec(any::<i32>(), 0..FIFO_CAPACITY)) {
        let policies = [
            QueuePolicy::Bounded(FIFO_CAPACITY),
            QueuePolicy::Unbounded,
            QueuePolicy::Dropping(FIFO_CAPACITY),
            QueuePolicy::CircularBuffer(FIFO_CAPACITY),
        ];
        for policy in policies {
            let queue = Queue::new(policy);
            let io = offer_all(&queue, values.clone())
                .then(take_n(&queue, values.len()))
                .product(queue.size());
            prop_assert_eq!(io.run_unsafe(), Ok((values.clone(), 0)));
        }
    }
}

#[rstest]
fn test_dropping_queue_keeps_oldest() {
    let queue = Queue::dropping(2);
    let io = offer_all(&queue, 1..=4).then(queue.try_take_all());
    assert_eq!(io.run_unsafe(), Ok(vec![1, 2]));
}

#[rstest]
fn test_circular_queue_keeps_newest() {
    let queue = Queue::circular_buffer(2);
    let io = offer_all(&queue, 1..=4).then(queue.try_take_all());
    assert_eq!(io.run_unsafe(), Ok(vec![3, 4]));
}

#[rstest]
fn test_try_offer_reports_acceptance() {
    let bounded = Queue::bounded(1);
    let circular = Queue::circular_buffer(1);
    let io = bounded
        .try_offer(1)
        .product(bounded.try_offer(2))
        .product(circular.try_offer(1).product(circular.try_offer(2)));
    assert_eq!(io.run_unsafe(), Ok(((true, false), (true, true))));
}

// =============================================================================
// Suspension
// =============================================================================

#[rstest]
fn test_zero_capacity_queue_hands_off_directly() {
    let queue = Queue::bounded(0);
    let exchange = |value: i32, queue: &Queue<i32>| {
        let taker = queue.clone();
        queue
            .offer(value)
            .start()
            .flat_map(move |offerer| taker.take().flat_map(move |taken| offerer.join().as_value(taken)))
    };

    let io = exchange(1, &queue)
        .product(exchange(2, &queue))
        .product(queue.size());
    assert_eq!(io.run_unsafe(), Ok(((1, 2), 0)));
}

#[rstest]
fn test_take_waits_for_offer() {
    let queue = Queue::unbounded();
    let producer = queue.clone();
    let io = queue
        .take()
        .start()
        .flat_map(move |taker| IO::cede().then(producer.offer(7)).then(taker.join()));
    assert_eq!(io.run_unsafe(), Ok(Outcome::Succeeded(7)));
}

#[rstest]
fn test_full_bounded_queue_suspends_offer_until_take() {
    let queue = Queue::bounded(1);
    let consumer = queue.clone();
    let io = queue.offer(1).then(queue.offer(2)).start().flat_map(move |producer| {
        IO::cede()
            .then(consumer.size())
            .flat_map(move |size_while_blocked| {
                consumer
                    .take()
                    .product(consumer.take())
                    .flat_map(move |taken| producer.join().as_value((size_while_blocked, taken)))
            })
    });
    assert_eq!(io.run_unsafe(), Ok((1, (1, 2))));
}

// =============================================================================
// Cancellation
// =============================================================================

#[rstest]
fn test_canceled_offer_leaves_queue_unchanged() {
    let queue = Queue::bounded(1);
    let observer = queue.clone();
    let io = queue.offer(1).then(queue.offer(2).start()).flat_map(move |blocked| {
        IO::cede()
            .then(blocked.cancel())
            .then(observer.size())
            .flat_map(move |size| {
                observer
                    .take()
                    .product(observer.try_offer(3))
                    .product(observer.try_take_all())
                    .fmap(move |result| (size, result))
            })
    });
    assert_eq!(io.run_unsafe(), Ok((1, ((1, true), vec![3]))));
}

#[rstest]
fn test_canceled_take_does_not_swallow_elements() {
    let queue = Queue::unbounded();
    let observer = queue.clone();
    let io = queue.take().start().flat_map(move |blocked| {
        IO::cede()
            .then(blocked.cancel())
            .then(observer.offer(5))
            .then(observer.try_take())
    });
    assert_eq!(io.run_unsafe(), Ok(Some(5)));
}

// =============================================================================
// Validation
// =============================================================================

#[rstest]
#[case(QueuePolicy::Dropping(0))]
#[case(QueuePolicy::CircularBuffer(0))]
fn test_zero_capacity_is_rejected_for_overflow_policies(#[case] policy: QueuePolicy) {
    assert_eq!(
        Queue::<i32>::try_new(policy).unwrap_err(),
        QueueError::InvalidCapacity(policy)
    );
}

#[rstest]
fn test_capacity_reflects_policy() {
    assert_eq!(Queue::<i32>::bounded(3).capacity(), Some(3));
    assert_eq!(Queue::<i32>::unbounded().capacity(), None);
    assert_eq!(Queue::<i32>::dropping(2).policy(), QueuePolicy::Dropping(2));
}
