//! Integration tests for fibers: start/join/cancel, masking, and the
//! structured concurrency combinators.

use rstest::rstest;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use strand::control::Either;
use strand::effect::{Callback, Error, IO, Outcome};

fn flag() -> (Arc<AtomicBool>, IO<()>) {
    let flag = Arc::new(AtomicBool::new(false));
    let handle = Arc::clone(&flag);
    (flag, IO::delay(move || handle.store(true, Ordering::SeqCst)))
}

// =============================================================================
// Join Outcomes
// =============================================================================

#[rstest]
fn test_join_reports_each_outcome() {
    let io = IO::pure(1)
        .start()
        .flat_map(|fiber| fiber.join())
        .product(IO::<i32>::raise_error("boom").start().flat_map(|fiber| fiber.join()))
        .product(
            IO::canceled()
                .then(IO::pure(3))
                .start()
                .flat_map(|fiber| fiber.join()),
        );

    let ((succeeded, errored), canceled) = io.run_unsafe().unwrap();
    assert_eq!(succeeded, Outcome::Succeeded(1));
    assert_eq!(errored, Outcome::Errored(Error::message("boom")));
    assert_eq!(canceled, Outcome::Canceled);
}

#[rstest]
fn test_join_with_never_reraises_errors() {
    let io = IO::<i32>::raise_error("child failed")
        .start()
        .flat_map(|fiber| fiber.join_with_never());
    assert_eq!(io.run_unsafe(), Err(Error::message("child failed")));
}

#[rstest]
fn test_fiber_ids_are_distinct() {
    let io = IO::unit()
        .start()
        .product(IO::unit().start())
        .fmap(|(first, second)| first.id() != second.id());
    assert_eq!(io.run_unsafe(), Ok(true));
}

// =============================================================================
// Cancellation
// =============================================================================

#[rstest]
fn test_cancel_runs_finalizers_before_returning() {
    let (finalized, finalizer) = flag();
    let check = Arc::clone(&finalized);
    let io = IO::<i32>::never()
        .on_cancel(finalizer)
        .start()
        .flat_map(move |fiber| {
            IO::cede()
                .then(fiber.cancel())
                .then(IO::delay(move || check.load(Ordering::SeqCst)))
        });
    assert_eq!(io.run_unsafe(), Ok(true));
    assert!(finalized.load(Ordering::SeqCst));
}

#[rstest]
fn test_cancel_is_observed_only_at_suspension_points() {
    let steps = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&steps);
    let busy = (0..100).fold(IO::unit(), move |io, _| {
        let counter = Arc::clone(&counter);
        io.then(IO::delay(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
    });

    let io = busy
        .then(IO::<()>::never())
        .start()
        .flat_map(|fiber| fiber.cancel().then(fiber.join()));
    assert_eq!(io.run_unsafe(), Ok(Outcome::Canceled));
    assert!(steps.load(Ordering::SeqCst) <= 100);
}

#[rstest]
fn test_uncancelable_region_defers_cancellation() {
    let (completed, mark_completed) = flag();
    let check = Arc::clone(&completed);
    let gate = Arc::new(parking_lot::Mutex::new(None::<Callback<()>>));
    let opener = Arc::clone(&gate);

    let masked = IO::uncancelable(move |_| {
        IO::async_(move |callback: Callback<()>| {
            *gate.lock() = Some(callback);
            None
        })
        .then(mark_completed)
    });

    let io = masked.start().flat_map(move |fiber| {
        let cancel = fiber.cancel();
        IO::cede().then(cancel.start()).flat_map(move |canceler| {
            IO::cede()
                .then(IO::delay(move || {
                    if let Some(callback) = opener.lock().take() {
                        let _ = callback.succeed(());
                    }
                }))
                .then(canceler.join_with_never())
                .then(fiber.join())
        })
    });

    assert_eq!(io.run_unsafe(), Ok(Outcome::Canceled));
    assert!(check.load(Ordering::SeqCst), "masked body must finish before cancellation");
}

#[rstest]
fn test_self_cancellation_inside_mask_runs_rest_of_region() {
    let (reached, mark) = flag();
    let io = IO::uncancelable(move |_| IO::canceled().then(mark))
        .start()
        .flat_map(|fiber| fiber.join());
    assert_eq!(io.run_unsafe(), Ok(Outcome::Canceled));
    assert!(reached.load(Ordering::SeqCst));
}

// =============================================================================
// Structured Concurrency
// =============================================================================

#[rstest]
fn test_race_returns_first_winner_and_cancels_loser() {
    let (loser_finalized, finalizer) = flag();
    let io = IO::cede()
        .then(IO::<i32>::never())
        .on_cancel(finalizer)
        .race(IO::pure("winner"));
    assert_eq!(io.run_unsafe(), Ok(Either::Right("winner")));
    assert!(loser_finalized.load(Ordering::SeqCst));
}

#[rstest]
fn test_race_pair_hands_back_running_loser() {
    let io = IO::pure(1)
        .race_pair(IO::cede().then(IO::pure(2)))
        .flat_map(|winner| match winner {
            Either::Left((outcome, loser)) => loser
                .join()
                .fmap(move |other| (outcome, other)),
            Either::Right((loser, outcome)) => loser.join().fmap(move |other| (other, outcome)),
        });
    assert_eq!(
        io.run_unsafe(),
        Ok((Outcome::Succeeded(1), Outcome::Succeeded(2)))
    );
}

#[rstest]
fn test_both_waits_for_both() {
    let io = IO::cede()
        .then(IO::cede())
        .then(IO::pure("slow"))
        .both(IO::pure("fast"));
    assert_eq!(io.run_unsafe(), Ok(("slow", "fast")));
}

#[rstest]
fn test_both_raises_first_error() {
    let io = IO::cede()
        .then(IO::<i32>::raise_error("late"))
        .both(IO::<i32>::raise_error("early"));
    assert_eq!(io.run_unsafe(), Err(Error::message("early")));
}

#[rstest]
fn test_par_is_both() {
    assert_eq!(IO::pure(1).par(IO::pure(2)).run_unsafe(), Ok((1, 2)));
}
