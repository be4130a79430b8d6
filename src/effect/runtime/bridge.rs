//! Bridge from fibers to the tokio ecosystem.
//!
//! Timers and arbitrary futures cannot run on the cooperative scheduler
//! itself, because it only interprets effect trees. They are spawned as tasks
//! on a global tokio runtime instead; the waiting fiber suspends on an
//! `Async` node and the task completes its callback.
//!
//! The global runtime is multi-threaded, created lazily on first use and never
//! dropped. Using it regardless of the caller's context means a run blocked
//! on with [`Runtime::run_sync`](super::Runtime::run_sync) from inside a
//! current-thread tokio runtime still sees its timers fire.

use std::future::Future;
use std::sync::LazyLock;

use tokio::runtime::{Builder, Runtime};
use tokio::task::JoinHandle;

use super::super::fiber::Callback;
use super::super::io::IO;

/// Global tokio runtime initialized lazily on first access.
///
/// Configured with one worker thread per CPU core and all drivers enabled.
static GLOBAL_RUNTIME: LazyLock<Runtime> = LazyLock::new(|| {
    Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .thread_name("strand-bridge")
        .enable_all()
        .build()
        .expect("Failed to create global tokio runtime")
});

/// Returns a reference to the global runtime.
#[inline]
pub(crate) fn global() -> &'static Runtime {
    &GLOBAL_RUNTIME
}

fn spawn<F>(future: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    global().spawn(future)
}

/// Suspends the fiber until the future built by `factory` resolves.
///
/// The future is built and spawned only when the effect runs. If the fiber
/// is canceled while waiting, the task is aborted.
pub(crate) fn from_future<A, F, Fut>(factory: F) -> IO<A>
where
    A: Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = A> + Send + 'static,
{
    IO::async_(move |callback: Callback<A>| {
        let future = factory();
        let task = spawn(async move {
            let value = future.await;
            let _ = callback.succeed(value);
        });
        Some(IO::delay(move || task.abort()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::ptr;

    #[rstest]
    fn global_returns_same_instance() {
        let runtime1 = global();
        let runtime2 = global();
        assert!(ptr::eq(runtime1, runtime2));
    }

    #[rstest]
    fn spawned_task_runs_on_global_runtime() {
        let (sender, receiver) = std::sync::mpsc::channel();
        spawn(async move {
            sender.send(42).unwrap();
        });
        assert_eq!(receiver.recv().unwrap(), 42);
    }
}
