//! # Operations
//!
//! Cancellable units of async work with hierarchical progress.
//!
//! ## Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Operation Lifecycle                              │
//! │                                                                         │
//! │   construct ──► run() ──► cancelled already? ──yes──► cancelled error  │
//! │                              │ no                                       │
//! │                              ▼                                          │
//! │                          execute()                                      │
//! │                              │                                          │
//! │                              ▼                                          │
//! │                          finish(result)   cancelled → cancelled error  │
//! │                              │                                          │
//! │                              ▼                                          │
//! │                          finished()       runs on every path           │
//! │                              │                                          │
//! │                              ▼                                          │
//! │                     progress.complete()                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Cancellation is cooperative: [`Progress::cancel`] flags the progress tree
//! and wakes waiters, and operations observe it between steps or while
//! awaiting a service call. Nothing is aborted mid-write.
//!
//! ## Entry Points
//! - [`run`]: awaits an operation in the current task
//! - [`spawn`]: runs it on a Tokio task and returns an [`OperationHandle`]
//! - [`start`]: fire-and-forget with a completion callback

pub mod progress;
pub mod record;
pub mod service;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::error;

use harmony_core::GeneralError;

pub use progress::Progress;
pub use record::RecordOperation;
pub use service::{RetryPolicy, RetryableError, ServiceRetry};

// =============================================================================
// Operation Trait
// =============================================================================

/// A unit of async work producing a typed result.
#[async_trait]
pub trait Operation: Send + Sync + 'static {
    type Output: Send + Sync + 'static;
    type Error: Send + 'static;

    /// Progress of this operation. Parents attach it as a child.
    fn progress(&self) -> &Progress;

    /// Does the work. Called at most once, by [`run`].
    async fn execute(&self) -> Result<Self::Output, Self::Error>;

    /// Error reported when the operation is cancelled.
    fn cancelled_error(&self) -> Self::Error;

    /// Adjusts the result once `execute` returns.
    ///
    /// Any result of a cancelled operation, success or failure, becomes the
    /// cancelled error.
    fn finish(
        &self,
        result: Result<Self::Output, Self::Error>,
    ) -> Result<Self::Output, Self::Error> {
        match result {
            _ if self.progress().is_cancelled() => Err(self.cancelled_error()),
            result => result,
        }
    }

    /// Cleanup that runs once the result is known, including when the
    /// operation was cancelled before `execute` started.
    async fn finished(&self) {}

    /// Requests cancellation.
    fn cancel(&self) {
        self.progress().cancel();
    }
}

// =============================================================================
// Running Operations
// =============================================================================

/// Runs `operation` to completion in the current task.
pub async fn run<O>(operation: &O) -> Result<O::Output, O::Error>
where
    O: Operation + ?Sized,
{
    let result = if operation.progress().is_cancelled() {
        Err(operation.cancelled_error())
    } else {
        let result = operation.execute().await;
        operation.finish(result)
    };

    operation.finished().await;
    operation.progress().complete();
    result
}

/// Runs `operation` on a new Tokio task.
pub fn spawn<O>(operation: O) -> OperationHandle<O::Output, O::Error>
where
    O: Operation,
    O::Error: From<GeneralError>,
{
    let progress = operation.progress().clone();
    let task = tokio::spawn(async move { run(&operation).await });

    OperationHandle { task, progress }
}

/// Runs `operation` on a new Tokio task and hands the result to `callback`.
///
/// Returns immediately with the operation's progress.
pub fn start<O, F>(operation: O, callback: F) -> Progress
where
    O: Operation,
    F: FnOnce(Result<O::Output, O::Error>) + Send + 'static,
{
    let progress = operation.progress().clone();
    tokio::spawn(async move {
        let result = run(&operation).await;
        callback(result);
    });

    progress
}

// =============================================================================
// Operation Handle
// =============================================================================

/// Handle to a spawned operation.
pub struct OperationHandle<T, E> {
    task: JoinHandle<Result<T, E>>,
    progress: Progress,
}

impl<T, E> OperationHandle<T, E>
where
    E: From<GeneralError>,
{
    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    pub fn cancel(&self) {
        self.progress.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the operation's result.
    pub async fn result(self) -> Result<T, E> {
        match self.task.await {
            Ok(result) => result,
            Err(err) if err.is_cancelled() => Err(GeneralError::Cancelled.into()),
            Err(err) => {
                error!(error = %err, "Operation task panicked");
                Err(GeneralError::Unknown.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct Countdown {
        progress: Progress,
        steps: u64,
        executed: Arc<AtomicUsize>,
        finished: Arc<AtomicUsize>,
        fail_on_cancel: bool,
    }

    impl Countdown {
        fn new(steps: u64) -> Self {
            Countdown {
                progress: Progress::new(steps),
                steps,
                executed: Arc::new(AtomicUsize::new(0)),
                finished: Arc::new(AtomicUsize::new(0)),
                fail_on_cancel: false,
            }
        }
    }

    #[async_trait]
    impl Operation for Countdown {
        type Output = u64;
        type Error = GeneralError;

        fn progress(&self) -> &Progress {
            &self.progress
        }

        async fn execute(&self) -> Result<u64, GeneralError> {
            self.executed.fetch_add(1, Ordering::SeqCst);
            for _ in 0..self.steps {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(5)) => self.progress.advance(1),
                    _ = self.progress.cancelled() => break,
                }
            }
            if self.fail_on_cancel && self.progress.is_cancelled() {
                return Err(GeneralError::Unknown);
            }
            Ok(self.progress.completed_unit_count())
        }

        fn cancelled_error(&self) -> GeneralError {
            GeneralError::Cancelled
        }

        async fn finished(&self) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_run_completes_progress() {
        let op = Countdown::new(3);
        assert_eq!(run(&op).await, Ok(3));
        assert!(op.progress().is_finished());
    }

    #[tokio::test]
    async fn test_cancelled_before_start_skips_execute() {
        let op = Countdown::new(3);
        op.cancel();

        assert_eq!(run(&op).await, Err(GeneralError::Cancelled));
        assert_eq!(op.executed.load(Ordering::SeqCst), 0);
        assert_eq!(op.finished.load(Ordering::SeqCst), 1);
        assert!(op.progress().is_finished());
    }

    #[tokio::test]
    async fn test_failure_of_cancelled_operation_becomes_cancelled() {
        let mut op = Countdown::new(1_000);
        op.fail_on_cancel = true;
        let finished = Arc::clone(&op.finished);

        let handle = spawn(op);
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();

        assert_eq!(handle.result().await, Err(GeneralError::Cancelled));
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_spawned_operation_can_be_cancelled() {
        let handle = spawn(Countdown::new(1_000));
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();

        assert_eq!(handle.result().await, Err(GeneralError::Cancelled));
    }

    #[tokio::test]
    async fn test_start_invokes_callback() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let progress = start(Countdown::new(2), move |result| {
            let _ = tx.send(result);
        });

        assert_eq!(rx.await.unwrap(), Ok(2));
        assert!(progress.is_finished());
    }
}
