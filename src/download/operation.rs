// OfflineKit - Offline Media Downloads for Mobile Players
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Asynchronous operation lifecycle and the bounded queue that runs them
//!
//! # Lifecycle
//! Every operation moves `Pending -> Running -> Finished(error?)` exactly
//! once. Finishing is the only way an operation reports its outcome, and
//! [`run_operation`] makes sure it happens on every exit path. Waiters use
//! [`OperationStatus::finished`], which resolves without polling.
//!
//! # Queue
//! [`OperationQueue`] spawns operations on the tokio runtime with a
//! semaphore bounding how many execute at once. An operation cancelled while
//! still waiting for a slot finishes as cancelled without ever starting, and
//! a panicking operation is finished with an internal error.

use crate::error::{OfflineError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Lifecycle state of an operation
#[derive(Debug, Clone)]
pub enum OperationState {
    /// Created but not started
    Pending,
    /// Executing
    Running,
    /// Done, with the error it failed with, if any
    Finished(Option<Arc<OfflineError>>),
}

impl OperationState {
    pub fn is_finished(&self) -> bool {
        matches!(self, OperationState::Finished(_))
    }

    pub fn error(&self) -> Option<Arc<OfflineError>> {
        match self {
            OperationState::Finished(error) => error.clone(),
            OperationState::Pending | OperationState::Running => None,
        }
    }
}

/// Observable state cell shared by an operation and its waiters
#[derive(Debug)]
pub struct OperationStatus {
    state: watch::Sender<OperationState>,
}

impl Default for OperationStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationStatus {
    pub fn new() -> Self {
        Self {
            state: watch::Sender::new(OperationState::Pending),
        }
    }

    /// Snapshot of the current state
    pub fn state(&self) -> OperationState {
        self.state.borrow().clone()
    }

    /// Move `Pending -> Running`. Returns false if the operation was already
    /// started or finished.
    pub fn start(&self) -> bool {
        self.state.send_if_modified(|state| match state {
            OperationState::Pending => {
                *state = OperationState::Running;
                true
            }
            OperationState::Running | OperationState::Finished(_) => false,
        })
    }

    /// Record the outcome. Only the first call has an effect.
    pub fn finish(&self, error: Option<OfflineError>) -> bool {
        let mut error = error.map(Arc::new);
        let finished = self.state.send_if_modified(|state| match state {
            OperationState::Finished(_) => false,
            OperationState::Pending | OperationState::Running => {
                *state = OperationState::Finished(error.take());
                true
            }
        });

        if !finished {
            log::debug!("Ignoring repeated finish of an operation");
        }
        finished
    }

    pub fn is_pending(&self) -> bool {
        matches!(*self.state.borrow(), OperationState::Pending)
    }

    pub fn is_executing(&self) -> bool {
        matches!(*self.state.borrow(), OperationState::Running)
    }

    pub fn is_finished(&self) -> bool {
        self.state.borrow().is_finished()
    }

    /// Error the operation finished with, if it finished with one
    pub fn error(&self) -> Option<Arc<OfflineError>> {
        self.state.borrow().error()
    }

    /// Wait until the operation finishes and return its error, if any
    pub async fn finished(&self) -> Option<Arc<OfflineError>> {
        let mut rx = self.state.subscribe();
        let result = match rx.wait_for(OperationState::is_finished).await {
            Ok(state) => state.error(),
            // The sender lives in `self`, so the channel cannot close here
            Err(_) => Some(Arc::new(OfflineError::internal("operation status dropped"))),
        };
        result
    }
}

/// A unit of asynchronous work with an observable lifecycle
#[async_trait]
pub trait AsyncOperation: Send + Sync {
    fn status(&self) -> &OperationStatus;

    fn cancel_token(&self) -> &CancellationToken;

    /// The work itself. Called at most once, by [`run_operation`].
    async fn execute(&self) -> Result<()>;

    /// Short description used in log messages
    fn describe(&self) -> String {
        "operation".to_string()
    }

    fn cancel(&self) {
        self.cancel_token().cancel();
    }
}

/// Drive an operation from start to finish.
///
/// Refuses to run an operation twice. An operation cancelled before it
/// starts finishes with [`OfflineError::Cancelled`] without executing.
pub async fn run_operation<O>(operation: &O)
where
    O: AsyncOperation + ?Sized,
{
    if !operation.status().start() {
        log::warn!("Refusing to start {} again", operation.describe());
        return;
    }

    if operation.cancel_token().is_cancelled() {
        operation.status().finish(Some(OfflineError::Cancelled));
        return;
    }

    let result = operation.execute().await;
    if let Err(ref e) = result {
        log::debug!("{} failed: {}", operation.describe(), e);
    }
    operation.status().finish(result.err());
}

/// Bounded work queue for operations
#[derive(Debug, Clone)]
pub struct OperationQueue {
    semaphore: Arc<Semaphore>,
    tasks: TaskTracker,
}

impl OperationQueue {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            tasks: TaskTracker::new(),
        }
    }

    /// Schedule an operation. It runs once a slot frees up.
    pub fn enqueue<O>(&self, operation: Arc<O>)
    where
        O: AsyncOperation + 'static,
    {
        let semaphore = Arc::clone(&self.semaphore);

        self.tasks.spawn(async move {
            let permit = tokio::select! {
                permit = semaphore.acquire_owned() => permit,
                _ = operation.cancel_token().cancelled() => {
                    operation.status().finish(Some(OfflineError::Cancelled));
                    return;
                }
            };
            let _permit = match permit {
                Ok(permit) => permit,
                Err(_) => {
                    operation
                        .status()
                        .finish(Some(OfflineError::internal("operation queue closed")));
                    return;
                }
            };

            // Run in a separate task so a panic cannot leave waiters hanging
            let runner = Arc::clone(&operation);
            let outcome = tokio::spawn(async move { run_operation(runner.as_ref()).await }).await;

            if let Err(e) = outcome {
                log::warn!("{} aborted: {}", operation.describe(), e);
                operation.status().finish(Some(OfflineError::internal(format!(
                    "{} panicked: {}",
                    operation.describe(),
                    e
                ))));
            }
        });
    }

    /// Number of queued or running operations
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for everything enqueued so far to finish
    pub async fn wait_idle(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct TestOperation {
        status: OperationStatus,
        cancel: CancellationToken,
        runs: AtomicUsize,
        fail: bool,
        delay: Duration,
        panic: bool,
    }

    impl TestOperation {
        fn new() -> Self {
            Self {
                status: OperationStatus::new(),
                cancel: CancellationToken::new(),
                runs: AtomicUsize::new(0),
                fail: false,
                delay: Duration::ZERO,
                panic: false,
            }
        }
    }

    #[async_trait]
    impl AsyncOperation for TestOperation {
        fn status(&self) -> &OperationStatus {
            &self.status
        }

        fn cancel_token(&self) -> &CancellationToken {
            &self.cancel
        }

        async fn execute(&self) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.panic {
                panic!("boom");
            }
            if self.fail {
                return Err(OfflineError::EmptyPayload("test".to_string()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let op = TestOperation::new();
        assert!(op.status().is_pending());

        run_operation(&op).await;

        assert!(op.status().is_finished());
        assert!(op.status().error().is_none());
        assert_eq!(op.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_second_start_refused() {
        let op = TestOperation::new();
        run_operation(&op).await;
        run_operation(&op).await;
        assert_eq!(op.runs.load(Ordering::SeqCst), 1);
        assert!(!op.status().start());
    }

    #[tokio::test]
    async fn test_finish_only_once() {
        let status = OperationStatus::new();
        assert!(status.finish(Some(OfflineError::Cancelled)));
        assert!(!status.finish(None));
        assert!(matches!(status.error().as_deref(), Some(OfflineError::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let op = TestOperation::new();
        op.cancel();
        run_operation(&op).await;

        assert_eq!(op.runs.load(Ordering::SeqCst), 0);
        assert!(matches!(op.status().error().as_deref(), Some(OfflineError::Cancelled)));
    }

    #[tokio::test]
    async fn test_failure_is_recorded() {
        let op = TestOperation { fail: true, ..TestOperation::new() };
        run_operation(&op).await;
        assert!(matches!(op.status().finished().await.as_deref(), Some(OfflineError::EmptyPayload(_))));
    }

    #[tokio::test]
    async fn test_queue_runs_and_waiters_wake() {
        let queue = OperationQueue::new(2);
        let ops: Vec<_> = (0..5)
            .map(|_| Arc::new(TestOperation { delay: Duration::from_millis(10), ..TestOperation::new() }))
            .collect();

        for op in &ops {
            queue.enqueue(Arc::clone(op));
        }
        for op in &ops {
            assert!(op.status().finished().await.is_none());
        }
        queue.wait_idle().await;
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_queue_cancel_while_waiting() {
        let queue = OperationQueue::new(1);
        let blocker = Arc::new(TestOperation { delay: Duration::from_millis(200), ..TestOperation::new() });
        let waiting = Arc::new(TestOperation::new());

        queue.enqueue(Arc::clone(&blocker));
        queue.enqueue(Arc::clone(&waiting));
        waiting.cancel();

        let error = waiting.status().finished().await;
        assert!(matches!(error.as_deref(), Some(OfflineError::Cancelled)));
        assert_eq!(waiting.runs.load(Ordering::SeqCst), 0);
        assert!(blocker.status().finished().await.is_none());
    }

    #[tokio::test]
    async fn test_queue_survives_panics() {
        let queue = OperationQueue::new(1);
        let op = Arc::new(TestOperation { panic: true, ..TestOperation::new() });

        queue.enqueue(Arc::clone(&op));

        let error = op.status().finished().await;
        assert!(matches!(error.as_deref(), Some(OfflineError::InternalError(_))));
    }
}
