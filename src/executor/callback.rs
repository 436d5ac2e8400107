//! Completion-callback adapter over the executor.
//!
//! Some embedders want fire-and-forget semantics: start an operation, get
//! a handle that can cancel it, and receive the outcome through a callback
//! instead of awaiting a future. This adapter keeps that surface isolated
//! from the core loop: it spawns `execute` on the runtime, hands the
//! outcome to the callback exactly once, and exposes cancellation through
//! a child token so cancelling one operation never affects its siblings.

use std::sync::Arc;

use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use super::command::{Command, RequestSpec};
use super::context::OperationContext;
use super::engine::Executor;
use super::error::StorageError;
use super::retry::RetryPolicy;

/// Handle to one callback-driven operation.
///
/// Dropping the handle does not cancel the operation; call
/// [`cancel`](Self::cancel) for that.
#[derive(Debug)]
pub struct CancellableHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl CancellableHandle {
    /// Requests cooperative cancellation of the operation.
    ///
    /// The callback still fires, with [`StorageError::Cancelled`], once the
    /// loop observes the token.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether the operation (and its callback) has completed.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Waits for the operation and its callback to finish.
    ///
    /// # Errors
    ///
    /// Returns the join error when the spawned task panicked or was
    /// aborted.
    pub async fn join(self) -> Result<(), JoinError> {
        self.join.await
    }
}

/// Starts `command` in the background and delivers the outcome to
/// `callback`.
///
/// The operation runs under a child of `parent`, so cancelling the parent
/// token cancels this operation along with everything else scoped to it,
/// while [`CancellableHandle::cancel`] reaches only this one.
pub fn execute_with_callback<S, F>(
    executor: Arc<Executor>,
    command: Command<'static, S>,
    policy: Box<dyn RetryPolicy>,
    context: Arc<OperationContext>,
    parent: &CancellationToken,
    callback: F,
) -> CancellableHandle
where
    S: RequestSpec + 'static,
    F: FnOnce(Result<S::Output, StorageError>) + Send + 'static,
{
    let token = parent.child_token();
    let task_token = token.clone();
    let join = tokio::spawn(async move {
        let result = executor
            .execute(command, policy.as_ref(), context.as_ref(), &task_token)
            .await;
        callback(result);
    });
    CancellableHandle { token, join }
}
