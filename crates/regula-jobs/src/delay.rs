//! Cancellable delayed tasks.
//!
//! A [`DelayedTask`] runs a future once after a delay unless its token is
//! cancelled first. Timing goes through `tokio::time`, so tests drive it with
//! a paused clock.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Handle to a scheduled future.
#[derive(Debug)]
pub struct DelayedTask {
    token: CancellationToken,
    delay: Duration,
}

impl DelayedTask {
    /// Run `fut` after `delay`. Cancelling `parent` also cancels the task.
    pub fn spawn<F>(delay: Duration, parent: &CancellationToken, fut: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = parent.child_token();
        let guard = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = guard.cancelled() => {}
                _ = tokio::time::sleep(delay) => fut.await,
            }
        });
        Self { token, delay }
    }

    /// Stop the task if it has not fired yet.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}
