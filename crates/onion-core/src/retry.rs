//! Retry Guard
//!
//! Holds at most one deferred action. Arming cancels whatever was pending;
//! the action fires once.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Single cancellable one-shot timer
#[derive(Debug, Default)]
pub struct RetryGuard {
    pending: Option<JoinHandle<()>>,
}

impl RetryGuard {
    pub fn new() -> Self {
        Self { pending: None }
    }

    /// Run `action` after `delay`, replacing any pending action
    pub fn arm<F>(&mut self, delay: Duration, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.cancel();

        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            action.await;
        }));
    }

    /// Drop the pending action, if any
    pub fn cancel(&mut self) {
        if let Some(pending) = self.pending.take() {
            if !pending.is_finished() {
                debug!("Retry guard cancelled");
            }
            pending.abort();
        }
    }

    /// Is an action waiting to fire?
    pub fn is_armed(&self) -> bool {
        self.pending.as_ref().is_some_and(|p| !p.is_finished())
    }
}

impl Drop for RetryGuard {
    fn drop(&mut self) {
        self.cancel();
    }
}
