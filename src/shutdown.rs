//! Shutdown coordination for every task a node spawns.
//!
//! All tasks go through [`ShutdownManager::spawn`], which registers them with one
//! `TaskTracker` and races them against one `CancellationToken`. Cancelling the
//! token stops the accept loop, the fan-out task and every connection task.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

#[derive(Clone, Default)]
pub struct ShutdownManager {
    /// Token to signal shutdown to all tasks
    cancel_token: CancellationToken,
    /// Tracks every spawned task so shutdown can wait for them
    tracker: TaskTracker,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Spawn a supervised task. It is dropped at its next suspension point once
    /// shutdown begins.
    pub fn spawn<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.cancel_token.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::trace!("Task {} cancelled", name);
                }
                _ = task => {}
            }
        });
    }

    /// Number of supervised tasks still running
    pub fn task_count(&self) -> usize {
        self.tracker.len()
    }

    /// Cancel every task and wait for them to finish, up to `timeout`.
    pub async fn shutdown(&self, timeout: Duration) {
        self.cancel_token.cancel();
        self.tracker.close();

        match tokio::time::timeout(timeout, self.tracker.wait()).await {
            Ok(()) => {
                tracing::info!("All tasks shut down gracefully");
            }
            Err(_) => {
                tracing::warn!(
                    "Shutdown timeout: {} task(s) did not complete",
                    self.tracker.len()
                );
            }
        }
    }

    /// Wait for ctrl+c or for another part of the process to begin shutdown.
    pub async fn wait_for_signal(&self) {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                match result {
                    Ok(()) => tracing::info!("Shutdown signal received"),
                    Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
                }
            }
            _ = self.cancel_token.cancelled() => {}
        }
    }
}
