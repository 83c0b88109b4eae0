//! Utilities.

use std::future::Future;

use tokio_util::{sync::CancellationToken, task::TaskTracker};

/// Stops and waits for a group of background tasks.
///
/// [`Closer::close`] cancels the stop token every task watches, then waits
/// until all tasks spawned through the closer have finished.
#[derive(Debug, Clone, Default)]
pub struct Closer {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl Closer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a task that runs until `fut` completes or the closer is closed.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = fut => {}
            }
        });
    }

    /// Signal every task to stop and wait for all of them.
    pub async fn close(&self) {
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}
