use std::{future::Future, panic};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The task currently serving one key.
pub(super) struct Slot {
    join_handle: JoinHandle<()>,
    token: CancellationToken,
}

impl Slot {
    /// Spawns the task built by `task`. It starts only after `prev`, the
    /// task previously serving the same key, has been cancelled and has
    /// returned.
    pub(super) fn spawn<F>(prev: Option<Slot>, task: impl FnOnce(CancellationToken) -> F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let fut = task(token.clone());

        let join_handle = tokio::spawn({
            let token = token.clone();
            async move {
                if let Some(prev) = prev {
                    prev.cancel().await;
                }

                if token.is_cancelled() {
                    return;
                }

                fut.await;
            }
        });
        Self { join_handle, token }
    }

    pub(super) fn is_finished(&self) -> bool {
        self.join_handle.is_finished()
    }

    pub(super) async fn cancel(self) {
        self.token.cancel();
        self.join().await;
    }

    /// Waits for the task to return by itself.
    pub(super) async fn join(self) {
        if let Err(err) = self.join_handle.await {
            if let Ok(panic) = err.try_into_panic() {
                panic::resume_unwind(panic)
            }
        }
    }
}
