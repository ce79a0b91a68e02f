use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Handle to control and join a background loop. Dropping it cancels the loop.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    token: CancellationToken,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub(crate) fn new(name: impl Into<String>, token: CancellationToken, join: JoinHandle<()>) -> Self {
        Self {
            name: name.into(),
            token,
            join: Some(join),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Request shutdown, wait up to `grace` for in-flight work, then abort.
    ///
    /// Returns `true` when the loop stopped on its own within the grace period.
    pub async fn shutdown(mut self, grace: Duration) -> bool {
        self.token.cancel();
        let Some(mut join) = self.join.take() else {
            return true;
        };

        match tokio::time::timeout(grace, &mut join).await {
            Ok(_) => true,
            Err(_) => {
                warn!(worker = %self.name, "worker did not stop within grace period, aborting");
                join.abort();
                let _ = join.await;
                false
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Shut down every handle concurrently under one shared grace period.
pub async fn shutdown_all(handles: Vec<WorkerHandle>, grace: Duration) -> usize {
    let mut set = tokio::task::JoinSet::new();
    for handle in handles {
        set.spawn(handle.shutdown(grace));
    }

    let mut aborted = 0;
    while let Some(done) = set.join_next().await {
        if !matches!(done, Ok(true)) {
            aborted += 1;
        }
    }
    aborted
}
