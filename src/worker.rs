//! Ownership of a background worker task
//!
//! Both the activity tracker and the report uploader run exactly one tokio
//! task each. The task polls a [`CancellationToken`] between iterations;
//! [`WorkerHandle`] keeps the token and the join handle together so the
//! owner can request a stop and wait for it with a bounded timeout.

use std::future::Future;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Default time a worker gets to finish its current iteration on shutdown
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct WorkerHandle {
    name: &'static str,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    shutdown_timeout: Duration,
}

impl WorkerHandle {
    /// Spawn `body` with a fresh cancellation token
    pub fn spawn<F, Fut>(name: &'static str, shutdown_timeout: Duration, body: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(body(cancel.clone()));
        Self {
            name,
            cancel,
            handle,
            shutdown_timeout,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Ask the worker to stop after its current iteration
    ///
    /// Work already in progress (an in-flight upload, say) runs to completion.
    pub fn terminate(&self) {
        if !self.cancel.is_cancelled() {
            info!("{} terminating", self.name);
            self.cancel.cancel();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Terminate and wait for the worker, aborting it if it overruns the
    /// shutdown timeout
    pub async fn shutdown(mut self) -> Result<()> {
        self.terminate();
        match tokio::time::timeout(self.shutdown_timeout, &mut self.handle).await {
            Ok(Ok(())) => {
                info!("{} stopped", self.name);
                Ok(())
            }
            Ok(Err(e)) => Err(anyhow!("{} task failed: {}", self.name, e)),
            Err(_) => {
                warn!(
                    "{} did not stop within {:?}, aborting",
                    self.name, self.shutdown_timeout
                );
                self.handle.abort();
                Err(anyhow!(
                    "{} did not stop within {:?}",
                    self.name,
                    self.shutdown_timeout
                ))
            }
        }
    }
}
