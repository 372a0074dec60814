//! Receive loops owned by one broker connection.

use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

/// Tracks the receive loops spawned for a connection so close can stop them
/// and wait for the delivery each one is handling.
pub(crate) struct ConsumerTasks {
    stop: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ConsumerTasks {
    pub(crate) fn new() -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            stop,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Resolves once [`ConsumerTasks::drain`] has been called.
    pub(crate) fn stopped(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut stop = self.stop.subscribe();
        async move {
            // A dropped sender also ends the loop.
            let _ = stop.wait_for(|stopped| *stopped).await;
        }
    }

    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Stop every loop and wait up to `timeout` for in-flight deliveries.
    ///
    /// Returns false if the wait timed out.
    pub(crate) async fn drain(&self, timeout: Duration) -> bool {
        self.stop.send_replace(true);
        let handles =
            std::mem::take(&mut *self.handles.lock().unwrap_or_else(PoisonError::into_inner));
        let count = handles.len();

        match tokio::time::timeout(timeout, futures::future::join_all(handles)).await {
            Ok(_) => true,
            Err(_) => {
                warn!(
                    consumers = count,
                    timeout_ms = timeout.as_millis() as u64,
                    "Consumers still busy after drain timeout"
                );
                false
            }
        }
    }
}
