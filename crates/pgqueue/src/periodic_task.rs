use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;

/// Callback invoked on every tick of a [`PeriodicTask`].
pub type PeriodicCallback =
    Arc<dyn Fn() -> BoxFuture<'static, Result<(), TransportError>> + Send + Sync>;

/// A named background task that runs a callback at a fixed interval until
/// stopped.
///
/// The first run happens one interval after [`start`](Self::start). A failing
/// callback is logged and the loop carries on. Stopping or dropping the task
/// cancels it, abandoning a callback that is still running.
pub struct PeriodicTask {
    name: String,
    interval: Duration,
    callback: PeriodicCallback,
    running: Mutex<Option<Running>>,
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    pub fn new(
        name: impl Into<String>,
        interval: Duration,
        callback: impl Fn() -> BoxFuture<'static, Result<(), TransportError>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            interval,
            callback: Arc::new(callback),
            running: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
    }

    /// Spawn the loop on the current tokio runtime. No-op if already running.
    pub fn start(&self) {
        let mut running = self.running.lock();
        if running.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let name = self.name.clone();
        let interval = self.interval;
        let callback = Arc::clone(&self.callback);
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        tokio::select! {
                            biased;
                            _ = token.cancelled() => break,
                            result = callback() => {
                                if let Err(e) = result {
                                    tracing::warn!(task = %name, error = %e, "periodic task failed");
                                }
                            }
                        }
                    }
                }
            }
            tracing::debug!(task = %name, "periodic task stopped");
        });

        *running = Some(Running { cancel, handle });
    }

    /// Cancel the loop and wait for it to finish. No-op if not running.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        running.cancel.cancel();
        if let Err(e) = running.handle.await {
            if e.is_panic() {
                tracing::warn!(task = %self.name, "periodic task panicked");
            }
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.cancel.cancel();
        }
    }
}
