use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Handle to a background worker task and the events it emits.
///
/// Cancelling is idempotent. Dropping the handle cancels the worker.
#[derive(Debug)]
pub struct WorkerHandle<E> {
    events: mpsc::UnboundedReceiver<E>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl<E> WorkerHandle<E> {
    pub(crate) fn new(
        events: mpsc::UnboundedReceiver<E>,
        cancel: CancellationToken,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            events,
            cancel,
            task: Some(task),
        }
    }

    /// Next event, or `None` once the worker has stopped and its queue is drained.
    pub async fn recv(&mut self) -> Option<E> {
        self.events.recv().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait for the worker task to exit.
    pub async fn join(mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if e.is_panic() {
                    tracing::error!(error = %e, "worker task panicked");
                }
            }
        }
    }
}

impl<E> Drop for WorkerHandle<E> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
