use super::cancel::CancellationSignal;
use super::consumer::{ConsumerReport, ConsumerState};
use super::executor::CommandExecutor;
use super::service::QueueService;
use crate::core::{QueueError, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};

/// Background task running a queue's consumer loop.
pub struct QueueWorker {
    cancel: CancellationSignal,
    state: watch::Receiver<ConsumerState>,
    join_handle: Option<JoinHandle<Result<ConsumerReport>>>,
}

impl QueueWorker {
    pub fn cancellation(&self) -> &CancellationSignal {
        &self.cancel
    }

    /// What the consumer loop is doing right now.
    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.join_handle
            .as_ref()
            .map(|handle| handle.is_finished())
            .unwrap_or(true)
    }

    /// Signals the loop to stop and waits for the current job to finish.
    pub async fn stop(mut self) -> Result<ConsumerReport> {
        self.cancel.cancel();
        match self.join_handle.take() {
            Some(join_handle) => join_handle.await.map_err(join_failure)?,
            None => Ok(ConsumerReport::default()),
        }
    }
}

impl Drop for QueueWorker {
    fn drop(&mut self) {
        // Never aborted: a job in flight is allowed to finish.
        self.cancel.cancel();
    }
}

fn join_failure(err: JoinError) -> QueueError {
    if err.is_panic() {
        QueueError::Worker(format!("consumer task panicked: {}", err))
    } else {
        QueueError::Worker(format!("consumer task aborted: {}", err))
    }
}

/// Spawns `service.start_processing` on the tokio runtime.
pub fn spawn_queue_worker<E>(service: Arc<QueueService>, executor: E) -> QueueWorker
where
    E: CommandExecutor + 'static,
{
    let cancel = CancellationSignal::new();
    let cancel_for_worker = cancel.clone();

    let consumer = service.consumer(executor);
    let state = consumer.state_watch();
    let join_handle = tokio::spawn(async move {
        service
            .run_consumer(consumer, &cancel_for_worker)
            .await
    });

    QueueWorker {
        cancel,
        state,
        join_handle: Some(join_handle),
    }
}
