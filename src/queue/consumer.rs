//! Tailing consumer: the single loop that drains a queue collection.

use super::cancel::CancellationSignal;
use super::executor::CommandExecutor;
use crate::codec::TypeRegistry;
use crate::core::{AppContext, QueueError, Result};
use crate::storage::{
    CappedCollection, CollectionSpec, JobRecord, LogDatabase, Position, START_POSITION, TailCursor,
};
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{Instrument, Level, event, info_span};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    WaitingForRecord,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

/// Counters collected over one run of the loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerReport {
    /// Records handed to the executor.
    pub executed: u64,
    pub completed: u64,
    pub failed: u64,
    /// Records already complete or failed when they were read.
    pub skipped: u64,
    /// Executions that ended in cancellation and stay pending.
    pub abandoned: u64,
    pub store_errors: u64,
    pub last_position: Position,
}

enum Outcome {
    Completed,
    Failed(String),
    Abandoned,
}

pub struct TailingConsumer<E> {
    database: Arc<LogDatabase>,
    collection_name: String,
    spec: CollectionSpec,
    registry: Arc<TypeRegistry>,
    executor: E,
    poll_interval: Duration,
    max_backoff: Duration,
    state: watch::Sender<ConsumerState>,
    report: ConsumerReport,
}

impl<E: CommandExecutor> TailingConsumer<E> {
    pub fn new(
        database: Arc<LogDatabase>,
        collection_name: impl Into<String>,
        spec: CollectionSpec,
        registry: Arc<TypeRegistry>,
        executor: E,
    ) -> Self {
        Self {
            database,
            collection_name: collection_name.into(),
            spec,
            registry,
            executor,
            poll_interval: super::config::DEFAULT_POLL_INTERVAL,
            max_backoff: super::config::DEFAULT_MAX_BACKOFF,
            state: watch::channel(ConsumerState::Idle).0,
            report: ConsumerReport::default(),
        }
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Follows the loop's state after [`run`](Self::run) has taken ownership.
    pub fn state_watch(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ConsumerState) {
        self.state.send_replace(state);
    }

    /// Runs until `cancel` fires, then returns what was processed.
    ///
    /// Reading starts from the beginning of the collection every time; jobs
    /// that are already complete or failed are skipped, so a restart never
    /// runs them twice.
    pub async fn run(mut self, cancel: &CancellationSignal) -> Result<ConsumerReport> {
        let mut collection = self
            .database
            .ensure_collection(&self.collection_name, &self.spec)
            .await?;
        let mut cursor = collection.tail_from(START_POSITION);
        let mut backoff = self.poll_interval;

        event!(
            Level::INFO,
            collection = %self.collection_name,
            commands = self.registry.len(),
            "queue consumer started"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }
            self.set_state(ConsumerState::WaitingForRecord);

            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = cursor.next(self.poll_interval) => next,
            };

            match next {
                Ok(Some(record)) => {
                    backoff = self.poll_interval;
                    self.report.last_position = record.position;
                    self.process(&collection, record, cancel).await;
                }
                Ok(None) => {
                    backoff = self.poll_interval;
                }
                Err(err) => {
                    self.report.store_errors += 1;
                    event!(
                        Level::ERROR,
                        collection = %self.collection_name,
                        error = %err,
                        retry_in_ms = backoff.as_millis() as u64,
                        "queue store unavailable"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(self.max_backoff);

                    if let Some(reopened) = self.reopen(&collection, &cursor).await {
                        (collection, cursor) = reopened;
                    }
                }
            }
        }

        self.set_state(ConsumerState::Cancelled);
        event!(
            Level::INFO,
            collection = %self.collection_name,
            executed = self.report.executed,
            failed = self.report.failed,
            "queue consumer stopped"
        );
        Ok(self.report)
    }

    /// Reacquires the collection after a store error. A collection that was
    /// recreated is read again from its start.
    async fn reopen(
        &self,
        current: &Arc<CappedCollection>,
        cursor: &TailCursor,
    ) -> Option<(Arc<CappedCollection>, TailCursor)> {
        if !current.is_dropped() {
            return None;
        }
        match self
            .database
            .ensure_collection(&self.collection_name, &self.spec)
            .await
        {
            Ok(collection) => {
                let from = if Arc::ptr_eq(&collection, current) {
                    cursor.position()
                } else {
                    START_POSITION
                };
                let cursor = collection.tail_from(from);
                Some((collection, cursor))
            }
            Err(err) => {
                event!(Level::DEBUG, collection = %self.collection_name, error = %err, "reopen failed");
                None
            }
        }
    }

    async fn process(
        &mut self,
        collection: &CappedCollection,
        record: JobRecord,
        cancel: &CancellationSignal,
    ) {
        self.set_state(ConsumerState::Processing);
        if record.status.is_resolved() {
            self.report.skipped += 1;
            return;
        }

        let position = record.position;
        let span = info_span!(
            "queue.job",
            collection = %self.collection_name,
            position,
            command = %record.name
        );

        self.report.executed += 1;
        let outcome = self.execute(&record).instrument(span.clone()).await;

        let error = match outcome {
            Outcome::Completed => {
                self.set_state(ConsumerState::Completed);
                self.report.completed += 1;
                event!(parent: &span, Level::DEBUG, "job completed");
                None
            }
            Outcome::Failed(message) => {
                self.set_state(ConsumerState::Failed);
                self.report.failed += 1;
                event!(parent: &span, Level::WARN, error = %message, "job failed");
                Some(message)
            }
            Outcome::Abandoned => {
                self.report.abandoned += 1;
                event!(parent: &span, Level::INFO, "job execution cancelled, left pending");
                return;
            }
        };

        let error = error.as_deref();
        let written = retry_with_backoff(
            cancel,
            self.poll_interval,
            self.max_backoff,
            &mut self.report.store_errors,
            move || async move {
                // A dropped collection took the record with it.
                if collection.is_dropped() {
                    return Ok(false);
                }
                collection
                    .update_in_place(position, |status| match error {
                        Some(message) => status.set_error(message),
                        None => status.mark_complete(),
                    })
                    .await
            },
        )
        .instrument(span.clone())
        .await;

        match written {
            Some(true) => {}
            Some(false) => {
                event!(parent: &span, Level::DEBUG, "record gone before its status was written");
            }
            None => {
                // Runs again after the next restart.
                event!(parent: &span, Level::WARN, "job status not written, left pending");
            }
        }
    }

    async fn execute(&self, record: &JobRecord) -> Outcome {
        let context = match AppContext::from_blob(&record.context) {
            Ok(context) => context,
            Err(err) => return Outcome::Failed(format!("Invalid execution context: {}", err)),
        };
        let command = match self.registry.decode(&record.name, &record.command) {
            Ok(command) => command,
            Err(err) => return Outcome::Failed(err.to_string()),
        };

        let result = AssertUnwindSafe(self.executor.execute(command, context))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(())) => Outcome::Completed,
            Ok(Err(err)) => match err.downcast_ref::<QueueError>() {
                Some(QueueError::Cancelled) => Outcome::Abandoned,
                _ => Outcome::Failed(format!("{:#}", err)),
            },
            Err(panic) => Outcome::Failed(format!("Handler panicked: {}", panic_message(&*panic))),
        }
    }
}

/// Retries `op` while the store is unavailable, sleeping `initial` and then
/// doubling up to `max` between attempts. Each failure bumps `errors`.
///
/// Returns `None` if `cancel` fires during a wait or the error is not a
/// store outage.
pub(crate) async fn retry_with_backoff<T, F, Fut>(
    cancel: &CancellationSignal,
    initial: Duration,
    max: Duration,
    errors: &mut u64,
    mut op: F,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = initial;
    loop {
        let err = match op().await {
            Ok(value) => return Some(value),
            Err(err) => err,
        };
        *errors += 1;
        if !err.is_store_unavailable() {
            event!(Level::ERROR, error = %err, "store write failed");
            return None;
        }
        event!(
            Level::ERROR,
            error = %err,
            retry_in_ms = backoff.as_millis() as u64,
            "store write failed, retrying"
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            _ = sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(max);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    #[tokio::test]
    async fn test_retry_succeeds_after_outage() {
        let cancel = CancellationSignal::new();
        let attempts = AtomicU32::new(0);
        let counter = &attempts;
        let mut errors = 0;

        let result = retry_with_backoff(
            &cancel,
            Duration::from_millis(5),
            Duration::from_millis(20),
            &mut errors,
            move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(QueueError::StoreUnavailable("disk gone".to_string()))
                } else {
                    Ok(7)
                }
            },
        )
        .await;

        assert_eq!(result, Some(7));
        assert_eq!(errors, 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_when_cancelled_during_backoff() {
        let cancel = CancellationSignal::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let mut errors = 0;
        let result: Option<()> = retry_with_backoff(
            &cancel,
            Duration::from_secs(30),
            Duration::from_secs(60),
            &mut errors,
            || async { Err(QueueError::StoreUnavailable("disk gone".to_string())) },
        )
        .await;

        assert_eq!(result, None);
        assert_eq!(errors, 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_retry_gives_up_on_non_store_error() {
        let cancel = CancellationSignal::new();
        let mut errors = 0;
        let result: Option<()> = retry_with_backoff(
            &cancel,
            Duration::from_millis(5),
            Duration::from_millis(5),
            &mut errors,
            || async { Err(QueueError::Serialization("bad status".to_string())) },
        )
        .await;
        assert_eq!(result, None);
        assert_eq!(errors, 1);
    }
}
