use super::cancel::CancellationSignal;
use super::config::QueueSettings;
use super::consumer::{ConsumerReport, TailingConsumer};
use super::executor::CommandExecutor;
use crate::codec::{Command, TypeRegistry};
use crate::core::{AppContext, QueueError, Result};
use crate::storage::{
    CappedCollection, CollectionStats, Endpoint, JobRecord, JobState, LogDatabase, Position,
};
use std::sync::Arc;
use tracing::{Level, event};

/// Durable bounded command queue.
///
/// Producers call [`enqueue`](Self::enqueue) from any task; exactly one task
/// per collection should run [`start_processing`](Self::start_processing).
/// Two consumers on the same collection would both execute every pending job.
/// A `file://` collection is locked to the first process that opens it;
/// other processes get [`QueueError::StoreUnavailable`].
///
/// # Examples
///
/// ```no_run
/// use cmdqueue::{AppContext, CancellationSignal, Noop, QueueService, QueueSettings, TypeRegistry, executor_fn};
///
/// # async fn demo() -> cmdqueue::Result<()> {
/// let settings = QueueSettings::new().connection_string("memory://demo");
/// let queue = QueueService::new(settings, TypeRegistry::new())?;
///
/// queue.enqueue(&Noop {}, &AppContext::system()).await?;
///
/// let cancel = CancellationSignal::new();
/// let report = queue
///     .start_processing(&cancel, executor_fn(|command, _ctx| async move {
///         println!("running {}", command.name());
///         anyhow::Ok(())
///     }))
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct QueueService {
    settings: QueueSettings,
    database: Arc<LogDatabase>,
    registry: Arc<TypeRegistry>,
}

impl QueueService {
    /// Validates `settings` and connects to the configured endpoint.
    pub fn new(settings: QueueSettings, registry: TypeRegistry) -> Result<Self> {
        let settings = settings.validate()?;
        let database = settings.open_database()?;
        Ok(Self {
            settings,
            database,
            registry: Arc::new(registry),
        })
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    /// Adds a command type. A consumer that is already running keeps the
    /// registry it started with.
    pub fn register_command<T: Command>(&mut self) -> bool {
        Arc::make_mut(&mut self.registry).register_command::<T>()
    }

    /// The queue's collection, created on first use.
    pub async fn collection(&self) -> Result<Arc<CappedCollection>> {
        self.database
            .ensure_collection(&self.settings.collection_name, &self.settings.collection_spec())
            .await
            .map_err(into_store_unavailable)
    }

    /// Queues `command` for background execution. Fire-and-forget: the
    /// handler's result never comes back to the caller.
    pub async fn enqueue<T: Command>(&self, command: &T, context: &AppContext) -> Result<()> {
        let (name, payload) = self.registry.encode(command)?;
        self.append(name, payload, context).await?;
        Ok(())
    }

    /// Queues an already serialized command by name and returns its position.
    pub async fn enqueue_payload(
        &self,
        name: &str,
        payload: serde_json::Value,
        context: &AppContext,
    ) -> Result<Position> {
        if !self.registry.contains(name) {
            return Err(QueueError::UnknownCommandType(name.to_string()));
        }
        self.append(name, payload, context).await
    }

    async fn append(
        &self,
        name: &str,
        payload: serde_json::Value,
        context: &AppContext,
    ) -> Result<Position> {
        let collection = self.collection().await?;
        let record = JobRecord::new(name, payload, context.to_blob()?, self.settings.error_capacity);
        let position = collection.append(record).await.map_err(into_store_unavailable)?;
        event!(
            Level::DEBUG,
            collection = %self.settings.collection_name,
            position,
            command = %name,
            "job enqueued"
        );
        Ok(position)
    }

    /// Runs the consumer loop until `cancel` fires.
    ///
    /// Takes a snapshot of the registry, resets the collection first when
    /// `reset_collection` is set, and then tails the collection from its
    /// start, handing every pending job to `executor`.
    pub async fn start_processing<E: CommandExecutor>(
        &self,
        cancel: &CancellationSignal,
        executor: E,
    ) -> Result<ConsumerReport> {
        self.run_consumer(self.consumer(executor), cancel).await
    }

    /// Builds the consumer [`start_processing`](Self::start_processing) would
    /// run, so its state can be watched before it starts.
    pub fn consumer<E: CommandExecutor>(&self, executor: E) -> TailingConsumer<E> {
        TailingConsumer::new(
            Arc::clone(&self.database),
            self.settings.collection_name.clone(),
            self.settings.collection_spec(),
            Arc::clone(&self.registry),
            executor,
        )
        .poll_interval(self.settings.poll_interval)
        .max_backoff(self.settings.max_backoff)
    }

    pub(crate) async fn run_consumer<E: CommandExecutor>(
        &self,
        consumer: TailingConsumer<E>,
        cancel: &CancellationSignal,
    ) -> Result<ConsumerReport> {
        if self.settings.reset_collection {
            let name = &self.settings.collection_name;
            self.database
                .reset_collection(name, &self.settings.collection_spec())
                .await?;
            event!(Level::INFO, collection = %name, "collection reset at startup");
        }
        consumer.run(cancel).await
    }

    /// Drops and recreates the collection. Must not run next to a live consumer.
    pub async fn reset(&self) -> Result<()> {
        self.database
            .reset_collection(&self.settings.collection_name, &self.settings.collection_spec())
            .await?;
        Ok(())
    }

    /// Every record still held by the collection, oldest first.
    pub async fn jobs(&self) -> Result<Vec<JobRecord>> {
        Ok(self.collection().await?.records().await)
    }

    pub async fn jobs_in_state(&self, state: JobState) -> Result<Vec<JobRecord>> {
        Ok(self
            .jobs()
            .await?
            .into_iter()
            .filter(|job| job.state() == state)
            .collect())
    }

    pub async fn job(&self, position: Position) -> Result<Option<JobRecord>> {
        Ok(self.collection().await?.get(position).await)
    }

    pub async fn stats(&self) -> Result<CollectionStats> {
        Ok(self.collection().await?.stats().await)
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.database.endpoint()
    }

    /// Every collection of the endpoint, not only this queue's.
    pub async fn collection_names(&self) -> Vec<String> {
        self.database.collection_names().await
    }

    /// Releases the collection's files and lock without deleting anything.
    /// The next call that needs the collection opens it again.
    pub async fn close(&self) -> bool {
        self.database
            .close_collection(&self.settings.collection_name)
            .await
    }
}

fn into_store_unavailable(err: QueueError) -> QueueError {
    match err {
        QueueError::IoError(msg) | QueueError::LockError(msg) => QueueError::StoreUnavailable(msg),
        other => other,
    }
}
