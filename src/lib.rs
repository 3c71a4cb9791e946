// ============================================================================
// cmdqueue Library
// ============================================================================

pub mod codec;
pub mod core;
pub mod queue;
pub mod storage;

// Re-export main types for convenience
pub use crate::codec::{Command, CommandDecoder, DecodedCommand, Noop, TypeRegistry};
pub use crate::core::{AppContext, QueueError, Result};
pub use crate::queue::{
    CancellationSignal, CommandExecutor, ConsumerReport, ConsumerState, FnExecutor, QueueService,
    QueueSettings, QueueWorker, TailingConsumer, executor_fn, spawn_queue_worker,
};
pub use crate::storage::{
    CappedCollection, CollectionOptions, CollectionSpec, CollectionStats, DurabilityMode, Endpoint,
    ErrorField, JobRecord, JobState, LogDatabase, Position, RecordStatus, START_POSITION,
    StoreOptions, TailCursor,
};
