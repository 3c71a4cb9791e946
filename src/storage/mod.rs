pub mod capped;
pub mod database;
pub mod persistence;
pub mod record;

pub use capped::{CappedCollection, CollectionOptions, CollectionStats, SEED_RECORD_NAME, TailCursor};
pub use database::{CollectionSpec, Endpoint, LogDatabase, StoreOptions};
pub use persistence::{DurabilityMode, LogPersistence};
pub use record::{
    DEFAULT_ERROR_CAPACITY, ErrorField, JobRecord, JobState, Position, RecordStatus, START_POSITION,
};
