use crate::core::{QueueError, Result};
use crate::storage::{
    CollectionOptions, CollectionSpec, DEFAULT_ERROR_CAPACITY, DurabilityMode, Endpoint,
    LogDatabase, StoreOptions,
};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_COLLECTION_NAME: &str = "Queue";
pub const DEFAULT_CONNECTION_STRING: &str = "file://./cmdqueue-data";
pub const DEFAULT_MAX_SIZE_BYTES: usize = 2_000_000;
pub const DEFAULT_MAX_DOCUMENTS: usize = 2_000;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);
pub const DEFAULT_CHECKPOINT_THRESHOLD: usize = 1000;

/// Smallest byte bound that still fits the seed record next to a real job.
pub const MIN_SIZE_BYTES: usize = 1024;

const MACHINE_TOKEN: &str = "_MACHINE";

/// Queue configuration
///
/// Zero or empty values mean "use the default"; [`QueueSettings::validate`]
/// fills them in and checks that the storage endpoint is reachable.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Name of the capped collection holding the jobs
    pub collection_name: String,

    /// Storage endpoint, `file://<dir>` or `memory://<name>`
    pub connection_string: String,

    /// Total byte bound of the collection
    pub max_size_bytes: usize,

    /// Record count bound of the collection
    pub max_documents: usize,

    /// Drop and recreate the collection when processing starts
    pub reset_collection: bool,

    /// Longest single wait for a new record
    pub poll_interval: Duration,

    /// Ceiling for the retry delay while the store is unavailable
    pub max_backoff: Duration,

    /// Byte budget of each record's error field
    pub error_capacity: usize,

    pub durability: DurabilityMode,

    /// WAL entries written before a snapshot compacts them
    pub checkpoint_threshold: usize,
}

impl QueueSettings {
    pub fn new() -> Self {
        Self {
            collection_name: DEFAULT_COLLECTION_NAME.to_string(),
            connection_string: DEFAULT_CONNECTION_STRING.to_string(),
            max_size_bytes: DEFAULT_MAX_SIZE_BYTES,
            max_documents: DEFAULT_MAX_DOCUMENTS,
            reset_collection: false,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_backoff: DEFAULT_MAX_BACKOFF,
            error_capacity: DEFAULT_ERROR_CAPACITY,
            durability: DurabilityMode::default(),
            checkpoint_threshold: DEFAULT_CHECKPOINT_THRESHOLD,
        }
    }

    pub fn collection_name(mut self, name: &str) -> Self {
        self.collection_name = name.to_string();
        self
    }

    pub fn connection_string(mut self, url: &str) -> Self {
        self.connection_string = url.to_string();
        self
    }

    pub fn max_size_bytes(mut self, bytes: usize) -> Self {
        self.max_size_bytes = bytes;
        self
    }

    pub fn max_documents(mut self, count: usize) -> Self {
        self.max_documents = count;
        self
    }

    pub fn reset_collection(mut self, reset: bool) -> Self {
        self.reset_collection = reset;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }

    pub fn error_capacity(mut self, bytes: usize) -> Self {
        self.error_capacity = bytes;
        self
    }

    pub fn durability(mut self, mode: DurabilityMode) -> Self {
        self.durability = mode;
        self
    }

    pub fn checkpoint_threshold(mut self, entries: usize) -> Self {
        self.checkpoint_threshold = entries;
        self
    }

    /// Applies defaults, expands `_MACHINE` in the collection name and
    /// checks that the endpoint is writable. Any problem is a [`QueueError::ConfigurationError`].
    pub fn validate(mut self) -> Result<Self> {
        self.apply_defaults();

        if self.collection_name.contains(MACHINE_TOKEN) {
            self.collection_name = self
                .collection_name
                .replace(MACHINE_TOKEN, &format!("_{}", machine_name()));
        }
        if self.collection_name.contains(['/', '\\']) || self.collection_name.contains("..") {
            return Err(QueueError::ConfigurationError(format!(
                "Invalid collection name '{}'",
                self.collection_name
            )));
        }
        if self.max_size_bytes < MIN_SIZE_BYTES {
            return Err(QueueError::ConfigurationError(format!(
                "max_size_bytes must be at least {}, got {}",
                MIN_SIZE_BYTES, self.max_size_bytes
            )));
        }
        if self.max_backoff < self.poll_interval {
            self.max_backoff = self.poll_interval;
        }

        self.open_database()?;
        Ok(self)
    }

    fn apply_defaults(&mut self) {
        if self.collection_name.trim().is_empty() {
            self.collection_name = DEFAULT_COLLECTION_NAME.to_string();
        }
        if self.connection_string.trim().is_empty() {
            self.connection_string = DEFAULT_CONNECTION_STRING.to_string();
        }
        if self.max_size_bytes == 0 {
            self.max_size_bytes = DEFAULT_MAX_SIZE_BYTES;
        }
        if self.max_documents == 0 {
            self.max_documents = DEFAULT_MAX_DOCUMENTS;
        }
        if self.poll_interval.is_zero() {
            self.poll_interval = DEFAULT_POLL_INTERVAL;
        }
        if self.max_backoff.is_zero() {
            self.max_backoff = DEFAULT_MAX_BACKOFF;
        }
        if self.error_capacity == 0 {
            self.error_capacity = DEFAULT_ERROR_CAPACITY;
        }
        if self.checkpoint_threshold == 0 {
            self.checkpoint_threshold = DEFAULT_CHECKPOINT_THRESHOLD;
        }
    }

    pub fn endpoint(&self) -> Result<Endpoint> {
        Endpoint::parse(&self.connection_string)
    }

    pub fn collection_spec(&self) -> CollectionSpec {
        CollectionSpec {
            options: CollectionOptions {
                max_size_bytes: self.max_size_bytes,
                max_documents: self.max_documents,
            },
            error_capacity: self.error_capacity,
        }
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            durability: self.durability,
            checkpoint_threshold: self.checkpoint_threshold,
        }
    }

    /// Opens the configured endpoint; an unreachable store is a configuration error here.
    pub(crate) fn open_database(&self) -> Result<Arc<LogDatabase>> {
        let endpoint = self.endpoint()?;
        LogDatabase::open(&endpoint, self.store_options()).map_err(|err| match err {
            QueueError::StoreUnavailable(msg) => QueueError::ConfigurationError(msg),
            other => other,
        })
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self::new()
    }
}

fn machine_name() -> String {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .map(|name| name.trim().to_string())
        .find(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn memory(name: &str) -> QueueSettings {
        QueueSettings::new().connection_string(&format!("memory://{}", name))
    }

    #[test]
    fn test_default_settings() {
        let settings = QueueSettings::default();
        assert_eq!(settings.collection_name, "Queue");
        assert_eq!(settings.max_size_bytes, 2_000_000);
        assert_eq!(settings.max_documents, 2_000);
        assert!(!settings.reset_collection);
    }

    #[test]
    fn test_zero_values_fall_back_to_defaults() {
        let settings = memory("config-defaults")
            .collection_name("  ")
            .max_size_bytes(0)
            .max_documents(0)
            .error_capacity(0)
            .poll_interval(Duration::ZERO)
            .validate()
            .unwrap();

        assert_eq!(settings.collection_name, DEFAULT_COLLECTION_NAME);
        assert_eq!(settings.max_size_bytes, DEFAULT_MAX_SIZE_BYTES);
        assert_eq!(settings.max_documents, DEFAULT_MAX_DOCUMENTS);
        assert_eq!(settings.error_capacity, DEFAULT_ERROR_CAPACITY);
        assert_eq!(settings.poll_interval, DEFAULT_POLL_INTERVAL);
    }

    #[test]
    fn test_machine_token_is_expanded() {
        let settings = memory("config-machine")
            .collection_name("Jobs_MACHINE")
            .validate()
            .unwrap();
        assert!(settings.collection_name.starts_with("Jobs_"));
        assert!(!settings.collection_name.contains(MACHINE_TOKEN));
    }

    #[test]
    fn test_invalid_settings_fail_fast() {
        let bad_scheme = QueueSettings::new().connection_string("mongodb://127.0.0.1/test");
        assert!(matches!(bad_scheme.validate(), Err(QueueError::ConfigurationError(_))));

        let too_small = memory("config-small").max_size_bytes(100);
        assert!(matches!(too_small.validate(), Err(QueueError::ConfigurationError(_))));

        let bad_name = memory("config-name").collection_name("../escape");
        assert!(matches!(bad_name.validate(), Err(QueueError::ConfigurationError(_))));
    }

    #[test]
    fn test_unwritable_directory_is_configuration_error() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("not-a-dir");
        std::fs::write(&file, b"x").unwrap();

        let settings = QueueSettings::new()
            .connection_string(&format!("file://{}", file.join("queue").display()));
        assert!(matches!(settings.validate(), Err(QueueError::ConfigurationError(_))));
    }

    #[test]
    fn test_backoff_never_below_poll_interval() {
        let settings = memory("config-backoff")
            .poll_interval(Duration::from_secs(5))
            .max_backoff(Duration::from_secs(1))
            .validate()
            .unwrap();
        assert_eq!(settings.max_backoff, Duration::from_secs(5));
    }
}
