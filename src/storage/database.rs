//! Storage endpoints and the named capped collections they hold.

use crate::core::{QueueError, Result};
use crate::storage::capped::{CappedCollection, CollectionOptions, SEED_RECORD_NAME};
use crate::storage::persistence::{DurabilityMode, LogPersistence};
use crate::storage::record::JobRecord;
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::{Level, event};

const FILE_SCHEME: &str = "file://";
const MEMORY_SCHEME: &str = "memory://";

// ============================================================================
// Endpoint
// ============================================================================

/// Where a queue's collections live.
///
/// Format: `file://<directory>` for a durable on-disk store or
/// `memory://<name>` for a process-local one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Directory(PathBuf),
    Memory(String),
}

impl Endpoint {
    pub fn parse(url: &str) -> Result<Self> {
        let url = url.trim();
        if let Some(path) = url.strip_prefix(FILE_SCHEME) {
            if path.is_empty() {
                return Err(QueueError::ConfigurationError(
                    "file:// endpoint requires a directory".to_string(),
                ));
            }
            return Ok(Self::Directory(PathBuf::from(path)));
        }
        if let Some(name) = url.strip_prefix(MEMORY_SCHEME) {
            let name = if name.is_empty() { "default" } else { name };
            return Ok(Self::Memory(name.to_string()));
        }
        Err(QueueError::ConfigurationError(format!(
            "Unsupported connection string '{}': expected {}<dir> or {}<name>",
            url, FILE_SCHEME, MEMORY_SCHEME
        )))
    }

    pub fn to_url(&self) -> String {
        match self {
            Self::Directory(path) => format!("{}{}", FILE_SCHEME, path.display()),
            Self::Memory(name) => format!("{}{}", MEMORY_SCHEME, name),
        }
    }

    pub fn is_durable(&self) -> bool {
        matches!(self, Self::Directory(_))
    }
}

impl FromStr for Endpoint {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_url())
    }
}

// ============================================================================
// Collection spec
// ============================================================================

/// How to create a collection that does not exist yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionSpec {
    pub options: CollectionOptions,
    pub error_capacity: usize,
}

/// Durability settings shared by every collection of one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    pub durability: DurabilityMode,
    pub checkpoint_threshold: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            durability: DurabilityMode::default(),
            checkpoint_threshold: 1000,
        }
    }
}

// ============================================================================
// Log database
// ============================================================================

lazy_static! {
    /// Endpoints opened by this process. Every producer and consumer pointing
    /// at the same endpoint shares one instance, and with it the append
    /// notifications tailing cursors wait on.
    static ref OPEN_DATABASES: Mutex<HashMap<Endpoint, Arc<LogDatabase>>> = Mutex::new(HashMap::new());
}

pub struct LogDatabase {
    endpoint: Endpoint,
    store: StoreOptions,
    collections: RwLock<HashMap<String, Arc<CappedCollection>>>,
}

impl LogDatabase {
    /// Opens `endpoint`, or returns the instance this process already opened.
    ///
    /// The store options of the first opener win.
    pub fn open(endpoint: &Endpoint, store: StoreOptions) -> Result<Arc<Self>> {
        let mut open = OPEN_DATABASES.lock()?;
        if let Some(existing) = open.get(endpoint) {
            return Ok(Arc::clone(existing));
        }

        let database = Arc::new(Self {
            endpoint: endpoint.clone(),
            store,
            collections: RwLock::new(HashMap::new()),
        });
        database.verify_writable()?;
        open.insert(endpoint.clone(), Arc::clone(&database));
        event!(Level::DEBUG, endpoint = %endpoint, "log database opened");
        Ok(database)
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Checks that the endpoint can be written to.
    pub fn verify_writable(&self) -> Result<()> {
        if let Endpoint::Directory(root) = &self.endpoint {
            fs::create_dir_all(root).map_err(|e| {
                QueueError::StoreUnavailable(format!("Cannot create '{}': {}", root.display(), e))
            })?;
            tempfile::tempfile_in(root).map_err(|e| {
                QueueError::StoreUnavailable(format!("Cannot write to '{}': {}", root.display(), e))
            })?;
        }
        Ok(())
    }

    fn collection_dir(&self, name: &str) -> Option<PathBuf> {
        match &self.endpoint {
            Endpoint::Directory(root) => Some(root.join(name)),
            Endpoint::Memory(_) => None,
        }
    }

    fn open_persistence(&self, dir: &Path) -> Result<LogPersistence> {
        let mut persistence = LogPersistence::open(dir, self.store.durability)?;
        persistence
            .wal_mut()
            .set_checkpoint_threshold(self.store.checkpoint_threshold);
        Ok(persistence)
    }

    /// Returns the live collection, loading it from disk on first access.
    async fn load(
        &self,
        collections: &mut HashMap<String, Arc<CappedCollection>>,
        name: &str,
        fallback: CollectionOptions,
    ) -> Result<Option<Arc<CappedCollection>>> {
        if let Some(existing) = collections.get(name) {
            return Ok(Some(Arc::clone(existing)));
        }
        let Some(dir) = self.collection_dir(name) else {
            return Ok(None);
        };
        if !LogPersistence::exists_at(&dir) {
            return Ok(None);
        }

        let persistence = self.open_persistence(&dir)?;
        let recovered = persistence.recover()?;
        let collection = CappedCollection::recover(name, persistence, recovered, fallback)?;
        collections.insert(name.to_string(), Arc::clone(&collection));
        Ok(Some(collection))
    }

    pub async fn collection_exists(&self, name: &str) -> bool {
        if self.collections.read().await.contains_key(name) {
            return true;
        }
        self.collection_dir(name)
            .map(|dir| LogPersistence::exists_at(dir))
            .unwrap_or(false)
    }

    pub async fn get_collection(&self, name: &str) -> Result<Option<Arc<CappedCollection>>> {
        let mut collections = self.collections.write().await;
        self.load(&mut collections, name, CollectionOptions::default())
            .await
    }

    /// Creates the collection if it does not exist yet.
    ///
    /// A new collection always starts with a completed seed record, so a
    /// tailing cursor opened on it has a position to start from. Calling
    /// this on an existing collection leaves its capacity unchanged.
    pub async fn ensure_collection(
        &self,
        name: &str,
        spec: &CollectionSpec,
    ) -> Result<Arc<CappedCollection>> {
        let mut collections = self.collections.write().await;
        if let Some(existing) = self.load(&mut collections, name, spec.options).await? {
            if existing.is_empty().await {
                Self::append_seed(&existing, spec.error_capacity).await?;
            }
            return Ok(existing);
        }

        let persistence = match self.collection_dir(name) {
            Some(dir) => Some(self.open_persistence(&dir)?),
            None => None,
        };
        let collection = CappedCollection::create(name, spec.options, persistence)?;
        Self::append_seed(&collection, spec.error_capacity).await?;
        collections.insert(name.to_string(), Arc::clone(&collection));

        event!(
            Level::INFO,
            endpoint = %self.endpoint,
            collection = %name,
            max_documents = spec.options.max_documents,
            max_size_bytes = spec.options.max_size_bytes,
            "collection created"
        );
        Ok(collection)
    }

    async fn append_seed(collection: &CappedCollection, error_capacity: usize) -> Result<()> {
        let mut seed = JobRecord::new(
            SEED_RECORD_NAME,
            serde_json::json!({}),
            serde_json::json!({}),
            error_capacity,
        );
        seed.status.mark_complete();
        collection.append(seed).await?;
        Ok(())
    }

    /// Drops the collection and deletes its files. Returns whether it existed.
    ///
    /// Handles to the old collection fail with `StoreUnavailable` from now on.
    pub async fn drop_collection(&self, name: &str) -> Result<bool> {
        let removed = self.collections.write().await.remove(name);
        let mut existed = false;

        if let Some(collection) = removed {
            existed = true;
            if let Some(persistence) = collection.close().await {
                persistence.destroy()?;
            }
        }
        if let Some(dir) = self.collection_dir(name) {
            if dir.exists() {
                // Taking the lock first keeps us off a directory another process owns.
                existed = true;
                self.open_persistence(&dir)?.destroy()?;
            }
        }

        if existed {
            event!(Level::INFO, endpoint = %self.endpoint, collection = %name, "collection dropped");
        }
        Ok(existed)
    }

    /// Releases the collection's files, and the directory lock with them,
    /// without deleting anything. The next access reloads it from disk.
    ///
    /// Returns whether the collection was loaded.
    pub async fn close_collection(&self, name: &str) -> bool {
        let removed = self.collections.write().await.remove(name);
        match removed {
            Some(collection) => {
                drop(collection.close().await);
                event!(Level::DEBUG, endpoint = %self.endpoint, collection = %name, "collection closed");
                true
            }
            None => false,
        }
    }

    /// Drops and recreates the collection.
    pub async fn reset_collection(
        &self,
        name: &str,
        spec: &CollectionSpec,
    ) -> Result<Arc<CappedCollection>> {
        self.drop_collection(name).await?;
        self.ensure_collection(name, spec).await
    }

    /// Names of the loaded collections plus, for a directory endpoint, every
    /// collection found on disk.
    pub async fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.read().await.keys().cloned().collect();
        if let Endpoint::Directory(root) = &self.endpoint {
            if let Ok(entries) = fs::read_dir(root) {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if !path.is_dir() || !LogPersistence::exists_at(&path) {
                        continue;
                    }
                    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                        if !names.iter().any(|n| n == name) {
                            names.push(name.to_string());
                        }
                    }
                }
            }
        }
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::record::START_POSITION;
    use tempfile::TempDir;

    fn spec(max_documents: usize) -> CollectionSpec {
        CollectionSpec {
            options: CollectionOptions { max_size_bytes: 1_000_000, max_documents },
            error_capacity: 32,
        }
    }

    #[test]
    fn test_parse_endpoints() {
        assert_eq!(
            Endpoint::parse("file:///var/lib/queue").unwrap(),
            Endpoint::Directory(PathBuf::from("/var/lib/queue"))
        );
        assert_eq!(
            Endpoint::parse("memory://jobs").unwrap(),
            Endpoint::Memory("jobs".to_string())
        );
        assert_eq!(Endpoint::parse("memory://").unwrap(), Endpoint::Memory("default".to_string()));
    }

    #[test]
    fn test_parse_rejects_unknown_scheme() {
        assert!(matches!(
            Endpoint::parse("mongodb://127.0.0.1/test"),
            Err(QueueError::ConfigurationError(_))
        ));
        assert!(Endpoint::parse("file://").is_err());
    }

    #[tokio::test]
    async fn test_ensure_creates_seeded_collection_once() {
        let endpoint = Endpoint::Memory("database-ensure-test".to_string());
        let db = LogDatabase::open(&endpoint, StoreOptions::default()).unwrap();

        let first = db.ensure_collection("Queue", &spec(10)).await.unwrap();
        let second = db.ensure_collection("Queue", &spec(99)).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.options().await.max_documents, 10);

        let records = first.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, SEED_RECORD_NAME);
        assert!(records[0].is_complete());
        assert!(first.next_after(START_POSITION).await.is_some());
    }

    #[tokio::test]
    async fn test_same_endpoint_shares_instance() {
        let endpoint = Endpoint::Memory("database-shared-test".to_string());
        let a = LogDatabase::open(&endpoint, StoreOptions::default()).unwrap();
        let b = LogDatabase::open(&endpoint, StoreOptions::default()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_durable_collection_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let store = StoreOptions { durability: DurabilityMode::Sync, checkpoint_threshold: 3 };
        let endpoint = Endpoint::Directory(temp_dir.path().to_path_buf());

        {
            let db = LogDatabase::open(&endpoint, store).unwrap();
            let log = db.ensure_collection("Queue", &spec(4)).await.unwrap();
            for i in 1..=6 {
                let record = JobRecord::new(format!("J{}", i), serde_json::json!({}), serde_json::json!({}), 32);
                let position = log.append(record).await.unwrap();
                if i == 5 {
                    log.update_in_place(position, |s| s.mark_complete()).await.unwrap();
                }
            }
            assert!(db.close_collection("Queue").await);
        }

        // Bypass the per-process cache to force recovery from disk.
        let fresh = LogDatabase {
            endpoint: endpoint.clone(),
            store,
            collections: RwLock::new(HashMap::new()),
        };
        let log = fresh.get_collection("Queue").await.unwrap().unwrap();
        let records = log.records().await;
        let names: Vec<&str> = records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["J3", "J4", "J5", "J6"]);
        assert!(records[2].is_complete());

        let next = log
            .append(JobRecord::new("J7", serde_json::json!({}), serde_json::json!({}), 32))
            .await
            .unwrap();
        assert_eq!(next, records[3].position + 1);
    }

    #[tokio::test]
    async fn test_second_database_on_locked_directory_is_unavailable() {
        let temp_dir = TempDir::new().unwrap();
        let endpoint = Endpoint::Directory(temp_dir.path().to_path_buf());
        assert!(endpoint.is_durable());

        let owner = LogDatabase::open(&endpoint, StoreOptions::default()).unwrap();
        owner.ensure_collection("Queue", &spec(10)).await.unwrap();

        // A second handle on the same directory, as another process would hold.
        let intruder = LogDatabase {
            endpoint: endpoint.clone(),
            store: StoreOptions::default(),
            collections: RwLock::new(HashMap::new()),
        };
        let err = intruder.ensure_collection("Queue", &spec(10)).await.unwrap_err();
        assert!(matches!(err, QueueError::StoreUnavailable(_)));
        assert!(matches!(
            intruder.get_collection("Queue").await,
            Err(QueueError::StoreUnavailable(_))
        ));

        assert!(owner.close_collection("Queue").await);
        let log = intruder.get_collection("Queue").await.unwrap().unwrap();
        assert_eq!(log.records().await.len(), 1);
        assert!(!owner.close_collection("Queue").await);
    }

    #[tokio::test]
    async fn test_collection_names_lists_loaded_and_on_disk() {
        let temp_dir = TempDir::new().unwrap();
        let endpoint = Endpoint::Directory(temp_dir.path().to_path_buf());
        let db = LogDatabase::open(&endpoint, StoreOptions::default()).unwrap();
        db.ensure_collection("Beta", &spec(10)).await.unwrap();
        db.ensure_collection("Alpha", &spec(10)).await.unwrap();
        db.close_collection("Alpha").await;
        fs::create_dir_all(temp_dir.path().join("not-a-collection")).unwrap();

        assert_eq!(db.collection_names().await, vec!["Alpha", "Beta"]);

        let memory = LogDatabase::open(&Endpoint::Memory("database-names-test".to_string()), StoreOptions::default()).unwrap();
        assert!(!memory.endpoint().is_durable());
        memory.ensure_collection("Only", &spec(10)).await.unwrap();
        assert_eq!(memory.collection_names().await, vec!["Only"]);
    }

    #[tokio::test]
    async fn test_drop_collection_removes_files() {
        let temp_dir = TempDir::new().unwrap();
        let endpoint = Endpoint::Directory(temp_dir.path().join("drop"));
        let db = LogDatabase::open(&endpoint, StoreOptions::default()).unwrap();
        db.ensure_collection("Queue", &spec(10)).await.unwrap();
        assert!(db.collection_exists("Queue").await);

        assert!(db.drop_collection("Queue").await.unwrap());
        assert!(!db.collection_exists("Queue").await);
        assert!(!db.drop_collection("Queue").await.unwrap());
    }
}
