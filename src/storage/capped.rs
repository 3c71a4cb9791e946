//! Capped collection: a bounded, insertion-ordered log with FIFO eviction.
//!
//! Every collection keeps its records in position order. Appending past
//! either the document bound or the byte bound evicts the oldest records,
//! whatever their processing state. Records never move and never change
//! size; only their [`RecordStatus`] can be rewritten in place.

use crate::core::{QueueError, Result};
use crate::storage::persistence::{CollectionSnapshot, LogPersistence, RecoveredLog, WalEntry};
use crate::storage::record::{JobRecord, JobState, Position, RecordStatus, START_POSITION};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{RwLock, watch};
use tokio::time::timeout;
use tracing::{Level, event};

/// Name tag of the reserved record every collection starts with.
pub const SEED_RECORD_NAME: &str = "Noop";

/// Capacity bounds fixed when the collection is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionOptions {
    pub max_size_bytes: usize,
    pub max_documents: usize,
}

impl Default for CollectionOptions {
    fn default() -> Self {
        Self {
            max_size_bytes: 2_000_000,
            max_documents: 2_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionStats {
    pub name: String,
    pub record_count: usize,
    pub total_bytes: usize,
    pub max_documents: usize,
    pub max_size_bytes: usize,
    pub pending: usize,
    pub complete: usize,
    pub failed: usize,
    pub first_position: Option<Position>,
    pub last_position: Option<Position>,
    /// Records evicted since the collection was opened in this process.
    pub evicted: u64,
    /// Evicted records that had not been resolved yet.
    pub evicted_pending: u64,
}

struct Slot {
    record: JobRecord,
    size: usize,
}

struct CollectionState {
    options: CollectionOptions,
    slots: VecDeque<Slot>,
    total_bytes: usize,
    next_position: Position,
    persistence: Option<LogPersistence>,
    evicted: u64,
    evicted_pending: u64,
}

impl CollectionState {
    fn new(options: CollectionOptions, persistence: Option<LogPersistence>) -> Self {
        Self {
            options,
            slots: VecDeque::new(),
            total_bytes: 0,
            next_position: START_POSITION + 1,
            persistence,
            evicted: 0,
            evicted_pending: 0,
        }
    }

    /// Index of the first record strictly after `position`.
    fn index_after(&self, position: Position) -> usize {
        self.slots.partition_point(|slot| slot.record.position <= position)
    }

    fn index_of(&self, position: Position) -> Option<usize> {
        self.slots
            .binary_search_by_key(&position, |slot| slot.record.position)
            .ok()
    }

    /// Inserts an already-positioned record and evicts from the front until
    /// both bounds hold again. Returns the evicted records.
    fn push(&mut self, record: JobRecord, size: usize) -> Vec<JobRecord> {
        self.next_position = self.next_position.max(record.position + 1);
        self.total_bytes += size;
        self.slots.push_back(Slot { record, size });

        let mut evicted = Vec::new();
        while self.slots.len() > 1
            && (self.slots.len() > self.options.max_documents
                || self.total_bytes > self.options.max_size_bytes)
        {
            let Some(oldest) = self.slots.pop_front() else {
                break;
            };
            self.total_bytes -= oldest.size;
            self.evicted += 1;
            if !oldest.record.status.is_resolved() {
                self.evicted_pending += 1;
            }
            evicted.push(oldest.record);
        }
        evicted
    }

    fn apply_update(&mut self, position: Position, status: RecordStatus) -> bool {
        match self.index_of(position) {
            Some(idx) => {
                self.slots[idx].record.status = status;
                true
            }
            None => false,
        }
    }

    fn snapshot(&self) -> CollectionSnapshot {
        CollectionSnapshot::new(
            self.options,
            self.next_position,
            self.slots.iter().map(|slot| slot.record.clone()).collect(),
        )
    }

    fn log(&mut self, entry: &WalEntry) -> Result<()> {
        match self.persistence.as_mut() {
            Some(persistence) => persistence.log(entry),
            None => Ok(()),
        }
    }

    fn maybe_checkpoint(&mut self, collection: &str) {
        let needs = self
            .persistence
            .as_ref()
            .map(|p| p.needs_checkpoint())
            .unwrap_or(false);
        if !needs {
            return;
        }
        let snapshot = self.snapshot();
        if let Some(persistence) = self.persistence.as_mut() {
            if let Err(err) = persistence.checkpoint(&snapshot) {
                // Recovery skips WAL appends the snapshot already holds, so a
                // half-finished checkpoint replays cleanly.
                event!(Level::ERROR, collection = %collection, error = %err, "collection checkpoint failed");
            }
        }
    }
}

pub struct CappedCollection {
    name: String,
    state: RwLock<CollectionState>,
    head_tx: watch::Sender<Position>,
    dropped: AtomicBool,
}

impl std::fmt::Debug for CappedCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CappedCollection")
            .field("name", &self.name)
            .field("dropped", &self.dropped)
            .finish_non_exhaustive()
    }
}

impl CappedCollection {
    /// Creates an empty collection and writes its creation to the WAL.
    pub(crate) fn create(
        name: impl Into<String>,
        options: CollectionOptions,
        persistence: Option<LogPersistence>,
    ) -> Result<Arc<Self>> {
        let mut state = CollectionState::new(options, persistence);
        state.log(&WalEntry::Create { options })?;
        Ok(Self::from_state(name.into(), state))
    }

    /// Rebuilds a collection from its snapshot and WAL.
    ///
    /// Appends are replayed through the same eviction logic that produced
    /// them, so the recovered contents match what was live before shutdown.
    /// An append below the snapshot's `next_position` is already in the
    /// snapshot and is skipped.
    pub(crate) fn recover(
        name: impl Into<String>,
        persistence: LogPersistence,
        recovered: RecoveredLog,
        fallback: CollectionOptions,
    ) -> Result<Arc<Self>> {
        let name = name.into();
        let RecoveredLog { snapshot, entries } = recovered;

        let mut state = match snapshot {
            Some(snapshot) => {
                let mut state = CollectionState::new(snapshot.options, None);
                for record in snapshot.records {
                    let size = record.stored_size()?;
                    state.push(record, size);
                }
                state.next_position = state.next_position.max(snapshot.next_position);
                state
            }
            None => CollectionState::new(fallback, None),
        };

        let mut replayed = 0usize;
        let mut skipped = 0usize;
        for entry in entries {
            match entry {
                WalEntry::Create { options } => {
                    state = CollectionState::new(options, None);
                }
                WalEntry::Append { record } => {
                    if record.position < state.next_position {
                        skipped += 1;
                        continue;
                    }
                    let size = record.stored_size()?;
                    state.push(record, size);
                }
                WalEntry::Update { position, status } => {
                    state.apply_update(position, status);
                }
            }
            replayed += 1;
        }
        // Recovery eviction is replay, not new data loss.
        state.evicted = 0;
        state.evicted_pending = 0;
        state.persistence = Some(persistence);

        event!(
            Level::INFO,
            collection = %name,
            records = state.slots.len(),
            wal_entries = replayed,
            already_in_snapshot = skipped,
            "collection recovered"
        );
        Ok(Self::from_state(name, state))
    }

    fn from_state(name: String, state: CollectionState) -> Arc<Self> {
        let head = state
            .slots
            .back()
            .map(|slot| slot.record.position)
            .unwrap_or(START_POSITION);
        let (head_tx, _) = watch::channel(head);
        Arc::new(Self {
            name,
            state: RwLock::new(state),
            head_tx,
            dropped: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::Acquire)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_dropped() {
            return Err(QueueError::StoreUnavailable(format!(
                "Collection '{}' was dropped",
                self.name
            )));
        }
        Ok(())
    }

    pub async fn options(&self) -> CollectionOptions {
        self.state.read().await.options
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.slots.is_empty()
    }

    /// Adds `record` at the end and returns the position assigned to it.
    pub async fn append(&self, mut record: JobRecord) -> Result<Position> {
        self.ensure_live()?;
        let mut state = self.state.write().await;

        record.position = state.next_position;
        let size = record.stored_size()?;
        if size > state.options.max_size_bytes {
            return Err(QueueError::RecordTooLarge {
                size,
                max: state.options.max_size_bytes,
            });
        }

        state.log(&WalEntry::Append { record: record.clone() })?;
        let position = record.position;
        let evicted = state.push(record, size);
        state.maybe_checkpoint(&self.name);
        drop(state);

        for old in evicted {
            if old.status.is_resolved() {
                event!(Level::TRACE, collection = %self.name, position = old.position, "record evicted");
            } else {
                event!(
                    Level::WARN,
                    collection = %self.name,
                    position = old.position,
                    name = %old.name,
                    "unprocessed record evicted"
                );
            }
        }

        self.head_tx.send_replace(position);
        Ok(position)
    }

    /// Rewrites the status of the record at `position`.
    ///
    /// Returns `Ok(false)` when the record has already been evicted.
    pub async fn update_in_place<F>(&self, position: Position, mutate: F) -> Result<bool>
    where
        F: FnOnce(&mut RecordStatus),
    {
        self.ensure_live()?;
        let mut state = self.state.write().await;
        let Some(idx) = state.index_of(position) else {
            event!(Level::DEBUG, collection = %self.name, position, "update skipped, record evicted");
            return Ok(false);
        };

        let mut status = state.slots[idx].record.status.clone();
        mutate(&mut status);

        state.log(&WalEntry::Update { position, status: status.clone() })?;
        state.apply_update(position, status);
        state.maybe_checkpoint(&self.name);
        Ok(true)
    }

    pub async fn get(&self, position: Position) -> Option<JobRecord> {
        let state = self.state.read().await;
        state
            .index_of(position)
            .map(|idx| state.slots[idx].record.clone())
    }

    /// All surviving records in position order.
    pub async fn records(&self) -> Vec<JobRecord> {
        let state = self.state.read().await;
        state.slots.iter().map(|slot| slot.record.clone()).collect()
    }

    pub async fn stats(&self) -> CollectionStats {
        let state = self.state.read().await;
        let mut stats = CollectionStats {
            name: self.name.clone(),
            record_count: state.slots.len(),
            total_bytes: state.total_bytes,
            max_documents: state.options.max_documents,
            max_size_bytes: state.options.max_size_bytes,
            pending: 0,
            complete: 0,
            failed: 0,
            first_position: state.slots.front().map(|slot| slot.record.position),
            last_position: state.slots.back().map(|slot| slot.record.position),
            evicted: state.evicted,
            evicted_pending: state.evicted_pending,
        };
        for slot in &state.slots {
            match slot.record.state() {
                JobState::Pending => stats.pending += 1,
                JobState::Complete => stats.complete += 1,
                JobState::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// First record strictly after `position`, if one is stored.
    pub async fn next_after(&self, position: Position) -> Option<JobRecord> {
        let state = self.state.read().await;
        let idx = state.index_after(position);
        state.slots.get(idx).map(|slot| slot.record.clone())
    }

    /// Opens a tailing read of the records appended after `position`.
    pub fn tail_from(self: &Arc<Self>, position: Position) -> TailCursor {
        TailCursor {
            collection: Arc::clone(self),
            position,
            head_rx: self.head_tx.subscribe(),
        }
    }

    /// Marks the collection dead and hands back its files for removal.
    pub(crate) async fn close(&self) -> Option<LogPersistence> {
        self.dropped.store(true, Ordering::Release);
        let persistence = self.state.write().await.persistence.take();
        // Wake tailers so they notice the drop without waiting out their poll.
        self.head_tx.send_modify(|_| {});
        persistence
    }
}

// ============================================================================
// Tailing cursor
// ============================================================================

/// Streaming read over a capped collection.
///
/// Yields records in position order, each exactly once per cursor, and waits
/// a bounded amount of time for new appends when it has caught up.
pub struct TailCursor {
    collection: Arc<CappedCollection>,
    position: Position,
    head_rx: watch::Receiver<Position>,
}

impl TailCursor {
    /// Position of the last record this cursor yielded.
    pub fn position(&self) -> Position {
        self.position
    }

    /// Next record after the cursor, waiting at most `wait` for one to be appended.
    ///
    /// `Ok(None)` means the wait elapsed; the caller polls again.
    pub async fn next(&mut self, wait: Duration) -> Result<Option<JobRecord>> {
        self.head_rx.borrow_and_update();
        if let Some(record) = self.try_next().await? {
            return Ok(Some(record));
        }

        match timeout(wait, self.head_rx.changed()).await {
            Ok(Ok(())) => self.try_next().await,
            Ok(Err(_)) => Err(QueueError::StoreUnavailable(format!(
                "Collection '{}' closed",
                self.collection.name()
            ))),
            Err(_) => Ok(None),
        }
    }

    async fn try_next(&mut self) -> Result<Option<JobRecord>> {
        self.collection.ensure_live()?;
        let Some(record) = self.collection.next_after(self.position).await else {
            return Ok(None);
        };

        if self.position != START_POSITION && record.position > self.position + 1 {
            event!(
                Level::WARN,
                collection = %self.collection.name(),
                from = self.position,
                to = record.position,
                lost = record.position - self.position - 1,
                "cursor fell behind eviction, records skipped"
            );
        }
        self.position = record.position;
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn collection(max_documents: usize) -> Arc<CappedCollection> {
        CappedCollection::create(
            "test",
            CollectionOptions { max_size_bytes: 1_000_000, max_documents },
            None,
        )
        .unwrap()
    }

    fn job(name: &str) -> JobRecord {
        JobRecord::new(name, json!({}), json!({}), 16)
    }

    #[tokio::test]
    async fn test_append_assigns_increasing_positions() {
        let log = collection(10);
        let a = log.append(job("A")).await.unwrap();
        let b = log.append(job("B")).await.unwrap();
        assert!(b > a);
        assert_eq!(log.get(a).await.unwrap().name, "A");
    }

    #[tokio::test]
    async fn test_document_bound_evicts_oldest() {
        let log = collection(3);
        for i in 1..=5 {
            log.append(job(&format!("J{}", i))).await.unwrap();
        }
        let names: Vec<String> = log.records().await.into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["J3", "J4", "J5"]);

        let stats = log.stats().await;
        assert_eq!(stats.evicted, 2);
        assert_eq!(stats.evicted_pending, 2);
    }

    #[tokio::test]
    async fn test_byte_bound_evicts_oldest() {
        let size = {
            let mut sample = job("J1");
            sample.position = 1;
            sample.stored_size().unwrap()
        };
        let log = CappedCollection::create(
            "bytes",
            CollectionOptions { max_size_bytes: size * 2 + 1, max_documents: 100 },
            None,
        )
        .unwrap();
        for i in 1..=4 {
            log.append(job(&format!("J{}", i))).await.unwrap();
        }
        let stats = log.stats().await;
        assert_eq!(stats.record_count, 2);
        assert!(stats.total_bytes <= size * 2 + 1);
    }

    #[tokio::test]
    async fn test_oversized_record_is_rejected() {
        let log = CappedCollection::create(
            "tiny",
            CollectionOptions { max_size_bytes: 10, max_documents: 100 },
            None,
        )
        .unwrap();
        let err = log.append(job("Big")).await.unwrap_err();
        assert!(matches!(err, QueueError::RecordTooLarge { max: 10, .. }));
        assert!(log.is_empty().await);
    }

    #[tokio::test]
    async fn test_update_on_evicted_record_is_noop() {
        let log = collection(1);
        let first = log.append(job("A")).await.unwrap();
        log.append(job("B")).await.unwrap();

        let applied = log.update_in_place(first, |s| s.mark_complete()).await.unwrap();
        assert!(!applied);
    }

    #[tokio::test]
    async fn test_tail_yields_in_order_and_times_out() {
        let log = collection(10);
        log.append(job("A")).await.unwrap();
        log.append(job("B")).await.unwrap();

        let mut cursor = log.tail_from(START_POSITION);
        let wait = Duration::from_millis(20);
        assert_eq!(cursor.next(wait).await.unwrap().unwrap().name, "A");
        assert_eq!(cursor.next(wait).await.unwrap().unwrap().name, "B");
        assert!(cursor.next(wait).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tail_wakes_on_append() {
        let log = collection(10);
        let mut cursor = log.tail_from(START_POSITION);

        let writer = Arc::clone(&log);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.append(job("Late")).await.unwrap();
        });

        let record = cursor.next(Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(record.name, "Late");
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_recovery_skips_appends_already_in_snapshot() {
        use crate::storage::persistence::{DurabilityMode, SNAPSHOT_FILE, SnapshotFile};
        use tempfile::TempDir;

        let temp_dir = TempDir::new().unwrap();
        let options = CollectionOptions { max_size_bytes: 1_000_000, max_documents: 10 };
        let positioned = |position: Position, name: &str| {
            let mut record = job(name);
            record.position = position;
            record
        };

        // Snapshot saved, but the crash hit before the WAL was emptied.
        let mut persistence = LogPersistence::open(temp_dir.path(), DurabilityMode::Sync).unwrap();
        persistence.log(&WalEntry::Append { record: positioned(2, "B") }).unwrap();
        persistence.log(&WalEntry::Append { record: positioned(3, "C") }).unwrap();
        let snapshot = CollectionSnapshot::new(options, 3, vec![positioned(1, "A"), positioned(2, "B")]);
        SnapshotFile::new(temp_dir.path().join(SNAPSHOT_FILE)).save(&snapshot).unwrap();

        let recovered = persistence.recover().unwrap();
        let log = CappedCollection::recover("crash", persistence, recovered, options).unwrap();

        let records = log.records().await;
        let positions: Vec<Position> = records.iter().map(|r| r.position).collect();
        assert_eq!(positions, vec![1, 2, 3]);
        let expected_bytes: usize = records.iter().map(|r| r.stored_size().unwrap()).sum();
        assert_eq!(log.stats().await.total_bytes, expected_bytes);
        assert_eq!(log.append(job("D")).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_closed_collection_rejects_reads_and_writes() {
        let log = collection(10);
        let mut cursor = log.tail_from(START_POSITION);
        log.close().await;

        assert!(log.append(job("A")).await.unwrap_err().is_store_unavailable());
        assert!(cursor.next(Duration::from_millis(10)).await.is_err());
    }
}
