//! Write-ahead log and snapshot files backing a durable capped collection

use crate::core::{QueueError, Result};
use crate::storage::capped::CollectionOptions;
use crate::storage::record::{JobRecord, Position, RecordStatus};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{Level, event};

pub(crate) const WAL_FILE: &str = "queue.wal";
pub(crate) const SNAPSHOT_FILE: &str = "queue.snapshot";
const LOCK_FILE: &str = "queue.lock";
const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Frame header: little-endian u32 body length.
const FRAME_HEADER: usize = 4;

fn unavailable(action: &str, err: impl std::fmt::Display) -> QueueError {
    QueueError::StoreUnavailable(format!("{}: {}", action, err))
}

// ============================================================================
// WAL Entry Types
// ============================================================================

/// One mutation of a collection, in the order it was applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalEntry {
    Create { options: CollectionOptions },
    Append { record: JobRecord },
    Update { position: Position, status: RecordStatus },
}

// ============================================================================
// Collection Snapshot
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionSnapshot {
    pub version: u32,
    pub options: CollectionOptions,
    /// Every append in the WAL below this position is already in `records`.
    pub next_position: Position,
    pub records: Vec<JobRecord>,
    pub created_at: DateTime<Utc>,
}

impl CollectionSnapshot {
    pub fn new(options: CollectionOptions, next_position: Position, records: Vec<JobRecord>) -> Self {
        Self {
            version: SNAPSHOT_FORMAT_VERSION,
            options,
            next_position,
            records,
            created_at: Utc::now(),
        }
    }
}

// ============================================================================
// Durability Configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DurabilityMode {
    /// fsync after every entry
    Sync,
    /// hand every entry to the OS, no fsync
    #[default]
    Async,
    /// keep nothing on disk
    None,
}

// ============================================================================
// WAL file
// ============================================================================

/// Splits `bytes` into complete frames.
///
/// Returns the decoded entries and the byte length they cover. A trailing
/// frame cut short by a crash ends the scan; a complete frame that does not
/// decode is corruption and fails.
fn decode_frames(bytes: &[u8]) -> Result<(Vec<WalEntry>, usize)> {
    let mut entries = Vec::new();
    let mut offset = 0;
    while bytes.len() - offset >= FRAME_HEADER {
        let mut header = [0u8; FRAME_HEADER];
        header.copy_from_slice(&bytes[offset..offset + FRAME_HEADER]);
        let body_len = u32::from_le_bytes(header) as usize;
        let body_start = offset + FRAME_HEADER;
        let Some(body) = bytes.get(body_start..body_start + body_len) else {
            break;
        };
        let entry = rmp_serde::from_slice(body).map_err(|e| {
            QueueError::Serialization(format!("Corrupt WAL entry at byte {}: {}", offset, e))
        })?;
        entries.push(entry);
        offset = body_start + body_len;
    }
    Ok((entries, offset))
}

fn encode_frame(entry: &WalEntry) -> Result<Vec<u8>> {
    let body = rmp_serde::to_vec(entry)
        .map_err(|e| QueueError::Serialization(format!("Failed to encode WAL entry: {}", e)))?;
    let body_len = u32::try_from(body.len())
        .map_err(|_| QueueError::Serialization(format!("WAL entry of {} bytes is too large", body.len())))?;
    let mut frame = Vec::with_capacity(FRAME_HEADER + body.len());
    frame.extend_from_slice(&body_len.to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Append-only file of length-prefixed MessagePack frames.
///
/// Every write starts at `committed`, the end of the last complete frame,
/// so a failed or torn write never leaves garbage in front of later frames.
pub struct WalFile {
    path: PathBuf,
    file: Option<File>,
    mode: DurabilityMode,
    committed: u64,
    since_checkpoint: usize,
    checkpoint_threshold: usize,
}

impl WalFile {
    /// Opens the WAL at `path`, cutting off a torn trailing frame if one is found.
    pub fn open<P: AsRef<Path>>(path: P, mode: DurabilityMode) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut wal = Self {
            path,
            file: None,
            mode,
            committed: 0,
            since_checkpoint: 0,
            checkpoint_threshold: 1000,
        };
        if mode == DurabilityMode::None {
            return Ok(wal);
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&wal.path)
            .map_err(|e| unavailable("Failed to open WAL", e))?;
        let bytes = fs::read(&wal.path).map_err(|e| unavailable("Failed to read WAL", e))?;
        let (_, valid) = decode_frames(&bytes)?;
        if valid < bytes.len() {
            event!(
                Level::WARN,
                wal = %wal.path.display(),
                dropped_bytes = bytes.len() - valid,
                "truncating torn WAL tail"
            );
            file.set_len(valid as u64)
                .map_err(|e| unavailable("Failed to truncate WAL", e))?;
        }
        wal.committed = valid as u64;
        wal.file = Some(file);
        Ok(wal)
    }

    pub fn append(&mut self, entry: &WalEntry) -> Result<()> {
        let frame = encode_frame(entry)?;
        let committed = self.committed;
        let sync = self.mode == DurabilityMode::Sync;
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };

        let written = file
            .seek(SeekFrom::Start(committed))
            .and_then(|_| file.write_all(&frame))
            .and_then(|_| if sync { file.sync_data() } else { Ok(()) });
        if let Err(err) = written {
            if let Err(cut) = file.set_len(committed) {
                event!(Level::ERROR, wal = %self.path.display(), error = %cut, "failed to roll back partial WAL entry");
            }
            return Err(unavailable("Failed to append WAL entry", err));
        }

        self.committed += frame.len() as u64;
        self.since_checkpoint += 1;
        Ok(())
    }

    /// Every complete entry, oldest first.
    pub fn replay(&self) -> Result<Vec<WalEntry>> {
        if self.file.is_none() {
            return Ok(Vec::new());
        }
        let bytes = fs::read(&self.path).map_err(|e| unavailable("Failed to read WAL", e))?;
        let (entries, valid) = decode_frames(&bytes)?;
        if valid < bytes.len() {
            event!(Level::WARN, wal = %self.path.display(), "ignoring torn WAL entry");
        }
        Ok(entries)
    }

    /// Empties the file once a snapshot holds its contents.
    pub fn reset(&mut self) -> Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.set_len(0).map_err(|e| unavailable("Failed to truncate WAL", e))?;
            if self.mode == DurabilityMode::Sync {
                file.sync_all().map_err(|e| unavailable("Failed to sync WAL", e))?;
            }
        }
        self.committed = 0;
        self.since_checkpoint = 0;
        Ok(())
    }

    pub fn needs_checkpoint(&self) -> bool {
        self.since_checkpoint >= self.checkpoint_threshold
    }

    pub fn entries_since_checkpoint(&self) -> usize {
        self.since_checkpoint
    }

    pub fn set_checkpoint_threshold(&mut self, threshold: usize) {
        self.checkpoint_threshold = threshold.max(1);
    }
}

// ============================================================================
// Snapshot file
// ============================================================================

pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Writes to a temp file in the same directory, then renames it over the old snapshot.
    pub fn save(&self, snapshot: &CollectionSnapshot) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) => parent.to_path_buf(),
            None => PathBuf::from("."),
        };
        let bytes = rmp_serde::to_vec(snapshot)
            .map_err(|e| QueueError::Serialization(format!("Failed to encode snapshot: {}", e)))?;

        let mut staged = NamedTempFile::new_in(&dir).map_err(|e| unavailable("Failed to stage snapshot", e))?;
        staged
            .write_all(&bytes)
            .and_then(|_| staged.as_file().sync_all())
            .map_err(|e| unavailable("Failed to write snapshot", e))?;
        staged
            .persist(&self.path)
            .map_err(|e| unavailable("Failed to install snapshot", e.error))?;
        Ok(())
    }

    pub fn load(&self) -> Result<Option<CollectionSnapshot>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(unavailable("Failed to read snapshot", e)),
        };
        let snapshot: CollectionSnapshot = rmp_serde::from_slice(&bytes)
            .map_err(|e| QueueError::Serialization(format!("Failed to decode snapshot: {}", e)))?;
        if snapshot.version != SNAPSHOT_FORMAT_VERSION {
            return Err(QueueError::Serialization(format!(
                "Unsupported snapshot format version {}",
                snapshot.version
            )));
        }
        Ok(Some(snapshot))
    }
}

// ============================================================================
// Log Persistence
// ============================================================================

/// What a collection directory held when it was opened.
#[derive(Debug, Default)]
pub struct RecoveredLog {
    pub snapshot: Option<CollectionSnapshot>,
    pub entries: Vec<WalEntry>,
}

/// The files of one collection directory.
///
/// Holds an exclusive lock on the directory for as long as it lives, so only
/// one process at a time can write the collection.
pub struct LogPersistence {
    dir: PathBuf,
    wal: WalFile,
    snapshot: SnapshotFile,
    durability_mode: DurabilityMode,
    _lock: File,
}

impl LogPersistence {
    /// Opens `dir`, failing with [`QueueError::StoreUnavailable`] if another
    /// handle already owns it.
    pub fn open<P: AsRef<Path>>(dir: P, durability_mode: DurabilityMode) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| unavailable("Failed to create collection directory", e))?;

        let lock_path = dir.join(LOCK_FILE);
        let lock = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| unavailable("Failed to open collection lock", e))?;
        FileExt::try_lock_exclusive(&lock).map_err(|e| {
            QueueError::StoreUnavailable(format!(
                "Collection '{}' is locked by another process: {}",
                dir.display(),
                e
            ))
        })?;

        let wal = WalFile::open(dir.join(WAL_FILE), durability_mode)?;
        let snapshot = SnapshotFile::new(dir.join(SNAPSHOT_FILE));
        Ok(Self {
            dir,
            wal,
            snapshot,
            durability_mode,
            _lock: lock,
        })
    }

    /// Whether a collection was ever written to `dir`.
    pub fn exists_at<P: AsRef<Path>>(dir: P) -> bool {
        let dir = dir.as_ref();
        dir.join(SNAPSHOT_FILE).exists()
            || fs::metadata(dir.join(WAL_FILE))
                .map(|meta| meta.len() > 0)
                .unwrap_or(false)
    }

    pub fn log(&mut self, entry: &WalEntry) -> Result<()> {
        self.wal.append(entry)
    }

    /// Saves `snapshot`, then empties the WAL.
    ///
    /// A crash between the two steps leaves entries the snapshot already
    /// covers; recovery skips them by position.
    pub fn checkpoint(&mut self, snapshot: &CollectionSnapshot) -> Result<()> {
        if self.durability_mode == DurabilityMode::None {
            return Ok(());
        }
        self.snapshot.save(snapshot)?;
        self.wal.reset()?;
        event!(
            Level::DEBUG,
            dir = %self.dir.display(),
            records = snapshot.records.len(),
            "collection checkpointed"
        );
        Ok(())
    }

    pub fn needs_checkpoint(&self) -> bool {
        self.durability_mode != DurabilityMode::None && self.wal.needs_checkpoint()
    }

    pub fn recover(&self) -> Result<RecoveredLog> {
        Ok(RecoveredLog {
            snapshot: self.snapshot.load()?,
            entries: self.wal.replay()?,
        })
    }

    /// Removes every file of the collection and releases its lock.
    pub fn destroy(self) -> Result<()> {
        let Self { dir, wal, _lock, .. } = self;
        drop(wal);
        drop(_lock);
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(|e| unavailable("Failed to remove collection directory", e))?;
        }
        Ok(())
    }

    pub fn wal(&self) -> &WalFile {
        &self.wal
    }

    pub fn wal_mut(&mut self) -> &mut WalFile {
        &mut self.wal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn options() -> CollectionOptions {
        CollectionOptions { max_size_bytes: 10_000, max_documents: 10 }
    }

    fn record(position: Position, name: &str) -> JobRecord {
        let mut record = JobRecord::new(name, json!({}), json!({}), 16);
        record.position = position;
        record
    }

    #[test]
    fn test_wal_append_and_replay() {
        let temp_dir = TempDir::new().unwrap();
        let mut wal = WalFile::open(temp_dir.path().join("test.wal"), DurabilityMode::Sync).unwrap();
        wal.append(&WalEntry::Create { options: options() }).unwrap();
        wal.append(&WalEntry::Append { record: record(1, "A") }).unwrap();
        wal.append(&WalEntry::Update { position: 1, status: RecordStatus::pending(16) }).unwrap();

        let entries = wal.replay().unwrap();
        assert_eq!(entries.len(), 3);
        assert!(matches!(&entries[1], WalEntry::Append { record } if record.name == "A"));
    }

    #[test]
    fn test_torn_tail_is_cut_before_new_appends() {
        let temp_dir = TempDir::new().unwrap();
        let wal_path = temp_dir.path().join("test.wal");
        let mut wal = WalFile::open(&wal_path, DurabilityMode::Sync).unwrap();
        wal.append(&WalEntry::Create { options: options() }).unwrap();
        drop(wal);

        // Header promising 64 bytes followed by only three of them.
        let mut file = OpenOptions::new().append(true).open(&wal_path).unwrap();
        file.write_all(&64u32.to_le_bytes()).unwrap();
        file.write_all(&[1, 2, 3]).unwrap();
        drop(file);

        let mut wal = WalFile::open(&wal_path, DurabilityMode::Sync).unwrap();
        wal.append(&WalEntry::Append { record: record(1, "A") }).unwrap();

        let entries = wal.replay().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(matches!(&entries[1], WalEntry::Append { record } if record.position == 1));
    }

    #[test]
    fn test_append_overwrites_bytes_past_last_good_frame() {
        let temp_dir = TempDir::new().unwrap();
        let mut wal = WalFile::open(temp_dir.path().join("test.wal"), DurabilityMode::Async).unwrap();
        wal.append(&WalEntry::Create { options: options() }).unwrap();

        // A write that died halfway leaves bytes past `committed`.
        let file = wal.file.as_mut().unwrap();
        file.seek(SeekFrom::End(0)).unwrap();
        file.write_all(&[0xff, 0xff]).unwrap();

        wal.append(&WalEntry::Append { record: record(1, "A") }).unwrap();
        wal.append(&WalEntry::Append { record: record(2, "B") }).unwrap();

        let entries = wal.replay().unwrap();
        assert_eq!(entries.len(), 3);
        assert!(matches!(&entries[2], WalEntry::Append { record } if record.name == "B"));
    }

    #[test]
    fn test_checkpoint_resets_wal() {
        let temp_dir = TempDir::new().unwrap();
        let mut persistence = LogPersistence::open(temp_dir.path(), DurabilityMode::Sync).unwrap();
        persistence.log(&WalEntry::Create { options: options() }).unwrap();
        persistence.log(&WalEntry::Append { record: record(1, "A") }).unwrap();
        assert_eq!(persistence.wal().entries_since_checkpoint(), 2);

        let snapshot = CollectionSnapshot::new(options(), 2, vec![record(1, "A")]);
        persistence.checkpoint(&snapshot).unwrap();
        assert_eq!(persistence.wal().entries_since_checkpoint(), 0);

        persistence.log(&WalEntry::Append { record: record(2, "B") }).unwrap();
        let recovered = persistence.recover().unwrap();
        assert_eq!(recovered.entries.len(), 1);
        let loaded = recovered.snapshot.unwrap();
        assert_eq!(loaded.next_position, 2);
        assert_eq!(loaded.records[0].name, "A");
    }

    #[test]
    fn test_second_open_of_locked_directory_fails() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("Queue");
        let first = LogPersistence::open(&dir, DurabilityMode::Async).unwrap();

        let second = LogPersistence::open(&dir, DurabilityMode::Async);
        assert!(matches!(second, Err(QueueError::StoreUnavailable(_))));

        drop(first);
        assert!(LogPersistence::open(&dir, DurabilityMode::Async).is_ok());
    }

    #[test]
    fn test_destroy_removes_directory() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("Queue");
        let mut persistence = LogPersistence::open(&dir, DurabilityMode::Async).unwrap();
        persistence.log(&WalEntry::Create { options: options() }).unwrap();
        assert!(LogPersistence::exists_at(&dir));

        persistence.destroy().unwrap();
        assert!(!dir.exists());
        assert!(!LogPersistence::exists_at(&dir));
    }
}
