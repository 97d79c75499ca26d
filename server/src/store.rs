//! Durable append-only log of full-canvas snapshots.
//!
//! Keys are big-endian sequence numbers so the most recent snapshot is the
//! last key in iteration order; values are bincode-encoded canvas states.
//! History is retained as written — compaction, if ever needed, is an
//! external job working from the exposed snapshot ids.

use log::debug;
use rocksdb::{DBWithThreadMode, IteratorMode, Options, SingleThreaded, WriteOptions};
use shared::CanvasState;
use std::fmt;
use std::path::{Path, PathBuf};

pub type SnapshotId = u64;

#[derive(Debug, Clone)]
pub enum StoreError {
    Database(String),
    Serialization(String),
    Deserialization(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Database(e) => write!(f, "database error: {}", e),
            StoreError::Serialization(e) => write!(f, "snapshot serialization error: {}", e),
            StoreError::Deserialization(e) => write!(f, "snapshot deserialization error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Durable store for canvas snapshots.
///
/// The hub is the sole writer, so implementations do not need to serialize
/// concurrent appends themselves.
pub trait SnapshotStore: Send + 'static {
    /// Appends a full snapshot and returns its id. The snapshot must be
    /// durable when this returns: the hub only broadcasts state it has
    /// successfully appended.
    fn append(&mut self, canvas: &CanvasState) -> Result<SnapshotId, StoreError>;

    /// The most recently appended snapshot, if any.
    fn latest(&self) -> Result<Option<(SnapshotId, CanvasState)>, StoreError>;
}

/// RocksDB-backed snapshot log.
pub struct RocksSnapshotStore {
    db: DBWithThreadMode<SingleThreaded>,
    path: PathBuf,
    next_seq: u64,
    sync_writes: bool,
}

impl RocksSnapshotStore {
    /// Opens (or creates) the log at `path` with synced writes.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Self::open_with(path, true)
    }

    /// `sync_writes: false` trades the durability-before-broadcast guarantee
    /// for speed; only tests should do that.
    pub fn open_with(path: impl Into<PathBuf>, sync_writes: bool) -> Result<Self, StoreError> {
        let path = path.into();
        let mut opts = Options::default();
        opts.create_if_missing(true);

        let db = DBWithThreadMode::<SingleThreaded>::open(&opts, &path)?;
        let next_seq = Self::recover_sequence(&db)?;
        debug!(
            "Opened snapshot log at {} (next sequence {})",
            path.display(),
            next_seq
        );

        Ok(Self {
            db,
            path,
            next_seq,
            sync_writes,
        })
    }

    /// The sequence number continues from the last key on disk.
    fn recover_sequence(db: &DBWithThreadMode<SingleThreaded>) -> Result<u64, StoreError> {
        let mut iter = db.iterator(IteratorMode::End);
        match iter.next() {
            Some(Ok((key, _))) => Ok(decode_seq(&key).map_or(0, |seq| seq + 1)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SnapshotStore for RocksSnapshotStore {
    fn append(&mut self, canvas: &CanvasState) -> Result<SnapshotId, StoreError> {
        let seq = self.next_seq;
        let value =
            bincode::serialize(canvas).map_err(|e| StoreError::Serialization(e.to_string()))?;

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.sync_writes);
        self.db.put_opt(seq.to_be_bytes(), value, &write_opts)?;

        self.next_seq += 1;
        Ok(seq)
    }

    fn latest(&self) -> Result<Option<(SnapshotId, CanvasState)>, StoreError> {
        let mut iter = self.db.iterator(IteratorMode::End);
        match iter.next() {
            Some(Ok((key, value))) => {
                let seq = decode_seq(&key)
                    .ok_or_else(|| StoreError::Deserialization("malformed snapshot key".into()))?;
                let canvas: CanvasState = bincode::deserialize(&value)
                    .map_err(|e| StoreError::Deserialization(e.to_string()))?;
                if !canvas.has_expected_dimensions() {
                    return Err(StoreError::Deserialization(
                        "snapshot dimensions do not match this build".into(),
                    ));
                }
                Ok(Some((seq, canvas)))
            }
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }
}

fn decode_seq(key: &[u8]) -> Option<u64> {
    key.try_into().ok().map(u64::from_be_bytes)
}

/// In-memory snapshot log for tests.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshots: Vec<CanvasState>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn append(&mut self, canvas: &CanvasState) -> Result<SnapshotId, StoreError> {
        self.snapshots.push(canvas.clone());
        Ok(self.snapshots.len() as u64 - 1)
    }

    fn latest(&self) -> Result<Option<(SnapshotId, CanvasState)>, StoreError> {
        Ok(self
            .snapshots
            .last()
            .map(|canvas| (self.snapshots.len() as u64 - 1, canvas.clone())))
    }
}
