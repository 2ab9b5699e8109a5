//! Append-only audit trail of privileged pool operations.
//!
//! Records are written through an [`AuditStore`]. A store failure is always
//! returned to the caller; the pool manager turns it into
//! `AdminError::AuditWrite` even when the audited operation succeeded.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Default number of records kept in memory.
pub const DEFAULT_MEMORY_CAPACITY: usize = 10_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    PoolCreate,
    PoolImport,
    PoolExport,
    PoolDestroy,
    PoolSetProperties,
    PoolAddSpares,
    PoolRemoveVdev,
    DeviceReplace,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure { code: String, reason: String },
}

impl AuditOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AuditOutcome::Success)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action: AuditAction,
    pub target: String,
    pub outcome: AuditOutcome,
}

/// Fields of a record before the store assigns its id.
#[derive(Clone, Debug)]
pub struct NewAuditRecord {
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action: AuditAction,
    pub target: String,
    pub outcome: AuditOutcome,
}

impl NewAuditRecord {
    fn with_id(self, id: u64) -> AuditRecord {
        AuditRecord {
            id,
            timestamp: self.timestamp,
            actor: self.actor,
            action: self.action,
            target: self.target,
            outcome: self.outcome,
        }
    }
}

#[derive(Debug, Error)]
pub enum AuditStoreError {
    #[error("audit store unavailable: {0}")]
    Unavailable(String),

    #[error("audit store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("audit record encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Backend for audit records. Ids are assigned by the store and strictly
/// increase in append order.
pub trait AuditStore: Send + Sync {
    fn append(&self, record: NewAuditRecord) -> Result<u64, AuditStoreError>;

    fn get(&self, id: u64) -> Result<Option<AuditRecord>, AuditStoreError>;

    /// Up to `limit` records, newest first.
    fn recent(&self, limit: usize) -> Result<Vec<AuditRecord>, AuditStoreError>;
}

struct Window {
    events: VecDeque<AuditRecord>,
    next_id: u64,
    capacity: usize,
}

impl Window {
    fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity.min(1024)),
            next_id: 1,
            capacity: capacity.max(1),
        }
    }

    fn push(&mut self, record: AuditRecord) {
        if self.events.len() >= self.capacity {
            self.events.pop_front();
        }
        self.next_id = self.next_id.max(record.id + 1);
        self.events.push_back(record);
    }

    fn get(&self, id: u64) -> Option<AuditRecord> {
        let idx = self.events.binary_search_by_key(&id, |r| r.id).ok()?;
        self.events.get(idx).cloned()
    }

    fn recent(&self, limit: usize) -> Vec<AuditRecord> {
        self.events.iter().rev().take(limit).cloned().collect()
    }
}

/// Bounded in-memory store; the oldest records are evicted at capacity.
pub struct MemoryAuditStore {
    window: Mutex<Window>,
    available: AtomicBool,
}

impl MemoryAuditStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            window: Mutex::new(Window::new(capacity)),
            available: AtomicBool::new(true),
        }
    }

    /// Simulates the backing store going away; appends fail until restored.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.window.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryAuditStore {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_CAPACITY)
    }
}

impl AuditStore for MemoryAuditStore {
    fn append(&self, record: NewAuditRecord) -> Result<u64, AuditStoreError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(AuditStoreError::Unavailable("memory store disabled".into()));
        }
        let mut window = self.window.lock();
        let id = window.next_id;
        window.push(record.with_id(id));
        Ok(id)
    }

    fn get(&self, id: u64) -> Result<Option<AuditRecord>, AuditStoreError> {
        Ok(self.window.lock().get(id))
    }

    fn recent(&self, limit: usize) -> Result<Vec<AuditRecord>, AuditStoreError> {
        Ok(self.window.lock().recent(limit))
    }
}

/// Append target behind a [`FileAuditStore`].
trait AuditSink: Send {
    /// Writes one complete line and makes it durable.
    fn append_line(&mut self, line: &[u8]) -> io::Result<()>;

    fn size(&self) -> io::Result<u64>;

    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl AuditSink for File {
    fn append_line(&mut self, line: &[u8]) -> io::Result<()> {
        self.write_all(line)?;
        self.sync_data()
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)?;
        self.sync_data()
    }
}

/// JSON-lines file store. Each append is written and synced before the id is
/// returned; the most recent `capacity` records are also cached for reads.
///
/// A failed append consumes its id and cuts the file back to its previous
/// length, so a torn line never survives and no id is handed out twice.
pub struct FileAuditStore {
    path: PathBuf,
    inner: Mutex<(Box<dyn AuditSink>, Window)>,
}

impl FileAuditStore {
    pub fn open(path: &Path, capacity: usize) -> Result<Self, AuditStoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut window = Window::new(capacity);
        if path.exists() {
            let reader = BufReader::new(File::open(path)?);
            for (lineno, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<AuditRecord>(&line) {
                    Ok(record) => window.push(record),
                    Err(e) => warn!(path = %path.display(), line = lineno + 1, error = %e, "skipping unreadable audit line"),
                }
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        debug!(path = %path.display(), next_id = window.next_id, "audit log opened");
        Ok(Self::with_sink(path, Box::new(file), window))
    }

    fn with_sink(path: &Path, sink: Box<dyn AuditSink>, window: Window) -> Self {
        Self {
            path: path.to_path_buf(),
            inner: Mutex::new((sink, window)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditStore for FileAuditStore {
    fn append(&self, record: NewAuditRecord) -> Result<u64, AuditStoreError> {
        let mut inner = self.inner.lock();
        let (sink, window) = &mut *inner;
        let id = window.next_id;
        let record = record.with_id(id);
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        let start = sink.size()?;
        if let Err(err) = sink.append_line(&line) {
            window.next_id = id + 1;
            if let Err(rollback) = sink.truncate(start) {
                warn!(path = %self.path.display(), id, error = %rollback, "could not cut back failed audit line");
            }
            return Err(err.into());
        }
        window.push(record);
        Ok(id)
    }

    fn get(&self, id: u64) -> Result<Option<AuditRecord>, AuditStoreError> {
        Ok(self.inner.lock().1.get(id))
    }

    fn recent(&self, limit: usize) -> Result<Vec<AuditRecord>, AuditStoreError> {
        Ok(self.inner.lock().1.recent(limit))
    }
}

/// Front door for writing and reading audit records.
#[derive(Clone)]
pub struct AuditLogger {
    store: Arc<dyn AuditStore>,
}

impl AuditLogger {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryAuditStore::default()))
    }

    pub fn append(
        &self,
        actor: &str,
        action: AuditAction,
        target: &str,
        outcome: AuditOutcome,
        timestamp: DateTime<Utc>,
    ) -> Result<u64, AuditStoreError> {
        let id = self.store.append(NewAuditRecord {
            timestamp,
            actor: actor.to_string(),
            action,
            target: target.to_string(),
            outcome,
        })?;
        debug!(id, actor, ?action, resource = target, "audit record appended");
        Ok(id)
    }

    /// The `limit` most recent records, newest first.
    pub fn records(&self, limit: usize) -> Result<Vec<AuditRecord>, AuditStoreError> {
        self.store.recent(limit)
    }

    pub fn get(&self, id: u64) -> Result<Option<AuditRecord>, AuditStoreError> {
        self.store.get(id)
    }
}
