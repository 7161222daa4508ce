//! Durable per-replica checkpoints.
//!
//! The status file holds one `host:port:timestamp:sequence` line per
//! configured replica. It is read once at startup and rewritten in full,
//! under its `.lock` sibling, after every checkpoint update.

use crate::error::ReplError;
use crate::lock::FileLock;
use crate::record::{ReplicaId, Stamp};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Checkpoint of one replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// The replica.
    pub replica: ReplicaId,
    /// Stamp of the newest record that reached a terminal outcome on it.
    pub last: Stamp,
}

impl StatusEntry {
    /// A zeroed checkpoint for `replica`.
    pub fn new(replica: ReplicaId) -> Self {
        Self {
            replica,
            last: Stamp::default(),
        }
    }

    /// Whether a record stamped `stamp` has not been processed yet.
    pub fn is_new(&self, stamp: Stamp) -> bool {
        stamp > self.last
    }

    fn to_line(&self) -> String {
        format!(
            "{}:{}:{}:{}\n",
            self.replica.host, self.replica.port, self.last.timestamp, self.last.sequence
        )
    }
}

/// Parse one status line, `host:port:timestamp:sequence`.
///
/// Fields are split from the right so that the host part may itself
/// contain colons.
fn parse_line(line: &str) -> Option<StatusEntry> {
    let mut fields = line.rsplitn(4, ':');
    let sequence = fields.next()?.trim().parse::<u32>().ok()?;
    let timestamp = fields.next()?.trim().parse::<u64>().ok()?;
    let port = fields.next()?.trim().parse::<u16>().ok()?;
    let host = fields.next()?;
    if host.is_empty() {
        return None;
    }
    Some(StatusEntry {
        replica: ReplicaId::new(host, port),
        last: Stamp::new(timestamp, sequence),
    })
}

/// The table of replica checkpoints and its status file.
pub struct StatusTable {
    path: PathBuf,
    entries: Mutex<Vec<StatusEntry>>,
    write_failing: AtomicBool,
}

impl StatusTable {
    /// Create an empty table backed by `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: Mutex::new(Vec::new()),
            write_failing: AtomicBool::new(false),
        }
    }

    /// Path of the status file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Start tracking `replica` with a zeroed checkpoint.
    ///
    /// Registering the same replica twice returns the existing entry.
    pub fn add_replica(&self, replica: &ReplicaId) -> StatusEntry {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.iter().find(|e| &e.replica == replica) {
            return existing.clone();
        }
        let entry = StatusEntry::new(replica.clone());
        entries.push(entry.clone());
        entry
    }

    /// Current checkpoint of `replica`.
    pub fn checkpoint(&self, replica: &ReplicaId) -> Option<Stamp> {
        self.entries
            .lock()
            .iter()
            .find(|e| &e.replica == replica)
            .map(|e| e.last)
    }

    /// Whether a record stamped `stamp` is still to be processed for `replica`.
    pub fn is_new(&self, replica: &ReplicaId, stamp: Stamp) -> bool {
        self.entries
            .lock()
            .iter()
            .find(|e| &e.replica == replica)
            .map_or(true, |e| e.is_new(stamp))
    }

    /// Move `replica`'s checkpoint to `stamp`.
    ///
    /// Checkpoints never move backwards; returns `false` when the update was
    /// ignored.
    pub fn update(&self, replica: &ReplicaId, stamp: Stamp) -> bool {
        let mut entries = self.entries.lock();
        match entries.iter_mut().find(|e| &e.replica == replica) {
            Some(entry) if stamp > entry.last => {
                entry.last = stamp;
                true
            }
            _ => false,
        }
    }

    /// Snapshot of every entry, in registration order.
    pub fn entries(&self) -> Vec<StatusEntry> {
        self.entries.lock().clone()
    }

    /// Truncate and rewrite the status file.
    pub fn persist(&self) -> Result<(), ReplError> {
        let entries = self.entries.lock();
        let _lock = FileLock::acquire(&self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        let mut out = BufWriter::new(file);
        for entry in entries.iter() {
            out.write_all(entry.to_line().as_bytes())?;
        }
        let file = out.into_inner().map_err(|e| e.into_error())?;
        file.sync_data()?;
        Ok(())
    }

    /// Persist, logging a failure instead of returning it.
    ///
    /// The in-memory checkpoint stays valid and the next successful write
    /// brings the file up to date, so a failure is only warned about once.
    pub fn persist_or_warn(&self) {
        match self.persist() {
            Ok(()) => {
                if self.write_failing.swap(false, Ordering::SeqCst) {
                    info!("status file {} written again", self.path.display());
                }
            }
            Err(e) => {
                if !self.write_failing.swap(true, Ordering::SeqCst) {
                    warn!("cannot write status file {}: {}", self.path.display(), e);
                }
            }
        }
    }

    /// Load checkpoints for the registered replicas from the status file.
    ///
    /// A missing file is created empty. Lines for replicas that are not
    /// registered are ignored with a warning; a line that cannot be parsed
    /// is an error. Returns the number of checkpoints restored.
    pub fn load(&self) -> Result<usize, ReplError> {
        if !self.path.exists() {
            File::create(&self.path)?;
            debug!(
                "no status file at {}, starting every replica from scratch",
                self.path.display()
            );
            return Ok(0);
        }
        let text = {
            let _lock = FileLock::acquire(&self.path)?;
            fs::read_to_string(&self.path)?
        };

        let mut entries = self.entries.lock();
        let mut restored = 0;
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            let saved = parse_line(line).ok_or_else(|| ReplError::StatusFile {
                path: self.path.clone(),
                line: line.to_string(),
            })?;
            match entries.iter_mut().find(|e| e.replica == saved.replica) {
                Some(entry) => {
                    debug!("restored checkpoint {} for {}", saved.last, saved.replica);
                    entry.last = saved.last;
                    restored += 1;
                }
                None => warn!(
                    "status file has a checkpoint for {}, which is not a configured replica",
                    saved.replica
                ),
            }
        }
        Ok(restored)
    }
}
