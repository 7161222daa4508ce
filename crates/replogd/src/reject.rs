//! Per-replica reject files.
//!
//! Every change a replica refused with a non-retryable error is appended to
//! `<host>:<port>.rej` as an `ERROR:` line followed by the record itself.
//! The parser skips leading `ERROR` lines, so a corrected reject file can be
//! fed back in as a producer log.

use crate::error::ReplError;
use crate::record::{ChangeRecord, ReplicaId};
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::error;

#[cfg(windows)]
const PORT_SEPARATOR: char = ',';
#[cfg(not(windows))]
const PORT_SEPARATOR: char = ':';

/// Writer for every replica's reject file.
///
/// A single mutex serializes all rejections in the process.
pub struct RejectLog {
    dir: PathBuf,
    mutex: Mutex<()>,
}

impl RejectLog {
    /// Reject files are created in `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            mutex: Mutex::new(()),
        }
    }

    /// Path of `replica`'s reject file.
    pub fn path_for(&self, replica: &ReplicaId) -> PathBuf {
        reject_path(&self.dir, replica)
    }

    /// Append a rejection entry for `record` on `replica`.
    pub fn write(
        &self,
        replica: &ReplicaId,
        record: &ChangeRecord,
        diagnostic: &str,
    ) -> Result<(), ReplError> {
        let path = self.path_for(replica);
        let mut entry = format!("ERROR: {}\n", diagnostic.replace(['\r', '\n'], " "));
        entry.push_str(&record.to_ldif_for(replica));

        let _guard = self.mutex.lock();
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(entry.as_bytes())?;
        file.sync_data()?;
        error!(
            "replica {} rejected {} (time {}): {}; written to {}",
            replica,
            record.dn,
            record.stamp,
            diagnostic,
            path.display()
        );
        Ok(())
    }
}

/// `<dir>/<host>:<port>.rej` (`,` instead of `:` on Windows).
pub fn reject_path(dir: &Path, replica: &ReplicaId) -> PathBuf {
    dir.join(format!(
        "{}{}{}.rej",
        replica.host, PORT_SEPARATOR, replica.port
    ))
}
