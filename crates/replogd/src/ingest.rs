//! The log ingestor.
//!
//! Moves new content from the directory server's replication log into the
//! daemon's private copy, parses it into change records for the queue, and
//! compacts the private copy once enough of it has been consumed.

use crate::config::EngineConfig;
use crate::error::ReplError;
use crate::lock::FileLock;
use crate::queue::{now_secs, CountFilter, ReplicationQueue};
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Counts reported after a one-shot run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OneShotReport {
    /// Records read from the log.
    pub total: usize,
    /// Records some replica still has to look at.
    pub pending: usize,
}

/// What the ingestor did over its lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    /// Bytes moved from the producer log into the private log.
    pub bytes_copied: u64,
    /// Records appended to the queue.
    pub records: u64,
    /// Paragraphs dropped because they did not parse.
    pub malformed: u64,
    /// Private log compactions.
    pub trims: u64,
}

/// Feeds the replication queue from the producer's log.
pub struct LogIngestor {
    producer_log: PathBuf,
    private_log: PathBuf,
    queue: Arc<ReplicationQueue>,
    idle_interval: Duration,
    /// Offset in the private log up to which records have been queued.
    offset: u64,
    stats: IngestStats,
}

fn file_nonempty(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}

/// Split `data` into blank-line-terminated paragraphs.
///
/// Returns the paragraphs and the number of bytes they (and the blank lines
/// around them) span. An unterminated trailing paragraph is only returned
/// when `at_end` is set; otherwise it is left for the next read.
fn split_paragraphs(data: &[u8], at_end: bool) -> (Vec<&[u8]>, usize) {
    let mut paragraphs = Vec::new();
    let mut consumed = 0;
    let mut start = 0;
    let mut pos = 0;
    let mut has_content = false;
    while pos < data.len() {
        let Some(newline) = data[pos..].iter().position(|&b| b == b'\n') else {
            break;
        };
        let end = pos + newline + 1;
        let blank = data[pos..end].iter().all(|b| b.is_ascii_whitespace());
        if blank {
            if has_content {
                paragraphs.push(&data[start..pos]);
            }
            consumed = end;
            start = end;
            has_content = false;
        } else {
            has_content = true;
        }
        pos = end;
    }
    if at_end && start < data.len() {
        let rest = &data[start..];
        if !rest.iter().all(|b| b.is_ascii_whitespace()) {
            paragraphs.push(rest);
        }
        consumed = data.len();
    }
    (paragraphs, consumed)
}

impl LogIngestor {
    /// Create an ingestor moving `producer_log` into `private_log`.
    pub fn new(
        producer_log: impl Into<PathBuf>,
        private_log: impl Into<PathBuf>,
        queue: Arc<ReplicationQueue>,
        idle_interval: Duration,
    ) -> Self {
        Self {
            producer_log: producer_log.into(),
            private_log: private_log.into(),
            queue,
            idle_interval,
            offset: 0,
            stats: IngestStats::default(),
        }
    }

    /// Create an ingestor with the paths and interval from `config`.
    pub fn from_config(config: &EngineConfig, queue: Arc<ReplicationQueue>) -> Self {
        Self::new(
            config.producer_log.clone(),
            config.private_log_path(),
            queue,
            config.idle_interval(),
        )
    }

    /// Counters so far.
    pub fn stats(&self) -> IngestStats {
        self.stats
    }

    /// Offset in the private log up to which records have been queued.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Queue whatever a previous run left in the private log.
    pub fn recover(&mut self) -> Result<usize, ReplError> {
        if !file_nonempty(&self.private_log) {
            return Ok(0);
        }
        let queued = self.populate()?;
        if queued > 0 {
            info!(
                "recovered {} records from {}",
                queued,
                self.private_log.display()
            );
        }
        Ok(queued)
    }

    /// Move the producer log's contents to the end of the private log and
    /// truncate the producer log. Returns the number of bytes moved.
    pub fn copy_producer_log(&mut self) -> Result<u64, ReplError> {
        if !file_nonempty(&self.producer_log) {
            return Ok(0);
        }
        let _producer = FileLock::acquire(&self.producer_log)?;
        let _private = FileLock::acquire(&self.private_log)?;
        let data = fs::read(&self.producer_log)?;
        if data.is_empty() {
            return Ok(0);
        }
        let mut out = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.private_log)?;
        out.write_all(&data)?;
        out.sync_data()?;
        OpenOptions::new()
            .write(true)
            .open(&self.producer_log)?
            .set_len(0)?;
        debug!(
            "moved {} bytes from {} to {}",
            data.len(),
            self.producer_log.display(),
            self.private_log.display()
        );
        self.stats.bytes_copied += data.len() as u64;
        Ok(data.len() as u64)
    }

    /// Queue every complete record of the private log past the read offset.
    pub fn populate(&mut self) -> Result<usize, ReplError> {
        let data = {
            let _lock = FileLock::acquire(&self.private_log)?;
            let mut file = fs::File::open(&self.private_log)?;
            file.seek(SeekFrom::Start(self.offset))?;
            let mut data = Vec::new();
            file.read_to_end(&mut data)?;
            data
        };
        let (queued, consumed) = self.append_paragraphs(&data, false);
        self.offset += consumed as u64;
        Ok(queued)
    }

    fn append_paragraphs(&mut self, data: &[u8], at_end: bool) -> (usize, usize) {
        let (paragraphs, consumed) = split_paragraphs(data, at_end);
        let mut queued = 0;
        for paragraph in paragraphs {
            let text = String::from_utf8_lossy(paragraph);
            match self.queue.append(&text) {
                Ok(_) => {
                    queued += 1;
                    self.stats.records += 1;
                }
                Err(e) => {
                    self.stats.malformed += 1;
                    warn!(
                        "dropping malformed replication record (begins with {:?}): {}",
                        text.lines().next().unwrap_or_default(),
                        e
                    );
                }
            }
        }
        (queued, consumed)
    }

    /// Rewrite the private log with only the records still needed.
    ///
    /// Bytes past the read offset have not been queued yet; they are kept
    /// after the rewritten records.
    pub fn trim(&mut self) -> Result<(), ReplError> {
        let _lock = FileLock::acquire(&self.private_log)?;
        let mut tail = Vec::new();
        if let Ok(mut file) = fs::File::open(&self.private_log) {
            file.seek(SeekFrom::Start(self.offset))?;
            file.read_to_end(&mut tail)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.private_log)?;
        let mut out = BufWriter::new(file);
        let written = self.queue.rewrite_to(&mut out, now_secs())?;
        out.write_all(&tail)?;
        let file = out.into_inner().map_err(|e| e.into_error())?;
        file.sync_data()?;
        self.offset = written;
        self.stats.trims += 1;
        debug!(
            "trimmed {} to {} bytes of live records",
            self.private_log.display(),
            written
        );
        Ok(())
    }

    /// One ingest cycle. Returns whether new content was found.
    pub fn poll(&mut self) -> Result<bool, ReplError> {
        let copied = self.copy_producer_log()?;
        if copied > 0 {
            self.populate()?;
        }
        self.queue.garbage_collect();
        if self.queue.needs_trim(now_secs()) {
            self.trim()?;
        }
        Ok(copied > 0)
    }

    /// Poll until shutdown, sleeping whenever the producer log is empty.
    pub fn run(mut self) -> IngestStats {
        info!(
            "ingestor started, watching {}",
            self.producer_log.display()
        );
        while !self.queue.is_shut_down() {
            let found = match self.poll() {
                Ok(found) => found,
                Err(e) => {
                    warn!("replication log processing failed: {}", e);
                    false
                }
            };
            if !found && self.queue.sleep(self.idle_interval) {
                break;
            }
        }
        info!(
            "ingestor stopped ({} records queued, {} malformed)",
            self.stats.records, self.stats.malformed
        );
        self.stats
    }

    /// Queue the producer log once, without copying or truncating it, and
    /// close the queue so workers stop when they are done.
    pub fn run_once(&mut self) -> Result<OneShotReport, ReplError> {
        if file_nonempty(&self.producer_log) {
            let data = {
                let _lock = FileLock::acquire(&self.producer_log)?;
                fs::read(&self.producer_log)?
            };
            self.append_paragraphs(&data, true);
        }
        self.queue.close();
        Ok(OneShotReport {
            total: self.queue.count(CountFilter::All),
            pending: self.queue.count(CountFilter::Pending),
        })
    }
}
