//! Replica workers.
//!
//! One worker per configured replica walks the shared queue from its own
//! cursor and applies, in order, every record addressed to its replica that
//! is newer than the replica's checkpoint.

use crate::config::ReplicaConfig;
use crate::error::OpError;
use crate::queue::ReplicationQueue;
use crate::record::{ChangeRecord, ReplicaId};
use crate::reject::RejectLog;
use crate::remote::{self, DirectoryConnector, DirectorySession};
use crate::status::StatusTable;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Where a worker is in its processing cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Waiting for a record at the cursor.
    AwaitingWork,
    /// Deciding what to do with the record at the cursor.
    Evaluating,
    /// Delivering the record to the replica.
    Applying,
    /// Passing over a record that is not for this replica or already applied.
    Skipping,
    /// Releasing the record and moving the cursor.
    Advancing,
    /// Stopped.
    ShuttingDown,
}

impl WorkerState {
    /// Lower-case name, as used in queue dumps.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::AwaitingWork => "awaiting_work",
            WorkerState::Evaluating => "evaluating",
            WorkerState::Applying => "applying",
            WorkerState::Skipping => "skipping",
            WorkerState::Advancing => "advancing",
            WorkerState::ShuttingDown => "shutting_down",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read access to a worker's state from other threads.
#[derive(Debug, Clone)]
pub struct WorkerStateHandle(Arc<Mutex<WorkerState>>);

impl WorkerStateHandle {
    fn new(state: WorkerState) -> Self {
        Self(Arc::new(Mutex::new(state)))
    }

    /// The worker's current state.
    pub fn get(&self) -> WorkerState {
        *self.0.lock()
    }

    fn set(&self, state: WorkerState) {
        *self.0.lock() = state;
    }
}

/// What a worker did over its lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    /// Records applied successfully.
    pub applied: u64,
    /// Records addressed to other replicas.
    pub skipped_other: u64,
    /// Records at or below the checkpoint.
    pub skipped_old: u64,
    /// Records the replica refused; each has a reject file entry.
    pub rejected: u64,
    /// Backoff sleeps after the replica was unreachable.
    pub retries: u64,
}

/// Delivers the queue's records to one replica.
pub struct ReplicaWorker {
    replica: ReplicaConfig,
    id: ReplicaId,
    queue: Arc<ReplicationQueue>,
    status: Arc<StatusTable>,
    rejects: Arc<RejectLog>,
    connector: Arc<dyn DirectoryConnector>,
    session: Option<Box<dyn DirectorySession>>,
    retry_interval: Duration,
    cursor: u64,
    state: WorkerStateHandle,
    stats: WorkerStats,
}

impl ReplicaWorker {
    /// Create a worker for `replica`, starting at the queue's head.
    pub fn new(
        replica: ReplicaConfig,
        queue: Arc<ReplicationQueue>,
        status: Arc<StatusTable>,
        rejects: Arc<RejectLog>,
        connector: Arc<dyn DirectoryConnector>,
        retry_interval: Duration,
    ) -> Self {
        let id = replica.id();
        let cursor = queue.head_position();
        Self {
            replica,
            id,
            queue,
            status,
            rejects,
            connector,
            session: None,
            retry_interval,
            cursor,
            state: WorkerStateHandle::new(WorkerState::AwaitingWork),
            stats: WorkerStats::default(),
        }
    }

    /// The replica this worker serves.
    pub fn replica(&self) -> &ReplicaId {
        &self.id
    }

    /// Current state.
    pub fn state(&self) -> WorkerState {
        self.state.get()
    }

    /// A handle that keeps reporting the state after the worker moved to
    /// its thread.
    pub fn state_handle(&self) -> WorkerStateHandle {
        self.state.clone()
    }

    /// Counters so far.
    pub fn stats(&self) -> WorkerStats {
        self.stats
    }

    /// Process records until shutdown, or until a closed queue is drained.
    pub fn run(mut self) -> WorkerStats {
        info!("replica {}: worker started", self.id);
        loop {
            self.state.set(WorkerState::AwaitingWork);
            let Some(record) = self.queue.wait_for(self.cursor) else {
                break;
            };
            if !self.process(&record) {
                break;
            }
            self.state.set(WorkerState::Advancing);
            self.queue.release(self.cursor);
            self.cursor += 1;
        }
        self.state.set(WorkerState::ShuttingDown);
        if let Some(mut session) = self.session.take() {
            session.unbind();
        }
        info!(
            "replica {}: worker stopped ({} applied, {} rejected, {} retries)",
            self.id, self.stats.applied, self.stats.rejected, self.stats.retries
        );
        self.stats
    }

    /// Dispose of one record. Returns `false` if shutdown interrupted a
    /// retry; the record is then left unreleased.
    fn process(&mut self, record: &ChangeRecord) -> bool {
        self.state.set(WorkerState::Evaluating);
        if !record.is_for(&self.id) {
            self.state.set(WorkerState::Skipping);
            trace!("replica {}: skip {} (not mine)", self.id, record.dn);
            self.stats.skipped_other += 1;
            return true;
        }
        if !self.status.is_new(&self.id, record.stamp) {
            self.state.set(WorkerState::Skipping);
            debug!(
                "replica {}: skip {} at {} (already applied)",
                self.id, record.dn, record.stamp
            );
            self.stats.skipped_old += 1;
            return true;
        }

        self.state.set(WorkerState::Applying);
        loop {
            match self.deliver(record) {
                Ok(()) => {
                    trace!("replica {}: applied {} at {}", self.id, record.dn, record.stamp);
                    self.stats.applied += 1;
                    self.checkpoint(record);
                    return true;
                }
                Err(OpError::Fatal { msg }) => {
                    self.stats.rejected += 1;
                    if let Err(e) = self.rejects.write(&self.id, record, &msg) {
                        error!(
                            "replica {}: cannot write reject entry for {}: {}",
                            self.id, record.dn, e
                        );
                    }
                    self.checkpoint(record);
                    return true;
                }
                Err(OpError::Retryable { msg }) => {
                    self.stats.retries += 1;
                    warn!(
                        "replica {}: {}; retrying {} in {}s",
                        self.id,
                        msg,
                        record.dn,
                        self.retry_interval.as_secs()
                    );
                    if self.queue.sleep(self.retry_interval) {
                        return false;
                    }
                }
            }
        }
    }

    /// Apply `record`, connecting lazily. A dropped connection is reopened
    /// once before the failure is reported.
    fn deliver(&mut self, record: &ChangeRecord) -> Result<(), OpError> {
        let mut last = String::new();
        for _ in 0..2 {
            let mut session = match self.session.take() {
                Some(session) => session,
                None => {
                    debug!("replica {}: connecting", self.id);
                    self.connector.connect(&self.replica)?
                }
            };
            match remote::apply(session.as_mut(), record) {
                Err(OpError::Retryable { msg }) => {
                    debug!("replica {}: connection lost ({}), reconnecting", self.id, msg);
                    session.unbind();
                    last = msg;
                }
                other => {
                    self.session = Some(session);
                    return other;
                }
            }
        }
        Err(OpError::Retryable { msg: last })
    }

    fn checkpoint(&mut self, record: &ChangeRecord) {
        if self.status.update(&self.id, record.stamp) {
            self.status.persist_or_warn();
        }
    }
}
