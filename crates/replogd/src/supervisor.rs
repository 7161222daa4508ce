//! Engine assembly and lifecycle.
//!
//! The [`Supervisor`] checks the environment, builds the state shared by all
//! threads, and starts one ingestor thread plus one worker thread per
//! replica. The returned [`RunningEngine`] is stopped through a
//! [`ShutdownHandle`] and joined into an [`EngineReport`]. While it runs, a
//! [`QueueDumper`] writes the queue and worker states to the dump file.

use crate::config::EngineConfig;
use crate::error::ReplError;
use crate::ingest::{IngestStats, LogIngestor, OneShotReport};
use crate::queue::ReplicationQueue;
use crate::record::ReplicaId;
use crate::reject::RejectLog;
use crate::remote::DirectoryConnector;
use crate::sanity;
use crate::status::StatusTable;
use crate::worker::{ReplicaWorker, WorkerState, WorkerStateHandle, WorkerStats};
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Stops a running engine from any thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    queue: Arc<ReplicationQueue>,
}

impl ShutdownHandle {
    /// Ask every thread to stop after its current record.
    pub fn trigger(&self) {
        if !self.queue.is_shut_down() {
            info!("shutdown requested");
        }
        self.queue.shutdown();
    }

    /// Whether shutdown has been requested.
    pub fn is_triggered(&self) -> bool {
        self.queue.is_shut_down()
    }
}

/// Writes a snapshot of a running engine to the dump file.
#[derive(Clone)]
pub struct QueueDumper {
    queue: Arc<ReplicationQueue>,
    states: Vec<(ReplicaId, WorkerStateHandle)>,
    path: PathBuf,
}

impl QueueDumper {
    /// Where the dump is written.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the dump file with the current worker states and queue
    /// contents. Returns the number of queued records listed.
    pub fn dump(&self) -> Result<usize, ReplError> {
        let wrap = |source: io::Error| ReplError::Dump {
            path: self.path.clone(),
            source,
        };
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(wrap(e)),
        }
        let file = create_private(&self.path).map_err(wrap)?;
        let mut out = BufWriter::new(file);
        for (id, state) in &self.states {
            writeln!(out, "replica {}: {}", id, state.get()).map_err(wrap)?;
        }
        let listed = self.queue.dump(&mut out).map_err(wrap)?;
        info!("dumped {} queued records to {}", listed, self.path.display());
        Ok(listed)
    }

    /// Dump, logging instead of returning a failure.
    pub fn dump_or_warn(&self) {
        if let Err(e) = self.dump() {
            warn!("{}", e);
        }
    }
}

#[cfg(unix)]
fn create_private(path: &Path) -> io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn create_private(path: &Path) -> io::Result<fs::File> {
    OpenOptions::new().write(true).create_new(true).open(path)
}

/// Summary produced when the engine stops.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineReport {
    /// Per-replica counters, in configuration order.
    pub replicas: Vec<(ReplicaId, WorkerStats)>,
    /// Ingestor counters.
    pub ingest: IngestStats,
    /// Counts reported by a one-shot run.
    pub one_shot: Option<OneShotReport>,
}

/// A configured engine that has not started any thread yet.
pub struct Supervisor {
    config: EngineConfig,
    queue: Arc<ReplicationQueue>,
    status: Arc<StatusTable>,
    rejects: Arc<RejectLog>,
    connector: Arc<dyn DirectoryConnector>,
    ingestor: LogIngestor,
}

impl Supervisor {
    /// Check the environment and build the shared state.
    ///
    /// Loads the status file and, unless running one-shot, queues whatever
    /// the previous run left in the private log.
    pub fn new(
        config: EngineConfig,
        connector: Arc<dyn DirectoryConnector>,
    ) -> Result<Self, ReplError> {
        sanity::check(&config)?;

        let queue = Arc::new(ReplicationQueue::new(config.replica_ids(), config.trim));
        let status = Arc::new(StatusTable::new(config.status_path()));
        let rejects = Arc::new(RejectLog::new(config.work_dir.clone()));
        for replica in &config.replicas {
            status.add_replica(&replica.id());
        }
        let loaded = status.load()?;
        debug!(
            "loaded {} status entries from {}",
            loaded,
            status.path().display()
        );

        let mut ingestor = LogIngestor::from_config(&config, queue.clone());
        if !config.one_shot {
            ingestor.recover()?;
        }

        Ok(Self {
            config,
            queue,
            status,
            rejects,
            connector,
            ingestor,
        })
    }

    /// The configuration the engine runs with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The shared queue.
    pub fn queue(&self) -> &Arc<ReplicationQueue> {
        &self.queue
    }

    /// The shared status table.
    pub fn status(&self) -> &Arc<StatusTable> {
        &self.status
    }

    /// A handle that stops the engine once started.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            queue: self.queue.clone(),
        }
    }

    /// Start the threads.
    ///
    /// In one-shot mode the producer log is ingested here, before any
    /// worker starts, and no ingestor thread is spawned.
    pub fn start(mut self) -> Result<RunningEngine, ReplError> {
        let handle = self.shutdown_handle();
        let mut engine = RunningEngine {
            handle: handle.clone(),
            status: self.status.clone(),
            ingestor: None,
            workers: Vec::new(),
            states: Vec::new(),
            dump_path: self.config.dump_path(),
            one_shot: None,
            ingest: IngestStats::default(),
        };

        if self.config.one_shot {
            let report = self.ingestor.run_once()?;
            info!(
                "{}: {} records total, {} to process",
                self.config.producer_log.display(),
                report.total,
                report.pending
            );
            engine.one_shot = Some(report);
            engine.ingest = self.ingestor.stats();
        }

        for replica in &self.config.replicas {
            let worker = ReplicaWorker::new(
                replica.clone(),
                self.queue.clone(),
                self.status.clone(),
                self.rejects.clone(),
                self.connector.clone(),
                self.config.retry_interval(),
            );
            let id = replica.id();
            let state = worker.state_handle();
            let name = format!("replica-{}", id);
            match spawn(&name, move || worker.run()) {
                Ok(join) => {
                    engine.states.push((id.clone(), state));
                    engine.workers.push((id, join));
                }
                Err(e) => return Err(engine.abort(e)),
            }
        }

        if !self.config.one_shot {
            let ingestor = self.ingestor;
            match spawn("ingestor", move || ingestor.run()) {
                Ok(join) => engine.ingestor = Some(join),
                Err(e) => return Err(engine.abort(e)),
            }
        }

        info!(
            "replication engine started with {} replicas",
            engine.workers.len()
        );
        Ok(engine)
    }
}

fn spawn<T, F>(name: &str, f: F) -> Result<JoinHandle<T>, ReplError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map_err(|source| ReplError::ThreadSpawn {
            name: name.to_string(),
            source,
        })
}

/// Threads of a started engine.
pub struct RunningEngine {
    handle: ShutdownHandle,
    status: Arc<StatusTable>,
    ingestor: Option<JoinHandle<IngestStats>>,
    workers: Vec<(ReplicaId, JoinHandle<WorkerStats>)>,
    states: Vec<(ReplicaId, WorkerStateHandle)>,
    dump_path: PathBuf,
    one_shot: Option<OneShotReport>,
    ingest: IngestStats,
}

impl RunningEngine {
    /// A handle that stops the engine.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.handle.clone()
    }

    /// A handle that dumps the queue to the work directory.
    pub fn dumper(&self) -> QueueDumper {
        QueueDumper {
            queue: self.handle.queue.clone(),
            states: self.states.clone(),
            path: self.dump_path.clone(),
        }
    }

    /// Current state of each worker, in configuration order.
    pub fn worker_states(&self) -> Vec<(ReplicaId, WorkerState)> {
        self.states
            .iter()
            .map(|(id, state)| (id.clone(), state.get()))
            .collect()
    }

    /// Counts from the one-shot ingest, if the engine runs one-shot.
    pub fn one_shot_report(&self) -> Option<OneShotReport> {
        self.one_shot
    }

    /// Wait for every thread to exit.
    ///
    /// Without a shutdown request this only returns in one-shot mode, once
    /// the workers have drained the queue.
    pub fn join(mut self) -> EngineReport {
        let mut report = EngineReport {
            replicas: Vec::with_capacity(self.workers.len()),
            ingest: self.ingest,
            one_shot: self.one_shot,
        };
        for (id, join) in self.workers.drain(..) {
            let stats = join.join().unwrap_or_else(|_| {
                error!("replica {}: worker thread panicked", id);
                WorkerStats::default()
            });
            report.replicas.push((id, stats));
        }
        if let Some(join) = self.ingestor.take() {
            // workers are gone; the ingestor only stops on shutdown
            self.handle.trigger();
            report.ingest = join.join().unwrap_or_else(|_| {
                error!("ingestor thread panicked");
                IngestStats::default()
            });
        }
        self.status.persist_or_warn();
        info!("replication engine stopped");
        report
    }

    /// Stop the threads already started and hand back `err`.
    fn abort(self, err: ReplError) -> ReplError {
        error!("{}", err);
        self.handle.trigger();
        self.join();
        err
    }
}
