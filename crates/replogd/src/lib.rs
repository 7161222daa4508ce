#![warn(missing_docs)]

//! replogd: ships a directory server's replication log to replica servers.
//!
//! The ingestor moves new change records from the server's log into a private
//! copy and an ordered in-memory queue; one worker per replica walks the
//! queue, applies each record addressed to it, checkpoints its progress in
//! the status file and records refused operations in a reject file.

pub mod cli;
pub mod config;
pub mod error;
pub mod export;
pub mod ingest;
pub mod ldif;
pub mod lock;
pub mod queue;
pub mod record;
pub mod reject;
pub mod remote;
pub mod sanity;
pub mod status;
pub mod supervisor;
pub mod worker;

pub use config::{EngineConfig, ReplicaConfig};
pub use error::{ConfigError, ConnectError, OpError, ParseError, ReplError};
pub use export::LdifExportConnector;
pub use queue::ReplicationQueue;
pub use record::{ChangeRecord, ReplicaId, Stamp};
pub use remote::{DirectoryConnector, DirectorySession};
pub use supervisor::{EngineReport, QueueDumper, RunningEngine, ShutdownHandle, Supervisor};
