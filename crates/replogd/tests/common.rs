//! Common test utilities and fixtures for integration tests.

#![allow(dead_code)]

use parking_lot::Mutex;
use replogd::config::ReplicaConfig;
use replogd::record::{AttributeValue, Modification};
use replogd::{ConnectError, DirectoryConnector, DirectorySession, EngineConfig, OpError};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Everything the recording connector saw, shared between sessions.
#[derive(Default)]
pub struct Recording {
    ops: Mutex<Vec<String>>,
    connects: Mutex<u64>,
    refused_dns: Mutex<HashSet<String>>,
    offline_hosts: Mutex<HashSet<String>>,
}

impl Recording {
    /// Operations applied so far, as `"<host> <op> <dn>"`.
    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().clone()
    }

    /// Operations applied to one host, in order.
    pub fn ops_for(&self, host: &str) -> Vec<String> {
        let prefix = format!("{} ", host);
        self.ops
            .lock()
            .iter()
            .filter_map(|op| op.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }

    /// Number of sessions opened.
    pub fn connects(&self) -> u64 {
        *self.connects.lock()
    }

    /// Make every operation on `dn` fail fatally.
    pub fn refuse(&self, dn: &str) {
        self.refused_dns.lock().insert(dn.to_string());
    }

    /// Stop refusing operations on `dn`.
    pub fn accept(&self, dn: &str) {
        self.refused_dns.lock().remove(dn);
    }

    /// Make `host` unreachable.
    pub fn take_offline(&self, host: &str) {
        self.offline_hosts.lock().insert(host.to_string());
    }

    /// Make `host` reachable again.
    pub fn bring_online(&self, host: &str) {
        self.offline_hosts.lock().remove(host);
    }
}

/// In-process connector recording every operation instead of sending it.
pub struct RecordingConnector {
    pub recording: Arc<Recording>,
}

impl RecordingConnector {
    pub fn new() -> (Arc<Self>, Arc<Recording>) {
        let recording = Arc::new(Recording::default());
        (
            Arc::new(Self {
                recording: recording.clone(),
            }),
            recording,
        )
    }
}

impl DirectoryConnector for RecordingConnector {
    fn connect(&self, replica: &ReplicaConfig) -> Result<Box<dyn DirectorySession>, ConnectError> {
        *self.recording.connects.lock() += 1;
        if self.recording.offline_hosts.lock().contains(&replica.host) {
            return Err(ConnectError {
                replica: replica.id().to_string(),
                msg: "connection refused".to_string(),
            });
        }
        Ok(Box::new(RecordingSession {
            host: replica.host.clone(),
            recording: self.recording.clone(),
        }))
    }
}

struct RecordingSession {
    host: String,
    recording: Arc<Recording>,
}

impl RecordingSession {
    fn record(&self, op: &str, dn: &str) -> Result<(), OpError> {
        if self.recording.offline_hosts.lock().contains(&self.host) {
            return Err(OpError::retryable("server down"));
        }
        if self.recording.refused_dns.lock().contains(dn) {
            return Err(OpError::fatal("Already exists"));
        }
        self.recording
            .ops
            .lock()
            .push(format!("{} {} {}", self.host, op, dn));
        Ok(())
    }
}

impl DirectorySession for RecordingSession {
    fn add(&mut self, dn: &str, _attributes: &[AttributeValue]) -> Result<(), OpError> {
        self.record("add", dn)
    }

    fn modify(&mut self, dn: &str, _modifications: &[Modification]) -> Result<(), OpError> {
        self.record("modify", dn)
    }

    fn delete(&mut self, dn: &str) -> Result<(), OpError> {
        self.record("delete", dn)
    }

    fn rename(
        &mut self,
        dn: &str,
        _new_rdn: &str,
        _delete_old_rdn: bool,
        _new_superior: Option<&str>,
    ) -> Result<(), OpError> {
        self.record("rename", dn)
    }
}

/// A temporary producer log and work directory with a configuration
/// pointing at them.
pub struct TestEnv {
    pub dir: TempDir,
    pub config: EngineConfig,
}

impl TestEnv {
    /// Two replicas, `ldap1:389` and `ldap2:389`, with fast polling.
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let work_dir = dir.path().join("work");
        fs::create_dir(&work_dir).unwrap();
        let config = EngineConfig {
            producer_log: dir.path().join("replog"),
            work_dir,
            replicas: vec![
                ReplicaConfig::new("ldap1", 389, "cn=replicator,dc=example"),
                ReplicaConfig::new("ldap2", 389, "cn=replicator,dc=example"),
            ],
            idle_interval_secs: 1,
            retry_interval_secs: 1,
            ..EngineConfig::default()
        };
        Self { dir, config }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Append `text` to the producer log.
    pub fn produce(&self, text: &str) {
        use std::io::Write;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.config.producer_log)
            .unwrap();
        file.write_all(text.as_bytes()).unwrap();
    }

    pub fn status_text(&self) -> String {
        fs::read_to_string(self.config.status_path()).unwrap_or_default()
    }
}

/// A delete record for the given replicas.
pub fn delete_record(replicas: &[&str], time: &str, dn: &str) -> String {
    let mut out = String::new();
    for replica in replicas {
        out.push_str(&format!("replica: {}\n", replica));
    }
    out.push_str(&format!("time: {}\ndn: {}\nchangetype: delete\n\n", time, dn));
    out
}

/// An add record for the given replicas.
pub fn add_record(replicas: &[&str], time: &str, dn: &str) -> String {
    let mut out = String::new();
    for replica in replicas {
        out.push_str(&format!("replica: {}\n", replica));
    }
    out.push_str(&format!(
        "time: {}\ndn: {}\nchangetype: add\nobjectClass: person\ncn: test\n\n",
        time, dn
    ));
    out
}

/// Poll `cond` until it holds or ten seconds pass.
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    cond()
}
