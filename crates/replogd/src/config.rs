//! Daemon configuration.
//!
//! Configuration is read from TOML or JSON, or from the directory server's
//! own `slapd.conf` (its `replogfile` and `replica` directives).

use crate::error::{ConfigError, ReplError};
use crate::queue::TrimPolicy;
use crate::record::{ReplicaId, DEFAULT_PORT};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Port used for `ldaps://` URIs without an explicit port.
pub const DEFAULT_LDAPS_PORT: u16 = 636;

/// File name of the private copy of the replication log.
pub const PRIVATE_LOG_NAME: &str = "replogd.replog";

/// File name of the status file.
pub const STATUS_FILE_NAME: &str = "replogd.status";

/// File name of the on-demand queue dump.
pub const DUMP_FILE_NAME: &str = "replogd.dump";

/// How the daemon authenticates to a replica.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindMethod {
    /// DN and password.
    #[default]
    Simple,
    /// SASL with the configured mechanism.
    Sasl,
    /// Kerberos v4; accepted by the readers only to be refused by validation.
    Kerberos,
}

/// Whether StartTLS is negotiated before binding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    /// Plain connection.
    #[default]
    Off,
    /// Try StartTLS, continue without it on failure.
    On,
    /// StartTLS must succeed.
    Critical,
}

/// One replica server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicaConfig {
    /// Host name; filled from `uri` when that is given.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// `ldap://host:port` or `ldaps://host:port`; replaces host and port.
    pub uri: Option<String>,
    /// DN to bind as.
    pub bind_dn: Option<String>,
    /// Authentication method.
    pub bind_method: BindMethod,
    /// Password for simple binds.
    pub credentials: Option<String>,
    /// SASL mechanism.
    pub sasl_mech: Option<String>,
    /// SASL realm.
    pub realm: Option<String>,
    /// SASL authentication identity.
    pub authc_id: Option<String>,
    /// SASL authorization identity.
    pub authz_id: Option<String>,
    /// SASL security properties.
    pub secprops: Option<String>,
    /// Kerberos service table; kept for old configurations, never used.
    pub srvtab: Option<PathBuf>,
    /// StartTLS policy.
    pub tls: TlsMode,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_PORT,
            uri: None,
            bind_dn: None,
            bind_method: BindMethod::Simple,
            credentials: None,
            sasl_mech: None,
            realm: None,
            authc_id: None,
            authz_id: None,
            secprops: None,
            srvtab: None,
            tls: TlsMode::Off,
        }
    }
}

impl ReplicaConfig {
    /// A simple-bind replica at `host:port`.
    pub fn new(host: impl Into<String>, port: u16, bind_dn: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            bind_dn: Some(bind_dn.into()),
            ..Self::default()
        }
    }

    /// The identity used in log records, status and reject files.
    pub fn id(&self) -> ReplicaId {
        ReplicaId::new(self.host.clone(), self.port)
    }

    fn label(&self) -> String {
        match (&self.uri, self.host.is_empty()) {
            (Some(uri), _) => uri.clone(),
            (None, true) => "(no host)".to_string(),
            (None, false) => format!("{}:{}", self.host, self.port),
        }
    }

    /// Take host and port from `uri` (if set) and check the bind settings.
    pub fn resolve(&mut self) -> Result<(), ConfigError> {
        if let Some(uri) = &self.uri {
            let (host, port) = parse_uri(uri)?;
            self.host = host;
            self.port = port;
        }
        match self.bind_method {
            BindMethod::Kerberos => {
                return Err(ConfigError::KerberosUnsupported {
                    replica: self.label(),
                })
            }
            BindMethod::Sasl => {
                if self.sasl_mech.as_deref().map_or(true, str::is_empty) {
                    return Err(ConfigError::MissingField {
                        field: "saslmech",
                        replica: self.label(),
                    });
                }
            }
            BindMethod::Simple => {
                if self.bind_dn.as_deref().map_or(true, str::is_empty) {
                    return Err(ConfigError::MissingField {
                        field: "binddn",
                        replica: self.label(),
                    });
                }
            }
        }
        if self.host.is_empty() {
            return Err(ConfigError::MissingField {
                field: "host",
                replica: self.label(),
            });
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "port",
                value: self.label(),
            });
        }
        Ok(())
    }
}

/// Split an `ldap[s]://host[:port]` URI.
pub fn parse_uri(uri: &str) -> Result<(String, u16), ConfigError> {
    let invalid = || ConfigError::InvalidValue {
        field: "uri",
        value: uri.to_string(),
    };
    let url = Url::parse(uri).map_err(|_| invalid())?;
    let default_port = match url.scheme() {
        "ldap" => DEFAULT_PORT,
        "ldaps" => DEFAULT_LDAPS_PORT,
        _ => return Err(invalid()),
    };
    let host = url.host_str().filter(|h| !h.is_empty()).ok_or_else(invalid)?;
    Ok((host.to_string(), url.port().unwrap_or(default_port)))
}

fn default_producer_log() -> PathBuf {
    PathBuf::from("/var/lib/ldap/replog")
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("/var/lib/replogd")
}

/// Configuration of the whole engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// The log the directory server appends changes to.
    pub producer_log: PathBuf,
    /// Directory holding the private log, status file and reject files.
    pub work_dir: PathBuf,
    /// Replicas to ship changes to.
    pub replicas: Vec<ReplicaConfig>,
    /// Seconds the ingestor sleeps when the producer log had nothing new.
    pub idle_interval_secs: u64,
    /// Seconds a worker waits before retrying an unreachable replica.
    pub retry_interval_secs: u64,
    /// Process the producer log once and exit.
    pub one_shot: bool,
    /// When the private log is compacted.
    pub trim: TrimPolicy,
    /// Directory for the LDIF export backend.
    pub export_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            producer_log: default_producer_log(),
            work_dir: default_work_dir(),
            replicas: Vec::new(),
            idle_interval_secs: 3,
            retry_interval_secs: 60,
            one_shot: false,
            trim: TrimPolicy::default(),
            export_dir: None,
        }
    }
}

impl EngineConfig {
    /// Read a configuration file, choosing the reader by extension.
    ///
    /// `.toml` and `.json` hold an `EngineConfig` directly; `.conf` is read
    /// as a `slapd.conf`, everything it does not say keeps its default.
    pub fn from_file(path: &Path) -> Result<Self, ReplError> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let mut config = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str::<EngineConfig>(&contents).map_err(|e| {
                ConfigError::Syntax {
                    msg: e.to_string(),
                }
            })?,
            "json" => serde_json::from_str::<EngineConfig>(&contents).map_err(|e| {
                ConfigError::Syntax {
                    msg: e.to_string(),
                }
            })?,
            "conf" => {
                let slapd = parse_slapd_conf(&contents)?;
                EngineConfig {
                    producer_log: slapd.replogfile.unwrap_or_else(default_producer_log),
                    replicas: slapd.replicas,
                    ..EngineConfig::default()
                }
            }
            _ => {
                return Err(ConfigError::UnsupportedFormat {
                    ext: ext.to_string(),
                }
                .into())
            }
        };
        config.resolve()?;
        debug!(
            "read {} replicas from {}",
            config.replicas.len(),
            path.display()
        );
        Ok(config)
    }

    /// Resolve and check every replica, and reject duplicates.
    pub fn resolve(&mut self) -> Result<(), ConfigError> {
        for replica in &mut self.replicas {
            replica.resolve()?;
        }
        for (i, replica) in self.replicas.iter().enumerate() {
            if self.replicas[..i].iter().any(|r| r.id() == replica.id()) {
                return Err(ConfigError::InvalidValue {
                    field: "replica",
                    value: format!("{} configured twice", replica.id()),
                });
            }
        }
        if self.idle_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "idle_interval_secs",
                value: "0".to_string(),
            });
        }
        Ok(())
    }

    /// Identities of the configured replicas, in configuration order.
    pub fn replica_ids(&self) -> Vec<ReplicaId> {
        self.replicas.iter().map(ReplicaConfig::id).collect()
    }

    /// Path of the private copy of the replication log.
    pub fn private_log_path(&self) -> PathBuf {
        self.work_dir.join(PRIVATE_LOG_NAME)
    }

    /// Path of the status file.
    pub fn status_path(&self) -> PathBuf {
        self.work_dir.join(STATUS_FILE_NAME)
    }

    /// Path the queue is dumped to on request.
    pub fn dump_path(&self) -> PathBuf {
        self.work_dir.join(DUMP_FILE_NAME)
    }

    /// Ingestor idle sleep.
    pub fn idle_interval(&self) -> Duration {
        Duration::from_secs(self.idle_interval_secs)
    }

    /// Worker backoff after an unreachable replica.
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }
}

/// What a `slapd.conf` tells the replication daemon.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlapdConf {
    /// `replogfile` directive.
    pub replogfile: Option<PathBuf>,
    /// One entry per `replica` directive, in file order.
    pub replicas: Vec<ReplicaConfig>,
}

/// Read the `replogfile` and `replica` directives of a `slapd.conf`.
///
/// Every other directive is ignored.
pub fn parse_slapd_conf(text: &str) -> Result<SlapdConf, ConfigError> {
    let mut conf = SlapdConf::default();
    for (lineno, line) in join_continuations(text) {
        if line.starts_with('#') || line.trim().is_empty() {
            continue;
        }
        let args = tokenize(&line);
        let Some(directive) = args.first() else {
            continue;
        };
        if directive.eq_ignore_ascii_case("replogfile") {
            let path = args.get(1).ok_or_else(|| ConfigError::Syntax {
                msg: format!("line {}: missing filename in \"replogfile <filename>\"", lineno),
            })?;
            conf.replogfile = Some(PathBuf::from(path));
        } else if directive.eq_ignore_ascii_case("replica") {
            conf.replicas.push(parse_replica_args(&args[1..], lineno)?);
        }
    }
    Ok(conf)
}

/// Join lines starting with whitespace onto the previous line.
/// Yields each logical line with the number of its first physical line.
fn join_continuations(text: &str) -> Vec<(usize, String)> {
    let mut lines: Vec<(usize, String)> = Vec::new();
    for (i, raw) in text.lines().enumerate() {
        let continues = raw.starts_with(|c: char| c.is_ascii_whitespace());
        match lines.last_mut() {
            Some((_, last)) if continues => last.push_str(raw),
            _ => lines.push((i + 1, raw.to_string())),
        }
    }
    lines
}

/// Split on blanks, honouring `"` quotes and `\` escapes.
fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut in_quote = false;
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '"' => {
                in_quote = !in_quote;
                in_token = true;
            }
            '\\' => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
                in_token = true;
            }
            ' ' | '\t' if !in_quote => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            _ => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    tokens
}

fn parse_replica_args(args: &[String], lineno: usize) -> Result<ReplicaConfig, ConfigError> {
    let mut replica = ReplicaConfig::default();
    let mut got_host = false;
    let mut got_method = false;
    for arg in args {
        let (key, value) = arg.split_once('=').ok_or_else(|| ConfigError::Syntax {
            msg: format!("line {}: replica argument {:?} is not key=value", lineno, arg),
        })?;
        match key.to_ascii_lowercase().as_str() {
            "host" => {
                let id = ReplicaId::parse(value).map_err(|_| ConfigError::InvalidValue {
                    field: "host",
                    value: value.to_string(),
                })?;
                replica.host = id.host;
                replica.port = id.port;
                got_host = true;
            }
            "uri" => {
                parse_uri(value)?;
                replica.uri = Some(value.to_string());
                got_host = true;
            }
            "binddn" => replica.bind_dn = Some(value.to_string()),
            "bindmethod" => {
                replica.bind_method = match value.to_ascii_lowercase().as_str() {
                    "simple" => BindMethod::Simple,
                    "sasl" => BindMethod::Sasl,
                    "kerberos" => BindMethod::Kerberos,
                    _ => {
                        return Err(ConfigError::InvalidValue {
                            field: "bindmethod",
                            value: value.to_string(),
                        })
                    }
                };
                got_method = true;
            }
            "credentials" => replica.credentials = Some(value.to_string()),
            "saslmech" => replica.sasl_mech = Some(value.to_string()),
            "realm" => replica.realm = Some(value.to_string()),
            "authcid" | "bindprincipal" => replica.authc_id = Some(value.to_string()),
            "authzid" => replica.authz_id = Some(value.to_string()),
            "secprops" => replica.secprops = Some(value.to_string()),
            "srvtab" => replica.srvtab = Some(PathBuf::from(value)),
            "tls" | "starttls" => {
                replica.tls = match value.to_ascii_lowercase().as_str() {
                    "critical" => TlsMode::Critical,
                    "no" | "off" => TlsMode::Off,
                    _ => TlsMode::On,
                }
            }
            _ => {
                return Err(ConfigError::Syntax {
                    msg: format!("line {}: unknown replica keyword {:?}", lineno, key),
                })
            }
        }
    }
    if !got_host {
        return Err(ConfigError::MissingField {
            field: "host",
            replica: format!("on line {}", lineno),
        });
    }
    if !got_method {
        return Err(ConfigError::MissingField {
            field: "bindmethod",
            replica: replica.label(),
        });
    }
    Ok(replica)
}
