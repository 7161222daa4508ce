//! Command line of the `replogd` binary.

use crate::config::EngineConfig;
use crate::error::ReplError;
use clap::Parser;
use std::path::PathBuf;

/// `replogd` command line.
#[derive(Debug, Parser)]
#[command(name = "replogd")]
#[command(
    about = "Ship a directory server's replication log to its replicas",
    long_about = None
)]
pub struct Cli {
    /// Configuration file (.toml, .json or slapd-style .conf).
    #[arg(short = 'f', long = "config")]
    pub config: Option<PathBuf>,

    /// Replication log to read instead of the configured one.
    #[arg(short, long)]
    pub replog: Option<PathBuf>,

    /// Directory for the private log, status file and reject files.
    #[arg(short = 't', long)]
    pub work_dir: Option<PathBuf>,

    /// Process the replication log once and exit.
    #[arg(short, long, requires = "replog")]
    pub one_shot: bool,

    /// Directory the LDIF export backend writes to.
    #[arg(long)]
    pub export_dir: Option<PathBuf>,

    /// Log filter, e.g. "info" or "replogd=debug". Overrides RUST_LOG.
    #[arg(long, env = "REPLOGD_LOG")]
    pub log_level: Option<String>,
}

impl Cli {
    /// Build the engine configuration: the config file (or defaults) with
    /// the command line overrides applied on top.
    pub fn load_config(&self) -> Result<EngineConfig, ReplError> {
        let config = match &self.config {
            Some(path) => EngineConfig::from_file(path)?,
            None => EngineConfig::default(),
        };
        self.apply_overrides(config)
    }

    fn apply_overrides(&self, mut config: EngineConfig) -> Result<EngineConfig, ReplError> {
        if let Some(replog) = &self.replog {
            config.producer_log = replog.clone();
        }
        if let Some(work_dir) = &self.work_dir {
            config.work_dir = work_dir.clone();
        }
        if let Some(export_dir) = &self.export_dir {
            config.export_dir = Some(export_dir.clone());
        }
        config.one_shot |= self.one_shot;
        config.resolve()?;
        Ok(config)
    }
}
