//! LDIF export backend.
//!
//! Instead of talking to a live server, every operation applied to a replica
//! is appended as an LDIF change record to `<dir>/<host>:<port>.ldif`. This
//! is used for dry runs and offline batch replay; the resulting files can be
//! loaded with any LDIF-aware tool.

use crate::config::ReplicaConfig;
use crate::error::{ConnectError, OpError};
use crate::ldif;
use crate::record::{AttributeValue, Change, Modification, ReplicaId};
use crate::remote::{DirectoryConnector, DirectorySession};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Connector writing each replica's operations to an LDIF file.
#[derive(Debug, Clone)]
pub struct LdifExportConnector {
    dir: PathBuf,
}

impl LdifExportConnector {
    /// Export into `dir`, which is created on first connect if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of the export file for `replica`.
    pub fn path_for(&self, replica: &ReplicaId) -> PathBuf {
        export_path(&self.dir, replica)
    }
}

fn export_path(dir: &Path, replica: &ReplicaId) -> PathBuf {
    let sep = if cfg!(windows) { ',' } else { ':' };
    dir.join(format!("{}{}{}.ldif", replica.host, sep, replica.port))
}

impl DirectoryConnector for LdifExportConnector {
    fn connect(&self, replica: &ReplicaConfig) -> Result<Box<dyn DirectorySession>, ConnectError> {
        let id = replica.id();
        let connect_err = |e: std::io::Error| ConnectError {
            replica: id.to_string(),
            msg: e.to_string(),
        };
        fs::create_dir_all(&self.dir).map_err(connect_err)?;
        let path = self.path_for(&id);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(connect_err)?;
        debug!("exporting changes for {} to {}", id, path.display());
        Ok(Box::new(LdifExportSession { file, path }))
    }
}

struct LdifExportSession {
    file: File,
    path: PathBuf,
}

impl LdifExportSession {
    fn emit(&mut self, dn: &str, change: Change) -> Result<(), OpError> {
        let mut out = String::new();
        ldif::put_value(&mut out, "dn", dn.as_bytes());
        ldif::put_folded(&mut out, &format!("changetype: {}", change.kind().as_str()));
        change.write_body(&mut out);
        out.push('\n');
        self.file
            .write_all(out.as_bytes())
            .and_then(|()| self.file.sync_data())
            .map_err(|e| OpError::retryable(format!("{}: {}", self.path.display(), e)))
    }
}

impl DirectorySession for LdifExportSession {
    fn add(&mut self, dn: &str, attributes: &[AttributeValue]) -> Result<(), OpError> {
        self.emit(
            dn,
            Change::Add {
                attributes: attributes.to_vec(),
            },
        )
    }

    fn modify(&mut self, dn: &str, modifications: &[Modification]) -> Result<(), OpError> {
        self.emit(
            dn,
            Change::Modify {
                modifications: modifications.to_vec(),
            },
        )
    }

    fn delete(&mut self, dn: &str) -> Result<(), OpError> {
        self.emit(dn, Change::Delete)
    }

    fn rename(
        &mut self,
        dn: &str,
        new_rdn: &str,
        delete_old_rdn: bool,
        new_superior: Option<&str>,
    ) -> Result<(), OpError> {
        self.emit(
            dn,
            Change::Rename {
                new_rdn: new_rdn.to_string(),
                delete_old_rdn,
                new_superior: new_superior.map(str::to_string),
            },
        )
    }
}
