//! Startup checks, run before any thread starts.

use crate::config::EngineConfig;
use crate::error::ReplError;
use std::fs::{self, OpenOptions};
use std::path::Path;

fn dir_of(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

fn dir_readable(dir: &Path) -> bool {
    fs::read_dir(dir).is_ok()
}

fn dir_writable(dir: &Path) -> bool {
    let marker = dir.join(format!(".replogd-check-{}", std::process::id()));
    match OpenOptions::new().write(true).create_new(true).open(&marker) {
        Ok(_) => fs::remove_file(&marker).is_ok(),
        Err(_) => false,
    }
}

fn file_readable(path: &Path) -> bool {
    fs::File::open(path).is_ok()
}

fn file_writable(path: &Path) -> bool {
    OpenOptions::new().append(true).open(path).is_ok()
}

/// A private file that already exists must be readable and writable.
fn check_private_file(what: &str, path: &Path, problems: &mut Vec<String>) {
    if !path.exists() {
        return;
    }
    if !file_readable(path) {
        problems.push(format!("{} {} is not readable", what, path.display()));
    } else if !file_writable(path) {
        problems.push(format!("{} {} is not writable", what, path.display()));
    }
}

/// Check everything the engine needs before it starts.
///
/// Every problem is collected; the result is an error listing all of them.
pub fn check(config: &EngineConfig) -> Result<(), ReplError> {
    let mut problems = Vec::new();

    if config.replicas.is_empty() {
        problems.push("no replicas configured".to_string());
    }

    let producer = &config.producer_log;
    let producer_dir = dir_of(producer);
    if !producer_dir.is_dir() {
        problems.push(format!(
            "directory of replication log {} does not exist",
            producer.display()
        ));
    } else if !dir_readable(producer_dir) {
        problems.push(format!(
            "directory of replication log {} is not readable",
            producer.display()
        ));
    } else if producer.exists() && !file_readable(producer) {
        problems.push(format!(
            "replication log {} is not readable",
            producer.display()
        ));
    }

    let work_dir = &config.work_dir;
    if !work_dir.is_dir() {
        problems.push(format!("work directory {} does not exist", work_dir.display()));
    } else if !dir_readable(work_dir) {
        problems.push(format!("work directory {} is not readable", work_dir.display()));
    } else if !dir_writable(work_dir) {
        problems.push(format!("work directory {} is not writable", work_dir.display()));
    } else {
        check_private_file("private replication log", &config.private_log_path(), &mut problems);
        check_private_file("status file", &config.status_path(), &mut problems);
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(ReplError::Sanity { problems })
    }
}
