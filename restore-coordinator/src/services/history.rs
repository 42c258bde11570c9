//! Backup history file (`gpbackup_history.yaml`).
//!
//! Every write happens under an exclusive lock file at a fixed path. The file is
//! made owner-writable only for the duration of a write.

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::Result;
use crate::models::backup_config::BackupConfig;

pub const HISTORY_LOCK_FILE: &str = "gpbackup_history.yaml.lck";
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    #[serde(rename = "backupconfigs", default)]
    pub backup_configs: Vec<BackupConfig>,
}

impl History {
    /// Inserts `config`, replacing any record with the same timestamp, and keeps
    /// records sorted newest first.
    pub fn add(&mut self, config: BackupConfig) {
        self.backup_configs
            .retain(|existing| existing.timestamp != config.timestamp);
        self.backup_configs.push(config);
        self.backup_configs
            .sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    }

    pub fn find(&self, timestamp: &str) -> Option<&BackupConfig> {
        self.backup_configs.iter().find(|c| c.timestamp == timestamp)
    }
}

/// Lock file held for the lifetime of the guard.
#[derive(Debug)]
pub struct HistoryLock {
    path: PathBuf,
}

impl HistoryLock {
    /// Creates the lock file, retrying every 50ms while another process holds it.
    /// A lock naming a process that no longer exists is taken over.
    pub async fn acquire(path: &Path) -> Result<Self> {
        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
            {
                Ok(mut file) => {
                    let _ = writeln!(file, "{}", std::process::id());
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if let Some(pid) = stale_holder(path) {
                        warn!(
                            pid,
                            "Removing history lock {} left by an exited process",
                            path.display()
                        );
                        match std::fs::remove_file(path) {
                            Ok(()) => continue,
                            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                            Err(e) => return Err(e.into()),
                        }
                    }
                    tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Pid recorded in the lock file when that process is gone. An unreadable or
/// half-written lock counts as held.
fn stale_holder(path: &Path) -> Option<i32> {
    let contents = std::fs::read_to_string(path).ok()?;
    let pid: i32 = contents.trim().parse().ok()?;
    if pid <= 0 {
        return None;
    }
    match kill(Pid::from_raw(pid), None) {
        Err(Errno::ESRCH) => Some(pid),
        _ => None,
    }
}

impl Drop for HistoryLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to release history lock {}: {}", self.path.display(), e);
        }
    }
}

#[derive(Debug, Clone)]
pub struct HistoryStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl HistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock_path: std::env::temp_dir().join(HISTORY_LOCK_FILE),
        }
    }

    pub fn with_lock_path(mut self, lock_path: impl Into<PathBuf>) -> Self {
        self.lock_path = lock_path.into();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records sorted by descending timestamp; a missing file reads as empty.
    pub fn read(&self) -> Result<History> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(History::default()),
            Err(e) => return Err(e.into()),
        };
        let mut history: History = serde_yaml::from_str(&contents)?;
        history
            .backup_configs
            .sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(history)
    }

    pub async fn append(&self, mut config: BackupConfig) -> Result<()> {
        let _lock = HistoryLock::acquire(&self.lock_path).await?;
        let mut history = self.read()?;
        if history.backup_configs.is_empty() {
            debug!("No existing backups found. Creating new backup history file.");
        }
        config.end_time = current_timestamp();
        history.add(config);
        self.write_read_only(&history)
    }

    pub async fn rewrite(&self, history: &History) -> Result<()> {
        let _lock = HistoryLock::acquire(&self.lock_path).await?;
        self.write_read_only(history)
    }

    pub fn find(&self, timestamp: &str) -> Result<Option<BackupConfig>> {
        Ok(self.read()?.find(timestamp).cloned())
    }

    /// Stamps `date_deleted` on the record for `timestamp`. Returns false when
    /// no such record exists.
    pub async fn mark_deleted(&self, timestamp: &str, date: &str) -> Result<bool> {
        let _lock = HistoryLock::acquire(&self.lock_path).await?;
        let mut history = self.read()?;
        let Some(record) = history
            .backup_configs
            .iter_mut()
            .find(|c| c.timestamp == timestamp)
        else {
            return Ok(false);
        };
        record.date_deleted = date.to_string();
        self.write_read_only(&history)?;
        Ok(true)
    }

    fn write_read_only(&self, history: &History) -> Result<()> {
        let contents = serde_yaml::to_string(history)?;
        if self.path.exists() {
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o644))?;
        }
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)?;
        file.write_all(contents.as_bytes())?;
        file.set_permissions(std::fs::Permissions::from_mode(0o444))?;
        file.sync_all()?;
        Ok(())
    }
}

/// Local time as a 14-digit backup timestamp.
pub fn current_timestamp() -> String {
    chrono::Local::now().format("%Y%m%d%H%M%S").to_string()
}
