//! Restore report and error-table files written next to the backup.

use chrono::{DateTime, Local};
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::Result;
use segment_helper::filepath::{BackupFileKind, FilePathInfo};
use segment_helper::transfer::progress::format_duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreStatus {
    Success,
    NonFatalErrors,
    Failure(String),
}

impl RestoreStatus {
    pub fn describe(&self) -> String {
        match self {
            RestoreStatus::Success => "Success".into(),
            RestoreStatus::NonFatalErrors => "Success but non-fatal errors occurred".into(),
            RestoreStatus::Failure(reason) => format!("Failure\nrestore error: {}", reason),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RestoreReport {
    pub backup_timestamp: String,
    pub restore_timestamp: String,
    pub database_name: String,
    pub backup_database_version: String,
    pub restore_database_version: String,
    pub backup_version: String,
    pub plugin: Option<String>,
    pub orig_segment_count: i32,
    pub dest_segment_count: i32,
    pub tables_restored: usize,
    pub tables_total: usize,
    pub data_errors: usize,
    pub metadata_errors: usize,
    pub start: DateTime<Local>,
    pub end: DateTime<Local>,
    pub status: RestoreStatus,
}

impl RestoreReport {
    pub fn new(backup_timestamp: &str, restore_timestamp: &str) -> Self {
        let now = Local::now();
        Self {
            backup_timestamp: backup_timestamp.to_string(),
            restore_timestamp: restore_timestamp.to_string(),
            database_name: String::new(),
            backup_database_version: String::new(),
            restore_database_version: String::new(),
            backup_version: String::new(),
            plugin: None,
            orig_segment_count: 0,
            dest_segment_count: 0,
            tables_restored: 0,
            tables_total: 0,
            data_errors: 0,
            metadata_errors: 0,
            start: now,
            end: now,
            status: RestoreStatus::Success,
        }
    }

    /// Stamps the end time and derives the status from the error counts
    /// unless a failure was already recorded.
    pub fn finish(&mut self, failure: Option<String>) {
        self.end = Local::now();
        self.status = match failure {
            Some(reason) => RestoreStatus::Failure(reason),
            None if self.data_errors + self.metadata_errors > 0 => RestoreStatus::NonFatalErrors,
            None => RestoreStatus::Success,
        };
    }

    pub fn render(&self) -> String {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".into());
        let elapsed = (self.end - self.start).num_seconds().max(0) as u64;

        let mut out = String::new();
        let _ = writeln!(out, "Restore Report\n");
        let mut row = |key: &str, value: &str| {
            let _ = writeln!(out, "{:<28}{}", format!("{}:", key), value);
        };
        row("timestamp key", &self.backup_timestamp);
        row("restore timestamp", &self.restore_timestamp);
        row("coordinator host", &host);
        row("gpbackup version", &self.backup_version);
        row("gprestore version", segment_helper::VERSION);
        row("database name", &self.database_name);
        row("backup database version", &self.backup_database_version);
        row("restore database version", &self.restore_database_version);
        row("plugin executable", self.plugin.as_deref().unwrap_or("None"));
        row(
            "segment count",
            &format!("{} -> {}", self.orig_segment_count, self.dest_segment_count),
        );
        row("start time", &self.start.format("%a %b %d %Y %H:%M:%S").to_string());
        row("end time", &self.end.format("%a %b %d %Y %H:%M:%S").to_string());
        row("duration", &format_duration(elapsed));
        row(
            "tables restored",
            &format!("{}/{}", self.tables_restored, self.tables_total),
        );
        row("data errors", &self.data_errors.to_string());
        row("metadata errors", &self.metadata_errors.to_string());
        row("restore status", &self.status.describe());
        out
    }

    pub fn path(&self, fp_info: &FilePathInfo) -> PathBuf {
        fp_info.restore_file_path(&self.restore_timestamp, BackupFileKind::Report)
    }

    pub fn write(&self, fp_info: &FilePathInfo) -> Result<PathBuf> {
        let path = self.path(fp_info);
        write_file(&path, &self.render())?;
        info!(path = %path.display(), "Wrote restore report");
        Ok(path)
    }
}

/// Writes the sorted FQNs in `tables`, one per line. Nothing is written for an
/// empty set.
pub fn write_error_tables(
    fp_info: &FilePathInfo,
    restore_timestamp: &str,
    kind: BackupFileKind,
    tables: &BTreeSet<String>,
) -> Result<Option<PathBuf>> {
    if tables.is_empty() {
        return Ok(None);
    }
    let path = fp_info.restore_file_path(restore_timestamp, kind);
    let mut contents = tables.iter().cloned().collect::<Vec<_>>().join("\n");
    contents.push('\n');
    write_file(&path, &contents)?;
    warn!(
        count = tables.len(),
        path = %path.display(),
        "Tables with errors were written for a later retry"
    );
    Ok(Some(path))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents)?;
    Ok(())
}
