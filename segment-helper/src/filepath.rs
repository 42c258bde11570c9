//! Deterministic path resolution for backup sets, pipes and control files.
//!
//! Every path is a pure function of the backup timestamp, the content id and
//! (for data) the table oid. The only other input is the pid of the process
//! that owns a pipe family, which is fixed for the lifetime of a restore and
//! handed to the helpers on their command line.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::utils::errors::{HelperError, Result};

/// Macro expanded by the database to the segment data directory in `COPY ... ON SEGMENT`.
pub const SEG_DATA_DIR: &str = "<SEG_DATA_DIR>";
/// Macro expanded by the database to the segment content id in `COPY ... ON SEGMENT`.
pub const SEGID: &str = "<SEGID>";
/// Content id of the coordinator.
pub const COORDINATOR_CONTENT: i32 = -1;

/// Returns true for exactly 14 ASCII digits (`YYYYMMDDHHMMSS`).
///
/// Future-dated timestamps are accepted; a backup may come from a time zone
/// ahead of the restoring host.
pub fn is_valid_timestamp(timestamp: &str) -> bool {
    timestamp.len() == 14 && timestamp.bytes().all(|b| b.is_ascii_digit())
}

pub fn validate_timestamp(timestamp: &str) -> Result<()> {
    if is_valid_timestamp(timestamp) {
        Ok(())
    } else {
        Err(HelperError::InvalidTimestamp(timestamp.to_string()))
    }
}

/// Backup-set files that live in the coordinator backup directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupFileKind {
    Config,
    Metadata,
    Statistics,
    Toc,
    Report,
    ErrorTablesMetadata,
    ErrorTablesData,
}

impl BackupFileKind {
    fn suffix(self) -> &'static str {
        match self {
            BackupFileKind::Config => "config.yaml",
            BackupFileKind::Metadata => "metadata.sql",
            BackupFileKind::Statistics => "statistics.sql",
            BackupFileKind::Toc => "toc.yaml",
            BackupFileKind::Report => "report",
            BackupFileKind::ErrorTablesMetadata => "error_tables_metadata",
            BackupFileKind::ErrorTablesData => "error_tables_data",
        }
    }
}

/// Path layout of one backup set as seen from one process.
#[derive(Debug, Clone)]
pub struct FilePathInfo {
    pub pid: u32,
    pub seg_dir_map: BTreeMap<i32, PathBuf>,
    pub timestamp: String,
    pub user_backup_dir: Option<PathBuf>,
    /// Only set for the legacy `<prefix><content>` directory layout.
    pub user_seg_prefix: String,
    pub report_dir: Option<PathBuf>,
}

impl FilePathInfo {
    pub fn new(
        seg_dir_map: BTreeMap<i32, PathBuf>,
        user_backup_dir: Option<PathBuf>,
        timestamp: &str,
        user_seg_prefix: &str,
        pid: u32,
    ) -> Result<Self> {
        validate_timestamp(timestamp)?;
        Ok(Self {
            pid,
            seg_dir_map,
            timestamp: timestamp.to_string(),
            user_backup_dir,
            user_seg_prefix: user_seg_prefix.to_string(),
            report_dir: None,
        })
    }

    pub fn with_report_dir(mut self, report_dir: Option<PathBuf>) -> Self {
        self.report_dir = report_dir;
        self
    }

    /// Same layout for another backup timestamp (used by incremental restore plans).
    pub fn for_timestamp(&self, timestamp: &str) -> Result<Self> {
        validate_timestamp(timestamp)?;
        let mut info = self.clone();
        info.timestamp = timestamp.to_string();
        Ok(info)
    }

    pub fn is_user_backup_dir(&self) -> bool {
        self.user_backup_dir.is_some()
    }

    fn date_dir(&self) -> &str {
        &self.timestamp[0..8]
    }

    fn seg_dir(&self, content: i32) -> PathBuf {
        self.seg_dir_map.get(&content).cloned().unwrap_or_default()
    }

    /// `<base>[/<prefix><C>]/backups/<YYYYMMDD>/<ts>`
    pub fn dir_for_content(&self, content: i32) -> PathBuf {
        let base = match &self.user_backup_dir {
            Some(dir) if !self.user_seg_prefix.is_empty() => {
                dir.join(format!("{}{}", self.user_seg_prefix, content))
            }
            Some(dir) => dir.clone(),
            None => self.seg_dir(content),
        };
        base.join("backups").join(self.date_dir()).join(&self.timestamp)
    }

    pub fn dir_for_report(&self, content: i32) -> PathBuf {
        match &self.report_dir {
            Some(dir) => dir
                .join(format!("{}{}", self.user_seg_prefix, content))
                .join("backups")
                .join(self.date_dir())
                .join(&self.timestamp),
            None => self.dir_for_content(content),
        }
    }

    fn expand_copy_macros(&self, template: &str, content: i32) -> PathBuf {
        let seg_dir = self.seg_dir(content);
        PathBuf::from(
            template
                .replace(SEG_DATA_DIR, &seg_dir.to_string_lossy())
                .replace(SEGID, &content.to_string()),
        )
    }

    /// Pipe base as written into a `COPY ... ON SEGMENT` command.
    pub fn segment_pipe_path_for_copy(&self) -> String {
        format!(
            "{}/gpbackup_{}_{}_pipe_{}",
            SEG_DATA_DIR, SEGID, self.timestamp, self.pid
        )
    }

    /// Pipe base for a concrete segment. Per-oid pipes append `_<oid>`.
    pub fn segment_pipe_path(&self, content: i32) -> PathBuf {
        self.expand_copy_macros(&self.segment_pipe_path_for_copy(), content)
    }

    pub fn table_backup_file_path_for_copy(
        &self,
        oid: u32,
        extension: &str,
        single_data_file: bool,
    ) -> String {
        let mut file_name = format!("gpbackup_{}_{}", SEGID, self.timestamp);
        if !single_data_file {
            file_name.push_str(&format!("_{}", oid));
        }
        file_name.push_str(extension);

        let base = match &self.user_backup_dir {
            Some(dir) if !self.user_seg_prefix.is_empty() => dir
                .join(format!("{}{}", self.user_seg_prefix, SEGID))
                .to_string_lossy()
                .into_owned(),
            Some(dir) => dir.to_string_lossy().into_owned(),
            None => SEG_DATA_DIR.to_string(),
        };
        format!(
            "{}/backups/{}/{}/{}",
            base.trim_end_matches('/'),
            self.date_dir(),
            self.timestamp,
            file_name
        )
    }

    pub fn table_backup_file_path(
        &self,
        content: i32,
        oid: u32,
        extension: &str,
        single_data_file: bool,
    ) -> PathBuf {
        let template = self.table_backup_file_path_for_copy(oid, extension, single_data_file);
        self.expand_copy_macros(&template, content)
    }

    pub fn backup_file_path(&self, kind: BackupFileKind) -> PathBuf {
        self.dir_for_content(COORDINATOR_CONTENT).join(format!(
            "gpbackup_{}_{}",
            self.timestamp,
            kind.suffix()
        ))
    }

    pub fn config_file_path(&self) -> PathBuf {
        self.backup_file_path(BackupFileKind::Config)
    }

    pub fn metadata_file_path(&self) -> PathBuf {
        self.backup_file_path(BackupFileKind::Metadata)
    }

    pub fn statistics_file_path(&self) -> PathBuf {
        self.backup_file_path(BackupFileKind::Statistics)
    }

    pub fn toc_file_path(&self) -> PathBuf {
        self.backup_file_path(BackupFileKind::Toc)
    }

    pub fn segment_toc_path(&self, content: i32) -> PathBuf {
        self.dir_for_content(content)
            .join(format!("gpbackup_{}_{}_toc.yaml", content, self.timestamp))
    }

    /// Helper scratch files (oid lists, launch scripts) in the segment data directory.
    pub fn segment_helper_file_path(&self, content: i32, suffix: &str) -> PathBuf {
        self.seg_dir(content).join(format!(
            "gpbackup_{}_{}_{}_{}",
            content, self.timestamp, suffix, self.pid
        ))
    }

    pub fn restore_file_path(&self, restore_timestamp: &str, kind: BackupFileKind) -> PathBuf {
        self.dir_for_report(COORDINATOR_CONTENT).join(format!(
            "gprestore_{}_{}_{}",
            self.timestamp,
            restore_timestamp,
            kind.suffix()
        ))
    }

    pub fn history_file_path(&self) -> PathBuf {
        self.seg_dir(COORDINATOR_CONTENT).join("gpbackup_history.yaml")
    }

    pub fn helper_log_path(&self, home: &Path) -> PathBuf {
        home.join("gpAdminLogs")
            .join(format!("gpbackup_helper_{}.log", self.date_dir()))
    }
}

/// Pipe serving one oid: `<pipe-base>_<oid>`.
pub fn pipe_name(pipe_base: &Path, oid: u32) -> PathBuf {
    suffixed(pipe_base, &oid.to_string())
}

/// Pipe serving one COPY pass of a multi-pass resized restore.
///
/// Single-pass restores keep the plain `<pipe-base>_<oid>` name.
pub fn pipe_name_for_batch(pipe_base: &Path, oid: u32, batch: usize, batches: usize) -> PathBuf {
    if batches <= 1 {
        pipe_name(pipe_base, oid)
    } else {
        suffixed(pipe_base, &format!("{}_{}", oid, batch))
    }
}

/// Pipe path for a `COPY ... ON SEGMENT` pass, with the database macros intact.
pub fn copy_pipe_path(pipe_template: &str, oid: u32, batch: usize, batches: usize) -> String {
    if batches <= 1 {
        format!("{}_{}", pipe_template, oid)
    } else {
        format!("{}_{}_{}", pipe_template, oid, batch)
    }
}

/// Skip signal for one oid: `<pipe-base>_skip_<oid>`.
pub fn skip_file_name(pipe_base: &Path, oid: u32) -> PathBuf {
    suffixed(pipe_base, &format!("skip_{}", oid))
}

/// Sentinel written by a helper that gave up: `<pipe-base>_error`.
pub fn error_file_name(pipe_base: &Path) -> PathBuf {
    suffixed(pipe_base, "error")
}

/// Per-table data file derived from the single-data-file name:
/// `gpbackup_<C>_<ts>.zst` becomes `gpbackup_<C>_<ts>_<oid>.zst`.
pub fn per_oid_data_file(data_file: &Path, oid: u32, extension: &str) -> PathBuf {
    let name = data_file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = if !extension.is_empty() {
        name.strip_suffix(extension).unwrap_or(&name)
    } else {
        name.as_str()
    };
    data_file.with_file_name(format!("{}_{}{}", stem, oid, extension))
}

/// Rewrites the `gpbackup_<C>_` content id of a data or TOC file name.
///
/// A resized restore reads source shards whose file names carry the source
/// content id rather than the destination's.
pub fn for_content(path: &Path, from: i32, to: i32) -> PathBuf {
    let from_prefix = format!("gpbackup_{}_", from);
    let to_prefix = format!("gpbackup_{}_", to);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    match name.strip_prefix(&from_prefix) {
        Some(rest) => path.with_file_name(format!("{}{}", to_prefix, rest)),
        None => path.to_path_buf(),
    }
}

fn suffixed(base: &Path, suffix: &str) -> PathBuf {
    let mut s = base.as_os_str().to_os_string();
    s.push("_");
    s.push(suffix);
    PathBuf::from(s)
}

/// Detects the legacy `<backup-dir>/<prefix>-1/backups` layout and returns `<prefix>`.
///
/// Returns an empty prefix for the current single-directory layout.
pub fn parse_seg_prefix(backup_dir: &Path) -> Result<String> {
    if backup_dir.as_os_str().is_empty() {
        return Ok(String::new());
    }
    match std::fs::metadata(backup_dir.join("backups")) {
        Ok(_) => return Ok(String::new()),
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
            return Err(HelperError::Config(format!(
                "Failure while trying to locate backup directory in {}. Error: {}",
                backup_dir.display(),
                e
            )))
        }
        Err(_) => {}
    }

    let mut prefixes = Vec::new();
    for entry in walkdir::WalkDir::new(backup_dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(prefix) = name.strip_suffix("-1") {
            if entry.path().join("backups").is_dir() {
                prefixes.push(prefix.to_string());
            }
        }
    }

    match prefixes.len() {
        0 => Err(HelperError::Config(format!(
            "Backup directory in {} missing",
            backup_dir.display()
        ))),
        1 => Ok(prefixes.remove(0)),
        _ => Err(HelperError::Config(format!(
            "Multiple backup directories in {}",
            backup_dir.display()
        ))),
    }
}
