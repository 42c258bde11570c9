use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{RestoreError, Result};
use segment_helper::compression::CompressionType;
use segment_helper::filepath::is_valid_timestamp;

/// One restore-plan step: the tables whose data lives under `timestamp`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestorePlanEntry {
    pub timestamp: String,
    #[serde(rename = "tablefqns")]
    pub table_fqns: Vec<String>,
}

/// Backup manifest (`gpbackup_<ts>_config.yaml`), also the history record shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    #[serde(rename = "backupdir")]
    pub backup_dir: String,
    #[serde(rename = "backupversion")]
    pub backup_version: String,
    pub compressed: bool,
    #[serde(rename = "compressiontype")]
    pub compression_type: String,
    #[serde(rename = "databasename")]
    pub database_name: String,
    #[serde(rename = "databaseversion")]
    pub database_version: String,
    #[serde(rename = "dataonly")]
    pub data_only: bool,
    #[serde(rename = "datedeleted")]
    pub date_deleted: String,
    #[serde(rename = "excluderelations")]
    pub exclude_relations: Vec<String>,
    #[serde(rename = "excludeschemafiltered")]
    pub exclude_schema_filtered: bool,
    #[serde(rename = "excludeschemas")]
    pub exclude_schemas: Vec<String>,
    #[serde(rename = "excludetablefiltered")]
    pub exclude_table_filtered: bool,
    #[serde(rename = "includerelations")]
    pub include_relations: Vec<String>,
    #[serde(rename = "includeschemafiltered")]
    pub include_schema_filtered: bool,
    #[serde(rename = "includeschemas")]
    pub include_schemas: Vec<String>,
    #[serde(rename = "includetablefiltered")]
    pub include_table_filtered: bool,
    pub incremental: bool,
    #[serde(rename = "leafpartitiondata")]
    pub leaf_partition_data: bool,
    #[serde(rename = "metadataonly")]
    pub metadata_only: bool,
    pub plugin: String,
    #[serde(rename = "pluginversion")]
    pub plugin_version: String,
    #[serde(rename = "restoreplan")]
    pub restore_plan: Vec<RestorePlanEntry>,
    #[serde(rename = "segmentcount")]
    pub segment_count: i32,
    #[serde(rename = "singledatafile")]
    pub single_data_file: bool,
    pub timestamp: String,
    #[serde(rename = "endtime")]
    pub end_time: String,
    #[serde(rename = "withoutglobals")]
    pub without_globals: bool,
    #[serde(rename = "withstatistics")]
    pub with_statistics: bool,
}

impl BackupConfig {
    pub fn read_from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            RestoreError::InvalidManifest(format!("Cannot read {}: {}", path.display(), e))
        })?;
        let config: BackupConfig = serde_yaml::from_str(&contents).map_err(|e| {
            RestoreError::InvalidManifest(format!("{}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks that hold for every manifest written by a backup.
    pub fn validate(&self) -> Result<()> {
        if !is_valid_timestamp(&self.timestamp) {
            return Err(RestoreError::InvalidManifest(format!(
                "timestamp {:?} is not a 14-digit backup timestamp",
                self.timestamp
            )));
        }
        if let Some(last) = self.restore_plan.last() {
            if last.timestamp != self.timestamp {
                return Err(RestoreError::InvalidManifest(format!(
                    "restore plan ends at {} instead of the backup timestamp {}",
                    last.timestamp, self.timestamp
                )));
            }
        }
        if let Some(entry) = self
            .restore_plan
            .iter()
            .find(|e| !is_valid_timestamp(&e.timestamp))
        {
            return Err(RestoreError::InvalidManifest(format!(
                "restore plan entry has invalid timestamp {:?}",
                entry.timestamp
            )));
        }
        if !self.metadata_only && self.segment_count < 1 {
            return Err(RestoreError::InvalidManifest(
                "segment count is missing from the backup configuration".into(),
            ));
        }
        Ok(())
    }

    pub fn is_deleted(&self) -> bool {
        !self.date_deleted.is_empty()
    }

    /// Codec of the data files; manifests predating `compressiontype` are gzip.
    pub fn compression(&self) -> Result<CompressionType> {
        if !self.compressed {
            return Ok(CompressionType::None);
        }
        if self.compression_type.is_empty() {
            return Ok(CompressionType::Gzip);
        }
        self.compression_type
            .parse()
            .map_err(|e: segment_helper::HelperError| RestoreError::InvalidManifest(e.to_string()))
    }

    /// Rejects backups taken by a newer tool or a newer database major version.
    pub fn ensure_compatible(&self, restore_version: &str, db_major: u32) -> Result<()> {
        if let (Some(backup), Some(restore)) =
            (version_triplet(&self.backup_version), version_triplet(restore_version))
        {
            if backup > restore {
                return Err(RestoreError::InvalidManifest(format!(
                    "gprestore {} cannot restore a backup taken with gpbackup {}; please use gprestore {} or later.",
                    restore_version, self.backup_version, self.backup_version
                )));
            }
        }
        if let Some((backup_major, _, _)) = version_triplet(&self.database_version) {
            if backup_major > u64::from(db_major) {
                return Err(RestoreError::InvalidManifest(format!(
                    "Cannot restore from database version {} to major version {} due to catalog incompatibilities.",
                    self.database_version, db_major
                )));
            }
        }
        Ok(())
    }

    /// Table FQNs and their source timestamps, newest step last.
    pub fn restore_plan_or_self(&self) -> Vec<RestorePlanEntry> {
        if self.restore_plan.is_empty() {
            vec![RestorePlanEntry {
                timestamp: self.timestamp.clone(),
                table_fqns: Vec::new(),
            }]
        } else {
            self.restore_plan.clone()
        }
    }
}

/// Leading `major.minor.patch` of a version string such as `1.20.4+dev.3.gabc`
/// or `6.20.3 build commit:abc`.
pub fn version_triplet(version: &str) -> Option<(u64, u64, u64)> {
    let core = version
        .trim()
        .split(|c: char| !(c.is_ascii_digit() || c == '.'))
        .next()?;
    let mut parts = core.split('.').filter(|p| !p.is_empty());
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let patch = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    Some((major, minor, patch))
}
