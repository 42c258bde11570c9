use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{RestoreError, Result};
use segment_helper::filepath::{validate_timestamp, COORDINATOR_CONTENT};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub cluster: ClusterConfig,
    pub database: DatabaseConfig,
    pub restore: RestoreSettings,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecMode {
    #[default]
    Local,
    Ssh,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub exec_mode: ExecMode,
    pub ssh_user: Option<String>,
    pub ssh_port: u16,
    pub ssh_identity_file: Option<PathBuf>,
    pub segments: Vec<SegmentConfig>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            exec_mode: ExecMode::Local,
            ssh_user: None,
            ssh_port: 22,
            ssh_identity_file: None,
            segments: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SegmentConfig {
    pub content_id: i32,
    pub hostname: String,
    pub port: u16,
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub dbname: Option<String>,
    pub password: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 5432,
            user: std::env::var("USER").unwrap_or_else(|_| "gpadmin".into()),
            dbname: None,
            password: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RestoreSettings {
    pub timestamp: Option<String>,
    pub backup_dir: Option<PathBuf>,
    pub report_dir: Option<PathBuf>,
    pub jobs: usize,
    pub on_error_continue: bool,
    pub truncate_table: bool,
    pub incremental: bool,
    pub redirect_schema: Option<String>,
    pub resize_cluster: bool,
    pub data_only: bool,
    pub metadata_only: bool,
    pub with_globals: bool,
    pub with_stats: bool,
    pub include_schemas: Vec<String>,
    pub exclude_schemas: Vec<String>,
    pub include_relations: Vec<String>,
    pub exclude_relations: Vec<String>,
    pub plugin_config: Option<PathBuf>,
    pub helper_path: String,
    pub copy_queue_size: usize,
    pub include_partition_root_in_ao_metadata: bool,
}

impl Default for RestoreSettings {
    fn default() -> Self {
        Self {
            timestamp: None,
            backup_dir: None,
            report_dir: None,
            jobs: 1,
            on_error_continue: false,
            truncate_table: false,
            incremental: false,
            redirect_schema: None,
            resize_cluster: false,
            data_only: false,
            metadata_only: false,
            with_globals: false,
            with_stats: false,
            include_schemas: Vec::new(),
            exclude_schemas: Vec::new(),
            include_relations: Vec::new(),
            exclude_relations: Vec::new(),
            plugin_config: None,
            helper_path: "gpbackup_helper".into(),
            copy_queue_size: 1,
            include_partition_root_in_ao_metadata: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub file: Option<PathBuf>,
    /// Home directory of the database user on segment hosts; helper logs go
    /// to `<home>/gpAdminLogs`.
    pub helper_home: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            file: None,
            helper_home: std::env::var("HOME").ok().map(PathBuf::from),
        }
    }
}

impl AppConfig {
    /// Reads the TOML file (when given) and applies environment overrides,
    /// `.env` included.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();

        let mut config = match path {
            Some(path) => {
                let contents = std::fs::read_to_string(path).map_err(|e| {
                    RestoreError::Config(format!("Cannot read {}: {}", path.display(), e))
                })?;
                Self::parse(&contents)?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| RestoreError::Config(e.to_string()))
    }

    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("PGHOST") {
            self.database.host = host;
        }
        if let Some(port) = lookup("PGPORT").and_then(|v| v.parse().ok()) {
            self.database.port = port;
        }
        if let Some(user) = lookup("PGUSER") {
            self.database.user = user;
        }
        if let Some(dbname) = lookup("PGDATABASE") {
            self.database.dbname = Some(dbname);
        }
        if let Some(jobs) = lookup("GPRESTORE_JOBS").and_then(|v| v.parse().ok()) {
            self.restore.jobs = jobs;
        }
        if let Some(level) = lookup("GPRESTORE_LOG_LEVEL") {
            self.log.level = level;
        }
    }

    /// Flag combinations and cluster layout checks, run before connecting.
    pub fn validate(&self) -> Result<()> {
        let restore = &self.restore;
        let timestamp = restore
            .timestamp
            .as_deref()
            .ok_or_else(|| RestoreError::Config("a backup timestamp is required".into()))?;
        if let Err(e) = validate_timestamp(timestamp) {
            return Err(e.into());
        }
        if restore.jobs < 1 {
            return Err(RestoreError::Config("jobs must be at least 1".into()));
        }
        if restore.data_only && restore.metadata_only {
            return Err(RestoreError::Config(
                "data_only and metadata_only cannot be used together".into(),
            ));
        }
        if !restore.include_schemas.is_empty() && !restore.exclude_schemas.is_empty() {
            return Err(RestoreError::Config(
                "include_schemas and exclude_schemas cannot be used together".into(),
            ));
        }
        if !restore.include_relations.is_empty() && !restore.exclude_relations.is_empty() {
            return Err(RestoreError::Config(
                "include_relations and exclude_relations cannot be used together".into(),
            ));
        }
        if let Some(fqn) = restore
            .include_relations
            .iter()
            .chain(&restore.exclude_relations)
            .find(|fqn| !is_qualified(fqn))
        {
            return Err(RestoreError::Config(format!(
                "Table \"{}\" is not correctly fully-qualified. Please ensure table is in the format \"schema.table\".",
                fqn
            )));
        }
        if restore.incremental && !restore.data_only {
            return Err(RestoreError::Config(
                "incremental restore requires data_only".into(),
            ));
        }
        if restore.copy_queue_size < 1 {
            return Err(RestoreError::Config(
                "copy_queue_size must be at least 1".into(),
            ));
        }
        if !self
            .cluster
            .segments
            .iter()
            .any(|s| s.content_id == COORDINATOR_CONTENT)
        {
            return Err(RestoreError::Config(
                "cluster.segments must include the coordinator (content_id = -1)".into(),
            ));
        }
        if self.dest_segment_count() == 0 {
            return Err(RestoreError::Config(
                "cluster.segments must include at least one segment".into(),
            ));
        }
        for path in [&restore.backup_dir, &restore.report_dir, &restore.plugin_config]
            .into_iter()
            .flatten()
        {
            if !path.is_absolute() {
                return Err(RestoreError::Config(format!(
                    "{} is not an absolute path.",
                    path.display()
                )));
            }
        }
        Ok(())
    }

    pub fn timestamp(&self) -> &str {
        self.restore.timestamp.as_deref().unwrap_or_default()
    }

    pub fn seg_dir_map(&self) -> BTreeMap<i32, PathBuf> {
        self.cluster
            .segments
            .iter()
            .map(|s| (s.content_id, s.data_dir.clone()))
            .collect()
    }

    /// Number of primary segments, the coordinator excluded.
    pub fn dest_segment_count(&self) -> i32 {
        self.cluster
            .segments
            .iter()
            .filter(|s| s.content_id >= 0)
            .count() as i32
    }

    pub fn is_filtered(&self) -> bool {
        let r = &self.restore;
        !(r.include_schemas.is_empty()
            && r.exclude_schemas.is_empty()
            && r.include_relations.is_empty()
            && r.exclude_relations.is_empty())
    }
}

fn is_qualified(fqn: &str) -> bool {
    match fqn.split_once('.') {
        Some((schema, name)) => !schema.is_empty() && !name.is_empty(),
        None => false,
    }
}
