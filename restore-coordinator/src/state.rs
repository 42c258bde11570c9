use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cluster::Cluster;
use crate::config::AppConfig;
use crate::db::ConnectionPool;
use crate::error::{RestoreError, Result};
use crate::models::backup_config::BackupConfig;
use crate::models::toc::{Filters, Toc};
use crate::services::dispatcher::ErroredSet;
use crate::services::history::current_timestamp;
use crate::services::plugins::PluginBridge;
use segment_helper::filepath::{parse_seg_prefix, FilePathInfo};

/// Everything one restore run shares: cluster, connections, the backup being
/// restored and the error sets filled along the way.
pub struct RestoreContext {
    pub config: AppConfig,
    pub fp_info: FilePathInfo,
    pub manifest: BackupConfig,
    pub toc: Toc,
    pub cluster: Arc<Cluster>,
    pub pool: Arc<dyn ConnectionPool>,
    pub plugin: Option<Arc<PluginBridge>>,
    pub cancel: CancellationToken,
    pub restore_timestamp: String,
    pub errored_data: ErroredSet,
    pub errored_metadata: ErroredSet,
}

impl RestoreContext {
    /// Locates the backup set, fetches its files through the plugin when one
    /// is configured, and loads the manifest and coordinator TOC.
    pub async fn initialize(
        config: AppConfig,
        cluster: Arc<Cluster>,
        pool: Arc<dyn ConnectionPool>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        config.validate()?;
        let restore = &config.restore;
        let seg_prefix = match &restore.backup_dir {
            Some(dir) => parse_seg_prefix(dir)?,
            None => String::new(),
        };
        let fp_info = FilePathInfo::new(
            cluster.seg_dir_map(),
            restore.backup_dir.clone(),
            config.timestamp(),
            &seg_prefix,
            std::process::id(),
        )?
        .with_report_dir(restore.report_dir.clone());

        let plugin = match &restore.plugin_config {
            Some(path) => {
                let bridge = PluginBridge::connect(cluster.clone(), path, &fp_info).await?;
                bridge.restore_file(&fp_info.config_file_path()).await?;
                Some(Arc::new(bridge))
            }
            None => None,
        };

        let manifest = BackupConfig::read_from_file(&fp_info.config_file_path())?;
        if manifest.is_deleted() {
            return Err(RestoreError::InvalidManifest(format!(
                "Backup {} was deleted on {}",
                manifest.timestamp, manifest.date_deleted
            )));
        }
        manifest.ensure_compatible(segment_helper::VERSION, pool.version().major)?;
        if manifest.plugin.is_empty() != plugin.is_none() {
            return Err(RestoreError::Config(if manifest.plugin.is_empty() {
                "a plugin config was given but the backup was not taken with a plugin".into()
            } else {
                format!(
                    "backup {} was taken with plugin {}; a plugin config is required",
                    manifest.timestamp, manifest.plugin
                )
            }));
        }
        if restore.data_only && manifest.metadata_only {
            return Err(RestoreError::Config(
                "Cannot use data_only on a metadata-only backup".into(),
            ));
        }
        if restore.with_stats && !manifest.with_statistics {
            return Err(RestoreError::Config(
                "Cannot restore statistics from a backup taken without them".into(),
            ));
        }

        if let Some(bridge) = &plugin {
            let mut files = vec![
                fp_info.metadata_file_path(),
                fp_info.toc_file_path(),
                fp_info.backup_file_path(segment_helper::filepath::BackupFileKind::Report),
            ];
            if restore.with_stats {
                files.push(fp_info.statistics_file_path());
            }
            for file in &files {
                bridge.restore_file(file).await?;
            }
            bridge
                .setup_segments(&fp_info, &manifest.plugin_version)
                .await?;
            if !manifest.metadata_only && manifest.single_data_file {
                bridge.restore_segment_tocs(&fp_info).await?;
            }
        }

        let toc = Toc::read_from_file(&fp_info.toc_file_path())?;
        info!(
            timestamp = %manifest.timestamp,
            database = %manifest.database_name,
            segments = manifest.segment_count,
            "Loaded backup manifest"
        );

        Ok(Self {
            config,
            fp_info,
            manifest,
            toc,
            cluster,
            pool,
            plugin,
            cancel,
            restore_timestamp: current_timestamp(),
            errored_data: ErroredSet::default(),
            errored_metadata: ErroredSet::default(),
        })
    }

    pub fn filters(&self) -> Filters {
        let r = &self.config.restore;
        Filters {
            include_schemas: r.include_schemas.clone(),
            exclude_schemas: r.exclude_schemas.clone(),
            include_relations: r.include_relations.clone(),
            exclude_relations: r.exclude_relations.clone(),
            ..Default::default()
        }
    }

    pub fn dest_segment_count(&self) -> i32 {
        self.cluster.primaries().count() as i32
    }

    /// Plugin cleanup on every host; helpers clean up after each data pass.
    pub async fn cleanup(&self) {
        if let Some(bridge) = &self.plugin {
            bridge.cleanup(&self.fp_info).await;
        }
        if self.cancel.is_cancelled() {
            warn!("Restore interrupted; cleanup complete");
        }
    }
}

#[cfg(test)]
pub(crate) mod fixture {
    //! On-disk backup set for restore tests.

    use super::*;
    use crate::cluster::fake::{segments, FakeExecutor};
    use crate::config::SegmentConfig;
    use crate::db::connection::fake::FakePool;
    use std::path::Path;
    use tempfile::TempDir;

    pub const TS: &str = "20170101010101";

    pub struct Fixture {
        pub dir: TempDir,
        pub executor: Arc<FakeExecutor>,
        pub pool: Arc<FakePool>,
    }

    /// Appends `sql` to the metadata file and returns its TOC entry.
    fn push(metadata: &mut String, kind: &str, schema: &str, name: &str, reference: &str, sql: &str) -> String {
        let start = metadata.len();
        metadata.push_str(sql);
        format!(
            "  - schema: \"{}\"\n    name: \"{}\"\n    objecttype: {}\n    referenceobject: \"{}\"\n    startbyte: {}\n    endbyte: {}\n",
            schema,
            name,
            kind,
            reference,
            start,
            metadata.len()
        )
    }

    /// Writes a two-table backup taken on `backup_segments` segments.
    pub fn write_backup(dir: &Path, backup_segments: i32, single_data_file: bool) {
        let backup_dir = dir.join("backups").join(&TS[..8]).join(TS);
        std::fs::create_dir_all(&backup_dir).unwrap();

        let mut metadata = String::new();
        let global = [
            push(&mut metadata, "SESSION GUCS", "", "", "", "SET client_encoding = 'UTF8';\n"),
            push(&mut metadata, "DATABASE", "", "testdb", "", "CREATE DATABASE testdb;\n"),
        ];
        let predata = [
            push(&mut metadata, "SCHEMA", "", "public", "", "CREATE SCHEMA public;\n"),
            push(&mut metadata, "TABLE", "public", "foo", "", "CREATE TABLE public.foo (i int);\n"),
            push(&mut metadata, "TABLE", "public", "bar", "", "CREATE TABLE public.bar (i int);\n"),
        ];
        let postdata = [
            push(&mut metadata, "INDEX", "public", "foo_idx", "public.foo", "CREATE INDEX foo_idx ON public.foo (i);\n"),
            push(&mut metadata, "INDEX", "public", "foo_idx2", "public.foo", "CREATE INDEX foo_idx2 ON public.foo (i);\n"),
        ];
        std::fs::write(backup_dir.join(format!("gpbackup_{}_metadata.sql", TS)), &metadata).unwrap();

        let mut stats = String::new();
        let statistics = [push(&mut stats, "STATISTICS", "public", "foo", "", "UPDATE pg_class SET reltuples = 4;\n")];
        std::fs::write(backup_dir.join(format!("gpbackup_{}_statistics.sql", TS)), &stats).unwrap();

        let toc = format!(
            "globalentries:\n{}predataentries:\n{}postdataentries:\n{}statisticsentries:\n{}dataentries:\n  - schema: public\n    name: foo\n    oid: 16384\n    attributestring: (i)\n    rowscopied: 4\n  - schema: public\n    name: bar\n    oid: 16385\n    attributestring: (i)\n    rowscopied: 2\n",
            global.concat(),
            predata.concat(),
            postdata.concat(),
            statistics.concat()
        );
        std::fs::write(backup_dir.join(format!("gpbackup_{}_toc.yaml", TS)), toc).unwrap();

        let manifest = format!(
            "backupversion: 1.0.0\ncompressed: false\ndatabasename: testdb\ndatabaseversion: 6.20.3\nsegmentcount: {}\nsingledatafile: {}\ntimestamp: \"{}\"\nwithstatistics: true\n",
            backup_segments, single_data_file, TS
        );
        std::fs::write(backup_dir.join(format!("gpbackup_{}_config.yaml", TS)), manifest).unwrap();
    }

    impl Fixture {
        pub fn new(backup_segments: i32, single_data_file: bool) -> Self {
            let dir = TempDir::new().unwrap();
            write_backup(dir.path(), backup_segments, single_data_file);
            let pool = Arc::new(FakePool::new(2).respond(|sql| {
                if sql.starts_with("COPY public.foo") {
                    Some(Ok(4))
                } else if sql.starts_with("COPY public.bar") {
                    Some(Ok(2))
                } else {
                    None
                }
            }));
            Self {
                dir,
                executor: Arc::new(FakeExecutor::new()),
                pool,
            }
        }

        pub fn config(&self, dest_segments: i32) -> AppConfig {
            let mut config = AppConfig::default();
            config.cluster.segments = segments(dest_segments);
            config.restore.timestamp = Some(TS.into());
            config.restore.backup_dir = Some(self.dir.path().to_path_buf());
            config.restore.jobs = 2;
            config
        }

        pub fn cluster(&self, segments: Vec<SegmentConfig>) -> Arc<Cluster> {
            Arc::new(Cluster::new(segments, self.executor.clone()))
        }

        pub async fn context(&self, config: AppConfig) -> Result<RestoreContext> {
            let cluster = self.cluster(config.cluster.segments.clone());
            RestoreContext::initialize(config, cluster, self.pool.clone(), CancellationToken::new()).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixture::*;
    use super::*;

    #[tokio::test]
    async fn test_initialize_loads_backup() {
        let fx = Fixture::new(3, false);
        let ctx = fx.context(fx.config(3)).await.unwrap();
        assert_eq!(ctx.manifest.database_name, "testdb");
        assert_eq!(ctx.toc.data_entries.len(), 2);
        assert_eq!(ctx.dest_segment_count(), 3);
        assert!(ctx.plugin.is_none());
        assert_eq!(ctx.restore_timestamp.len(), 14);
    }

    #[tokio::test]
    async fn test_initialize_rejects_missing_backup() {
        let fx = Fixture::new(3, false);
        let mut config = fx.config(3);
        config.restore.timestamp = Some("20180101010101".into());
        let err = fx.context(config).await.err().unwrap();
        assert!(matches!(err, RestoreError::InvalidManifest(_)));
    }

    #[tokio::test]
    async fn test_initialize_rejects_newer_database() {
        let fx = Fixture::new(3, false);
        let cluster = fx.cluster(fx.config(3).cluster.segments);
        let pool = Arc::new(crate::db::connection::fake::FakePool::new(1).with_version(5));
        let err = RestoreContext::initialize(fx.config(3), cluster, pool, CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("catalog incompatibilities"));
    }

    #[tokio::test]
    async fn test_filters_follow_settings() {
        let fx = Fixture::new(3, false);
        let mut config = fx.config(3);
        config.restore.exclude_schemas = vec!["s2".into()];
        let ctx = fx.context(config).await.unwrap();
        let filters = ctx.filters();
        assert_eq!(filters.exclude_schemas, vec!["s2".to_string()]);
        assert!(filters.include_relations.is_empty());
    }
}
