//! gprestore - restores a backup set onto a running cluster.

use clap::Parser;
use restore_coordinator::cluster::{check_outputs, executor_for, shell_quote, Cluster};
use restore_coordinator::db::{ConnectionPool, PgPool};
use restore_coordinator::services::history::{current_timestamp, HistoryStore};
use restore_coordinator::services::restore::run_restore;
use restore_coordinator::{AppConfig, RestoreContext, RestoreError};
use segment_helper::daemon::shutdown::ShutdownCoordinator;
use segment_helper::filepath::{validate_timestamp, FilePathInfo, COORDINATOR_CONTENT};
use segment_helper::plugin::{Plugin, PluginConfig};
use segment_helper::VERSION;
use std::path::PathBuf;
use std::sync::Arc;

const EXIT_SUCCESS: i32 = 0;
const EXIT_TABLE_ERRORS: i32 = 1;
const EXIT_FATAL: i32 = 2;
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser, Debug)]
#[command(name = "gprestore", version = VERSION, about = "Restore a backup set onto the cluster")]
struct Cli {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Backup timestamp to restore (YYYYMMDDHHMMSS)
    #[arg(long)]
    timestamp: Option<String>,

    /// Number of parallel connections
    #[arg(long)]
    jobs: Option<usize>,

    #[arg(long)]
    log_level: Option<String>,

    /// Record failing tables and keep going
    #[arg(long)]
    on_error_continue: bool,

    /// Print the backup history as JSON and exit
    #[arg(long, conflicts_with = "delete_backup")]
    list_backups: bool,

    /// Delete the backup with this timestamp and exit
    #[arg(long, value_name = "TIMESTAMP")]
    delete_backup: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            EXIT_FATAL
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let mut config = AppConfig::load(cli.config.as_deref())?;
    if let Some(timestamp) = cli.timestamp {
        config.restore.timestamp = Some(timestamp);
    }
    if let Some(jobs) = cli.jobs {
        config.restore.jobs = jobs;
    }
    if let Some(level) = cli.log_level {
        config.log.level = level;
    }
    config.restore.on_error_continue |= cli.on_error_continue;

    if let Err(e) = segment_helper::utils::logger::init(&config.log.level, config.log.file.as_deref()) {
        eprintln!("Failed to initialise logging: {}", e);
    }

    if cli.list_backups {
        list_backups(&config)?;
        return Ok(EXIT_SUCCESS);
    }
    if let Some(timestamp) = cli.delete_backup {
        delete_backup(&config, &timestamp).await?;
        return Ok(EXIT_SUCCESS);
    }

    config.validate()?;
    tracing::info!(
        timestamp = config.timestamp(),
        jobs = config.restore.jobs,
        "gprestore {} starting",
        VERSION
    );

    let cluster = Arc::new(Cluster::new(
        config.cluster.segments.clone(),
        executor_for(&config),
    ));
    let pool: Arc<dyn ConnectionPool> =
        Arc::new(PgPool::connect(&config.database, config.restore.jobs).await?);

    let shutdown = ShutdownCoordinator::new();
    let signals = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown.wait_for_signal().await;
        }
    });

    let outcome = match RestoreContext::initialize(config, cluster, pool, shutdown.token()).await {
        Ok(ctx) => run_restore(&ctx).await.map(|summary| (ctx, summary)),
        Err(e) => Err(e),
    };
    signals.abort();

    let log_hint = "see the gprestore log for details";
    match outcome {
        Ok((ctx, summary)) => {
            tracing::info!(
                restored = summary.tables_restored,
                total = summary.tables_total,
                data_errors = summary.errored_data.len(),
                metadata_errors = summary.errored_metadata.len(),
                "Restore of backup {} finished",
                ctx.manifest.timestamp
            );
            if summary.has_errors() {
                tracing::warn!(
                    "Restore completed with errors; {}. Failing tables were written next to the restore report.",
                    log_hint
                );
                Ok(EXIT_TABLE_ERRORS)
            } else {
                Ok(EXIT_SUCCESS)
            }
        }
        Err(RestoreError::Interrupted) => {
            tracing::warn!("Restore interrupted; {}", log_hint);
            Ok(EXIT_INTERRUPTED)
        }
        Err(e) => {
            tracing::error!("Restore failed: {}; {}", e, log_hint);
            Ok(EXIT_FATAL)
        }
    }
}

fn history_store(config: &AppConfig) -> anyhow::Result<HistoryStore> {
    let coordinator = config
        .cluster
        .segments
        .iter()
        .find(|s| s.content_id == COORDINATOR_CONTENT)
        .ok_or_else(|| anyhow::anyhow!("cluster.segments must include the coordinator (content_id = -1)"))?;
    Ok(HistoryStore::new(
        coordinator.data_dir.join("gpbackup_history.yaml"),
    ))
}

fn list_backups(config: &AppConfig) -> anyhow::Result<()> {
    let history = history_store(config)?.read()?;
    let rows: Vec<serde_json::Value> = history
        .backup_configs
        .iter()
        .map(|b| {
            serde_json::json!({
                "timestamp": b.timestamp,
                "database": b.database_name,
                "backupVersion": b.backup_version,
                "segmentCount": b.segment_count,
                "plugin": b.plugin,
                "incremental": b.incremental,
                "singleDataFile": b.single_data_file,
                "endTime": b.end_time,
                "dateDeleted": b.date_deleted,
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&rows)?);
    Ok(())
}

/// Removes the backup through its plugin, or from every segment directory,
/// then stamps the history record.
async fn delete_backup(config: &AppConfig, timestamp: &str) -> anyhow::Result<()> {
    validate_timestamp(timestamp)?;
    let store = history_store(config)?;
    let record = store
        .find(timestamp)?
        .ok_or_else(|| anyhow::anyhow!("Backup {} not found in history", timestamp))?;
    if record.date_deleted.is_empty() {
        if let Some(path) = &config.restore.plugin_config {
            Plugin::new(PluginConfig::read_from_file(path)?)
                .delete_backup(timestamp)
                .await?;
        } else {
            let cluster = Cluster::new(config.cluster.segments.clone(), executor_for(config));
            let fp_info = FilePathInfo::new(
                cluster.seg_dir_map(),
                config.restore.backup_dir.clone(),
                timestamp,
                "",
                std::process::id(),
            )?;
            check_outputs(
                cluster
                    .run_on_segments(|seg| {
                        format!(
                            "rm -rf {}",
                            shell_quote(&fp_info.dir_for_content(seg.content_id).to_string_lossy())
                        )
                    })
                    .await,
                "Deleting backup directory",
            )?;
            let coordinator_dir = fp_info.dir_for_content(COORDINATOR_CONTENT);
            if coordinator_dir.exists() {
                std::fs::remove_dir_all(&coordinator_dir)?;
            }
        }
    }
    store.mark_deleted(timestamp, &current_timestamp()).await?;
    tracing::info!("Backup {} deleted", timestamp);
    Ok(())
}
