//! One restore run from start to finish: globals, pre-data, table data for
//! every restore-plan step, post-data and statistics, then the report.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::{RestoreError, Result};
use crate::models::toc::{FilterSet, Filters, ObjectType, Section, StatementWithType};
use crate::services::dispatcher::{DataSource, Dispatcher, RestoreOptions};
use crate::services::helpers::{HelperOptions, SegmentHelpers};
use crate::services::postdata::restore_postdata;
use crate::services::redistribute::resize_plan;
use crate::services::report::{write_error_tables, RestoreReport};
use crate::services::statements::StatementExecutor;
use crate::state::RestoreContext;
use segment_helper::daemon::shutdown::is_terminated;
use segment_helper::filepath::BackupFileKind;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub tables_restored: usize,
    pub tables_total: usize,
    pub errored_data: BTreeSet<String>,
    pub errored_metadata: BTreeSet<String>,
}

impl RestoreSummary {
    pub fn has_errors(&self) -> bool {
        !self.errored_data.is_empty() || !self.errored_metadata.is_empty()
    }
}

/// Runs every phase, then writes the report and error-table files whatever
/// the outcome.
pub async fn run_restore(ctx: &RestoreContext) -> Result<RestoreSummary> {
    let mut report = RestoreReport::new(&ctx.manifest.timestamp, &ctx.restore_timestamp);
    report.database_name = ctx.manifest.database_name.clone();
    report.backup_database_version = ctx.manifest.database_version.clone();
    report.restore_database_version = ctx.pool.version().raw.clone();
    report.backup_version = ctx.manifest.backup_version.clone();
    report.plugin = ctx.plugin.as_ref().map(|bridge| bridge.name().to_string());
    report.orig_segment_count = ctx.manifest.segment_count;
    report.dest_segment_count = ctx.dest_segment_count();

    let mut summary = RestoreSummary::default();
    let result = restore_phases(ctx, &mut summary).await;
    ctx.cleanup().await;

    summary.errored_data = ctx.errored_data.lock().await.clone();
    summary.errored_metadata = ctx.errored_metadata.lock().await.clone();
    for (kind, tables) in [
        (BackupFileKind::ErrorTablesData, &summary.errored_data),
        (BackupFileKind::ErrorTablesMetadata, &summary.errored_metadata),
    ] {
        if let Err(e) = write_error_tables(&ctx.fp_info, &ctx.restore_timestamp, kind, tables) {
            warn!("Unable to write error tables file: {}", e);
        }
    }

    report.tables_restored = summary.tables_restored;
    report.tables_total = summary.tables_total;
    report.data_errors = summary.errored_data.len();
    report.metadata_errors = summary.errored_metadata.len();
    report.finish(result.as_ref().err().map(|e| e.to_string()));
    if let Err(e) = report.write(&ctx.fp_info) {
        warn!("Unable to write restore report: {}", e);
    }

    result.map(|()| summary)
}

async fn restore_phases(ctx: &RestoreContext, summary: &mut RestoreSummary) -> Result<()> {
    let restore = &ctx.config.restore;
    let metadata_file = ctx.fp_info.metadata_file_path();
    let executor = StatementExecutor::new(
        ctx.pool.clone(),
        restore.on_error_continue,
        ctx.errored_metadata.clone(),
        ctx.cancel.clone(),
    );
    let redirect = restore.redirect_schema.as_deref().filter(|s| !s.is_empty());

    let gucs: Vec<String> = ctx
        .toc
        .statements_for_section(
            Section::Global,
            &metadata_file,
            &Filters::object_types(vec![ObjectType::SessionGucs], Vec::new()),
        )?
        .into_iter()
        .map(|s| s.statement)
        .collect();

    if restore.with_globals && !restore.data_only {
        info!("Restoring global metadata");
        let globals = ctx.toc.statements_for_section(
            Section::Global,
            &metadata_file,
            &Filters::object_types(Vec::new(), vec![ObjectType::SessionGucs, ObjectType::Database]),
        )?;
        executor
            .execute_statements(globals, "Global objects", false)
            .await?;
    }

    if !restore.data_only {
        info!("Restoring pre-data metadata");
        let mut filters = ctx.filters();
        let roots = ctx.toc.included_partition_roots(&restore.include_relations);
        filters.include_relations.extend(roots);
        let mut statements =
            ctx.toc
                .statements_for_section(Section::Predata, &metadata_file, &filters)?;
        if let Some(schema) = redirect {
            statements = redirect_statements(statements, schema);
        }
        let (schemas, rest): (Vec<_>, Vec<_>) = statements
            .into_iter()
            .partition(|s| s.object_type == ObjectType::Schema);
        restore_schemas(ctx, schemas).await?;
        executor
            .execute_statements(rest, "Pre-data objects", false)
            .await?;
        info!("Pre-data metadata restore complete");
    }

    if !restore.metadata_only && !ctx.manifest.metadata_only {
        restore_data(ctx, &gucs, summary).await?;
    }

    if !restore.data_only {
        let mut statements =
            ctx.toc
                .statements_for_section(Section::Postdata, &metadata_file, &ctx.filters())?;
        if let Some(schema) = redirect {
            statements = redirect_statements(statements, schema);
        }
        restore_postdata(&executor, statements).await?;
    }

    if restore.with_stats {
        info!("Restoring query planner statistics");
        let mut statements = ctx.toc.statements_for_section(
            Section::Statistics,
            &ctx.fp_info.statistics_file_path(),
            &ctx.filters(),
        )?;
        if let Some(schema) = redirect {
            statements = redirect_statements(statements, schema);
        }
        executor
            .execute_statements(statements, "Statistics", false)
            .await?;
    }
    Ok(())
}

/// Loads table data for each restore-plan step from that step's backup files.
async fn restore_data(
    ctx: &RestoreContext,
    gucs: &[String],
    summary: &mut RestoreSummary,
) -> Result<()> {
    let restore = &ctx.config.restore;
    let resize = resize_plan(
        ctx.manifest.segment_count,
        ctx.dest_segment_count(),
        restore.resize_cluster,
    )?;
    let compression = ctx.manifest.compression()?;
    let use_helpers = ctx.manifest.single_data_file || restore.resize_cluster;

    let filters = ctx.filters();
    let has_plan = !ctx.manifest.restore_plan.is_empty();
    if has_plan {
        ensure_plan_covers_ao_tables(ctx, &filters)?;
    }
    let options = RestoreOptions {
        jobs: restore.jobs,
        on_error_continue: restore.on_error_continue,
        truncate_table: restore.truncate_table,
        incremental: restore.incremental,
        redirect_schema: restore.redirect_schema.clone().filter(|s| !s.is_empty()),
        resize_cluster: restore.resize_cluster,
    };

    for step in ctx.manifest.restore_plan_or_self() {
        if has_plan && step.table_fqns.is_empty() {
            continue;
        }
        if ctx.cancel.is_cancelled() || is_terminated() {
            return Err(RestoreError::Interrupted);
        }
        let fp_info = ctx.fp_info.for_timestamp(&step.timestamp)?;
        let tables = ctx.toc.data_entries_matching(&filters, &step.table_fqns);
        info!(
            timestamp = %step.timestamp,
            tables = tables.len(),
            "Restoring table data"
        );
        summary.tables_total += tables.len();

        let helpers = use_helpers.then(|| {
            Arc::new(SegmentHelpers::new(
                ctx.cluster.clone(),
                fp_info.clone(),
                HelperOptions {
                    helper_path: restore.helper_path.clone(),
                    compression,
                    single_data_file: ctx.manifest.single_data_file,
                    on_error_continue: restore.on_error_continue,
                    resize,
                    copy_queue_size: restore.copy_queue_size,
                    plugin_config: ctx
                        .plugin
                        .as_ref()
                        .map(|p| p.host_config_path().to_path_buf()),
                    log_file: ctx
                        .config
                        .log
                        .helper_home
                        .as_ref()
                        .map(|home| fp_info.helper_log_path(home)),
                    log_level: ctx.config.log.level.clone(),
                },
            ))
        });
        let source = DataSource {
            fp_info,
            single_data_file: ctx.manifest.single_data_file,
            compression,
            plugin_restore_cmd: ctx.plugin.as_ref().map(|p| p.restore_data_command()),
            helpers,
        };
        let dispatcher = Dispatcher::new(
            ctx.pool.clone(),
            options.clone(),
            source,
            gucs.to_vec(),
            ctx.errored_data.clone(),
            ctx.cancel.clone(),
        );
        let outcome = dispatcher.restore(tables).await?;
        summary.tables_restored += outcome.restored;
    }
    info!(
        restored = summary.tables_restored,
        total = summary.tables_total,
        "Data restore complete"
    );
    Ok(())
}

/// Every append-optimized table recorded in the backup's incremental metadata
/// must be loaded by some restore-plan step, or its data would be silently
/// left behind.
fn ensure_plan_covers_ao_tables(ctx: &RestoreContext, filters: &Filters) -> Result<()> {
    let ao = ctx.toc.ao_incremental_metadata(
        ctx.pool.version().major,
        ctx.config.restore.include_partition_root_in_ao_metadata,
    );
    let planned: HashSet<&str> = ctx
        .manifest
        .restore_plan
        .iter()
        .flat_map(|step| step.table_fqns.iter().map(String::as_str))
        .collect();
    let schemas = FilterSet::from_lists(&filters.include_schemas, &filters.exclude_schemas);
    let relations = FilterSet::from_lists(&filters.include_relations, &filters.exclude_relations);

    let missing: Vec<&str> = ao
        .keys()
        .map(String::as_str)
        .filter(|fqn| {
            let schema = fqn.split('.').next().unwrap_or_default();
            schemas.matches(schema) && relations.matches(fqn) && !planned.contains(fqn)
        })
        .collect();
    debug!(tables = ao.len(), "AO incremental metadata entries in backup");
    if missing.is_empty() {
        return Ok(());
    }
    Err(RestoreError::InvalidManifest(format!(
        "restore plan of backup {} does not cover append-optimized tables: {}",
        ctx.manifest.timestamp,
        missing.join(", ")
    )))
}

/// Creates schemas one at a time on the first connection; a schema that
/// already exists is only a warning.
async fn restore_schemas(ctx: &RestoreContext, schemas: Vec<StatementWithType>) -> Result<()> {
    for schema in schemas {
        if ctx.cancel.is_cancelled() || is_terminated() {
            return Err(RestoreError::Interrupted);
        }
        match ctx.pool.exec(&schema.statement, 0).await {
            Ok(_) => {}
            Err(e) if e.to_string().contains("already exists") => {
                warn!("Schema {} already exists", schema.name);
            }
            Err(e) if ctx.config.restore.on_error_continue => {
                error!("Error encountered while creating schema {}: {}", schema.name, e);
                ctx.errored_metadata.lock().await.insert(schema.name.clone());
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Moves statements into `schema`. Schema creation itself is dropped; the
/// target schema must already exist.
pub fn redirect_statements(
    statements: Vec<StatementWithType>,
    schema: &str,
) -> Vec<StatementWithType> {
    let new_prefix = format!("{}.", schema);
    statements
        .into_iter()
        .filter(|s| s.object_type != ObjectType::Schema)
        .map(|mut s| {
            if !s.schema.is_empty() {
                let old_prefix = format!("{}.", s.schema);
                s.statement = s.statement.replacen(&old_prefix, &new_prefix, 1);
                s.reference_object = s.reference_object.replacen(&old_prefix, &new_prefix, 1);
                s.schema = schema.to_string();
            }
            s
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::output;
    use crate::db::connection::fake::FakePool;
    use crate::models::backup_config::RestorePlanEntry;
    use crate::models::toc::AoEntry;
    use crate::state::fixture::{Fixture, TS};

    fn position(statements: &[String], needle: &str) -> usize {
        statements
            .iter()
            .position(|s| s.contains(needle))
            .unwrap_or_else(|| panic!("{} not executed", needle))
    }

    #[tokio::test]
    async fn test_full_restore_runs_phases_in_order() {
        let fx = Fixture::new(3, false);
        let mut config = fx.config(3);
        config.restore.with_stats = true;
        let ctx = fx.context(config).await.unwrap();

        let summary = run_restore(&ctx).await.unwrap();
        assert_eq!(summary.tables_restored, 2);
        assert_eq!(summary.tables_total, 2);
        assert!(!summary.has_errors());

        let executed = fx.pool.statements();
        let schema = position(&executed, "CREATE SCHEMA public");
        let table = position(&executed, "CREATE TABLE public.foo");
        let guc = position(&executed, "SET client_encoding");
        let copy = position(&executed, "COPY public.foo(i) FROM PROGRAM 'cat ");
        let index = position(&executed, "CREATE INDEX foo_idx ON");
        let index2 = position(&executed, "CREATE INDEX foo_idx2 ON");
        let stats = position(&executed, "UPDATE pg_class");
        assert!(schema < table && table < guc && guc < copy);
        assert!(copy < index && index < index2 && index2 < stats);
        assert!(fx.pool.statements_matching("CREATE DATABASE").is_empty());
        assert!(fx.executor.commands().is_empty());

        let report = ctx.fp_info.restore_file_path(&ctx.restore_timestamp, BackupFileKind::Report);
        let contents = std::fs::read_to_string(report).unwrap();
        assert!(contents.contains(TS));
        assert!(contents.contains("2/2"));
    }

    #[tokio::test]
    async fn test_data_only_skips_metadata() {
        let fx = Fixture::new(3, false);
        let mut config = fx.config(3);
        config.restore.data_only = true;
        let ctx = fx.context(config).await.unwrap();
        run_restore(&ctx).await.unwrap();
        assert!(fx.pool.statements_matching("CREATE").is_empty());
        assert_eq!(fx.pool.statements_matching("COPY ").len(), 2);
    }

    #[tokio::test]
    async fn test_metadata_only_skips_data() {
        let fx = Fixture::new(3, false);
        let mut config = fx.config(3);
        config.restore.metadata_only = true;
        config.restore.with_globals = true;
        let ctx = fx.context(config).await.unwrap();
        let summary = run_restore(&ctx).await.unwrap();
        assert_eq!(summary.tables_total, 0);
        assert!(fx.pool.statements_matching("COPY ").is_empty());
        assert_eq!(fx.pool.statements_matching("CREATE DATABASE").len(), 0);
        assert_eq!(fx.pool.statements_matching("CREATE INDEX").len(), 2);
    }

    #[tokio::test]
    async fn test_existing_schema_is_a_warning() {
        let fx = Fixture::new(3, false);
        let pool = Arc::new(
            FakePool::new(2)
                .respond(|sql| {
                    sql.starts_with("CREATE SCHEMA").then(|| {
                        Err(RestoreError::Database {
                            message: "ERROR: schema \"public\" already exists (SQLSTATE 42P06)".into(),
                            context: None,
                        })
                    })
                })
                .respond(|sql| sql.starts_with("COPY public.foo").then_some(Ok(4)))
                .respond(|sql| sql.starts_with("COPY public.bar").then_some(Ok(2))),
        );
        let config = fx.config(3);
        let cluster = fx.cluster(config.cluster.segments.clone());
        let ctx = RestoreContext::initialize(config, cluster, pool.clone(), Default::default())
            .await
            .unwrap();
        run_restore(&ctx).await.unwrap();
        assert_eq!(pool.statements_matching("CREATE TABLE").len(), 2);
    }

    #[tokio::test]
    async fn test_on_error_continue_writes_error_tables() {
        let fx = Fixture::new(3, false);
        let pool = Arc::new(FakePool::new(2).respond(|sql| {
            if sql.starts_with("COPY public.bar") {
                Some(Err(RestoreError::Database {
                    message: "ERROR: invalid input syntax for integer (SQLSTATE 22P02)".into(),
                    context: Some("COPY bar, line 1".into()),
                }))
            } else if sql.starts_with("COPY public.foo") {
                Some(Ok(4))
            } else {
                None
            }
        }));
        let mut config = fx.config(3);
        config.restore.on_error_continue = true;
        let cluster = fx.cluster(config.cluster.segments.clone());
        let ctx = RestoreContext::initialize(config, cluster, pool.clone(), Default::default())
            .await
            .unwrap();

        let summary = run_restore(&ctx).await.unwrap();
        assert_eq!(summary.tables_restored, 1);
        assert!(summary.has_errors());
        assert!(summary.errored_data.contains("public.bar"));

        let path = ctx
            .fp_info
            .restore_file_path(&ctx.restore_timestamp, BackupFileKind::ErrorTablesData);
        assert_eq!(std::fs::read_to_string(path).unwrap(), "public.bar\n");
        let report = ctx.fp_info.restore_file_path(&ctx.restore_timestamp, BackupFileKind::Report);
        assert!(std::fs::read_to_string(report)
            .unwrap()
            .contains("Success but non-fatal errors occurred"));
    }

    #[tokio::test]
    async fn test_fatal_error_still_writes_report() {
        let fx = Fixture::new(3, false);
        let pool = Arc::new(FakePool::new(2).respond(|sql| {
            sql.starts_with("COPY public.foo").then(|| Ok(3))
        }));
        let config = fx.config(3);
        let cluster = fx.cluster(config.cluster.segments.clone());
        let ctx = RestoreContext::initialize(config, cluster, pool.clone(), Default::default())
            .await
            .unwrap();

        let err = run_restore(&ctx).await.unwrap_err();
        assert!(matches!(err, RestoreError::RowCountMismatch { .. }));
        assert!(pool.statements_matching("CREATE INDEX").is_empty());
        let report = ctx.fp_info.restore_file_path(&ctx.restore_timestamp, BackupFileKind::Report);
        assert!(std::fs::read_to_string(report).unwrap().contains("Failure"));
    }

    #[tokio::test]
    async fn test_resize_restore_drives_helpers() {
        let fx = Fixture::new(3, false);
        let mut config = fx.config(2);
        config.restore.resize_cluster = true;
        config.restore.data_only = true;
        let executor = Arc::new(crate::cluster::fake::FakeExecutor::new().on(|host, cmd| {
            cmd.ends_with("--version").then(|| {
                output(
                    host,
                    &format!("gpbackup_helper version {}\n", segment_helper::VERSION),
                    0,
                )
            })
        }));
        let cluster = Arc::new(crate::cluster::Cluster::new(
            config.cluster.segments.clone(),
            executor.clone(),
        ));
        // Each pass loads half of the backed-up rows.
        let pool = Arc::new(
            FakePool::new(2)
                .respond(|sql| sql.starts_with("COPY public.foo").then_some(Ok(2)))
                .respond(|sql| sql.starts_with("COPY public.bar").then_some(Ok(1))),
        );
        let ctx = RestoreContext::initialize(config, cluster, pool.clone(), Default::default())
            .await
            .unwrap();

        let summary = run_restore(&ctx).await.unwrap();
        assert_eq!(summary.tables_restored, 2);
        let copies = pool.statements_matching("COPY ");
        assert_eq!(copies.len(), 4);
        assert!(copies.iter().all(|c| c.contains("| cat -")));
        assert_eq!(pool.statements_matching("REORGANIZE=true").len(), 2);
        assert_eq!(executor.commands_matching("bash ").len(), 2);
        assert!(!executor.commands_matching("pkill").is_empty());
    }

    #[tokio::test]
    async fn test_size_mismatch_without_resize_is_rejected() {
        let fx = Fixture::new(3, false);
        let mut config = fx.config(2);
        config.restore.data_only = true;
        let ctx = fx.context(config).await.unwrap();
        let err = run_restore(&ctx).await.unwrap_err();
        assert!(matches!(err, RestoreError::InvalidManifest(_)));
        assert!(fx.pool.statements_matching("COPY ").is_empty());
    }

    #[test]
    fn test_redirect_statements() {
        let statements = vec![
            StatementWithType {
                schema: String::new(),
                name: "public".into(),
                object_type: ObjectType::Schema,
                reference_object: String::new(),
                statement: "CREATE SCHEMA public;".into(),
            },
            StatementWithType {
                schema: "public".into(),
                name: "foo_idx".into(),
                object_type: ObjectType::Index,
                reference_object: "public.foo".into(),
                statement: "CREATE INDEX foo_idx ON public.foo USING btree (i);".into(),
            },
        ];
        let redirected = redirect_statements(statements, "other");
        assert_eq!(redirected.len(), 1);
        assert_eq!(redirected[0].schema, "other");
        assert_eq!(redirected[0].reference_object, "other.foo");
        assert_eq!(
            redirected[0].statement,
            "CREATE INDEX foo_idx ON other.foo USING btree (i);"
        );
    }

    fn with_plan(ctx: &mut RestoreContext, ao_tables: &[&str]) {
        ctx.manifest.restore_plan = vec![RestorePlanEntry {
            timestamp: TS.into(),
            table_fqns: vec!["public.foo".into(), "public.bar".into()],
        }];
        for fqn in ao_tables {
            ctx.toc
                .incremental_metadata
                .ao
                .insert(fqn.to_string(), AoEntry::default());
        }
    }

    #[tokio::test]
    async fn test_restore_plan_covering_ao_tables_loads_data() {
        let fx = Fixture::new(3, false);
        let mut config = fx.config(3);
        config.restore.data_only = true;
        config.restore.exclude_schemas = vec!["s2".into()];
        let mut ctx = fx.context(config).await.unwrap();
        with_plan(&mut ctx, &["public.foo", "s2.filtered_out"]);

        let summary = run_restore(&ctx).await.unwrap();
        assert_eq!(summary.tables_restored, 2);
        assert_eq!(fx.pool.statements_matching("COPY ").len(), 2);
    }

    #[tokio::test]
    async fn test_ao_table_missing_from_plan_is_rejected() {
        let fx = Fixture::new(3, false);
        let mut config = fx.config(3);
        config.restore.data_only = true;
        let mut ctx = fx.context(config).await.unwrap();
        with_plan(&mut ctx, &["public.foo", "public.baz"]);

        let err = run_restore(&ctx).await.unwrap_err();
        assert!(matches!(err, RestoreError::InvalidManifest(_)));
        assert!(err.to_string().contains("public.baz"));
        assert!(fx.pool.statements_matching("COPY ").is_empty());
    }

    #[tokio::test]
    async fn test_partition_root_in_ao_metadata_follows_setting() {
        let fx = Fixture::new(3, false);
        let mut ctx = fx.context(fx.config(3)).await.unwrap();
        with_plan(&mut ctx, &["public.sales"]);
        ctx.toc.data_entries[0].partition_root = "sales".into();
        let filters = ctx.filters();

        ensure_plan_covers_ao_tables(&ctx, &filters).unwrap();

        ctx.config.restore.include_partition_root_in_ao_metadata = true;
        let err = ensure_plan_covers_ao_tables(&ctx, &filters).unwrap_err();
        assert!(err.to_string().contains("public.sales"));
    }
}
