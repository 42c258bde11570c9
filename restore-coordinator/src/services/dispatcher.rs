//! Table data restore: a pool of workers, one database connection each,
//! pulling tables off a shared queue and loading them with
//! `COPY ... FROM PROGRAM ... ON SEGMENT`.

use futures_util::future::join_all;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db::ConnectionPool;
use crate::error::{RestoreError, Result};
use crate::models::toc::CoordinatorDataEntry;
use crate::services::helpers::SegmentHelpers;
use crate::services::redistribute::redistribute_table;
use segment_helper::compression::CompressionType;
use segment_helper::daemon::shutdown::is_terminated;
use segment_helper::filepath::{copy_pipe_path, FilePathInfo};
use segment_helper::transfer::progress::ProgressCounter;

/// Tables whose restore failed under `on-error-continue`.
pub type ErroredSet = Arc<Mutex<BTreeSet<String>>>;

const ERROR_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct RestoreOptions {
    pub jobs: usize,
    pub on_error_continue: bool,
    pub truncate_table: bool,
    pub incremental: bool,
    pub redirect_schema: Option<String>,
    pub resize_cluster: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            jobs: 1,
            on_error_continue: false,
            truncate_table: false,
            incremental: false,
            redirect_schema: None,
            resize_cluster: false,
        }
    }
}

impl RestoreOptions {
    fn truncate_first(&self) -> bool {
        self.incremental || self.truncate_table
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableTaskState {
    Pending,
    Running,
    Redistributing,
    Done,
    Failed,
    /// Failed under on-error-continue; the helpers were told to move on.
    Skipped,
    /// Dropped because the run is stopping.
    Aborted,
}

impl TableTaskState {
    pub fn can_advance_to(self, next: TableTaskState) -> bool {
        use TableTaskState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Aborted)
                | (Running, Redistributing)
                | (Running, Done)
                | (Running, Failed)
                | (Redistributing, Done)
                | (Redistributing, Failed)
                | (Failed, Skipped)
                | (Failed, Aborted)
        )
    }
}

struct TableTask {
    entry: CoordinatorDataEntry,
    target: String,
    state: TableTaskState,
}

impl TableTask {
    fn new(entry: CoordinatorDataEntry, redirect_schema: Option<&str>) -> Self {
        let target = entry.target_fqn(redirect_schema);
        Self {
            entry,
            target,
            state: TableTaskState::Pending,
        }
    }

    fn advance(&mut self, next: TableTaskState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "invalid table task transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!(table = %self.target, from = ?self.state, to = ?next, "Table task state change");
        self.state = next;
    }
}

/// Where table data is read from for one backup timestamp.
pub struct DataSource {
    pub fp_info: FilePathInfo,
    pub single_data_file: bool,
    pub compression: CompressionType,
    /// `<plugin> restore_data <config>` when a plugin serves the data files directly.
    pub plugin_restore_cmd: Option<String>,
    /// Present in single-data-file and resize restores, where segment helpers feed pipes.
    pub helpers: Option<Arc<SegmentHelpers>>,
}

impl DataSource {
    pub fn batches(&self) -> usize {
        self.helpers.as_ref().map(|h| h.batches()).unwrap_or(1)
    }
}

/// `COPY` statement loading one pass of `oid` into `table`.
pub fn build_copy_command(
    table: &str,
    attribute_string: &str,
    source: &DataSource,
    oid: u32,
    batch: usize,
) -> String {
    let program = match &source.helpers {
        // The helper already decompresses and talks to the plugin.
        Some(helpers) => format!(
            "cat {} | cat -",
            copy_pipe_path(
                &source.fp_info.segment_pipe_path_for_copy(),
                oid,
                batch,
                helpers.batches()
            )
        ),
        None => format!(
            "{} {} | {}",
            source.plugin_restore_cmd.as_deref().unwrap_or("cat"),
            source.fp_info.table_backup_file_path_for_copy(
                oid,
                source.compression.extension(),
                false
            ),
            source.compression.decompress_command()
        ),
    };
    format!(
        "COPY {}{} FROM PROGRAM '{}' WITH CSV DELIMITER ',' ON SEGMENT;",
        table,
        attribute_string,
        program.replace('\'', "''")
    )
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreOutcome {
    pub restored: usize,
    pub errored_tables: BTreeSet<String>,
}

pub struct Dispatcher {
    pool: Arc<dyn ConnectionPool>,
    options: RestoreOptions,
    source: Arc<DataSource>,
    gucs: Vec<String>,
    errored: ErroredSet,
    cancel: CancellationToken,
}

struct Shared {
    pool: Arc<dyn ConnectionPool>,
    options: RestoreOptions,
    source: Arc<DataSource>,
    gucs: Vec<String>,
    cancel: CancellationToken,
    fatal: AtomicBool,
    first_error: Mutex<Option<RestoreError>>,
    failed: Mutex<BTreeSet<String>>,
    restored: AtomicUsize,
    failures: AtomicUsize,
    progress: ProgressCounter,
}

impl Dispatcher {
    pub fn new(
        pool: Arc<dyn ConnectionPool>,
        options: RestoreOptions,
        source: DataSource,
        gucs: Vec<String>,
        errored: ErroredSet,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            pool,
            options,
            source: Arc::new(source),
            gucs,
            errored,
            cancel,
        }
    }

    fn workers(&self) -> usize {
        self.options.jobs.min(self.pool.num_conns()).max(1)
    }

    /// Loads `tables` and returns how many were restored and which failed.
    ///
    /// Without on-error-continue the first failure is returned as the error
    /// after in-flight tables finish. Helpers are always cleaned up.
    pub async fn restore(&self, tables: Vec<CoordinatorDataEntry>) -> Result<RestoreOutcome> {
        if tables.is_empty() {
            info!(
                "No data to restore for timestamp {}",
                self.source.fp_info.timestamp
            );
            return Ok(RestoreOutcome::default());
        }
        let result = self.run(tables).await;
        if let Some(helpers) = &self.source.helpers {
            helpers.cleanup().await;
        }
        result
    }

    async fn start_helpers(&self, tables: &[CoordinatorDataEntry]) -> Result<()> {
        let Some(helpers) = &self.source.helpers else {
            return Ok(());
        };
        debug!(
            single_data_file = self.source.single_data_file,
            resize = self.options.resize_cluster,
            "Initializing pipes and gpbackup_helper on segments"
        );
        let oids: Vec<u32> = tables.iter().map(|t| t.oid).collect();
        helpers.verify_versions().await?;
        helpers.write_oid_lists(&oids).await?;
        helpers
            .create_initial_pipes(&oids, self.workers().min(oids.len()))
            .await?;
        if self.cancel.is_cancelled() {
            return Err(RestoreError::Interrupted);
        }
        helpers.start().await
    }

    async fn run(&self, tables: Vec<CoordinatorDataEntry>) -> Result<RestoreOutcome> {
        let total = tables.len();
        self.start_helpers(&tables).await?;

        let shared = Arc::new(Shared {
            pool: self.pool.clone(),
            options: self.options.clone(),
            source: self.source.clone(),
            gucs: self.gucs.clone(),
            cancel: self.cancel.clone(),
            fatal: AtomicBool::new(false),
            first_error: Mutex::new(None),
            failed: Mutex::new(BTreeSet::new()),
            restored: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
            progress: ProgressCounter::new("tables restored", total),
        });

        let (tx, rx) = mpsc::channel(total);
        for entry in tables {
            if tx.send(entry).await.is_err() {
                break;
            }
        }
        drop(tx);
        let rx = Arc::new(Mutex::new(rx));

        let workers_done = CancellationToken::new();
        let monitor = tokio::spawn(monitor(shared.clone(), workers_done.clone()));
        let handles: Vec<_> = (0..self.workers())
            .map(|which| tokio::spawn(worker(shared.clone(), rx.clone(), which)))
            .collect();
        for joined in join_all(handles).await {
            if let Err(e) = joined {
                shared
                    .record_fatal(RestoreError::Io(std::io::Error::other(format!(
                        "restore worker failed: {}",
                        e
                    ))))
                    .await;
            }
        }
        workers_done.cancel();
        if let Err(e) = monitor.await {
            warn!("Helper error monitor failed: {}", e);
        }
        shared.progress.finish();

        let failed = shared.failed.lock().await.clone();
        self.errored.lock().await.extend(failed.iter().cloned());
        let failures = shared.failures.load(Ordering::SeqCst);
        if failures > 0 {
            error!(
                "Encountered {} error(s) during table data restore; see log file for a list of table errors.",
                failures
            );
        }

        if self.cancel.is_cancelled() || is_terminated() {
            return Err(RestoreError::Interrupted);
        }
        if let Some(e) = shared.first_error.lock().await.take() {
            return Err(e);
        }
        Ok(RestoreOutcome {
            restored: shared.restored.load(Ordering::SeqCst),
            errored_tables: failed,
        })
    }
}

impl Shared {
    fn should_stop(&self) -> bool {
        self.fatal.load(Ordering::SeqCst) || self.cancel.is_cancelled() || is_terminated()
    }

    async fn record_fatal(&self, e: RestoreError) {
        self.fatal.store(true, Ordering::SeqCst);
        let mut first = self.first_error.lock().await;
        if first.is_none() {
            *first = Some(e);
        }
    }

    async fn restore_table(&self, which: usize, task: &mut TableTask) -> Result<u64> {
        task.advance(TableTaskState::Running);
        let oid = task.entry.oid;
        if self.options.truncate_first() {
            self.pool
                .exec(&format!("TRUNCATE {}", task.target), which)
                .await?;
        }

        let batches = self.source.batches();
        let mut rows = 0u64;
        for batch in 0..batches {
            if let Some(helpers) = &self.source.helpers {
                helpers.create_pipe(oid, batch, batches).await?;
            }
            let copy = build_copy_command(
                &task.target,
                &task.entry.attribute_string,
                &self.source,
                oid,
                batch,
            );
            debug!(conn = which, "Executing \"{}\" on coordinator", copy);
            match self.pool.exec(&copy, which).await {
                Ok(loaded) => rows += loaded,
                Err(e) => {
                    // A helper that gave up explains the failed COPY better than the database can.
                    if let Some(helpers) = &self.source.helpers {
                        helpers.check_agent_errors().await?;
                    }
                    return Err(e.into_copy_failure(&task.target));
                }
            }
        }

        if rows as i64 != task.entry.rows_copied {
            return Err(RestoreError::RowCountMismatch {
                table: task.target.clone(),
                expected: task.entry.rows_copied,
                actual: rows as i64,
            });
        }
        if self.options.resize_cluster {
            task.advance(TableTaskState::Redistributing);
            redistribute_table(self.pool.as_ref(), which, &task.target).await?;
        }
        if let Some(helpers) = &self.source.helpers {
            helpers.check_agent_errors().await?;
        }
        Ok(rows)
    }

    async fn handle_failure(&self, task: &mut TableTask, e: RestoreError) {
        task.advance(TableTaskState::Failed);
        if self.cancel.is_cancelled() || is_terminated() {
            task.advance(TableTaskState::Aborted);
            return;
        }
        self.failures.fetch_add(1, Ordering::SeqCst);
        error!(table = %task.target, "{}", e);

        if !(self.options.on_error_continue && e.is_per_table()) {
            task.advance(TableTaskState::Aborted);
            self.record_fatal(e).await;
            return;
        }

        self.failed.lock().await.insert(task.target.clone());
        task.advance(TableTaskState::Skipped);
        match (&e, &self.source.helpers) {
            // The helper has exited; nothing is left to feed the remaining tables.
            (RestoreError::HelperError(_), _) => self.record_fatal(e).await,
            (RestoreError::RowCountMismatch { .. }, _) | (_, None) => {}
            (_, Some(helpers)) => {
                if let Err(skip_err) = helpers.place_skip_file(task.entry.oid).await {
                    warn!(oid = task.entry.oid, "Unable to place skip file: {}", skip_err);
                }
            }
        }
    }
}

async fn worker(
    shared: Arc<Shared>,
    rx: Arc<Mutex<mpsc::Receiver<CoordinatorDataEntry>>>,
    which: usize,
) {
    for guc in &shared.gucs {
        if let Err(e) = shared.pool.exec(guc, which).await {
            error!(conn = which, "Unable to set session GUCs: {}", e);
            shared.record_fatal(e).await;
            return;
        }
    }

    loop {
        if shared.should_stop() {
            break;
        }
        let next = rx.lock().await.recv().await;
        let Some(entry) = next else {
            break;
        };
        let mut task = TableTask::new(entry, shared.options.redirect_schema.as_deref());
        if shared.should_stop() {
            task.advance(TableTaskState::Aborted);
            break;
        }
        match shared.restore_table(which, &mut task).await {
            Ok(rows) => {
                task.advance(TableTaskState::Done);
                shared.restored.fetch_add(1, Ordering::SeqCst);
                debug!(table = %task.target, rows, conn = which, "Restored data to table from file");
                shared.progress.increment();
            }
            Err(e) => shared.handle_failure(&mut task, e).await,
        }
    }
}

/// Watches for helper error files and interrupts while the workers run.
///
/// A helper that died leaves its COPY waiting on a pipe with no writer, so
/// the in-flight statements are cancelled rather than waited for.
async fn monitor(shared: Arc<Shared>, done: CancellationToken) {
    let mut interval = tokio::time::interval(ERROR_POLL_INTERVAL);
    interval.tick().await;
    let polling = shared.source.helpers.is_some();
    loop {
        tokio::select! {
            _ = done.cancelled() => return,
            _ = shared.cancel.cancelled() => {
                warn!("Restore interrupted, cancelling COPY statements in progress");
                shared.pool.cancel_all().await;
                return;
            }
            _ = interval.tick(), if polling => {
                if let Some(helpers) = &shared.source.helpers {
                    if let Err(e) = helpers.check_agent_errors().await {
                        error!("{}", e);
                        shared.record_fatal(e).await;
                        shared.pool.cancel_all().await;
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::{output, segments, FakeExecutor};
    use crate::cluster::Cluster;
    use crate::db::connection::fake::FakePool;
    use crate::services::helpers::HelperOptions;
    use segment_helper::resize::ResizePlan;
    use std::sync::atomic::Ordering;

    const TS: &str = "20170101010101";

    fn entry(name: &str, oid: u32, rows: i64) -> CoordinatorDataEntry {
        CoordinatorDataEntry {
            schema: "public".into(),
            name: name.into(),
            oid,
            attribute_string: "(i)".into(),
            rows_copied: rows,
            partition_root: String::new(),
            distribution_policy: "DISTRIBUTED BY (i)".into(),
        }
    }

    fn fp_info(cluster: &Cluster) -> FilePathInfo {
        FilePathInfo::new(cluster.seg_dir_map(), None, TS, "", 4242).unwrap()
    }

    fn file_source() -> DataSource {
        let cluster = Cluster::new(segments(2), Arc::new(FakeExecutor::new()));
        DataSource {
            fp_info: fp_info(&cluster),
            single_data_file: false,
            compression: CompressionType::Gzip,
            plugin_restore_cmd: None,
            helpers: None,
        }
    }

    fn helper_executor() -> Arc<FakeExecutor> {
        let version = format!("gpbackup_helper version {}\n", segment_helper::VERSION);
        Arc::new(FakeExecutor::new().on(move |host, cmd| {
            cmd.ends_with("--version").then(|| output(host, &version, 0))
        }))
    }

    fn helper_source(executor: Arc<FakeExecutor>, resize: Option<ResizePlan>) -> DataSource {
        let cluster = Arc::new(Cluster::new(segments(2), executor));
        let fp_info = fp_info(&cluster);
        let helpers = SegmentHelpers::new(
            cluster,
            fp_info.clone(),
            HelperOptions {
                helper_path: "gpbackup_helper".into(),
                compression: CompressionType::Zstd,
                single_data_file: true,
                on_error_continue: true,
                resize,
                copy_queue_size: 1,
                plugin_config: None,
                log_file: None,
                log_level: "info".into(),
            },
        );
        DataSource {
            fp_info,
            single_data_file: true,
            compression: CompressionType::Zstd,
            plugin_restore_cmd: None,
            helpers: Some(Arc::new(helpers)),
        }
    }

    fn dispatcher(pool: Arc<FakePool>, options: RestoreOptions, source: DataSource) -> (Dispatcher, ErroredSet) {
        let errored = ErroredSet::default();
        let d = Dispatcher::new(
            pool,
            options,
            source,
            vec!["SET search_path TO public;".into()],
            errored.clone(),
            CancellationToken::new(),
        );
        (d, errored)
    }

    fn copy_rows(sql: &str) -> Option<Result<u64>> {
        if !sql.starts_with("COPY") {
            return None;
        }
        let rows = if sql.contains("public.big") { 10 } else { 4 };
        Some(Ok(rows))
    }

    #[test]
    fn test_copy_command_forms() {
        let source = file_source();
        assert_eq!(
            build_copy_command("public.foo", "(i, j)", &source, 16384, 0),
            "COPY public.foo(i, j) FROM PROGRAM 'cat <SEG_DATA_DIR>/backups/20170101/20170101010101/gpbackup_<SEGID>_20170101010101_16384.gz | gzip -d -c' WITH CSV DELIMITER ',' ON SEGMENT;"
        );

        let mut plugin = file_source();
        plugin.plugin_restore_cmd = Some("/usr/bin/plugin restore_data /tmp/plugin.yaml".into());
        assert!(build_copy_command("public.foo", "", &plugin, 1, 0)
            .contains("PROGRAM '/usr/bin/plugin restore_data /tmp/plugin.yaml <SEG_DATA_DIR>/"));

        let helpers = helper_source(Arc::new(FakeExecutor::new()), Some(ResizePlan::new(3, 2).unwrap()));
        assert_eq!(
            build_copy_command("public.foo", "", &helpers, 16384, 1),
            "COPY public.foo FROM PROGRAM 'cat <SEG_DATA_DIR>/gpbackup_<SEGID>_20170101010101_pipe_4242_16384_1 | cat -' WITH CSV DELIMITER ',' ON SEGMENT;"
        );
    }

    #[test]
    fn test_task_state_machine() {
        use TableTaskState::*;
        assert!(Pending.can_advance_to(Running));
        assert!(Running.can_advance_to(Redistributing));
        assert!(Redistributing.can_advance_to(Done));
        assert!(Failed.can_advance_to(Skipped));
        assert!(Failed.can_advance_to(Aborted));
        assert!(!Done.can_advance_to(Running));
        assert!(!Pending.can_advance_to(Done));
        assert!(!Skipped.can_advance_to(Running));
    }

    #[tokio::test]
    async fn test_restore_from_per_table_files() {
        let pool = Arc::new(FakePool::new(2).respond(copy_rows));
        let options = RestoreOptions {
            jobs: 2,
            ..Default::default()
        };
        let (d, errored) = dispatcher(pool.clone(), options, file_source());
        let tables = vec![entry("foo", 1, 4), entry("bar", 2, 4), entry("big", 3, 10)];
        let outcome = d.restore(tables).await.unwrap();
        assert_eq!(outcome.restored, 3);
        assert!(outcome.errored_tables.is_empty());
        assert!(errored.lock().await.is_empty());
        assert_eq!(pool.statements_matching("COPY").len(), 3);
        assert_eq!(pool.statements_matching("SET search_path").len(), 2);
        assert!(pool.statements_matching("TRUNCATE").is_empty());
    }

    #[tokio::test]
    async fn test_truncate_and_redirect() {
        let pool = Arc::new(FakePool::new(1).respond(copy_rows));
        let options = RestoreOptions {
            incremental: true,
            redirect_schema: Some("other".into()),
            ..Default::default()
        };
        let (d, _) = dispatcher(pool.clone(), options, file_source());
        d.restore(vec![entry("foo", 1, 4)]).await.unwrap();
        let statements = pool.statements();
        assert_eq!(statements[1], "TRUNCATE other.foo");
        assert!(statements[2].starts_with("COPY other.foo(i) FROM PROGRAM"));
    }

    #[tokio::test]
    async fn test_row_mismatch_is_fatal_without_continue() {
        let pool = Arc::new(FakePool::new(1).respond(copy_rows));
        let (d, errored) = dispatcher(pool.clone(), RestoreOptions::default(), file_source());
        let tables = vec![entry("foo", 1, 5), entry("bar", 2, 4), entry("baz", 3, 4)];
        let err = d.restore(tables).await.unwrap_err();
        assert!(matches!(
            err,
            RestoreError::RowCountMismatch { expected: 5, actual: 4, .. }
        ));
        assert_eq!(pool.statements_matching("COPY").len(), 1);
        assert!(errored.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_on_error_continue_records_table_and_skips() {
        let executor = helper_executor();
        let pool = Arc::new(
            FakePool::new(2)
                .respond(|sql| {
                    (sql.starts_with("COPY public.bad")).then(|| {
                        Err(RestoreError::Database {
                            message: "ERROR: invalid input syntax (SQLSTATE 22P02)".into(),
                            context: Some("COPY bad, line 1".into()),
                        })
                    })
                })
                .respond(copy_rows),
        );
        let options = RestoreOptions {
            jobs: 2,
            on_error_continue: true,
            ..Default::default()
        };
        let (d, errored) = dispatcher(pool.clone(), options, helper_source(executor.clone(), None));
        let tables = vec![entry("foo", 1, 4), entry("bad", 2, 4), entry("bar", 3, 4)];
        let outcome = d.restore(tables).await.unwrap();

        assert_eq!(outcome.restored, 2);
        assert_eq!(
            outcome.errored_tables.into_iter().collect::<Vec<_>>(),
            vec!["public.bad"]
        );
        assert!(errored.lock().await.contains("public.bad"));
        let skips = executor.commands_matching("touch");
        assert_eq!(skips.len(), 2);
        assert!(skips.iter().all(|c| c.ends_with("_skip_2")));
        assert_eq!(executor.commands_matching("pkill").len(), 2);
    }

    #[tokio::test]
    async fn test_helper_error_aborts_even_with_continue() {
        let executor = Arc::new(
            FakeExecutor::new()
                .on(|host, cmd| {
                    cmd.ends_with("--version").then(|| {
                        output(host, &format!("gpbackup_helper version {}", segment_helper::VERSION), 0)
                    })
                })
                .on(|host, cmd| {
                    (cmd.contains("_error ]") && cmd.contains("gpseg1/")).then(|| output(host, "error\n", 0))
                }),
        );
        let pool = Arc::new(FakePool::new(1).respond(copy_rows));
        let options = RestoreOptions {
            on_error_continue: true,
            ..Default::default()
        };
        let (d, errored) = dispatcher(pool.clone(), options, helper_source(executor.clone(), None));
        let err = d
            .restore(vec![entry("foo", 1, 4), entry("bar", 2, 4)])
            .await
            .unwrap_err();
        assert!(matches!(err, RestoreError::HelperError(_)));
        assert!(errored.lock().await.contains("public.foo"));
        assert_eq!(pool.statements_matching("COPY").len(), 1);
        assert!(!executor.commands_matching("rm -f").is_empty());
    }

    #[tokio::test]
    async fn test_resize_runs_one_pass_per_batch_and_reorganizes() {
        let executor = helper_executor();
        let pool = Arc::new(FakePool::new(1).respond(|sql| sql.starts_with("COPY").then_some(Ok(2))));
        let options = RestoreOptions {
            resize_cluster: true,
            ..Default::default()
        };
        let source = helper_source(executor.clone(), Some(ResizePlan::new(3, 2).unwrap()));
        let (d, _) = dispatcher(pool.clone(), options, source);
        let outcome = d.restore(vec![entry("foo", 16384, 4)]).await.unwrap();
        assert_eq!(outcome.restored, 1);

        let copies = pool.statements_matching("COPY");
        assert_eq!(copies.len(), 2);
        assert!(copies[0].contains("pipe_4242_16384_0 |"));
        assert!(copies[1].contains("pipe_4242_16384_1 |"));
        assert_eq!(
            pool.statements_matching("REORGANIZE"),
            vec!["ALTER TABLE public.foo SET WITH (REORGANIZE=true)"]
        );
        let script = executor
            .file("sdw1", &d.source.fp_info.segment_helper_file_path(0, "script"))
            .unwrap();
        assert!(String::from_utf8(script).unwrap().contains("--orig-seg-count 3 --dest-seg-count 2"));
    }

    #[tokio::test]
    async fn test_interrupt_before_start_cleans_up() {
        let executor = helper_executor();
        let pool = Arc::new(FakePool::new(1).respond(copy_rows));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let d = Dispatcher::new(
            pool.clone(),
            RestoreOptions::default(),
            helper_source(executor.clone(), None),
            Vec::new(),
            ErroredSet::default(),
            cancel,
        );
        let err = d.restore(vec![entry("foo", 1, 4)]).await.unwrap_err();
        assert!(matches!(err, RestoreError::Interrupted));
        assert!(pool.statements().is_empty());
        assert!(executor.commands_matching("bash ").is_empty());
        assert_eq!(executor.commands_matching("pkill").len(), 2);
    }

    #[tokio::test]
    async fn test_interrupt_cancels_running_copies() {
        let pool = Arc::new(
            FakePool::new(1)
                .with_delay(Duration::from_millis(200))
                .respond(copy_rows),
        );
        let cancel = CancellationToken::new();
        let d = Dispatcher::new(
            pool.clone(),
            RestoreOptions::default(),
            file_source(),
            Vec::new(),
            ErroredSet::default(),
            cancel.clone(),
        );
        let trigger = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });
        let err = d
            .restore(vec![entry("foo", 1, 4), entry("bar", 2, 4)])
            .await
            .unwrap_err();
        trigger.await.unwrap();
        assert!(matches!(err, RestoreError::Interrupted));
        assert_eq!(pool.cancels.load(Ordering::SeqCst), 1);
        assert_eq!(pool.statements_matching("COPY").len(), 1);
    }

    #[tokio::test]
    async fn test_empty_table_list() {
        let pool = Arc::new(FakePool::new(1));
        let (d, _) = dispatcher(pool.clone(), RestoreOptions::default(), file_source());
        assert_eq!(d.restore(Vec::new()).await.unwrap(), RestoreOutcome::default());
        assert!(pool.statements().is_empty());
    }
}
