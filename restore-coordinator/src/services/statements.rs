//! Runs metadata statements over the connection pool.

use futures_util::future::join_all;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::db::ConnectionPool;
use crate::error::{RestoreError, Result};
use crate::models::toc::StatementWithType;
use crate::services::dispatcher::ErroredSet;
use segment_helper::daemon::shutdown::is_terminated;
use segment_helper::transfer::progress::ProgressCounter;

pub struct StatementExecutor {
    pool: Arc<dyn ConnectionPool>,
    on_error_continue: bool,
    errored_metadata: ErroredSet,
    cancel: CancellationToken,
}

struct Run {
    queue: Mutex<std::vec::IntoIter<StatementWithType>>,
    fatal: AtomicBool,
    first_error: Mutex<Option<RestoreError>>,
    failures: AtomicUsize,
    progress: ProgressCounter,
}

impl StatementExecutor {
    pub fn new(
        pool: Arc<dyn ConnectionPool>,
        on_error_continue: bool,
        errored_metadata: ErroredSet,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            pool,
            on_error_continue,
            errored_metadata,
            cancel,
        }
    }

    /// Executes `statements` in order on connection 0, or drawn from a shared
    /// queue by every connection when `parallel`.
    ///
    /// Returns the number of statements that failed under on-error-continue;
    /// otherwise the first failure is returned once running statements finish.
    pub async fn execute_statements(
        &self,
        statements: Vec<StatementWithType>,
        label: &str,
        parallel: bool,
    ) -> Result<usize> {
        if statements.is_empty() {
            return Ok(0);
        }
        let run = Run {
            progress: ProgressCounter::new(format!("{} restored", label), statements.len()),
            queue: Mutex::new(statements.into_iter()),
            fatal: AtomicBool::new(false),
            first_error: Mutex::new(None),
            failures: AtomicUsize::new(0),
        };

        let conns = if parallel { self.pool.num_conns().max(1) } else { 1 };
        join_all((0..conns).map(|which| self.execute_on_conn(&run, which))).await;
        run.progress.finish();

        if self.cancel.is_cancelled() || is_terminated() {
            return Err(RestoreError::Interrupted);
        }
        if let Some(e) = run.first_error.lock().await.take() {
            return Err(e);
        }
        let failures = run.failures.load(Ordering::SeqCst);
        if failures > 0 {
            error!(
                "Encountered {} errors during metadata restore; see log file for a list of failed statements.",
                failures
            );
        }
        Ok(failures)
    }

    async fn execute_on_conn(&self, run: &Run, which: usize) {
        loop {
            if run.fatal.load(Ordering::SeqCst) || self.cancel.is_cancelled() || is_terminated() {
                return;
            }
            let next = run.queue.lock().await.next();
            let Some(statement) = next else {
                return;
            };
            if let Err(e) = self.pool.exec(&statement.statement, which).await {
                debug!(
                    "Error encountered when executing statement: {} Error was: {}",
                    statement.statement.trim(),
                    e
                );
                if self.on_error_continue {
                    run.failures.fetch_add(1, Ordering::SeqCst);
                    self.errored_metadata.lock().await.insert(statement.fqn());
                } else {
                    run.fatal.store(true, Ordering::SeqCst);
                    let mut first = run.first_error.lock().await;
                    if first.is_none() {
                        *first = Some(e);
                    }
                    return;
                }
            }
            run.progress.increment();
        }
    }
}
