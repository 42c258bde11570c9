//! Restoring onto a cluster whose segment count differs from the backup's.

use tracing::{debug, info};

use crate::db::ConnectionPool;
use crate::error::{RestoreError, Result};
use segment_helper::resize::ResizePlan;

/// Resize plan for restoring `orig` segments worth of data onto `dest` segments.
///
/// Returns `None` when the counts match. Differing counts without
/// `resize_cluster` are rejected before any data moves.
pub fn resize_plan(orig: i32, dest: i32, resize_cluster: bool) -> Result<Option<ResizePlan>> {
    if orig == dest {
        return Ok(None);
    }
    if !resize_cluster {
        return Err(RestoreError::InvalidManifest(format!(
            "Cannot restore a backup taken on a cluster with {} segments to a cluster with {} segments; \
             use resize-cluster to restore to a different-sized cluster",
            orig, dest
        )));
    }
    let plan = ResizePlan::new(orig, dest)?;
    info!(
        orig,
        dest,
        passes = plan.batches(),
        "Restoring to a cluster of a different size"
    );
    Ok(Some(plan))
}

pub fn redistribute_statement(table: &str) -> String {
    format!("ALTER TABLE {} SET WITH (REORGANIZE=true)", table)
}

/// Rebalances `table` across the destination segments after its passes are loaded.
pub async fn redistribute_table(pool: &dyn ConnectionPool, which: usize, table: &str) -> Result<()> {
    debug!(table, "Redistributing data");
    pool.exec(&redistribute_statement(table), which).await?;
    Ok(())
}
