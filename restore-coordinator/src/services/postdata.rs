//! Post-data restore in two parallel batches.
//!
//! Creating several indexes at once on an append-optimized table that has no
//! index yet can deadlock. The first batch therefore holds exactly one index
//! per table; once it completes, every such table has an index and the rest
//! can run in parallel safely.

use std::collections::HashSet;
use tracing::info;

use crate::error::Result;
use crate::models::toc::{ObjectType, StatementWithType};
use crate::services::statements::StatementExecutor;

/// Splits `statements` into the first index of each owning table and
/// everything else, preserving input order within each batch.
pub fn batch_postdata_statements(
    statements: Vec<StatementWithType>,
) -> (Vec<StatementWithType>, Vec<StatementWithType>) {
    let mut indexed = HashSet::new();
    let mut first = Vec::new();
    let mut second = Vec::new();
    for statement in statements {
        if statement.object_type == ObjectType::Index
            && indexed.insert(statement.reference_object.clone())
        {
            first.push(statement);
        } else {
            second.push(statement);
        }
    }
    (first, second)
}

/// Returns the number of failed statements (on-error-continue only).
pub async fn restore_postdata(
    executor: &StatementExecutor,
    statements: Vec<StatementWithType>,
) -> Result<usize> {
    info!("Restoring post-data metadata");
    let (first, second) = batch_postdata_statements(statements);
    let mut failures = executor
        .execute_statements(first, "Post-data objects (first batch)", true)
        .await?;
    failures += executor
        .execute_statements(second, "Post-data objects", true)
        .await?;
    info!("Post-data metadata restore complete");
    Ok(failures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::fake::FakePool;
    use crate::services::dispatcher::ErroredSet;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn stmt(kind: ObjectType, name: &str, reference: &str) -> StatementWithType {
        StatementWithType {
            schema: "public".into(),
            name: name.into(),
            object_type: kind,
            reference_object: reference.into(),
            statement: format!("-- {} {}\n", name, reference),
        }
    }

    fn names(statements: &[StatementWithType]) -> Vec<&str> {
        statements.iter().map(|s| s.name.as_str()).collect()
    }

    #[test]
    fn test_first_index_per_table() {
        let input = vec![
            stmt(ObjectType::Index, "foo_idx1", "public.foo"),
            stmt(ObjectType::Index, "foo_idx2", "public.foo"),
            stmt(ObjectType::Trigger, "bar_trig", "public.bar"),
            stmt(ObjectType::Index, "bar_idx1", "public.bar"),
            stmt(ObjectType::Rule, "foo_rule", "public.foo"),
            stmt(ObjectType::Index, "baz_idx1", "public.baz"),
            stmt(ObjectType::Index, "bar_idx2", "public.bar"),
        ];
        let (first, second) = batch_postdata_statements(input.clone());
        assert_eq!(names(&first), vec!["foo_idx1", "bar_idx1", "baz_idx1"]);
        assert_eq!(
            names(&second),
            vec!["foo_idx2", "bar_trig", "foo_rule", "bar_idx2"]
        );
        assert_eq!(first.len() + second.len(), input.len());
    }

    #[test]
    fn test_no_indexes() {
        let input = vec![
            stmt(ObjectType::Constraint, "foo_pk", "public.foo"),
            stmt(ObjectType::EventTrigger, "evt", ""),
        ];
        let (first, second) = batch_postdata_statements(input);
        assert!(first.is_empty());
        assert_eq!(names(&second), vec!["foo_pk", "evt"]);
    }

    #[tokio::test]
    async fn test_second_batch_waits_for_first() {
        let pool = Arc::new(FakePool::new(4).with_delay(Duration::from_millis(10)));
        let executor = StatementExecutor::new(
            pool.clone(),
            false,
            ErroredSet::default(),
            CancellationToken::new(),
        );
        let input = vec![
            stmt(ObjectType::Index, "foo_idx1", "public.foo"),
            stmt(ObjectType::Index, "foo_idx2", "public.foo"),
            stmt(ObjectType::Index, "bar_idx1", "public.bar"),
            stmt(ObjectType::Index, "bar_idx2", "public.bar"),
        ];
        assert_eq!(restore_postdata(&executor, input).await.unwrap(), 0);
        let order: Vec<String> = pool.statements();
        let position = |needle: &str| order.iter().position(|s| s.contains(needle)).unwrap();
        assert!(position("foo_idx2") > position("foo_idx1"));
        assert!(position("foo_idx2") > position("bar_idx1"));
        assert!(position("bar_idx2") > position("bar_idx1"));
    }
}
