//! Load planning: apply staged rows to a warehouse target.
//!
//! The planner dispatches on the target's load method. `replace_all` is
//! stage-then-swap: readers never observe a half-replaced table, and a
//! staging failure leaves the previous contents untouched. `merge_upsert`
//! matches on the unique keys and applies rows in staging order, so the
//! last row wins on a key collision.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use tidemark_types::run::Row;
use tidemark_types::{LoadMethod, RunError, TargetSpec, TaskSpec};

/// Warehouse write surface. One implementation per backend; the engine
/// only ever talks to this trait.
#[async_trait]
pub trait WarehouseClient: Send + Sync {
    /// Atomically replace the full contents of the target table.
    async fn replace_all(&self, target: &TargetSpec, rows: Vec<Row>) -> anyhow::Result<u64>;

    /// Upsert rows by `unique_keys`: matched rows are updated, unmatched
    /// rows inserted. Rows apply in order.
    async fn merge_upsert(
        &self,
        target: &TargetSpec,
        unique_keys: &[String],
        rows: Vec<Row>,
    ) -> anyhow::Result<u64>;
}

/// Dispatches a staged row batch to the warehouse per the task's target.
pub struct LoadPlanner {
    warehouse: Arc<dyn WarehouseClient>,
}

impl LoadPlanner {
    #[must_use]
    pub fn new(warehouse: Arc<dyn WarehouseClient>) -> Self {
        Self { warehouse }
    }

    /// Apply `rows` to the task's target, returning the loaded row count.
    ///
    /// # Errors
    ///
    /// Returns [`RunError::LoadConflict`] when the warehouse rejects the
    /// load, and [`RunError::SpecInvalid`] for a merge target without
    /// unique keys (the registry rejects such specs up front; this guard
    /// covers specs constructed programmatically).
    pub async fn load(&self, task: &TaskSpec, rows: Vec<Row>) -> Result<u64, RunError> {
        let target = task.target();
        let loaded = match target.load_method {
            LoadMethod::ReplaceAll => self
                .warehouse
                .replace_all(target, rows)
                .await
                .map_err(|e| RunError::LoadConflict(format!("{}: {e}", target.qualified_table())))?,
            LoadMethod::MergeUpsert => {
                let unique_keys = task.unique_keys();
                if unique_keys.is_empty() {
                    return Err(RunError::SpecInvalid(format!(
                        "merge_upsert target '{}' has no unique keys",
                        target.qualified_table()
                    )));
                }
                self.warehouse
                    .merge_upsert(target, unique_keys, rows)
                    .await
                    .map_err(|e| {
                        RunError::LoadConflict(format!("{}: {e}", target.qualified_table()))
                    })?
            }
        };
        tracing::debug!(
            table = target.qualified_table(),
            method = %target.load_method,
            rows = loaded,
            "Load applied"
        );
        Ok(loaded)
    }
}

/// In-memory warehouse used by the engine's tests and local dry runs.
/// Implements the same atomicity and merge contract as a real backend.
#[derive(Default)]
pub struct MemoryWarehouse {
    tables: Mutex<HashMap<String, Vec<Row>>>,
}

impl MemoryWarehouse {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a table's current rows.
    #[must_use]
    pub fn rows(&self, qualified_table: &str) -> Vec<Row> {
        self.tables
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(qualified_table)
            .cloned()
            .unwrap_or_default()
    }
}

fn merge_key(row: &Row, unique_keys: &[String]) -> String {
    let mut key = String::new();
    for k in unique_keys {
        key.push_str(&row.get(k).map(ToString::to_string).unwrap_or_default());
        key.push('\u{1f}');
    }
    key
}

#[async_trait]
impl WarehouseClient for MemoryWarehouse {
    async fn replace_all(&self, target: &TargetSpec, rows: Vec<Row>) -> anyhow::Result<u64> {
        let loaded = rows.len() as u64;
        let mut tables = self
            .tables
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        // Swap in one assignment under the lock; no reader sees a partial
        // table.
        tables.insert(target.qualified_table(), rows);
        Ok(loaded)
    }

    async fn merge_upsert(
        &self,
        target: &TargetSpec,
        unique_keys: &[String],
        rows: Vec<Row>,
    ) -> anyhow::Result<u64> {
        let loaded = rows.len() as u64;
        let mut tables = self
            .tables
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let table = tables.entry(target.qualified_table()).or_default();

        let mut index: HashMap<String, usize> = table
            .iter()
            .enumerate()
            .map(|(i, row)| (merge_key(row, unique_keys), i))
            .collect();
        for row in rows {
            let key = merge_key(&row, unique_keys);
            match index.get(&key) {
                Some(&i) => table[i] = row,
                None => {
                    index.insert(key, table.len());
                    table.push(row);
                }
            }
        }
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, serde_json::Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    fn target(method: LoadMethod) -> TargetSpec {
        TargetSpec {
            project: "acme".into(),
            dataset: "bronze".into(),
            table: "orders".into(),
            load_method: method,
            partition_field: None,
            cluster_fields: Vec::new(),
        }
    }

    fn relational_task(method: LoadMethod, unique_keys: Vec<String>) -> TaskSpec {
        use tidemark_types::source::{ConnectionRefs, RelationalSource};
        TaskSpec::Relational {
            source: RelationalSource {
                connection: ConnectionRefs::One("pg_shop".into()),
                schema: None,
                table: "orders".into(),
                timestamp_keys: vec!["updated_at".into()],
                unique_keys,
                window_expansion: None,
            },
            target: target(method),
        }
    }

    #[tokio::test]
    async fn replace_all_swaps_full_contents() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let planner = LoadPlanner::new(warehouse.clone());
        let task = relational_task(LoadMethod::ReplaceAll, Vec::new());

        planner
            .load(&task, vec![row(&[("id", 1.into())]), row(&[("id", 2.into())])])
            .await
            .unwrap();
        let loaded = planner
            .load(&task, vec![row(&[("id", 9.into())])])
            .await
            .unwrap();

        assert_eq!(loaded, 1);
        let rows = warehouse.rows("acme.bronze.orders");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], serde_json::json!(9));
    }

    #[tokio::test]
    async fn merge_upsert_updates_matches_and_inserts_the_rest() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let planner = LoadPlanner::new(warehouse.clone());
        let task = relational_task(LoadMethod::MergeUpsert, vec!["id".into()]);

        planner
            .load(
                &task,
                vec![
                    row(&[("id", 1.into()), ("state", "placed".into())]),
                    row(&[("id", 2.into()), ("state", "placed".into())]),
                ],
            )
            .await
            .unwrap();
        planner
            .load(
                &task,
                vec![
                    row(&[("id", 2.into()), ("state", "shipped".into())]),
                    row(&[("id", 3.into()), ("state", "placed".into())]),
                ],
            )
            .await
            .unwrap();

        let rows = warehouse.rows("acme.bronze.orders");
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1]["state"], serde_json::json!("shipped"));
        assert_eq!(rows[2]["id"], serde_json::json!(3));
    }

    #[tokio::test]
    async fn merge_upsert_is_idempotent() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let planner = LoadPlanner::new(warehouse.clone());
        let task = relational_task(LoadMethod::MergeUpsert, vec!["id".into()]);
        let batch = vec![
            row(&[("id", 1.into()), ("state", "placed".into())]),
            row(&[("id", 2.into()), ("state", "shipped".into())]),
        ];

        planner.load(&task, batch.clone()).await.unwrap();
        let first = warehouse.rows("acme.bronze.orders");
        planner.load(&task, batch).await.unwrap();
        let second = warehouse.rows("acme.bronze.orders");

        assert_eq!(first, second);
        assert_eq!(second.len(), 2);
    }

    #[tokio::test]
    async fn later_rows_win_within_one_batch() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let planner = LoadPlanner::new(warehouse.clone());
        let task = relational_task(LoadMethod::MergeUpsert, vec!["id".into()]);

        planner
            .load(
                &task,
                vec![
                    row(&[("id", 1.into()), ("database", "shop_a".into())]),
                    row(&[("id", 1.into()), ("database", "shop_b".into())]),
                ],
            )
            .await
            .unwrap();

        let rows = warehouse.rows("acme.bronze.orders");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["database"], serde_json::json!("shop_b"));
    }

    /// Warehouse wrapper that fails before handing the batch to the real
    /// backend, simulating a staging failure ahead of the commit point.
    struct FailBeforeCommit {
        inner: MemoryWarehouse,
        fail_next: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl WarehouseClient for FailBeforeCommit {
        async fn replace_all(&self, target: &TargetSpec, rows: Vec<Row>) -> anyhow::Result<u64> {
            if self
                .fail_next
                .swap(false, std::sync::atomic::Ordering::SeqCst)
            {
                anyhow::bail!("staging aborted");
            }
            self.inner.replace_all(target, rows).await
        }

        async fn merge_upsert(
            &self,
            target: &TargetSpec,
            unique_keys: &[String],
            rows: Vec<Row>,
        ) -> anyhow::Result<u64> {
            self.inner.merge_upsert(target, unique_keys, rows).await
        }
    }

    #[tokio::test]
    async fn failed_replace_leaves_prior_contents_untouched() {
        let warehouse = Arc::new(FailBeforeCommit {
            inner: MemoryWarehouse::new(),
            fail_next: std::sync::atomic::AtomicBool::new(false),
        });
        let planner = LoadPlanner::new(warehouse.clone());
        let task = relational_task(LoadMethod::ReplaceAll, Vec::new());

        planner
            .load(&task, vec![row(&[("id", 1.into())]), row(&[("id", 2.into())])])
            .await
            .unwrap();
        let before = warehouse.inner.rows("acme.bronze.orders");

        warehouse
            .fail_next
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let err = planner
            .load(&task, vec![row(&[("id", 9.into())])])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "load_conflict");
        assert_eq!(warehouse.inner.rows("acme.bronze.orders"), before);
    }

    #[tokio::test]
    async fn merge_without_unique_keys_is_rejected() {
        let planner = LoadPlanner::new(Arc::new(MemoryWarehouse::new()));
        let task = relational_task(LoadMethod::MergeUpsert, Vec::new());
        let err = planner.load(&task, Vec::new()).await.unwrap_err();
        assert_eq!(err.kind(), "spec_invalid");
    }

    #[tokio::test]
    async fn compound_unique_keys_distinguish_rows() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let planner = LoadPlanner::new(warehouse.clone());
        let task = relational_task(
            LoadMethod::MergeUpsert,
            vec!["id".into(), "database".into()],
        );

        planner
            .load(
                &task,
                vec![
                    row(&[("id", 1.into()), ("database", "shop_a".into())]),
                    row(&[("id", 1.into()), ("database", "shop_b".into())]),
                ],
            )
            .await
            .unwrap();

        assert_eq!(warehouse.rows("acme.bronze.orders").len(), 2);
    }
}
