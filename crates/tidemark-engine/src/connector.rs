//! Source connectors: polymorphic extraction over the task kinds.
//!
//! Relational extraction fans out over every shard of a sharded source and
//! concatenates the results in declaration order, so on unique-key
//! collisions the last shard by declaration order wins once the loader
//! applies rows in order. Any shard failure fails the whole extraction;
//! there is no partial shard commit.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use tidemark_types::run::Row;
use tidemark_types::source::{ColumnFormat, FormatKind, SpreadsheetSource};
use tidemark_types::{RunError, TaskSpec, Window};
use tokio::task::JoinSet;

/// Column added to staged rows of a sharded source, naming the shard each
/// row came from.
pub const SHARD_LABEL_COLUMN: &str = "database";

/// Live access to one relational connection, resolved by name through the
/// deployment's connection resolver.
#[async_trait]
pub trait RelationalClient: Send + Sync {
    /// Extract rows from `table` on the named connection. The window filter
    /// applies over `timestamp_keys`; an unbounded window (or no keys) is a
    /// full scan.
    async fn extract(
        &self,
        connection: &str,
        table: &str,
        timestamp_keys: &[String],
        window: Window,
    ) -> anyhow::Result<Vec<Row>>;
}

/// Live access to the spreadsheet service.
#[async_trait]
pub trait SheetClient: Send + Sync {
    /// Read all rows of a range. Spreadsheets have no incremental concept;
    /// there is no window parameter by design.
    async fn read_range(&self, spreadsheet_id: &str, range: &str) -> anyhow::Result<Vec<Row>>;
}

/// Polymorphic source extraction over the non-delegated task kinds.
pub struct SourceConnector {
    relational: Arc<dyn RelationalClient>,
    sheets: Arc<dyn SheetClient>,
}

impl SourceConnector {
    #[must_use]
    pub fn new(relational: Arc<dyn RelationalClient>, sheets: Arc<dyn SheetClient>) -> Self {
        Self { relational, sheets }
    }

    /// Extract staged rows for one run.
    ///
    /// # Errors
    ///
    /// Returns [`RunError::SourceUnavailable`] when any shard or the sheet
    /// service fails.
    pub async fn extract(&self, task: &TaskSpec, window: Window) -> Result<Vec<Row>, RunError> {
        match task {
            TaskSpec::Relational { source, .. } => {
                let connections = source.connection.names();
                let sharded = connections.len() > 1;
                let table = source.qualified_table();

                let mut shard_tasks: JoinSet<(usize, anyhow::Result<Vec<Row>>)> = JoinSet::new();
                for (index, connection) in connections.iter().enumerate() {
                    let client = self.relational.clone();
                    let connection = (*connection).to_string();
                    let table = table.clone();
                    let timestamp_keys = source.timestamp_keys.clone();
                    shard_tasks.spawn(async move {
                        let rows = client
                            .extract(&connection, &table, &timestamp_keys, window)
                            .await
                            .map(|mut rows| {
                                if sharded {
                                    label_shard(&mut rows, &connection);
                                }
                                rows
                            });
                        (index, rows)
                    });
                }

                let mut slots: Vec<Option<Vec<Row>>> = vec![None; connections.len()];
                while let Some(joined) = shard_tasks.join_next().await {
                    match joined {
                        Ok((index, Ok(rows))) => slots[index] = Some(rows),
                        Ok((index, Err(e))) => {
                            shard_tasks.abort_all();
                            return Err(RunError::SourceUnavailable(format!(
                                "shard '{}' failed: {e}",
                                connections[index]
                            )));
                        }
                        Err(join_err) if join_err.is_cancelled() => {}
                        Err(join_err) => {
                            return Err(RunError::Internal(anyhow::anyhow!(
                                "shard extraction task panicked: {join_err}"
                            )));
                        }
                    }
                }

                // Concatenate in declaration order; the loader applies rows
                // in order, so the last shard wins on key collisions.
                let mut staged = Vec::new();
                for slot in slots {
                    staged.extend(slot.unwrap_or_default());
                }
                tracing::debug!(
                    table,
                    shards = connections.len(),
                    rows = staged.len(),
                    window = %window,
                    "Relational extraction complete"
                );
                Ok(staged)
            }
            TaskSpec::Spreadsheet { source, .. } => {
                let mut rows = self
                    .sheets
                    .read_range(&source.spreadsheet_id, &source.range)
                    .await
                    .map_err(|e| {
                        RunError::SourceUnavailable(format!(
                            "spreadsheet '{}' range '{}': {e}",
                            source.spreadsheet_id, source.range
                        ))
                    })?;
                apply_value_formats(&mut rows, source);
                tracing::debug!(
                    spreadsheet = source.spreadsheet_id,
                    range = source.range,
                    rows = rows.len(),
                    "Spreadsheet extraction complete"
                );
                Ok(rows)
            }
            TaskSpec::ComputeDelegate { .. } => Err(RunError::Internal(anyhow::anyhow!(
                "compute-delegate tasks stage data through the compute platform, not the \
                 source connector"
            ))),
        }
    }
}

/// Tag every row with the shard it came from, the driver prefix stripped
/// from the connection name.
fn label_shard(rows: &mut [Row], connection: &str) {
    let label = connection
        .strip_prefix("pg_")
        .or_else(|| connection.strip_prefix("mysql_"))
        .unwrap_or(connection);
    for row in rows {
        row.insert(
            SHARD_LABEL_COLUMN.to_string(),
            serde_json::Value::String(label.to_string()),
        );
    }
}

/// Coerce formatted columns in place. Unparseable values become null, so a
/// bad cell degrades to a missing value instead of failing the run.
fn apply_value_formats(rows: &mut [Row], source: &SpreadsheetSource) {
    for rule in &source.value_formats {
        for row in rows.iter_mut() {
            if let Some(value) = row.get_mut(&rule.column) {
                *value = coerce_value(value, rule);
            }
        }
    }
}

fn coerce_value(value: &serde_json::Value, rule: &ColumnFormat) -> serde_json::Value {
    let serde_json::Value::String(raw) = value else {
        return serde_json::Value::Null;
    };
    match rule.kind {
        FormatKind::Date => NaiveDate::parse_from_str(raw, &rule.format)
            .map(|d| serde_json::Value::String(d.format("%Y-%m-%d").to_string()))
            .unwrap_or(serde_json::Value::Null),
        FormatKind::Timestamp => NaiveDateTime::parse_from_str(raw, &rule.format)
            .map(|dt| serde_json::Value::String(dt.format("%Y-%m-%dT%H:%M:%SZ").to_string()))
            .unwrap_or(serde_json::Value::Null),
    }
}
