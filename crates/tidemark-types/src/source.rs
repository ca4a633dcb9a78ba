//! Task union and source variants.
//!
//! `task.type` in a job document is a tagged union over the supported
//! connector kinds. Modelling it as a sum type means an unhandled kind is a
//! compile error, not a silent no-op.

use serde::{Deserialize, Serialize};

use crate::target::TargetSpec;

/// Tagged task union, discriminated on `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskSpec {
    /// Relational table (one or many sharded connections) into the warehouse.
    Relational {
        source: RelationalSource,
        target: TargetSpec,
    },
    /// Spreadsheet range into the warehouse. Always a full re-read.
    Spreadsheet {
        source: SpreadsheetSource,
        target: TargetSpec,
    },
    /// Extraction/transformation delegated to an external batch-compute job.
    ComputeDelegate {
        source: DelegateSource,
        target: TargetSpec,
    },
}

impl TaskSpec {
    /// The warehouse target shared by every variant.
    #[must_use]
    pub fn target(&self) -> &TargetSpec {
        match self {
            Self::Relational { target, .. }
            | Self::Spreadsheet { target, .. }
            | Self::ComputeDelegate { target, .. } => target,
        }
    }

    /// Unique keys used for merge conflict resolution, if the variant has any.
    #[must_use]
    pub fn unique_keys(&self) -> &[String] {
        match self {
            Self::Relational { source, .. } => &source.unique_keys,
            Self::Spreadsheet { source, .. } => &source.unique_keys,
            Self::ComputeDelegate { .. } => &[],
        }
    }

    /// Timestamp keys driving incremental windowing, if any.
    ///
    /// Spreadsheet sources have no incremental concept and always report
    /// an empty list.
    #[must_use]
    pub fn timestamp_keys(&self) -> &[String] {
        match self {
            Self::Relational { source, .. } => &source.timestamp_keys,
            Self::Spreadsheet { .. } | Self::ComputeDelegate { .. } => &[],
        }
    }

    /// Window expansion buffer, when the variant supports windowing.
    #[must_use]
    pub fn window_expansion(&self) -> Option<WindowExpansion> {
        match self {
            Self::Relational { source, .. } => source.window_expansion,
            Self::Spreadsheet { .. } | Self::ComputeDelegate { .. } => None,
        }
    }
}

/// One or many named connection references.
///
/// Many references describe a sharded source: the same table spread across
/// several physical databases, extracted per shard and concatenated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConnectionRefs {
    One(String),
    Many(Vec<String>),
}

impl ConnectionRefs {
    /// All referenced connection names, in declaration order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        match self {
            Self::One(name) => vec![name.as_str()],
            Self::Many(names) => names.iter().map(String::as_str).collect(),
        }
    }

    /// Whether this spec fans out over more than one shard.
    #[must_use]
    pub fn is_sharded(&self) -> bool {
        matches!(self, Self::Many(names) if names.len() > 1)
    }
}

/// Relational-table source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationalSource {
    pub connection: ConnectionRefs,
    #[serde(default)]
    pub schema: Option<String>,
    pub table: String,
    /// Columns driving the incremental window filter. Empty means the
    /// extraction is always full.
    #[serde(default)]
    pub timestamp_keys: Vec<String>,
    /// Conflict-resolution keys for merge-upsert targets.
    #[serde(default)]
    pub unique_keys: Vec<String>,
    #[serde(default)]
    pub window_expansion: Option<WindowExpansion>,
}

impl RelationalSource {
    /// `schema.table` or bare table name when no schema is set.
    #[must_use]
    pub fn qualified_table(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{schema}.{}", self.table),
            None => self.table.clone(),
        }
    }
}

/// Spreadsheet-range source. No watermark, no window: every run re-reads
/// the full range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpreadsheetSource {
    pub spreadsheet_id: String,
    pub range: String,
    #[serde(default)]
    pub unique_keys: Vec<String>,
    /// Per-column value coercion applied while staging.
    #[serde(default)]
    pub value_formats: Vec<ColumnFormat>,
}

/// A value-formatting rule for one spreadsheet column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnFormat {
    pub column: String,
    pub kind: FormatKind,
    /// strftime-style parse format, e.g. `"%d/%m/%Y"`.
    pub format: String,
}

/// What a formatted spreadsheet column is coerced into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatKind {
    /// ISO-8601 date (`YYYY-MM-DD`).
    Date,
    /// RFC 3339 UTC timestamp.
    Timestamp,
}

/// External batch-compute delegate source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegateSource {
    /// Entrypoint class or path inside the image.
    pub entrypoint: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub driver: ResourceShape,
    #[serde(default)]
    pub executor: ResourceShape,
    #[serde(default)]
    pub workers: WorkerBounds,
    /// Seconds the platform keeps the finished job around before reclaiming
    /// its resources. Guarantees cleanup even if polling is interrupted.
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds_after_finished: u32,
    /// Shuffle-tracking idle timeout, only meaningful under elastic scaling.
    #[serde(default)]
    pub shuffle_tracking_timeout_seconds: Option<u32>,
}

fn default_ttl_seconds() -> u32 {
    600
}

/// CPU/memory request for one driver or executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceShape {
    pub cores: u32,
    pub memory: String,
}

impl Default for ResourceShape {
    fn default() -> Self {
        Self {
            cores: 1,
            memory: "2g".to_string(),
        }
    }
}

/// Elastic worker bounds for a delegated job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerBounds {
    pub min: u32,
    pub initial: u32,
    pub max: u32,
}

impl Default for WorkerBounds {
    fn default() -> Self {
        Self {
            min: 1,
            initial: 1,
            max: 1,
        }
    }
}

impl WorkerBounds {
    /// Elastic scaling is enabled when the bounds are not degenerate.
    #[must_use]
    pub fn is_elastic(&self) -> bool {
        self.max > self.min
    }
}

/// Buffer subtracted from the watermark when opening an extraction window,
/// so rows committed with a lagging timestamp are re-included instead of
/// being skipped forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowExpansion {
    pub value: u32,
    pub unit: ExpansionUnit,
}

/// Unit for [`WindowExpansion`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpansionUnit {
    Minutes,
    Hours,
    Days,
}

impl WindowExpansion {
    /// Convert to a chrono duration. Absent expansion is zero.
    #[must_use]
    pub fn to_duration(opt: Option<Self>) -> chrono::Duration {
        match opt {
            None => chrono::Duration::zero(),
            Some(exp) => {
                let value = i64::from(exp.value);
                match exp.unit {
                    ExpansionUnit::Minutes => chrono::Duration::minutes(value),
                    ExpansionUnit::Hours => chrono::Duration::hours(value),
                    ExpansionUnit::Days => chrono::Duration::days(value),
                }
            }
        }
    }
}
