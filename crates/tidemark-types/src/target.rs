//! Warehouse target model.

use serde::{Deserialize, Serialize};

/// Load strategy against the target table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMethod {
    /// Atomically substitute the table's full contents with the staged rows.
    ReplaceAll,
    /// Merge staged rows by unique key: matching rows are overwritten,
    /// new keys inserted, everything else left untouched.
    MergeUpsert,
}

impl LoadMethod {
    /// Wire-format string.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReplaceAll => "replace_all",
            Self::MergeUpsert => "merge_upsert",
        }
    }
}

impl std::fmt::Display for LoadMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Warehouse destination table plus its load strategy and storage layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSpec {
    pub project: String,
    pub dataset: String,
    pub table: String,
    pub load_method: LoadMethod,
    /// Column whose date value physically groups rows for scan pruning.
    /// A layout hint, never a correctness concern.
    #[serde(default)]
    pub partition_field: Option<String>,
    #[serde(default)]
    pub cluster_fields: Vec<String>,
}

impl TargetSpec {
    /// Fully-qualified `project.dataset.table` identifier.
    #[must_use]
    pub fn qualified_table(&self) -> String {
        format!("{}.{}.{}", self.project, self.dataset, self.table)
    }
}
