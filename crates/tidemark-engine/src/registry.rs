//! Job spec registry: YAML parsing, environment substitution, and
//! load-time validation.
//!
//! Malformed documents are rejected here with field-level diagnostics; a
//! spec that reaches the schedule engine is structurally and semantically
//! valid. Loaded specs are immutable.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, LazyLock};

use anyhow::Context;
use regex::Regex;
use tidemark_types::{JobName, JobSpec, LoadMethod, RunError, TaskSpec};

use crate::scheduler::parse_cron;

static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env var regex"));

/// Substitute `${VAR_NAME}` patterns with environment variable values.
///
/// # Errors
///
/// Returns an error naming every referenced variable that is not set.
pub fn substitute_env_vars(input: &str) -> anyhow::Result<String> {
    let mut result = input.to_string();
    let mut missing = Vec::new();

    for cap in ENV_VAR_RE.captures_iter(input) {
        let var_name = &cap[1];
        match std::env::var(var_name) {
            Ok(val) => {
                result = result.replace(&cap[0], &val);
            }
            Err(_) => missing.push(var_name.to_string()),
        }
    }

    if !missing.is_empty() {
        anyhow::bail!("Missing environment variable(s): {}", missing.join(", "));
    }

    Ok(result)
}

/// In-memory registry of validated job specs, keyed by globally unique name.
#[derive(Default)]
pub struct SpecRegistry {
    jobs: HashMap<JobName, Arc<JobSpec>>,
}

impl SpecRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one job document from a YAML string (after env substitution)
    /// and validate it.
    ///
    /// # Errors
    ///
    /// Returns [`RunError::SpecInvalid`] with every diagnostic found.
    pub fn parse_job_str(yaml_str: &str) -> Result<JobSpec, RunError> {
        let substituted = substitute_env_vars(yaml_str)
            .map_err(|e| RunError::SpecInvalid(e.to_string()))?;
        let spec: JobSpec = serde_yaml::from_str(&substituted)
            .map_err(|e| RunError::SpecInvalid(format!("document does not parse: {e}")))?;
        validate_job(&spec)?;
        Ok(spec)
    }

    /// Register a validated spec, rejecting duplicate names.
    ///
    /// # Errors
    ///
    /// Returns [`RunError::SpecInvalid`] on a duplicate job name.
    pub fn insert(&mut self, spec: JobSpec) -> Result<(), RunError> {
        if self.jobs.contains_key(&spec.name) {
            return Err(RunError::SpecInvalid(format!(
                "name: duplicate job name '{}'",
                spec.name
            )));
        }
        self.jobs.insert(spec.name.clone(), Arc::new(spec));
        Ok(())
    }

    /// Load every `*.yaml` / `*.yml` document under `dir`, recursively.
    ///
    /// # Errors
    ///
    /// Returns the first I/O failure, or [`RunError::SpecInvalid`] (wrapped)
    /// for the first document that fails validation, naming the file.
    pub fn load_dir(&mut self, dir: &Path) -> anyhow::Result<usize> {
        let mut files = Vec::new();
        collect_yaml_files(dir, &mut files)
            .with_context(|| format!("scanning spec directory {}", dir.display()))?;
        files.sort();

        let mut loaded = 0;
        for file in files {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("reading spec file {}", file.display()))?;
            let spec = Self::parse_job_str(&content)
                .map_err(|e| anyhow::anyhow!("{}: {e}", file.display()))?;
            tracing::debug!(job = %spec.name, file = %file.display(), "Loaded job spec");
            self.insert(spec)
                .map_err(|e| anyhow::anyhow!("{}: {e}", file.display()))?;
            loaded += 1;
        }
        Ok(loaded)
    }

    /// Look up a spec by name.
    #[must_use]
    pub fn get(&self, name: &JobName) -> Option<Arc<JobSpec>> {
        self.jobs.get(name).cloned()
    }

    /// All registered specs, in unspecified order.
    #[must_use]
    pub fn jobs(&self) -> Vec<Arc<JobSpec>> {
        self.jobs.values().cloned().collect()
    }

    /// Number of registered specs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Whether the registry holds no specs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

fn collect_yaml_files(dir: &Path, out: &mut Vec<std::path::PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_yaml_files(&path, out)?;
        } else if matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml" | "yml")
        ) {
            out.push(path);
        }
    }
    Ok(())
}

/// Validate a parsed job spec.
/// Returns `Ok(())` if valid, or every validation failure found.
///
/// # Errors
///
/// Returns [`RunError::SpecInvalid`] listing all field-level diagnostics.
pub fn validate_job(spec: &JobSpec) -> Result<(), RunError> {
    let mut errors = Vec::new();

    if spec.name.as_str().trim().is_empty() {
        errors.push("name: must not be empty".to_string());
    }

    if let Err(e) = parse_cron(&spec.behavior.cron) {
        errors.push(format!(
            "behavior.cron: invalid expression '{}': {e}",
            spec.behavior.cron
        ));
    }

    if spec.behavior.max_active_runs == 0 {
        errors.push("behavior.max_active_runs: must be at least 1".to_string());
    }

    if spec.behavior.timeout_minutes == 0 {
        errors.push("behavior.timeout_minutes: must be at least 1".to_string());
    }

    let target = spec.task.target();
    if target.project.trim().is_empty()
        || target.dataset.trim().is_empty()
        || target.table.trim().is_empty()
    {
        errors.push("task.target: project, dataset, and table must be set".to_string());
    }

    if target.load_method == LoadMethod::MergeUpsert && spec.task.unique_keys().is_empty() {
        errors.push(
            "task.source.unique_keys: merge_upsert requires at least one unique key".to_string(),
        );
    }

    match &spec.task {
        TaskSpec::Relational { source, .. } => {
            if source.connection.names().is_empty() {
                errors.push("task.source.connection: must name at least one connection".to_string());
            }
            if source.table.trim().is_empty() {
                errors.push("task.source.table: must not be empty".to_string());
            }
            if target.load_method == LoadMethod::MergeUpsert && source.timestamp_keys.is_empty() {
                errors.push(
                    "task.source.timestamp_keys: incremental merge_upsert requires at least one \
                     timestamp key"
                        .to_string(),
                );
            }
        }
        TaskSpec::Spreadsheet { source, .. } => {
            if source.spreadsheet_id.trim().is_empty() {
                errors.push("task.source.spreadsheet_id: must not be empty".to_string());
            }
            if source.range.trim().is_empty() {
                errors.push("task.source.range: must not be empty".to_string());
            }
        }
        TaskSpec::ComputeDelegate { source, .. } => {
            if source.entrypoint.trim().is_empty() {
                errors.push("task.source.entrypoint: must not be empty".to_string());
            }
            if source.workers.min > source.workers.max {
                errors.push("task.source.workers: min must not exceed max".to_string());
            }
            if source.workers.initial < source.workers.min
                || source.workers.initial > source.workers.max
            {
                errors.push(
                    "task.source.workers: initial must lie within [min, max]".to_string(),
                );
            }
            if source.ttl_seconds_after_finished == 0 {
                errors.push(
                    "task.source.ttl_seconds_after_finished: must be at least 1".to_string(),
                );
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(RunError::SpecInvalid(errors.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_JOB: &str = r#"
name: bronze.shop.orders
behavior:
  cron: "0 2 * * *"
  start_date: "2026-01-01T00:00:00Z"
  catchup: false
  max_active_runs: 1
  retry:
    count: 2
    delay_in_minute: 5
priority_weight: 5
tags: [bronze, shop]
owner: data-platform
task:
  type: relational
  source:
    connection: pg_shop
    schema: public
    table: orders
    timestamp_keys: [updated_at]
    unique_keys: [id]
    window_expansion:
      value: 30
      unit: minutes
  target:
    project: acme
    dataset: bronze
    table: orders
    load_method: merge_upsert
    partition_field: created_date
"#;

    #[test]
    fn valid_job_parses_and_validates() {
        let spec = SpecRegistry::parse_job_str(VALID_JOB).unwrap();
        assert_eq!(spec.name.as_str(), "bronze.shop.orders");
        assert_eq!(spec.behavior.retry.count, 2);
        assert_eq!(spec.priority_weight, 5);
    }

    #[test]
    fn env_vars_are_substituted() {
        std::env::set_var("TM_TEST_CONN", "pg_shop_replica");
        let yaml = VALID_JOB.replace("pg_shop", "${TM_TEST_CONN}");
        let spec = SpecRegistry::parse_job_str(&yaml).unwrap();
        match &spec.task {
            TaskSpec::Relational { source, .. } => {
                assert_eq!(source.connection.names(), vec!["pg_shop_replica"]);
            }
            other => panic!("expected relational task, got {other:?}"),
        }
        std::env::remove_var("TM_TEST_CONN");
    }

    #[test]
    fn missing_env_var_is_reported() {
        let yaml = VALID_JOB.replace("pg_shop", "${TM_DEFINITELY_NOT_SET_9}");
        let err = SpecRegistry::parse_job_str(&yaml).unwrap_err();
        assert!(err.to_string().contains("TM_DEFINITELY_NOT_SET_9"));
    }

    #[test]
    fn merge_upsert_without_unique_keys_is_rejected() {
        let yaml = VALID_JOB.replace("unique_keys: [id]", "unique_keys: []");
        let err = SpecRegistry::parse_job_str(&yaml).unwrap_err();
        assert_eq!(err.kind(), "spec_invalid");
        assert!(err.to_string().contains("unique_keys"), "got: {err}");
    }

    #[test]
    fn merge_upsert_without_timestamp_keys_is_rejected() {
        let yaml = VALID_JOB.replace("timestamp_keys: [updated_at]", "timestamp_keys: []");
        let err = SpecRegistry::parse_job_str(&yaml).unwrap_err();
        assert!(err.to_string().contains("timestamp_keys"), "got: {err}");
    }

    #[test]
    fn invalid_cron_is_rejected_with_field_diagnostic() {
        let yaml = VALID_JOB.replace("\"0 2 * * *\"", "\"not a cron\"");
        let err = SpecRegistry::parse_job_str(&yaml).unwrap_err();
        assert!(err.to_string().contains("behavior.cron"), "got: {err}");
    }

    #[test]
    fn zero_max_active_runs_is_rejected() {
        let yaml = VALID_JOB.replace("max_active_runs: 1", "max_active_runs: 0");
        let err = SpecRegistry::parse_job_str(&yaml).unwrap_err();
        assert!(err.to_string().contains("max_active_runs"), "got: {err}");
    }

    #[test]
    fn multiple_diagnostics_are_all_reported() {
        let yaml = VALID_JOB
            .replace("max_active_runs: 1", "max_active_runs: 0")
            .replace("unique_keys: [id]", "unique_keys: []");
        let err = SpecRegistry::parse_job_str(&yaml).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("max_active_runs"), "got: {msg}");
        assert!(msg.contains("unique_keys"), "got: {msg}");
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = SpecRegistry::new();
        registry
            .insert(SpecRegistry::parse_job_str(VALID_JOB).unwrap())
            .unwrap();
        let err = registry
            .insert(SpecRegistry::parse_job_str(VALID_JOB).unwrap())
            .unwrap_err();
        assert!(err.to_string().contains("duplicate"), "got: {err}");
    }

    #[test]
    fn load_dir_walks_recursively() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("shop");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("orders.yaml"), VALID_JOB).unwrap();
        std::fs::write(
            dir.path().join("customers.yml"),
            VALID_JOB.replace("bronze.shop.orders", "bronze.shop.customers"),
        )
        .unwrap();
        std::fs::write(dir.path().join("README.md"), "not a spec").unwrap();

        let mut registry = SpecRegistry::new();
        let loaded = registry.load_dir(dir.path()).unwrap();
        assert_eq!(loaded, 2);
        assert!(registry
            .get(&JobName::new("bronze.shop.orders"))
            .is_some());
        assert!(registry
            .get(&JobName::new("bronze.shop.customers"))
            .is_some());
    }

    #[test]
    fn delegate_worker_bounds_are_validated() {
        let yaml = r#"
name: silver.shop.orders_agg
behavior:
  cron: "0 3 * * *"
  start_date: "2026-01-01T00:00:00Z"
task:
  type: compute_delegate
  source:
    entrypoint: com.acme.OrdersAgg
    image: registry.acme.io/spark-jobs:1.4.0
    workers:
      min: 4
      initial: 2
      max: 3
  target:
    project: acme
    dataset: silver
    table: orders_agg
    load_method: replace_all
"#;
        let err = SpecRegistry::parse_job_str(yaml).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("workers"), "got: {msg}");
    }
}
