use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tidemark_engine::compute::render_manifest;
use tidemark_engine::{window::window_for_task, SpecRegistry};
use tidemark_state::{SqliteWatermarkStore, WatermarkStore};
use tidemark_types::manifest::ManifestContext;
use tidemark_types::{JobName, TaskSpec};

/// Execute the `render-manifest` command: print the manifest a delegated
/// run of `job` would submit for `logical_time`.
pub fn execute(
    state_db: &Path,
    spec_dir: &Path,
    job: &str,
    logical_time: DateTime<Utc>,
    attempt: u32,
) -> Result<()> {
    let mut registry = SpecRegistry::new();
    registry.load_dir(spec_dir)?;
    let name = JobName::new(job);
    let spec = registry
        .get(&name)
        .with_context(|| format!("job '{job}' not found under {}", spec_dir.display()))?;

    let TaskSpec::ComputeDelegate { source, target } = &spec.task else {
        anyhow::bail!("job '{job}' is not a compute_delegate task");
    };

    // The rendered window mirrors what a live run would compute: the
    // persisted watermark when the state database is reachable, a full
    // window otherwise.
    let watermark = SqliteWatermarkStore::open(state_db)
        .ok()
        .and_then(|store| store.get(&name).ok().flatten())
        .map(|w| w.value);
    let window = window_for_task(&spec.task, watermark, logical_time);

    let context = ManifestContext {
        job: spec.name.to_string(),
        logical_date: logical_time,
        attempt,
    };
    let manifest = render_manifest(&spec.name, source, target, window, &context);
    print!("{}", serde_yaml::to_string(&manifest)?);
    Ok(())
}
