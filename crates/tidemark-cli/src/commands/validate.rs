use std::path::Path;

use anyhow::Result;
use tidemark_engine::SpecRegistry;

/// Execute the `validate` command: load and validate every job document
/// under `dir`, reporting field-level diagnostics for the first bad one.
pub fn execute(dir: &Path) -> Result<()> {
    let mut registry = SpecRegistry::new();
    let loaded = registry.load_dir(dir)?;

    let mut jobs = registry.jobs();
    jobs.sort_by(|a, b| a.name.as_str().cmp(b.name.as_str()));
    for spec in &jobs {
        let kind = match &spec.task {
            tidemark_types::TaskSpec::Relational { .. } => "relational",
            tidemark_types::TaskSpec::Spreadsheet { .. } => "spreadsheet",
            tidemark_types::TaskSpec::ComputeDelegate { .. } => "compute_delegate",
        };
        println!(
            "{:<40} {:<16} {} -> {}",
            spec.name,
            kind,
            spec.behavior.cron,
            spec.task.target().qualified_table()
        );
    }

    println!("\n{loaded} job spec(s) valid.");
    Ok(())
}
