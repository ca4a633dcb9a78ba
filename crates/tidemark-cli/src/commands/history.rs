use std::path::Path;

use anyhow::{Context, Result};
use tidemark_state::{SqliteWatermarkStore, WatermarkStore};
use tidemark_types::JobName;

/// Execute the `history` command: print recent runs of a job, newest first.
pub fn execute(state_db: &Path, job: &str, limit: u32) -> Result<()> {
    let store = SqliteWatermarkStore::open(state_db)
        .with_context(|| format!("opening state database {}", state_db.display()))?;
    let rows = store.run_history(&JobName::new(job), limit)?;

    if rows.is_empty() {
        println!("job '{job}' has no recorded runs");
        return Ok(());
    }

    println!(
        "{:<22} {:<18} {:>8} {:<22} {}",
        "LOGICAL TIME", "STATE", "ATTEMPTS", "FINISHED", "ERROR"
    );
    for run in rows {
        let finished = run
            .finished_at
            .map_or_else(|| "-".to_string(), |t| t.to_rfc3339());
        let error = match (&run.error_kind, &run.error_message) {
            (Some(kind), Some(msg)) => format!("{kind}: {msg}"),
            (Some(kind), None) => kind.clone(),
            _ => "-".to_string(),
        };
        println!(
            "{:<22} {:<18} {:>8} {:<22} {}",
            run.logical_time.to_rfc3339(),
            run.state.as_str(),
            run.attempts,
            finished,
            error
        );
    }
    Ok(())
}
