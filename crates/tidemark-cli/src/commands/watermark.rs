use std::path::Path;

use anyhow::{Context, Result};
use tidemark_state::{SqliteWatermarkStore, WatermarkStore};
use tidemark_types::JobName;

/// Execute the `watermark` command: print the persisted cursor for a job.
pub fn execute(state_db: &Path, job: &str) -> Result<()> {
    let store = SqliteWatermarkStore::open(state_db)
        .with_context(|| format!("opening state database {}", state_db.display()))?;
    let name = JobName::new(job);

    match store.get(&name)? {
        Some(watermark) => {
            println!("job:        {job}");
            println!("watermark:  {}", watermark.value.to_rfc3339());
            println!("updated_at: {}", watermark.updated_at.to_rfc3339());
        }
        None => println!("job '{job}' has no watermark (no successful incremental run yet)"),
    }
    Ok(())
}
