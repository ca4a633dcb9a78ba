//! Watermark store trait definition.
//!
//! [`WatermarkStore`] defines the storage contract for per-job incremental
//! cursors and run history. Model types for job specs live in
//! `tidemark_types`.

use chrono::{DateTime, Utc};
use tidemark_types::{JobName, RunState, Window};

use crate::error;

/// Snapshot of a persisted watermark for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watermark {
    /// Upper bound of the last successfully committed extraction window.
    pub value: DateTime<Utc>,
    /// When this cursor was last written.
    pub updated_at: DateTime<Utc>,
}

/// One persisted run-history row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRow {
    pub id: i64,
    pub job: JobName,
    pub logical_time: DateTime<Utc>,
    pub state: RunState,
    pub attempts: u32,
    pub window: Option<Window>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
}

/// Storage contract for watermarks and run history.
///
/// Implementations must be `Send + Sync` for use behind
/// `Arc<dyn WatermarkStore>`, and must survive orchestrator restarts.
pub trait WatermarkStore: Send + Sync {
    /// Read the current watermark for a job.
    ///
    /// Returns `Ok(None)` when the job has never committed a run.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn get(&self, job: &JobName) -> error::Result<Option<Watermark>>;

    /// Advance the watermark for `job` to `to`, atomically and monotonically.
    ///
    /// Returns `true` if the cursor moved (insert, or `to` is strictly newer
    /// than the stored value) and `false` if the stored value is already at
    /// or past `to` — the cursor never moves backward, even when a
    /// later-started run finishes first.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn advance(&self, job: &JobName, to: DateTime<Utc>) -> error::Result<bool>;

    /// Record the start of a run, returning its row ID.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn start_run(&self, job: &JobName, logical_time: DateTime<Utc>) -> error::Result<i64>;

    /// Finalize a run row with its terminal state, attempt count, window,
    /// and classified error (if any).
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn complete_run(
        &self,
        run_id: i64,
        state: RunState,
        attempts: u32,
        window: Option<Window>,
        error_kind: Option<&str>,
        error_message: Option<&str>,
    ) -> error::Result<()>;

    /// Latest logical time any run of `job` was recorded for, terminal or
    /// not. Used to restore trigger bookkeeping across restarts.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn last_logical_time(&self, job: &JobName) -> error::Result<Option<DateTime<Utc>>>;

    /// Latest logical time whose run ended in
    /// [`RunState::RetriesExhausted`]. Restored on startup so a failed run
    /// keeps blocking its dependents across orchestrator restarts.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn last_failed_logical_time(&self, job: &JobName) -> error::Result<Option<DateTime<Utc>>>;

    /// Most recent run rows for a job, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn run_history(&self, job: &JobName, limit: u32) -> error::Result<Vec<RunRow>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Verify the trait is object-safe (can be used as `dyn WatermarkStore`).
    #[test]
    fn trait_is_object_safe() {
        fn _assert_object_safe(_: &dyn WatermarkStore) {}
    }
}
