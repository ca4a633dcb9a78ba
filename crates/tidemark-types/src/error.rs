//! Run error taxonomy and retry classification.
//!
//! Connector, loader, and submitter failures are caught at the run boundary
//! and classified into one of these kinds; they never leak past the
//! schedule engine untyped.

use std::time::Duration;

/// Classified failure of a run attempt (or of spec loading).
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// Malformed job document. Fatal at load time; no run is ever created.
    #[error("invalid job spec: {0}")]
    SpecInvalid(String),

    /// Source connector unreachable or query failed.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// Warehouse unreachable or a conflicting concurrent writer.
    #[error("load conflict: {0}")]
    LoadConflict(String),

    /// Delegated compute job was rejected or reached the Failed phase.
    #[error("delegate job failed: {0}")]
    DelegateJobFailed(String),

    /// The attempt exceeded the job's timeout and was force-terminated.
    #[error("run timed out after {0:?}")]
    Timeout(Duration),

    /// Terminal: the retry budget is spent. Carries the last classified
    /// error; surfaced to operators, never retried further.
    #[error("retries exhausted after {attempts} attempt(s): {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<RunError>,
    },

    /// Host-side failure (state store, task panic). Never retryable.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl RunError {
    /// Whether the job's retry policy applies to this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::SourceUnavailable(_)
                | Self::LoadConflict(_)
                | Self::DelegateJobFailed(_)
                | Self::Timeout(_)
        )
    }

    /// Stable kind label for run history and operator reports.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SpecInvalid(_) => "spec_invalid",
            Self::SourceUnavailable(_) => "source_unavailable",
            Self::LoadConflict(_) => "load_conflict",
            Self::DelegateJobFailed(_) => "delegate_job_failed",
            Self::Timeout(_) => "run_timeout",
            Self::RetriesExhausted { .. } => "retries_exhausted",
            Self::Internal(_) => "internal",
        }
    }
}
