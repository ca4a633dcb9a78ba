//! Extraction windows and run records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::JobName;

/// One staged row: a flat column → value object.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Half-open extraction range `[start, end)`.
///
/// `start == None` means unbounded: a full extraction (first run, or a
/// source with no timestamp keys).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub start: Option<DateTime<Utc>>,
    pub end: DateTime<Utc>,
}

impl Window {
    /// A window with no lower bound.
    #[must_use]
    pub fn unbounded(end: DateTime<Utc>) -> Self {
        Self { start: None, end }
    }

    /// Whether this window covers all history.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.start.is_none()
    }
}

impl std::fmt::Display for Window {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.start {
            Some(start) => write!(f, "[{start}, {})", self.end),
            None => write!(f, "[-inf, {})", self.end),
        }
    }
}

/// Lifecycle of one scheduled run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Queued,
    Running,
    Success,
    RetriesExhausted,
}

impl RunState {
    /// Wire-format string for storage.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Success => "success",
            Self::RetriesExhausted => "retries_exhausted",
        }
    }

    /// Parse the wire-format string.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "retries_exhausted" => Some(Self::RetriesExhausted),
            _ => None,
        }
    }

    /// Terminal states never transition again.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::RetriesExhausted)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution (possibly retried) of a job for a given logical time.
///
/// Owned by the schedule engine for its lifetime; references but never
/// mutates the job spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub job: JobName,
    pub logical_time: DateTime<Utc>,
    pub state: RunState,
    /// Attempts performed so far (1-based once running).
    pub attempts: u32,
    /// Classified error of each failed attempt, oldest first.
    pub attempt_errors: Vec<String>,
    /// Window the run extracted over, once computed.
    pub window: Option<Window>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub rows_loaded: u64,
}

impl RunRecord {
    /// A freshly queued run for `job` at `logical_time`.
    #[must_use]
    pub fn queued(job: JobName, logical_time: DateTime<Utc>) -> Self {
        Self {
            job,
            logical_time,
            state: RunState::Queued,
            attempts: 0,
            attempt_errors: Vec::new(),
            window: None,
            started_at: None,
            finished_at: None,
            rows_loaded: 0,
        }
    }
}
