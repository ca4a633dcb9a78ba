//! Extraction window calculation.
//!
//! The window for a run is derived from the persisted watermark, the job's
//! expansion buffer, and the run's logical trigger time. The expansion
//! exists because sources may commit rows with a timestamp slightly behind
//! wall clock (replication or commit lag); without it, rows landing in
//! `[previous-window-end - lag, previous-window-end]` would be skipped
//! forever.

use chrono::{DateTime, Duration, Utc};
use tidemark_types::{TaskSpec, Window, WindowExpansion};

/// Compute the extraction window for one run.
///
/// `end` is always the logical trigger time. `start` is the watermark minus
/// the expansion buffer, or unbounded on the first run.
#[must_use]
pub fn compute_window(
    last_watermark: Option<DateTime<Utc>>,
    expansion: Duration,
    logical_now: DateTime<Utc>,
) -> Window {
    match last_watermark {
        None => Window::unbounded(logical_now),
        Some(watermark) => Window {
            start: Some(watermark - expansion),
            end: logical_now,
        },
    }
}

/// Window for a concrete task: sources without timestamp keys have no
/// incremental concept and always extract in full.
#[must_use]
pub fn window_for_task(
    task: &TaskSpec,
    last_watermark: Option<DateTime<Utc>>,
    logical_now: DateTime<Utc>,
) -> Window {
    if task.timestamp_keys().is_empty() {
        return Window::unbounded(logical_now);
    }
    let expansion = WindowExpansion::to_duration(task.window_expansion());
    compute_window(last_watermark, expansion, logical_now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tidemark_types::source::{
        ConnectionRefs, ExpansionUnit, RelationalSource, SpreadsheetSource,
    };
    use tidemark_types::{LoadMethod, TargetSpec};

    fn ts(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, m, 0).unwrap()
    }

    fn target() -> TargetSpec {
        TargetSpec {
            project: "acme".into(),
            dataset: "bronze".into(),
            table: "orders".into(),
            load_method: LoadMethod::MergeUpsert,
            partition_field: None,
            cluster_fields: Vec::new(),
        }
    }

    #[test]
    fn first_run_is_unbounded() {
        let window = compute_window(None, Duration::minutes(30), ts(6, 0));
        assert!(window.is_full());
        assert_eq!(window.end, ts(6, 0));
    }

    #[test]
    fn start_is_watermark_minus_expansion() {
        let window = compute_window(Some(ts(4, 0)), Duration::minutes(30), ts(6, 0));
        assert_eq!(window.start, Some(ts(3, 30)));
        assert_eq!(window.end, ts(6, 0));
    }

    #[test]
    fn zero_expansion_starts_exactly_at_watermark() {
        let window = compute_window(Some(ts(4, 0)), Duration::zero(), ts(6, 0));
        assert_eq!(window.start, Some(ts(4, 0)));
    }

    #[test]
    fn task_without_timestamp_keys_is_always_full() {
        let task = TaskSpec::Relational {
            source: RelationalSource {
                connection: ConnectionRefs::One("pg_shop".into()),
                schema: None,
                table: "orders".into(),
                timestamp_keys: Vec::new(),
                unique_keys: Vec::new(),
                window_expansion: None,
            },
            target: target(),
        };
        // Even with a watermark present, windowing is not applicable.
        let window = window_for_task(&task, Some(ts(4, 0)), ts(6, 0));
        assert!(window.is_full());
    }

    #[test]
    fn spreadsheet_task_ignores_watermark() {
        let task = TaskSpec::Spreadsheet {
            source: SpreadsheetSource {
                spreadsheet_id: "1AbC".into(),
                range: "Sheet1!A1:F".into(),
                unique_keys: Vec::new(),
                value_formats: Vec::new(),
            },
            target: target(),
        };
        let window = window_for_task(&task, Some(ts(4, 0)), ts(6, 0));
        assert!(window.is_full());
        assert_eq!(window.end, ts(6, 0));
    }

    #[test]
    fn relational_task_applies_expansion() {
        let task = TaskSpec::Relational {
            source: RelationalSource {
                connection: ConnectionRefs::One("pg_shop".into()),
                schema: None,
                table: "orders".into(),
                timestamp_keys: vec!["updated_at".into()],
                unique_keys: vec!["id".into()],
                window_expansion: Some(WindowExpansion {
                    value: 1,
                    unit: ExpansionUnit::Hours,
                }),
            },
            target: target(),
        };
        let window = window_for_task(&task, Some(ts(4, 0)), ts(6, 0));
        assert_eq!(window.start, Some(ts(3, 0)));
        assert_eq!(window.end, ts(6, 0));
    }
}
