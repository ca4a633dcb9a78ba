//! Compute-job manifest model and name templating.
//!
//! A manifest is rendered per delegated run and discarded once the external
//! job reaches a terminal phase. Name templates substitute from an explicit
//! context record; there is no implicit variable capture.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::source::{ResourceShape, WorkerBounds};

static TEMPLATE_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{(job|date|attempt)\}").expect("valid template token regex"));

/// Substitution context for manifest name templates.
#[derive(Debug, Clone)]
pub struct ManifestContext {
    pub job: String,
    pub logical_date: DateTime<Utc>,
    pub attempt: u32,
}

impl ManifestContext {
    /// Render `{job}` / `{date}` / `{attempt}` tokens, then normalize the
    /// result into a platform-safe name: lowercase, `_` and `.` become `-`.
    #[must_use]
    pub fn render_name(&self, template: &str) -> String {
        let rendered = TEMPLATE_TOKEN_RE.replace_all(template, |caps: &regex::Captures<'_>| {
            match &caps[1] {
                "job" => self.job.clone(),
                "date" => self.logical_date.format("%Y%m%dt%H%M%S").to_string(),
                "attempt" => self.attempt.to_string(),
                _ => unreachable!("regex only matches known tokens"),
            }
        });
        rendered.to_lowercase().replace(['_', '.'], "-")
    }
}

/// Rendered description of one external batch-compute job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeJobManifest {
    /// Platform-unique job name, fresh per attempt.
    pub name: String,
    pub image: String,
    pub entrypoint: String,
    pub arguments: Vec<String>,
    pub driver: ResourceShape,
    pub executor: ResourceShape,
    pub workers: WorkerBounds,
    pub ttl_seconds_after_finished: u32,
    /// Only set when elastic scaling is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shuffle_tracking_timeout_seconds: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ctx() -> ManifestContext {
        ManifestContext {
            job: "bronze.shop.Orders".to_string(),
            logical_date: Utc.with_ymd_and_hms(2026, 3, 1, 2, 30, 0).unwrap(),
            attempt: 2,
        }
    }

    #[test]
    fn render_substitutes_all_tokens() {
        let name = ctx().render_name("{job}-{date}-{attempt}");
        assert_eq!(name, "bronze-shop-orders-20260301t023000-2");
    }

    #[test]
    fn render_normalizes_underscores_and_case() {
        let context = ManifestContext {
            job: "bronze_shop_orders".to_string(),
            logical_date: Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap(),
            attempt: 1,
        };
        assert_eq!(context.render_name("{job}"), "bronze-shop-orders");
    }

    #[test]
    fn render_leaves_unknown_tokens_alone() {
        let name = ctx().render_name("{job}-{unknown}");
        assert!(name.ends_with("-{unknown}"), "got: {name}");
    }
}
