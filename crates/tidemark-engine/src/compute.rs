//! External batch-compute delegation.
//!
//! For delegated tasks the engine does not move rows itself: it renders a
//! job manifest, submits it to the compute platform, and polls until the
//! job reaches a terminal phase. Every attempt submits a fresh manifest
//! with a fresh platform-unique name, so a retry never collides with the
//! remains of the previous attempt.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::SecondsFormat;
use tidemark_types::manifest::{ComputeJobManifest, ManifestContext};
use tidemark_types::source::DelegateSource;
use tidemark_types::{JobName, RunError, TargetSpec, Window};

/// Name template applied per attempt. The rendered name is normalized into
/// a platform-safe identifier by [`ManifestContext::render_name`].
pub const NAME_TEMPLATE: &str = "{job}-{date}-{attempt}";

/// Image used when the job document does not pin one.
pub const DEFAULT_IMAGE: &str = "registry.local/tidemark/compute-runner:latest";

/// Opaque platform-side identifier of a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DelegateJobId(pub String);

impl std::fmt::Display for DelegateJobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Phase of a delegated job as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelegatePhase {
    Submitted,
    Running,
    Succeeded,
    Failed,
}

impl DelegatePhase {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Batch-compute platform surface: submit, observe, reclaim.
#[async_trait]
pub trait ComputePlatform: Send + Sync {
    /// Submit a rendered manifest. Rejection is a failed attempt, not an
    /// engine fault.
    async fn submit(&self, manifest: &ComputeJobManifest) -> anyhow::Result<DelegateJobId>;

    /// Report the current phase of a submitted job.
    async fn poll(&self, id: &DelegateJobId) -> anyhow::Result<DelegatePhase>;

    /// Best-effort early termination. The manifest's TTL reclaims the job
    /// even when this is never called.
    async fn terminate(&self, id: &DelegateJobId) -> anyhow::Result<()>;
}

/// Render the manifest for one delegated attempt.
///
/// Kept free of the platform handle so operators can render offline.
#[must_use]
pub fn render_manifest(
    job: &JobName,
    source: &DelegateSource,
    target: &TargetSpec,
    window: Window,
    context: &ManifestContext,
) -> ComputeJobManifest {
    let mut arguments = vec![
        "--target".to_string(),
        target.qualified_table(),
        "--load-method".to_string(),
        target.load_method.to_string(),
        "--window-end".to_string(),
        window.end.to_rfc3339_opts(SecondsFormat::Secs, true),
    ];
    if let Some(start) = window.start {
        arguments.push("--window-start".to_string());
        arguments.push(start.to_rfc3339_opts(SecondsFormat::Secs, true));
    }

    let manifest = ComputeJobManifest {
        name: context.render_name(NAME_TEMPLATE),
        image: source
            .image
            .clone()
            .unwrap_or_else(|| DEFAULT_IMAGE.to_string()),
        entrypoint: source.entrypoint.clone(),
        arguments,
        driver: source.driver.clone(),
        executor: source.executor.clone(),
        workers: source.workers,
        ttl_seconds_after_finished: source.ttl_seconds_after_finished,
        // Shuffle tracking only applies under elastic scaling.
        shuffle_tracking_timeout_seconds: if source.workers.is_elastic() {
            source.shuffle_tracking_timeout_seconds
        } else {
            None
        },
    };
    tracing::debug!(job = %job, manifest = manifest.name, image = manifest.image, "Manifest rendered");
    manifest
}

/// Submits delegated jobs and watches them to a terminal phase.
pub struct ComputeJobSubmitter {
    platform: Arc<dyn ComputePlatform>,
    poll_interval: Duration,
}

impl ComputeJobSubmitter {
    #[must_use]
    pub fn new(platform: Arc<dyn ComputePlatform>, poll_interval: Duration) -> Self {
        Self {
            platform,
            poll_interval,
        }
    }

    /// Run one delegated attempt end to end: render, submit, poll until
    /// terminal.
    ///
    /// # Errors
    ///
    /// [`RunError::DelegateJobFailed`] when the platform rejects the
    /// submission or the job reaches the `Failed` phase.
    pub async fn execute(
        &self,
        job: &JobName,
        source: &DelegateSource,
        target: &TargetSpec,
        window: Window,
        attempt: u32,
        logical_time: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), RunError> {
        let context = ManifestContext {
            job: job.to_string(),
            logical_date: logical_time,
            attempt,
        };
        let manifest = render_manifest(job, source, target, window, &context);

        let id = self
            .platform
            .submit(&manifest)
            .await
            .map_err(|e| RunError::DelegateJobFailed(format!("submission rejected: {e}")))?;
        tracing::info!(job = %job, delegate = %id, "Delegate job submitted");

        loop {
            let phase = self
                .platform
                .poll(&id)
                .await
                .map_err(|e| RunError::DelegateJobFailed(format!("poll failed for {id}: {e}")))?;
            match phase {
                DelegatePhase::Succeeded => {
                    tracing::info!(job = %job, delegate = %id, "Delegate job succeeded");
                    return Ok(());
                }
                DelegatePhase::Failed => {
                    return Err(RunError::DelegateJobFailed(format!(
                        "delegate {id} reached Failed phase"
                    )));
                }
                DelegatePhase::Submitted | DelegatePhase::Running => {
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tidemark_types::source::{ResourceShape, WorkerBounds};
    use tidemark_types::LoadMethod;

    fn source(workers: WorkerBounds) -> DelegateSource {
        DelegateSource {
            entrypoint: "jobs.orders.Backfill".into(),
            image: None,
            driver: ResourceShape::default(),
            executor: ResourceShape {
                cores: 4,
                memory: "8g".into(),
            },
            workers,
            ttl_seconds_after_finished: 600,
            shuffle_tracking_timeout_seconds: Some(120),
        }
    }

    fn target() -> TargetSpec {
        TargetSpec {
            project: "acme".into(),
            dataset: "bronze".into(),
            table: "orders".into(),
            load_method: LoadMethod::ReplaceAll,
            partition_field: None,
            cluster_fields: Vec::new(),
        }
    }

    fn context(attempt: u32) -> ManifestContext {
        ManifestContext {
            job: "bronze.shop.orders".into(),
            logical_date: Utc.with_ymd_and_hms(2026, 3, 1, 2, 0, 0).unwrap(),
            attempt,
        }
    }

    #[test]
    fn manifest_name_is_fresh_per_attempt() {
        let job = JobName::new("bronze.shop.orders");
        let window = Window::unbounded(Utc.with_ymd_and_hms(2026, 3, 1, 2, 0, 0).unwrap());
        let first = render_manifest(&job, &source(WorkerBounds::default()), &target(), window, &context(1));
        let second = render_manifest(&job, &source(WorkerBounds::default()), &target(), window, &context(2));
        assert_ne!(first.name, second.name);
        assert_eq!(first.name, "bronze-shop-orders-20260301t020000-1");
        assert_eq!(first.image, DEFAULT_IMAGE);
        // Cleanup TTL rides on every manifest.
        assert_eq!(first.ttl_seconds_after_finished, 600);
    }

    #[test]
    fn shuffle_tracking_dropped_without_elastic_scaling() {
        let job = JobName::new("j");
        let window = Window::unbounded(Utc.with_ymd_and_hms(2026, 3, 1, 2, 0, 0).unwrap());
        let fixed = render_manifest(
            &job,
            &source(WorkerBounds::default()),
            &target(),
            window,
            &context(1),
        );
        assert_eq!(fixed.shuffle_tracking_timeout_seconds, None);

        let elastic = render_manifest(
            &job,
            &source(WorkerBounds {
                min: 1,
                initial: 2,
                max: 8,
            }),
            &target(),
            window,
            &context(1),
        );
        assert_eq!(elastic.shuffle_tracking_timeout_seconds, Some(120));
    }

    #[test]
    fn window_bounds_become_arguments() {
        let job = JobName::new("j");
        let window = Window {
            start: Some(Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()),
            end: Utc.with_ymd_and_hms(2026, 3, 1, 2, 0, 0).unwrap(),
        };
        let manifest = render_manifest(
            &job,
            &source(WorkerBounds::default()),
            &target(),
            window,
            &context(1),
        );
        assert!(manifest
            .arguments
            .windows(2)
            .any(|p| p == ["--window-start", "2026-03-01T00:00:00Z"]));
        assert!(manifest
            .arguments
            .windows(2)
            .any(|p| p == ["--window-end", "2026-03-01T02:00:00Z"]));
    }

    /// Platform scripted with a fixed sequence of phases per poll.
    struct ScriptedPlatform {
        phases: Mutex<VecDeque<DelegatePhase>>,
        reject_submit: bool,
    }

    #[async_trait]
    impl ComputePlatform for ScriptedPlatform {
        async fn submit(&self, manifest: &ComputeJobManifest) -> anyhow::Result<DelegateJobId> {
            if self.reject_submit {
                anyhow::bail!("quota exceeded");
            }
            Ok(DelegateJobId(manifest.name.clone()))
        }

        async fn poll(&self, _id: &DelegateJobId) -> anyhow::Result<DelegatePhase> {
            Ok(self
                .phases
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(DelegatePhase::Succeeded))
        }

        async fn terminate(&self, _id: &DelegateJobId) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn submitter(platform: ScriptedPlatform) -> ComputeJobSubmitter {
        ComputeJobSubmitter::new(Arc::new(platform), Duration::from_secs(5))
    }

    #[tokio::test(start_paused = true)]
    async fn polls_until_succeeded() {
        let sub = submitter(ScriptedPlatform {
            phases: Mutex::new(VecDeque::from([
                DelegatePhase::Submitted,
                DelegatePhase::Running,
                DelegatePhase::Succeeded,
            ])),
            reject_submit: false,
        });
        let job = JobName::new("j");
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 2, 0, 0).unwrap();
        sub.execute(
            &job,
            &source(WorkerBounds::default()),
            &target(),
            Window::unbounded(now),
            1,
            now,
        )
        .await
        .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_phase_is_a_retryable_error() {
        let sub = submitter(ScriptedPlatform {
            phases: Mutex::new(VecDeque::from([
                DelegatePhase::Running,
                DelegatePhase::Failed,
            ])),
            reject_submit: false,
        });
        let job = JobName::new("j");
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 2, 0, 0).unwrap();
        let err = sub
            .execute(
                &job,
                &source(WorkerBounds::default()),
                &target(),
                Window::unbounded(now),
                1,
                now,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "delegate_job_failed");
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn rejected_submission_is_a_failed_attempt() {
        let sub = submitter(ScriptedPlatform {
            phases: Mutex::new(VecDeque::new()),
            reject_submit: true,
        });
        let job = JobName::new("j");
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 2, 0, 0).unwrap();
        let err = sub
            .execute(
                &job,
                &source(WorkerBounds::default()),
                &target(),
                Window::unbounded(now),
                1,
                now,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("quota exceeded"), "got: {err}");
    }
}
