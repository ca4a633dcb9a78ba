//! Schedule engine: cron evaluation, run admission, retries, and
//! watermark commits.
//!
//! One explicit engine struct owns the registry, the state store, and the
//! execution components; there are no process-wide singletons. A run moves
//! through admission gates in a fixed order: depends-on-past gate, per-job
//! active-run semaphore, then a global priority slot per attempt (released
//! while a retry delay elapses). The extraction window is computed once per
//! run and shared by every attempt, so retries re-extract the same range
//! instead of silently shifting it.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use cron::Schedule;
use tidemark_state::WatermarkStore;
use tidemark_types::{JobName, JobSpec, RunError, RunRecord, RunState, TaskSpec};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;

use crate::compute::ComputeJobSubmitter;
use crate::connector::SourceConnector;
use crate::loader::LoadPlanner;
use crate::registry::SpecRegistry;
use crate::slots::PrioritySlots;
use crate::window::window_for_task;

/// Parse a cron trigger expression.
///
/// Job documents use the classic 5-field form (minute first); the parser
/// also wants a seconds field, so 5-field expressions get a literal `0`
/// second prepended. 6- and 7-field forms pass through unchanged.
///
/// # Errors
///
/// Returns the parse error for a malformed expression.
pub fn parse_cron(expr: &str) -> anyhow::Result<Schedule> {
    let trimmed = expr.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };
    Ok(Schedule::from_str(&normalized)?)
}

/// Engine-wide tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    /// Process-wide cap on concurrently executing runs across all jobs.
    pub global_slots: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self { global_slots: 8 }
    }
}

/// Per-job admission bookkeeping.
struct JobRuntime {
    /// Caps concurrently non-terminal runs of the job; FIFO among waiters.
    semaphore: Arc<Semaphore>,
    /// Woken whenever a run of this job reaches a terminal state.
    notify: Notify,
    gate: Mutex<GateState>,
}

#[derive(Default)]
struct GateState {
    /// Logical times of runs currently in flight.
    active: HashSet<DateTime<Utc>>,
    /// Latest logical time whose run exhausted its retries.
    last_failed: Option<DateTime<Utc>>,
    /// Latest logical time a run was admitted for; seeds cron evaluation.
    last_triggered: Option<DateTime<Utc>>,
}

/// The orchestrator: evaluates triggers, admits runs, executes attempts,
/// and commits watermarks.
pub struct ScheduleEngine {
    registry: SpecRegistry,
    store: Arc<dyn WatermarkStore>,
    connector: Arc<SourceConnector>,
    planner: Arc<LoadPlanner>,
    submitter: Arc<ComputeJobSubmitter>,
    slots: Arc<PrioritySlots>,
    runtimes: Mutex<HashMap<JobName, Arc<JobRuntime>>>,
    in_flight: AtomicUsize,
    drained: Notify,
}

fn internal(e: impl Into<anyhow::Error>) -> RunError {
    RunError::Internal(e.into())
}

impl ScheduleEngine {
    #[must_use]
    pub fn new(
        registry: SpecRegistry,
        store: Arc<dyn WatermarkStore>,
        connector: Arc<SourceConnector>,
        planner: Arc<LoadPlanner>,
        submitter: Arc<ComputeJobSubmitter>,
        options: EngineOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            store,
            connector,
            planner,
            submitter,
            slots: PrioritySlots::new(options.global_slots),
            runtimes: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
        })
    }

    /// The loaded spec registry.
    #[must_use]
    pub fn registry(&self) -> &SpecRegistry {
        &self.registry
    }

    /// Restore per-job trigger bookkeeping from run history, so a restart
    /// does not re-fire logical times that already ran and a run that
    /// exhausted its retries keeps blocking its dependents.
    ///
    /// # Errors
    ///
    /// Returns the first state-store failure.
    pub fn initialize(&self) -> anyhow::Result<()> {
        for spec in self.registry.jobs() {
            let last = self.store.last_logical_time(&spec.name)?;
            let last_failed = self.store.last_failed_logical_time(&spec.name)?;
            let runtime = self.runtime(&spec);
            {
                let mut gate = runtime.gate.lock().unwrap_or_else(PoisonError::into_inner);
                gate.last_triggered = last;
                gate.last_failed = last_failed;
            }
            if let Some(last) = last {
                tracing::debug!(job = %spec.name, last_logical_time = %last, "Restored trigger bookkeeping");
            }
            if let Some(failed) = last_failed {
                tracing::debug!(job = %spec.name, failed_logical_time = %failed, "Restored failed-run block");
            }
        }
        Ok(())
    }

    /// Wait until no run is in flight.
    pub async fn drain(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Logical times of `spec` due at `now` and not yet triggered.
    ///
    /// With `catchup: false`, multiple missed intervals collapse to the most
    /// recent one.
    ///
    /// # Errors
    ///
    /// Returns [`RunError::SpecInvalid`] for an unparseable cron expression.
    pub fn due_times(
        &self,
        spec: &JobSpec,
        now: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, RunError> {
        let schedule = parse_cron(&spec.behavior.cron)
            .map_err(|e| RunError::SpecInvalid(format!("behavior.cron: {e}")))?;
        let runtime = self.runtime(spec);
        let last = runtime
            .gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_triggered;
        Ok(due_ticks(
            &schedule,
            spec.behavior.start_date,
            spec.behavior.catchup,
            last,
            now,
        ))
    }

    /// Fire every due run. Jobs proceed concurrently; due times within one
    /// job fire in chronological order.
    pub async fn tick(self: Arc<Self>, now: DateTime<Utc>) -> Vec<RunRecord> {
        let mut fired: JoinSet<Vec<RunRecord>> = JoinSet::new();
        for spec in self.registry.jobs() {
            let due = match self.due_times(&spec, now) {
                Ok(due) => due,
                Err(e) => {
                    tracing::error!(job = %spec.name, error = %e, "Trigger evaluation failed");
                    continue;
                }
            };
            if due.is_empty() {
                continue;
            }
            let engine = Arc::clone(&self);
            fired.spawn(async move {
                let mut records = Vec::new();
                for logical_time in due {
                    match engine.trigger(&spec.name, logical_time).await {
                        Ok(record) => records.push(record),
                        Err(e) => {
                            tracing::warn!(
                                job = %spec.name,
                                logical_time = %logical_time,
                                error = %e,
                                "Run not started"
                            );
                        }
                    }
                }
                records
            });
        }

        let mut records = Vec::new();
        while let Some(joined) = fired.join_next().await {
            match joined {
                Ok(batch) => records.extend(batch),
                Err(e) => tracing::error!(error = %e, "Trigger task panicked"),
            }
        }
        records
    }

    /// Drive one run of `job` for `logical_time` to a terminal state.
    ///
    /// A run that fails all its attempts still returns `Ok`: the record
    /// carries the terminal state and attempt errors. `Err` means the run
    /// never executed (unknown job, blocked by a failed predecessor, or a
    /// state-store fault).
    ///
    /// # Errors
    ///
    /// [`RunError::SpecInvalid`] for an unknown job; [`RunError::Internal`]
    /// when blocked under `depends_on_past` or on state-store failure.
    pub async fn trigger(
        &self,
        job: &JobName,
        logical_time: DateTime<Utc>,
    ) -> Result<RunRecord, RunError> {
        let spec = self
            .registry
            .get(job)
            .ok_or_else(|| RunError::SpecInvalid(format!("unknown job '{job}'")))?;
        let runtime = self.runtime(&spec);

        if spec.behavior.depends_on_past {
            self.await_predecessor(&spec, &runtime, logical_time).await?;
        }

        {
            let mut gate = runtime.gate.lock().unwrap_or_else(PoisonError::into_inner);
            gate.active.insert(logical_time);
            if gate.last_triggered.map_or(true, |t| t < logical_time) {
                gate.last_triggered = Some(logical_time);
            }
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);

        let result = self.execute_run(&spec, &runtime, logical_time).await;

        {
            let mut gate = runtime.gate.lock().unwrap_or_else(PoisonError::into_inner);
            gate.active.remove(&logical_time);
            if let Ok(record) = &result {
                if record.state == RunState::RetriesExhausted
                    && gate.last_failed.map_or(true, |t| t < logical_time)
                {
                    gate.last_failed = Some(logical_time);
                }
            }
        }
        runtime.notify.notify_waiters();
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
        result
    }

    /// Wait for any earlier in-flight run to reach a terminal state; a
    /// predecessor that exhausted its retries blocks this run outright.
    async fn await_predecessor(
        &self,
        spec: &JobSpec,
        runtime: &JobRuntime,
        logical_time: DateTime<Utc>,
    ) -> Result<(), RunError> {
        loop {
            let notified = runtime.notify.notified();
            tokio::pin!(notified);
            // Register for wakeups before inspecting the gate, so a
            // completion between the check and the await is not lost.
            notified.as_mut().enable();
            {
                let gate = runtime.gate.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(failed) = gate.last_failed.filter(|t| *t < logical_time) {
                    return Err(internal(anyhow::anyhow!(
                        "run for '{}' at {} blocked: predecessor at {} exhausted its retries",
                        spec.name,
                        logical_time,
                        failed
                    )));
                }
                if !gate.active.iter().any(|t| *t < logical_time) {
                    return Ok(());
                }
                tracing::debug!(
                    job = %spec.name,
                    logical_time = %logical_time,
                    "Waiting for predecessor run"
                );
            }
            notified.await;
        }
    }

    async fn execute_run(
        &self,
        spec: &JobSpec,
        runtime: &JobRuntime,
        logical_time: DateTime<Utc>,
    ) -> Result<RunRecord, RunError> {
        let _active = runtime
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(internal)?;

        let run_id = self
            .store
            .start_run(&spec.name, logical_time)
            .map_err(internal)?;
        let mut record = RunRecord::queued(spec.name.clone(), logical_time);
        record.state = RunState::Running;
        record.started_at = Some(Utc::now());

        // One window per run: retries re-extract the same range.
        let watermark = self.store.get(&spec.name).map_err(internal)?.map(|w| w.value);
        let window = window_for_task(&spec.task, watermark, logical_time);
        record.window = Some(window);
        tracing::info!(
            job = %spec.name,
            logical_time = %logical_time,
            window = %window,
            "Run started"
        );

        let max_attempts = spec.behavior.retry.count + 1;
        loop {
            record.attempts += 1;
            // A global slot covers one attempt, not the whole run: a run
            // waiting out its retry delay holds no execution capacity.
            let slot = self.slots.clone().acquire_owned(spec.priority_weight).await;
            let outcome = match tokio::time::timeout(
                spec.timeout(),
                self.attempt(spec, window, record.attempts, logical_time),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(RunError::Timeout(spec.timeout())),
            };
            drop(slot);

            match outcome {
                Ok(rows_loaded) => {
                    record.rows_loaded = rows_loaded;
                    record.state = RunState::Success;
                    record.finished_at = Some(Utc::now());
                    // The cursor only moves after a committed load, only to
                    // the window end, and never backward.
                    if !spec.task.timestamp_keys().is_empty() {
                        let moved = self
                            .store
                            .advance(&spec.name, window.end)
                            .map_err(internal)?;
                        tracing::debug!(
                            job = %spec.name,
                            to = %window.end,
                            moved,
                            "Watermark advance"
                        );
                    }
                    self.store
                        .complete_run(
                            run_id,
                            RunState::Success,
                            record.attempts,
                            Some(window),
                            None,
                            None,
                        )
                        .map_err(internal)?;
                    tracing::info!(
                        job = %spec.name,
                        logical_time = %logical_time,
                        attempts = record.attempts,
                        rows = rows_loaded,
                        "Run succeeded"
                    );
                    return Ok(record);
                }
                Err(e) => {
                    record.attempt_errors.push(format!("{}: {e}", e.kind()));
                    if e.is_retryable() && record.attempts < max_attempts {
                        tracing::warn!(
                            job = %spec.name,
                            attempt = record.attempts,
                            max_attempts,
                            error = %e,
                            delay_secs = spec.retry_delay().as_secs(),
                            "Attempt failed; retrying"
                        );
                        tokio::time::sleep(spec.retry_delay()).await;
                        continue;
                    }
                    record.state = RunState::RetriesExhausted;
                    record.finished_at = Some(Utc::now());
                    self.store
                        .complete_run(
                            run_id,
                            RunState::RetriesExhausted,
                            record.attempts,
                            Some(window),
                            Some(e.kind()),
                            Some(&e.to_string()),
                        )
                        .map_err(internal)?;
                    tracing::error!(
                        job = %spec.name,
                        logical_time = %logical_time,
                        attempts = record.attempts,
                        error = %e,
                        "Run failed; retries exhausted"
                    );
                    return Ok(record);
                }
            }
        }
    }

    /// One attempt: extract and load, or delegate to the compute platform.
    async fn attempt(
        &self,
        spec: &JobSpec,
        window: tidemark_types::Window,
        attempt: u32,
        logical_time: DateTime<Utc>,
    ) -> Result<u64, RunError> {
        match &spec.task {
            TaskSpec::ComputeDelegate { source, target } => {
                self.submitter
                    .execute(&spec.name, source, target, window, attempt, logical_time)
                    .await?;
                // The delegate owns the load; its row count is not observed.
                Ok(0)
            }
            task => {
                let rows = self.connector.extract(task, window).await?;
                self.planner.load(task, rows).await
            }
        }
    }

    fn runtime(&self, spec: &JobSpec) -> Arc<JobRuntime> {
        let mut runtimes = self
            .runtimes
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(runtimes.entry(spec.name.clone()).or_insert_with(|| {
            Arc::new(JobRuntime {
                semaphore: Arc::new(Semaphore::new(spec.behavior.max_active_runs as usize)),
                notify: Notify::new(),
                gate: Mutex::new(GateState::default()),
            })
        }))
    }
}

/// Trigger times strictly after `last` (or from `start_date` when none),
/// up to and including `now`. With `catchup: false` the missed backlog
/// collapses to the most recent tick.
fn due_ticks(
    schedule: &Schedule,
    start_date: DateTime<Utc>,
    catchup: bool,
    last: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Vec<DateTime<Utc>> {
    let from = last.unwrap_or(start_date - chrono::Duration::seconds(1));
    let mut due: Vec<DateTime<Utc>> = schedule
        .after(&from)
        .take_while(|t| *t <= now)
        .filter(|t| *t >= start_date)
        .collect();
    if !catchup {
        if let Some(latest) = due.pop() {
            due = vec![latest];
        }
    }
    due
}
