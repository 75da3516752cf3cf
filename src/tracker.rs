//! Job and step tracking.
//!
//! Every failover and cleanup run is registered with a [`JobTracker`] and
//! each phase is executed through [`StepRunner`], which records the step's
//! start, end, and status and runs it inside a `step` tracing span.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tracing::{Instrument, info, info_span, warn};

use crate::model::{ContextId, JobId, JobStatus};
use crate::steps::FailoverStep;

/// Status of one recorded step.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StepStatus {
    /// Planned, not started.
    Pending,
    /// In progress.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Deliberately not executed.
    Skipped,
}

/// One entry of a job's step journal.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StepRecord {
    /// Step identifier.
    pub step: FailoverStep,
    /// Current status.
    pub status: StepStatus,
    /// Start time.
    pub started_at: Option<DateTime<Utc>>,
    /// End time.
    pub ended_at: Option<DateTime<Utc>>,
    /// Error text or skip reason.
    pub detail: Option<String>,
}

/// Parameters for [`JobTracker::start_job`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JobRequest {
    /// Job class (`failover` or `cleanup`).
    pub job_type: &'static str,
    /// Operation label, for example `test_failover`.
    pub operation: String,
    /// Context the job acts on.
    pub context_id: ContextId,
    /// Caller correlation id.
    pub external_job_id: String,
    /// Free-form metadata.
    pub metadata: BTreeMap<String, String>,
}

/// Derived counters for a job.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct JobProgress {
    /// Steps registered for the job.
    pub steps_total: usize,
    /// Steps that completed.
    pub steps_completed: usize,
    /// Steps that were skipped.
    pub steps_skipped: usize,
    /// First failed step, if any.
    pub failed_step: Option<FailoverStep>,
}

/// Durable, append-only record of jobs and their steps.
pub trait JobTracker: Send + Sync {
    /// Registers a job and returns its identifier.
    fn start_job(&self, request: &JobRequest) -> JobId;

    /// Registers the steps a job intends to run, in order, as pending.
    fn plan_steps(&self, job_id: &JobId, steps: &[FailoverStep]);

    /// Marks `step` as running.
    fn begin_step(&self, job_id: &JobId, step: FailoverStep);

    /// Marks `step` as finished with `status` and an optional detail.
    fn finish_step(
        &self,
        job_id: &JobId,
        step: FailoverStep,
        status: StepStatus,
        detail: Option<String>,
    );

    /// Closes the job.
    fn end_job(&self, job_id: &JobId, status: JobStatus, error: Option<String>);

    /// Returns the job's step journal.
    fn steps(&self, job_id: &JobId) -> Vec<StepRecord>;

    /// Returns derived counters for the job.
    fn progress(&self, job_id: &JobId) -> JobProgress {
        let steps = self.steps(job_id);
        JobProgress {
            steps_total: steps.len(),
            steps_completed: steps
                .iter()
                .filter(|record| record.status == StepStatus::Completed)
                .count(),
            steps_skipped: steps
                .iter()
                .filter(|record| record.status == StepStatus::Skipped)
                .count(),
            failed_step: steps
                .iter()
                .find(|record| record.status == StepStatus::Failed)
                .map(|record| record.step),
        }
    }
}

#[derive(Clone, Debug)]
struct TrackedJob {
    request: JobRequest,
    status: Option<JobStatus>,
    error: Option<String>,
    steps: Vec<StepRecord>,
}

/// In-process tracker that also mirrors every transition to `tracing`.
#[derive(Clone, Debug, Default)]
pub struct MemoryTracker {
    jobs: Arc<Mutex<BTreeMap<JobId, TrackedJob>>>,
}

impl MemoryTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Final status of a job, once ended.
    #[must_use]
    pub fn job_status(&self, job_id: &JobId) -> Option<JobStatus> {
        self.lock().get(job_id).and_then(|job| job.status)
    }

    /// Error recorded when the job ended, if any.
    #[must_use]
    pub fn job_error(&self, job_id: &JobId) -> Option<String> {
        self.lock().get(job_id).and_then(|job| job.error.clone())
    }

    /// Operation label the job was started with.
    #[must_use]
    pub fn job_operation(&self, job_id: &JobId) -> Option<String> {
        self.lock()
            .get(job_id)
            .map(|job| job.request.operation.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<JobId, TrackedJob>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_record(
        &self,
        job_id: &JobId,
        step: FailoverStep,
        update: impl FnOnce(&mut StepRecord),
    ) {
        let mut jobs = self.lock();
        let Some(job) = jobs.get_mut(job_id) else {
            warn!(job_id = %job_id, step = step.id(), "step recorded for unknown job");
            return;
        };
        if let Some(record) = job
            .steps
            .iter_mut()
            .rev()
            .find(|record| record.step == step)
        {
            update(record);
            return;
        }
        let mut record = StepRecord {
            step,
            status: StepStatus::Pending,
            started_at: None,
            ended_at: None,
            detail: None,
        };
        update(&mut record);
        job.steps.push(record);
    }
}

impl JobTracker for MemoryTracker {
    fn start_job(&self, request: &JobRequest) -> JobId {
        let job_id = JobId::generate();
        info!(
            job_id = %job_id,
            context_id = %request.context_id,
            operation = %request.operation,
            external_job_id = %request.external_job_id,
            "job started"
        );
        self.lock().insert(
            job_id.clone(),
            TrackedJob {
                request: request.clone(),
                status: None,
                error: None,
                steps: Vec::new(),
            },
        );
        job_id
    }

    fn plan_steps(&self, job_id: &JobId, steps: &[FailoverStep]) {
        for step in steps {
            self.with_record(job_id, *step, |_| {});
        }
    }

    fn begin_step(&self, job_id: &JobId, step: FailoverStep) {
        self.with_record(job_id, step, |record| {
            record.status = StepStatus::Running;
            record.started_at = Some(Utc::now());
        });
    }

    fn finish_step(
        &self,
        job_id: &JobId,
        step: FailoverStep,
        status: StepStatus,
        detail: Option<String>,
    ) {
        self.with_record(job_id, step, |record| {
            record.status = status;
            record.ended_at = Some(Utc::now());
            record.detail = detail;
        });
    }

    fn end_job(&self, job_id: &JobId, status: JobStatus, error: Option<String>) {
        info!(job_id = %job_id, status = status.as_str(), "job ended");
        if let Some(job) = self.lock().get_mut(job_id) {
            job.status = Some(status);
            job.error = error;
        }
    }

    fn steps(&self, job_id: &JobId) -> Vec<StepRecord> {
        self.lock()
            .get(job_id)
            .map(|job| job.steps.clone())
            .unwrap_or_default()
    }
}

/// How a step that ran to completion should be recorded.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StepDisposition {
    /// The step did its work.
    Completed,
    /// The step decided there was nothing to do.
    Skipped(String),
}

/// Runs steps of one job through a tracker.
pub struct StepRunner<'a> {
    tracker: &'a dyn JobTracker,
    job_id: JobId,
}

impl<'a> StepRunner<'a> {
    /// Binds a runner to `job_id`.
    #[must_use]
    pub const fn new(tracker: &'a dyn JobTracker, job_id: JobId) -> Self {
        Self { tracker, job_id }
    }

    /// Job this runner records against.
    #[must_use]
    pub const fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Runs `work` as `step`, recording it completed on success.
    ///
    /// # Errors
    ///
    /// Returns the step's own error after recording the step as failed.
    pub async fn run<T, E, Fut>(&self, step: FailoverStep, work: Fut) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let result = self.execute(step, work).await;
        if result.is_ok() {
            self.tracker
                .finish_step(&self.job_id, step, StepStatus::Completed, None);
        }
        result
    }

    /// Runs `work` as `step`, letting the step decide whether it completed
    /// or skipped.
    ///
    /// # Errors
    ///
    /// Returns the step's own error after recording the step as failed.
    pub async fn run_with_disposition<E, Fut>(
        &self,
        step: FailoverStep,
        work: Fut,
    ) -> Result<StepDisposition, E>
    where
        Fut: Future<Output = Result<StepDisposition, E>>,
        E: Display,
    {
        let result = self.execute(step, work).await;
        match &result {
            Ok(StepDisposition::Completed) => {
                self.tracker
                    .finish_step(&self.job_id, step, StepStatus::Completed, None);
            }
            Ok(StepDisposition::Skipped(reason)) => {
                info!(job_id = %self.job_id, step = step.id(), reason = %reason, "step skipped");
                self.tracker.finish_step(
                    &self.job_id,
                    step,
                    StepStatus::Skipped,
                    Some(reason.clone()),
                );
            }
            Err(_) => {}
        }
        result
    }

    /// Records `step` as skipped without running anything.
    pub fn skip(&self, step: FailoverStep, reason: &str) {
        info!(job_id = %self.job_id, step = step.id(), reason, "step skipped");
        self.tracker.finish_step(
            &self.job_id,
            step,
            StepStatus::Skipped,
            Some(reason.to_owned()),
        );
    }

    async fn execute<T, E, Fut>(&self, step: FailoverStep, work: Fut) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.tracker.begin_step(&self.job_id, step);
        let span = info_span!("step", job_id = %self.job_id, step = step.id());
        let result = async {
            info!("step started");
            work.await
        }
        .instrument(span)
        .await;
        if let Err(err) = &result {
            warn!(job_id = %self.job_id, step = step.id(), error = %err, "step failed");
            self.tracker.finish_step(
                &self.job_id,
                step,
                StepStatus::Failed,
                Some(err.to_string()),
            );
        }
        result
    }
}
