//! Phased failover of a replicated VM onto the destination platform.
//!
//! [`FailoverOrchestrator::execute`] validates the request, opens a tracker
//! job, and walks the planned phases in order through [`StepRunner`]. The
//! first failing phase stops the run: the job is marked failed, later phases
//! stay pending in the journal, and a sanitized summary is stored on the
//! context. Resources created before the failure are left in place for the
//! cleanup orchestrator to reverse.
//!
//! The context counts as failed over from the first phase with side effects
//! onwards, so a failed run must be cleaned up or rolled back before the
//! next attempt.

mod phases;

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::{info, warn};

use crate::failover_config::{FailoverConfig, FailoverConfigError, FailoverRequest, SnapshotStrategy};
use crate::injection::{InjectionError, InjectionOutcome};
use crate::lifecycle::PlatformError;
use crate::model::{
    ContextId, ContextStatus, FailoverJob, JobId, JobStatus, SnapshotSet, VmId,
};
use crate::replication::ReplicationError;
use crate::sanitizer::{SanitizedMessage, sanitize_step};
use crate::services::Services;
use crate::snapshot::SnapshotError;
use crate::source::SourcePowerError;
use crate::steps::FailoverStep;
use crate::store::StoreError;
use crate::summary::{OperationSummary, OperationType};
use crate::tracker::{JobRequest, StepRunner};
use crate::validator::{PreflightValidator, ValidationReport};
use crate::volume::VolumeError;

use phases::Run;

/// Error raised by a single failover phase.
#[derive(Debug, Error)]
pub enum PhaseError {
    /// A critical pre-flight check failed.
    #[error("pre-flight validation failed: {summary}")]
    Validation {
        /// Joined messages of the failed critical checks.
        summary: String,
    },
    /// Source VM power control failed.
    #[error(transparent)]
    SourcePower(#[from] SourcePowerError),
    /// The final sync failed.
    #[error(transparent)]
    Replication(#[from] ReplicationError),
    /// Persisted state could not be read or written.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Protection snapshots could not be created.
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    /// Driver injection failed.
    #[error(transparent)]
    Injection(#[from] InjectionError),
    /// The destination platform rejected a request.
    #[error(transparent)]
    Platform(#[from] PlatformError),
    /// A volume could not be moved.
    #[error(transparent)]
    Volume(#[from] VolumeError),
    /// A source network has no destination network.
    #[error("no destination network for source network '{source_network}' and no default network configured")]
    Network {
        /// Unresolved source network.
        source_network: String,
    },
    /// The context has no boot volume.
    #[error("context {context_id} has no OS volume")]
    MissingOsVolume {
        /// Context being failed over.
        context_id: ContextId,
    },
    /// A phase needed the destination VM before it was created.
    #[error("destination VM has not been created")]
    NoDestination,
    /// The destination VM did not report running after start.
    #[error("destination VM {vm_id} is not running after start")]
    NotRunning {
        /// Destination VM.
        vm_id: VmId,
    },
    /// A cleanup-only step was handed to the failover pipeline.
    #[error("step {step} is not part of a failover")]
    NotAFailoverStep {
        /// Offending step.
        step: FailoverStep,
    },
}

/// Errors returned by [`FailoverOrchestrator::execute`].
#[derive(Debug, Error)]
pub enum FailoverError {
    /// The request violates a cross-field rule.
    #[error(transparent)]
    Config(#[from] FailoverConfigError),
    /// State could not be loaded before the run started.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The context already hosts a failover.
    #[error("context {context_id} is already {status}; run cleanup or rollback first")]
    AlreadyFailedOver {
        /// Context requested.
        context_id: ContextId,
        /// Current context status label.
        status: &'static str,
    },
    /// An earlier failover job still tracks protection snapshots.
    #[error(
        "failover job {job_id} on context {context_id} still tracks protection snapshots; run cleanup or rollback first"
    )]
    PendingCleanup {
        /// Context requested.
        context_id: ContextId,
        /// Job holding the snapshots.
        job_id: JobId,
    },
    /// A phase failed and the run stopped.
    #[error("failover job {job_id} failed at step {step}: {source}")]
    StepFailed {
        /// Tracker and failover job id.
        job_id: JobId,
        /// Failing phase.
        step: FailoverStep,
        /// Phase error.
        #[source]
        source: Box<PhaseError>,
    },
}

impl FailoverError {
    /// Operator-facing rendering of a phase failure.
    #[must_use]
    pub fn sanitized(&self) -> Option<SanitizedMessage> {
        match self {
            Self::StepFailed { step, source, .. } => Some(sanitize_step(*step, source)),
            _ => None,
        }
    }
}

/// Result of a completed failover.
#[derive(Clone, Debug)]
pub struct FailoverOutcome {
    /// Tracker and failover job id.
    pub job_id: JobId,
    /// VM now running on the destination.
    pub destination_vm_id: VmId,
    /// Protection snapshots recorded on the job.
    pub snapshots: SnapshotSet,
    /// Driver injection result, when the phase ran.
    pub injection: Option<InjectionOutcome>,
    /// Pre-flight report, when validation ran.
    pub validation: Option<ValidationReport>,
}

/// Runs test and live failovers.
pub struct FailoverOrchestrator<'a> {
    services: &'a Services,
    validator: PreflightValidator,
}

impl<'a> FailoverOrchestrator<'a> {
    /// Creates an orchestrator using the built-in pre-flight checks.
    #[must_use]
    pub fn new(services: &'a Services) -> Self {
        Self {
            services,
            validator: PreflightValidator::new(),
        }
    }

    /// Replaces the pre-flight validator.
    #[must_use]
    pub fn with_validator(mut self, validator: PreflightValidator) -> Self {
        self.validator = validator;
        self
    }

    /// Phases a run of `config` walks through, in order.
    #[must_use]
    pub fn plan(config: &FailoverConfig) -> Vec<FailoverStep> {
        let mut steps = Vec::with_capacity(10);
        if !config.skip_validation {
            steps.push(FailoverStep::Validation);
        }
        if config.requires_source_power_off() {
            steps.push(FailoverStep::SourceVmPowerOff);
        }
        if config.requires_final_sync() {
            steps.push(FailoverStep::FinalSync);
        }
        steps.push(FailoverStep::VolumeModeSwitchFailover);
        if config.snapshot_backend != SnapshotStrategy::None {
            steps.push(FailoverStep::MultiVolumeSnapshotCreation);
        }
        if !config.skip_driver_injection {
            steps.push(FailoverStep::VirtioDriverInjection);
        }
        steps.extend([
            FailoverStep::VmCreation,
            FailoverStep::VolumeAttachment,
            FailoverStep::VmStartupAndValidation,
            FailoverStep::StatusUpdate,
        ]);
        steps
    }

    /// Runs a failover.
    ///
    /// # Errors
    ///
    /// Returns [`FailoverError::Config`], [`FailoverError::AlreadyFailedOver`]
    /// or [`FailoverError::PendingCleanup`] before anything is changed, [`FailoverError::Store`] when the job
    /// cannot be recorded, and [`FailoverError::StepFailed`] when a phase
    /// fails.
    pub async fn execute(&self, request: &FailoverRequest) -> Result<FailoverOutcome, FailoverError> {
        let config = request.validate()?;
        let services = self.services;
        let context = services.store.context(&config.context_id)?;
        if matches!(
            context.status,
            ContextStatus::FailedOverTest | ContextStatus::FailedOverLive
        ) {
            return Err(FailoverError::AlreadyFailedOver {
                context_id: context.context_id.clone(),
                status: context.status.as_str(),
            });
        }
        if let Some(previous) = services.store.latest_job(&context.context_id)?
            && !previous.snapshots.is_empty()
        {
            return Err(FailoverError::PendingCleanup {
                context_id: context.context_id.clone(),
                job_id: previous.job_id,
            });
        }

        let kind = config.kind();
        let external_job_id = config.external_job_id();
        let tracker = services.tracker.as_ref();
        let job_id = tracker.start_job(&JobRequest {
            job_type: "failover",
            operation: OperationType::Failover(kind).as_str().to_owned(),
            context_id: config.context_id.clone(),
            external_job_id: external_job_id.clone(),
            metadata: BTreeMap::from([
                (String::from("vm_name"), config.vm_name.clone()),
                (String::from("destination_vm_name"), config.destination_vm_name()),
            ]),
        });
        let plan = Self::plan(&config);
        tracker.plan_steps(&job_id, &plan);
        info!(
            job_id = %job_id,
            context_id = %config.context_id,
            kind = kind.as_str(),
            steps = plan.len(),
            "failover started"
        );

        let mut job = FailoverJob::new(job_id.clone(), &context, kind);
        if config.skip_validation {
            job.set_status(JobStatus::Executing);
        }
        if let Err(err) = services.store.save_job(&job) {
            tracker.end_job(&job_id, JobStatus::Failed, Some(err.to_string()));
            return Err(FailoverError::Store(err));
        }

        let runner = StepRunner::new(tracker, job_id.clone());
        let mut run = Run::new(services, &self.validator, &config, context, job);
        match run.execute(&runner, &plan).await {
            Ok(()) => {
                tracker.end_job(&job_id, JobStatus::Completed, None);
                OperationSummary::from_job(
                    tracker,
                    &job_id,
                    &external_job_id,
                    OperationType::Failover(kind),
                    None,
                )
                .persist(services.store.as_ref(), &config.context_id);
                info!(job_id = %job_id, context_id = %config.context_id, "failover completed");
                run.into_outcome(job_id)
            }
            Err((step, error)) => {
                let message = error.to_string();
                warn!(job_id = %job_id, step = step.id(), error = %message, "failover failed");
                run.mark_failed();
                tracker.end_job(&job_id, JobStatus::Failed, Some(message.clone()));
                OperationSummary::from_job(
                    tracker,
                    &job_id,
                    &external_job_id,
                    OperationType::Failover(kind),
                    Some(&message),
                )
                .persist(services.store.as_ref(), &config.context_id);
                Err(FailoverError::StepFailed {
                    job_id,
                    step,
                    source: Box::new(error),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests;
