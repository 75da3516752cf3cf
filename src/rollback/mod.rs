//! Reversal of test and live failovers.
//!
//! Tearing down a test environment and rolling back a live cutover share
//! one compensating sequence. The destination VM is stopped and its volumes
//! are freed. Protection snapshots are reverted and deleted and ownership
//! returns to the hub appliance, after which the destination VM is deleted
//! and the job and context statuses are reset. A live rollback may finally
//! power the source VM back on.
//!
//! Every step tolerates resources that are already gone, so re-running a
//! cleanup after a partial or complete earlier run is safe. Snapshots that
//! cannot be cleaned up stay tracked for that next run. An unforced run that
//! stops after freeing volumes puts them back on the hub before returning.

mod teardown;

use std::collections::BTreeMap;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::lifecycle::PlatformError;
use crate::model::{ContextId, FailoverKind, JobId, JobStatus, VmId, VolumeId};
use crate::services::Services;
use crate::snapshot::SnapshotError;
use crate::source::{PowerChange, SourcePowerError};
use crate::steps::FailoverStep;
use crate::store::StoreError;
use crate::summary::{OperationSummary, OperationType};
use crate::tracker::{JobRequest, StepRunner};
use crate::volume::VolumeError;

use teardown::Teardown;

/// Choices captured when a rollback is requested.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RollbackOptions {
    /// Power the source VM back on after the teardown.
    pub power_on_source: bool,
    /// Continue past failed steps and report them all at the end.
    pub force_cleanup: bool,
    /// Kind of failover being reversed.
    pub failover_type: FailoverKind,
}

impl RollbackOptions {
    /// Defaults for reversing a failover of `kind`: a live rollback powers
    /// the source back on, a test teardown leaves it alone.
    #[must_use]
    pub const fn defaults_for(kind: FailoverKind) -> Self {
        Self {
            power_on_source: matches!(kind, FailoverKind::Live),
            force_cleanup: false,
            failover_type: kind,
        }
    }
}

/// Question put to the operator before a rollback starts.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct RollbackDecision {
    /// Stable decision identifier.
    pub decision_id: &'static str,
    /// Prompt text.
    pub question: String,
    /// Answers offered.
    pub options: [&'static str; 2],
    /// Preselected answer.
    pub default_value: &'static str,
    /// The operator must answer before the rollback proceeds.
    pub required: bool,
}

/// Builds the operator prompt for reversing a failover of `kind`.
#[must_use]
pub fn rollback_decision(kind: FailoverKind, vm_name: &str) -> RollbackDecision {
    match kind {
        FailoverKind::Live => RollbackDecision {
            decision_id: "live-rollback-power-on",
            question: format!(
                "The source VM '{vm_name}' was powered off during live failover. Would you like to power it back on during rollback?"
            ),
            options: ["Yes, power on source VM", "No, leave powered off"],
            default_value: "Yes, power on source VM",
            required: true,
        },
        FailoverKind::Test => RollbackDecision {
            decision_id: "test-cleanup-confirmation",
            question: format!(
                "Proceed with test failover cleanup for VM '{vm_name}'? This will remove the test VM and restore normal operations."
            ),
            options: ["Yes, proceed with cleanup", "Cancel"],
            default_value: "Yes, proceed with cleanup",
            required: true,
        },
    }
}

/// Error raised by a single teardown step.
#[derive(Debug, Error)]
pub enum TeardownError {
    /// The context has no failover job to reverse.
    #[error("no failover job recorded for context {context_id}")]
    NoJob {
        /// Context being cleaned up.
        context_id: ContextId,
    },
    /// The context has no boot volume for the legacy snapshot.
    #[error("context {context_id} has no OS volume")]
    MissingOsVolume {
        /// Context being cleaned up.
        context_id: ContextId,
    },
    /// Persisted state could not be read or written.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The destination platform rejected a request.
    #[error(transparent)]
    Platform(#[from] PlatformError),
    /// A volume could not be moved.
    #[error(transparent)]
    Volume(#[from] VolumeError),
    /// A snapshot operation failed.
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    /// Source VM power control failed.
    #[error(transparent)]
    SourcePower(#[from] SourcePowerError),
    /// A failover-only step was handed to the teardown pipeline.
    #[error("step {step} is not part of a cleanup")]
    NotACleanupStep {
        /// Offending step.
        step: FailoverStep,
    },
}

/// A step that failed during a forced rollback.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StepFailure {
    /// Failing step.
    pub step: FailoverStep,
    /// Raw error text.
    pub message: String,
}

/// Errors returned by [`CleanupOrchestrator`].
#[derive(Debug, Error)]
pub enum CleanupError {
    /// The context could not be loaded.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A step failed and the run stopped.
    #[error("cleanup job {job_id} failed at step {step}: {source}")]
    Step {
        /// Tracker job id.
        job_id: JobId,
        /// Failing step.
        step: FailoverStep,
        /// Step error.
        #[source]
        source: Box<TeardownError>,
    },
    /// A forced rollback ran to the end with failed steps.
    #[error("cleanup job {job_id} finished with {} failed step(s): {}", failures.len(), describe(failures))]
    Incomplete {
        /// Tracker job id.
        job_id: JobId,
        /// Every failed step, in order.
        failures: Vec<StepFailure>,
    },
    /// The teardown succeeded but the source VM could not be powered on.
    #[error("rollback completed but failed to power on source VM: {source}")]
    SourcePowerOn {
        /// Tracker job id.
        job_id: JobId,
        /// Power error.
        #[source]
        source: Box<SourcePowerError>,
    },
}

fn describe(failures: &[StepFailure]) -> String {
    failures
        .iter()
        .map(|failure| format!("{}: {}", failure.step, failure.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result of a finished cleanup or rollback.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CleanupOutcome {
    /// Tracker job id of the cleanup run.
    pub job_id: JobId,
    /// Failover job that was reversed.
    pub failover_job_id: Option<JobId>,
    /// Destination VM that was deleted by this run.
    pub deleted_vm: Option<VmId>,
    /// Volumes reattached to the hub by this run.
    pub returned_volumes: Vec<VolumeId>,
    /// Source power change, when power-on was requested.
    pub source_power: Option<PowerChange>,
}

/// Runs test teardowns and live rollbacks.
pub struct CleanupOrchestrator<'a> {
    services: &'a Services,
}

impl<'a> CleanupOrchestrator<'a> {
    /// Creates an orchestrator over `services`.
    #[must_use]
    pub const fn new(services: &'a Services) -> Self {
        Self { services }
    }

    /// Steps a run walks through, in order.
    #[must_use]
    pub fn plan(options: &RollbackOptions) -> Vec<FailoverStep> {
        let mut steps = vec![
            FailoverStep::FailoverJobRetrieval,
            FailoverStep::TestVmShutdown,
            FailoverStep::VolumeDetachment,
            FailoverStep::MultiVolumeSnapshotCleanup,
            FailoverStep::VolumeModeSwitchHub,
            FailoverStep::LegacySnapshotRollback,
            FailoverStep::LegacySnapshotDeletion,
            FailoverStep::VolumeReattachmentToHub,
            FailoverStep::TestVmDeletion,
            FailoverStep::FailoverJobStatusUpdate,
            FailoverStep::VmContextStatusUpdate,
        ];
        if options.power_on_source {
            steps.push(FailoverStep::SourceVmPowerOn);
        }
        steps
    }

    /// Tears down a test failover. The first failing step aborts the run.
    ///
    /// # Errors
    ///
    /// Returns [`CleanupError::Store`] when the context cannot be loaded and
    /// [`CleanupError::Step`] when a step fails.
    pub async fn cleanup(&self, context_id: &ContextId) -> Result<CleanupOutcome, CleanupError> {
        self.execute(
            context_id,
            &RollbackOptions::defaults_for(FailoverKind::Test),
            OperationType::Cleanup,
        )
        .await
    }

    /// Rolls back a failover according to `options`.
    ///
    /// With `force_cleanup` every step runs even after a failure and the
    /// failures are reported together at the end.
    ///
    /// # Errors
    ///
    /// Returns [`CleanupError::Step`] for the first failure of an unforced
    /// run, [`CleanupError::Incomplete`] when a forced run saw failures, and
    /// [`CleanupError::SourcePowerOn`] when only the final power-on failed.
    pub async fn rollback(
        &self,
        context_id: &ContextId,
        options: &RollbackOptions,
    ) -> Result<CleanupOutcome, CleanupError> {
        self.execute(context_id, options, OperationType::Rollback).await
    }

    async fn execute(
        &self,
        context_id: &ContextId,
        options: &RollbackOptions,
        operation: OperationType,
    ) -> Result<CleanupOutcome, CleanupError> {
        let services = self.services;
        let context = services.store.context(context_id)?;
        let external_job_id = format!(
            "{}-{}-{}",
            operation.as_str(),
            context.vm_name,
            Utc::now().timestamp()
        );
        let tracker = services.tracker.as_ref();
        let job_id = tracker.start_job(&JobRequest {
            job_type: "cleanup",
            operation: format!("{}_{}", options.failover_type.as_str(), operation.as_str()),
            context_id: context_id.clone(),
            external_job_id: external_job_id.clone(),
            metadata: BTreeMap::from([
                (String::from("vm_name"), context.vm_name.clone()),
                (String::from("power_on_source"), options.power_on_source.to_string()),
                (String::from("force_cleanup"), options.force_cleanup.to_string()),
            ]),
        });
        let plan = Self::plan(options);
        tracker.plan_steps(&job_id, &plan);
        info!(
            job_id = %job_id,
            context_id = %context_id,
            operation = operation.as_str(),
            force_cleanup = options.force_cleanup,
            power_on_source = options.power_on_source,
            "cleanup started"
        );

        let runner = StepRunner::new(tracker, job_id.clone());
        let mut teardown = Teardown::new(services, context);
        let mut failures = Vec::new();
        let mut aborted = None;
        for &step in &plan {
            let Err(error) = teardown.run_step(&runner, step).await else {
                continue;
            };
            if options.force_cleanup {
                warn!(job_id = %job_id, step = step.id(), error = %error, "step failed; continuing because force cleanup is set");
                failures.push(StepFailure {
                    step,
                    message: error.to_string(),
                });
            } else {
                aborted = Some((step, error));
                break;
            }
        }
        if let Some((step, _)) = &aborted
            && *step != FailoverStep::VolumeReattachmentToHub
        {
            teardown.secure_volumes().await;
        }

        let result = match (aborted, failures.is_empty()) {
            (None, true) => Ok(teardown.into_outcome(job_id.clone())),
            (None, false) => Err(CleanupError::Incomplete {
                job_id: job_id.clone(),
                failures,
            }),
            (Some((FailoverStep::SourceVmPowerOn, TeardownError::SourcePower(source))), _) => {
                Err(CleanupError::SourcePowerOn {
                    job_id: job_id.clone(),
                    source: Box::new(source),
                })
            }
            (Some((step, source)), _) => Err(CleanupError::Step {
                job_id: job_id.clone(),
                step,
                source: Box::new(source),
            }),
        };

        let message = result.as_ref().err().map(ToString::to_string);
        match &message {
            None => {
                tracker.end_job(&job_id, JobStatus::Completed, None);
                info!(job_id = %job_id, context_id = %context_id, "cleanup completed");
            }
            Some(text) => {
                tracker.end_job(&job_id, JobStatus::Failed, Some(text.clone()));
                error!(job_id = %job_id, context_id = %context_id, error = %text, "cleanup failed");
            }
        }
        OperationSummary::from_job(
            tracker,
            &job_id,
            &external_job_id,
            operation,
            message.as_deref(),
        )
        .persist(services.store.as_ref(), context_id);
        result
    }
}
