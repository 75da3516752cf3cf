//! The individual failover phases.

use tracing::{info, warn};

use super::{FailoverError, FailoverOutcome, PhaseError};
use crate::failover_config::{FailoverConfig, SnapshotStrategy};
use crate::injection::{GuestFamily, InjectionOutcome, InjectionRequest};
use crate::model::{
    ContextStatus, FailoverJob, JobId, JobStatus, OperationMode, SnapshotBackendKind, VmContext,
    VmId, VmSpec,
};
use crate::network;
use crate::services::Services;
use crate::steps::FailoverStep;
use crate::tracker::{StepDisposition, StepRunner};
use crate::validator::{PreflightValidator, SourceObservation, ValidationInput, ValidationReport};
use crate::volume::AttachAs;

/// State carried between the phases of one run.
pub(super) struct Run<'a> {
    services: &'a Services,
    validator: &'a PreflightValidator,
    config: &'a FailoverConfig,
    context: VmContext,
    job: FailoverJob,
    validation: Option<ValidationReport>,
    injection: Option<InjectionOutcome>,
    claimed: bool,
}

impl<'a> Run<'a> {
    pub(super) const fn new(
        services: &'a Services,
        validator: &'a PreflightValidator,
        config: &'a FailoverConfig,
        context: VmContext,
        job: FailoverJob,
    ) -> Self {
        Self {
            services,
            validator,
            config,
            context,
            job,
            validation: None,
            injection: None,
            claimed: false,
        }
    }

    /// Walks `plan`, stopping at the first failing phase.
    pub(super) async fn execute(
        &mut self,
        runner: &StepRunner<'_>,
        plan: &[FailoverStep],
    ) -> Result<(), (FailoverStep, PhaseError)> {
        for &step in plan {
            if step != FailoverStep::Validation && !self.claimed {
                self.claim_context().map_err(|error| (step, error))?;
            }
            let result = match step {
                FailoverStep::Validation => runner.run(step, self.validate()).await,
                FailoverStep::SourceVmPowerOff => runner.run(step, self.power_off_source()).await,
                FailoverStep::FinalSync => runner.run(step, self.final_sync()).await,
                FailoverStep::VolumeModeSwitchFailover => {
                    runner.run(step, async { self.switch_mode() }).await
                }
                FailoverStep::MultiVolumeSnapshotCreation => {
                    runner.run(step, self.create_snapshots()).await
                }
                FailoverStep::VirtioDriverInjection => runner
                    .run_with_disposition(step, self.inject_drivers())
                    .await
                    .map(drop),
                FailoverStep::VmCreation => runner.run(step, self.create_vm()).await,
                FailoverStep::VolumeAttachment => runner.run(step, self.attach_volumes()).await,
                FailoverStep::VmStartupAndValidation => runner.run(step, self.start_vm()).await,
                FailoverStep::StatusUpdate => runner.run(step, async { self.finalize() }).await,
                other => Err(PhaseError::NotAFailoverStep { step: other }),
            };
            result.map_err(|error| (step, error))?;
        }
        Ok(())
    }

    /// Records the job as failed. Store errors are logged only: the phase
    /// error is what the caller needs to see.
    pub(super) fn mark_failed(&mut self) {
        self.job.set_status(JobStatus::Failed);
        if let Err(err) = self.services.store.save_job(&self.job) {
            warn!(job_id = %self.job.job_id, error = %err, "failed to record failed job");
        }
    }

    pub(super) fn into_outcome(self, job_id: JobId) -> Result<FailoverOutcome, FailoverError> {
        let destination_vm_id = self.job.destination_vm_id.ok_or_else(|| {
            FailoverError::StepFailed {
                job_id: job_id.clone(),
                step: FailoverStep::VmCreation,
                source: Box::new(PhaseError::NoDestination),
            }
        })?;
        Ok(FailoverOutcome {
            job_id,
            destination_vm_id,
            snapshots: self.job.snapshots,
            injection: self.injection,
            validation: self.validation,
        })
    }

    /// Marks the context as failed over before the first phase that changes
    /// anything outside the store.
    fn claim_context(&mut self) -> Result<(), PhaseError> {
        let status = ContextStatus::failed_over(self.config.kind());
        self.services
            .store
            .update_context_status(&self.context.context_id, status)?;
        self.claimed = true;
        info!(context_id = %self.context.context_id, status = status.as_str(), "context claimed for failover");
        Ok(())
    }

    fn transition(&mut self, status: JobStatus) -> Result<(), PhaseError> {
        self.job.set_status(status);
        self.services.store.save_job(&self.job)?;
        Ok(())
    }

    fn refresh_context(&mut self) -> Result<(), PhaseError> {
        self.context = self.services.store.context(&self.context.context_id)?;
        Ok(())
    }

    fn destination(&self) -> Result<VmId, PhaseError> {
        self.job
            .destination_vm_id
            .clone()
            .ok_or(PhaseError::NoDestination)
    }

    async fn validate(&mut self) -> Result<(), PhaseError> {
        self.transition(JobStatus::Validating)?;
        let source = match self
            .services
            .source_power()
            .state(&self.context.vm_id)
            .await
        {
            Ok(state) => SourceObservation::Reported(state),
            Err(err) => SourceObservation::Unavailable(err.to_string()),
        };
        let mappings = self
            .services
            .store
            .network_mappings(&self.context.context_id)?;
        let report = self.validator.validate(&ValidationInput {
            context: &self.context,
            mappings: &mappings,
            kind: self.config.kind(),
            powers_off_source: self.config.requires_source_power_off(),
            source: &source,
        });
        info!(
            context_id = %self.context.context_id,
            readiness_score = report.readiness_score,
            warnings = report.warnings.len(),
            "pre-flight validation finished"
        );

        let passed = report.is_valid;
        let summary = report.error_summary();
        self.validation = Some(report);
        if !passed {
            return Err(PhaseError::Validation { summary });
        }
        self.transition(JobStatus::Executing)
    }

    async fn power_off_source(&mut self) -> Result<(), PhaseError> {
        let change = self
            .services
            .source_power()
            .power_off(&self.context.vm_id)
            .await?;
        info!(vm_id = %self.context.vm_id, change = ?change, "source VM powered off");
        Ok(())
    }

    async fn final_sync(&mut self) -> Result<(), PhaseError> {
        let sync_job = self
            .services
            .final_sync()
            .run(&self.context.context_id, &self.context.vm_id)
            .await?;
        info!(context_id = %self.context.context_id, sync_job = %sync_job, "final sync completed");
        self.refresh_context()
    }

    fn switch_mode(&mut self) -> Result<(), PhaseError> {
        self.services
            .volumes()
            .switch_mode(&self.context.context_id, OperationMode::Failover)?;
        self.refresh_context()
    }

    async fn create_snapshots(&mut self) -> Result<(), PhaseError> {
        let kind = match self.config.snapshot_backend {
            SnapshotStrategy::PerVolume => SnapshotBackendKind::PerVolume,
            SnapshotStrategy::DistributedBlock => SnapshotBackendKind::DistributedBlock,
            SnapshotStrategy::None => return Ok(()),
        };
        let report = self
            .services
            .snapshots()
            .create_all(kind, &self.context.volumes, &self.config.snapshot_name())
            .await?;
        for failure in &report.failures {
            warn!(
                job_id = %self.job.job_id,
                volume_id = %failure.volume_id,
                error = %failure.message,
                "volume left without protection snapshot"
            );
        }
        self.job.snapshots = report.snapshots;
        self.services.store.save_job(&self.job)?;
        Ok(())
    }

    async fn inject_drivers(&mut self) -> Result<StepDisposition, PhaseError> {
        match self.try_inject().await {
            Ok(InjectionOutcome::Completed { .. }) => Ok(StepDisposition::Completed),
            Ok(InjectionOutcome::Skipped { reason }) => Ok(StepDisposition::Skipped(reason)),
            Err(err) if self.config.is_live_failover() => {
                warn!(
                    job_id = %self.job.job_id,
                    error = %err,
                    "driver injection failed; continuing live failover"
                );
                let reason = format!("driver injection failed: {err}");
                self.injection = Some(InjectionOutcome::Skipped {
                    reason: reason.clone(),
                });
                Ok(StepDisposition::Skipped(reason))
            }
            Err(err) => Err(err),
        }
    }

    async fn try_inject(&mut self) -> Result<InjectionOutcome, PhaseError> {
        let os_volume = self
            .context
            .os_volume()
            .cloned()
            .ok_or_else(|| PhaseError::MissingOsVolume {
                context_id: self.context.context_id.clone(),
            })?;
        let device = match GuestFamily::classify(&self.context.os_type).skip_reason() {
            Some(_) => None,
            None => self.services.volumes().device_path(&os_volume).await?,
        };
        let outcome = self
            .services
            .injector()
            .inject(
                InjectionRequest {
                    vm_id: &self.context.vm_id,
                    os_type: &self.context.os_type,
                    device_path: device.as_deref(),
                    protection: self.job.snapshots.get(&os_volume.volume_id),
                    timestamp: self.config.timestamp,
                },
                &self.services.snapshots(),
            )
            .await?;
        self.injection = Some(outcome.clone());
        Ok(outcome)
    }

    async fn create_vm(&mut self) -> Result<(), PhaseError> {
        let context_id = self.context.context_id.clone();
        let mappings = self.services.store.network_mappings(&context_id)?;
        let default_network = self
            .services
            .settings
            .default_network_id
            .as_deref()
            .unwrap_or_default();
        let resolutions = network::resolve_all(
            &mappings,
            &self.context.networks,
            self.config.uses_test_networks(),
            default_network,
        );
        if let Some(missing) = resolutions
            .iter()
            .find(|resolution| resolution.destination_network_id.is_empty())
        {
            return Err(PhaseError::Network {
                source_network: missing.source_network.clone(),
            });
        }
        for resolution in resolutions.iter().filter(|resolution| resolution.used_default) {
            warn!(
                source_network = %resolution.source_network,
                network_id = %resolution.destination_network_id,
                "no mapping for source network; using default network"
            );
        }

        let spec = VmSpec {
            name: self.config.destination_vm_name(),
            cpu_count: self.context.cpu_count,
            memory_mb: self.context.memory_mb,
            network_ids: resolutions
                .into_iter()
                .map(|resolution| resolution.destination_network_id)
                .collect(),
            os_type: self.context.os_type.clone(),
        };
        let vm_id = self.services.lifecycle().create(&spec).await?;
        self.job.destination_vm_id = Some(vm_id.clone());
        self.services.store.save_job(&self.job)?;
        self.services
            .store
            .set_destination_vm(&context_id, Some(vm_id))?;
        Ok(())
    }

    async fn attach_volumes(&mut self) -> Result<(), PhaseError> {
        let vm_id = self.destination()?;
        let context_id = self.context.context_id.clone();
        let os_volume = self
            .context
            .os_volume()
            .cloned()
            .ok_or_else(|| PhaseError::MissingOsVolume {
                context_id: context_id.clone(),
            })?;
        let data_volumes: Vec<_> = self.context.data_volumes().cloned().collect();

        self.services
            .lifecycle()
            .delete_default_root_volume(&vm_id)
            .await?;
        let volumes = self.services.volumes();
        volumes
            .move_to_destination(&context_id, &os_volume, &vm_id, AttachAs::Root)
            .await?;
        for volume in &data_volumes {
            volumes
                .move_to_destination(&context_id, volume, &vm_id, AttachAs::Data)
                .await?;
        }
        info!(
            vm_id = %vm_id,
            volumes = data_volumes.len() + 1,
            "volumes attached to destination VM"
        );
        self.refresh_context()
    }

    async fn start_vm(&mut self) -> Result<(), PhaseError> {
        let vm_id = self.destination()?;
        let lifecycle = self.services.lifecycle();
        lifecycle.start(&vm_id).await?;
        if !lifecycle.is_running(&vm_id).await? {
            return Err(PhaseError::NotRunning { vm_id });
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), PhaseError> {
        self.services.store.update_context_status(
            &self.context.context_id,
            ContextStatus::failed_over(self.config.kind()),
        )?;
        self.transition(JobStatus::Completed)
    }
}
