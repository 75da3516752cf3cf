//! The individual teardown steps.

use tracing::{error, info, warn};

use super::{CleanupOutcome, TeardownError};
use crate::lifecycle::StopOutcome;
use crate::model::{
    ContextStatus, FailoverJob, JobId, JobStatus, OperationMode, SnapshotBackendKind,
    SnapshotHandle, VmContext, VmId, VolumeId,
};
use crate::services::Services;
use crate::source::PowerChange;
use crate::steps::FailoverStep;
use crate::tracker::{StepDisposition, StepRunner};

/// State carried between the steps of one teardown.
pub(super) struct Teardown<'a> {
    services: &'a Services,
    context: VmContext,
    job: Option<FailoverJob>,
    destination: Option<VmId>,
    legacy_tracked: bool,
    volumes_released: bool,
    deleted_vm: Option<VmId>,
    returned_volumes: Vec<VolumeId>,
    source_power: Option<PowerChange>,
}

impl<'a> Teardown<'a> {
    pub(super) const fn new(services: &'a Services, context: VmContext) -> Self {
        Self {
            services,
            context,
            job: None,
            destination: None,
            legacy_tracked: false,
            volumes_released: false,
            deleted_vm: None,
            returned_volumes: Vec::new(),
            source_power: None,
        }
    }

    pub(super) async fn run_step(
        &mut self,
        runner: &StepRunner<'_>,
        step: FailoverStep,
    ) -> Result<(), TeardownError> {
        match step {
            FailoverStep::FailoverJobRetrieval => {
                runner.run(step, async { self.retrieve_job() }).await
            }
            FailoverStep::TestVmShutdown => {
                runner.run_with_disposition(step, self.stop_vm()).await.map(drop)
            }
            FailoverStep::VolumeDetachment => runner.run(step, self.detach_volumes()).await,
            FailoverStep::MultiVolumeSnapshotCleanup => runner
                .run_with_disposition(step, self.clean_snapshots())
                .await
                .map(drop),
            FailoverStep::VolumeModeSwitchHub => {
                runner.run(step, async { self.switch_mode() }).await
            }
            FailoverStep::LegacySnapshotRollback => runner
                .run_with_disposition(step, self.revert_legacy())
                .await
                .map(drop),
            FailoverStep::LegacySnapshotDeletion => runner
                .run_with_disposition(step, self.delete_legacy())
                .await
                .map(drop),
            FailoverStep::VolumeReattachmentToHub => runner.run(step, self.return_volumes()).await,
            FailoverStep::TestVmDeletion => {
                runner.run_with_disposition(step, self.delete_vm()).await.map(drop)
            }
            FailoverStep::FailoverJobStatusUpdate => {
                runner.run(step, async { self.close_job() }).await
            }
            FailoverStep::VmContextStatusUpdate => {
                runner.run(step, async { self.reset_context() }).await
            }
            FailoverStep::SourceVmPowerOn => runner.run(step, self.power_on_source()).await,
            other => Err(TeardownError::NotACleanupStep { step: other }),
        }
    }

    /// Returns volumes detached earlier in this run to the hub after the run
    /// stopped before reattaching them. A volume that cannot be reattached
    /// is reported as orphaned by the volume engine.
    pub(super) async fn secure_volumes(&mut self) {
        if !self.volumes_released {
            return;
        }
        let context_id = self.context.context_id.clone();
        match self
            .services
            .volumes()
            .return_all_to_hub(&context_id, &self.context.volumes)
            .await
        {
            Ok(moved) => {
                warn!(context_id = %context_id, returned = moved.len(), "volumes returned to hub after aborted cleanup");
                self.volumes_released = false;
                self.returned_volumes = moved;
            }
            Err(err) => {
                error!(context_id = %context_id, error = %err, "volumes could not be returned to hub after aborted cleanup");
            }
        }
    }

    pub(super) fn into_outcome(self, job_id: JobId) -> CleanupOutcome {
        CleanupOutcome {
            job_id,
            failover_job_id: self.job.map(|job| job.job_id),
            deleted_vm: self.deleted_vm,
            returned_volumes: self.returned_volumes,
            source_power: self.source_power,
        }
    }

    fn job_mut(&mut self) -> Result<&mut FailoverJob, TeardownError> {
        let context_id = &self.context.context_id;
        self.job.as_mut().ok_or_else(|| TeardownError::NoJob {
            context_id: context_id.clone(),
        })
    }

    fn save_job(&self) -> Result<(), TeardownError> {
        if let Some(job) = &self.job {
            self.services.store.save_job(job)?;
        }
        Ok(())
    }

    fn retrieve_job(&mut self) -> Result<(), TeardownError> {
        let context_id = self.context.context_id.clone();
        let job = self
            .services
            .store
            .latest_job(&context_id)?
            .ok_or_else(|| TeardownError::NoJob {
                context_id: context_id.clone(),
            })?;

        // A job already marked cleaned up only names a VM that is gone.
        let job_destination = if job.status == JobStatus::Cleanup {
            None
        } else {
            job.destination_vm_id.clone()
        };
        self.destination = self.context.destination_vm_id.clone().or(job_destination);
        self.legacy_tracked = job
            .legacy_snapshot_id
            .as_deref()
            .is_some_and(|id| job.snapshots.contains_snapshot(id));
        info!(
            context_id = %context_id,
            failover_job_id = %job.job_id,
            destination_vm_id = ?self.destination,
            snapshots = job.snapshots.len(),
            "failover job retrieved"
        );
        self.job = Some(job);
        Ok(())
    }

    async fn stop_vm(&mut self) -> Result<StepDisposition, TeardownError> {
        let Some(vm_id) = self.destination.clone() else {
            return Ok(StepDisposition::Skipped(String::from(
                "no destination VM recorded",
            )));
        };
        match self.services.lifecycle().stop(&vm_id).await? {
            StopOutcome::Stopped => Ok(StepDisposition::Completed),
            StopOutcome::AlreadyStopped => {
                info!(vm_id = %vm_id, "destination VM already stopped");
                Ok(StepDisposition::Completed)
            }
            StopOutcome::Absent => {
                info!(vm_id = %vm_id, "destination VM no longer exists");
                self.destination = None;
                Ok(StepDisposition::Skipped(String::from(
                    "destination VM no longer exists",
                )))
            }
        }
    }

    async fn detach_volumes(&mut self) -> Result<(), TeardownError> {
        self.volumes_released = true;
        let detached = self
            .services
            .volumes()
            .detach_from_non_hub(&self.context.context_id, &self.context.volumes)
            .await?;
        info!(context_id = %self.context.context_id, detached = detached.len(), "volumes detached");
        Ok(())
    }

    /// Reverts and deletes the tracked snapshots. Per-volume failures stay
    /// tracked on the job for the next cleanup and do not stop this one.
    async fn clean_snapshots(&mut self) -> Result<StepDisposition, TeardownError> {
        let snapshots = self.services.snapshots();
        let job = self.job_mut()?;
        if job.snapshots.is_empty() {
            info!(failover_job_id = %job.job_id, "no tracked snapshots to clean up");
            return Ok(StepDisposition::Completed);
        }
        let report = snapshots.cleanup_all(&mut job.snapshots).await;
        let remaining = job.snapshots.len();
        self.save_job()?;
        if report.is_clean() {
            info!(cleaned = report.completed.len(), "tracked snapshots reverted and deleted");
            return Ok(StepDisposition::Completed);
        }
        let summary = report.failure_summary();
        warn!(
            cleaned = report.completed.len(),
            remaining,
            failures = %summary,
            "some snapshots could not be cleaned up; they stay tracked for the next cleanup"
        );
        Ok(StepDisposition::Skipped(format!(
            "{remaining} snapshot(s) left for the next cleanup: {summary}"
        )))
    }

    fn switch_mode(&mut self) -> Result<(), TeardownError> {
        self.services
            .volumes()
            .switch_mode(&self.context.context_id, OperationMode::Hub)?;
        Ok(())
    }

    fn legacy_handle(&self) -> Result<Option<SnapshotHandle>, TeardownError> {
        let Some(job) = &self.job else {
            return Err(TeardownError::NoJob {
                context_id: self.context.context_id.clone(),
            });
        };
        let Some(id) = &job.legacy_snapshot_id else {
            return Ok(None);
        };
        let os_volume = self
            .context
            .os_volume()
            .ok_or_else(|| TeardownError::MissingOsVolume {
                context_id: self.context.context_id.clone(),
            })?;
        Ok(Some(SnapshotHandle {
            id: id.clone(),
            name: id.clone(),
            backend: SnapshotBackendKind::PerVolume,
            volume_id: os_volume.volume_id.clone(),
            disk_id: os_volume.disk_id.clone(),
            created_at: job.created_at,
        }))
    }

    fn legacy_skip_reason(&self) -> Option<&'static str> {
        if self.legacy_tracked {
            Some("legacy snapshot handled with the volume snapshots")
        } else {
            None
        }
    }

    async fn revert_legacy(&mut self) -> Result<StepDisposition, TeardownError> {
        if let Some(reason) = self.legacy_skip_reason() {
            return Ok(StepDisposition::Skipped(reason.to_owned()));
        }
        let Some(handle) = self.legacy_handle()? else {
            return Ok(StepDisposition::Skipped(String::from(
                "no legacy snapshot recorded",
            )));
        };
        match self.services.snapshots().revert(&handle).await {
            Ok(()) => {
                info!(snapshot_id = %handle.id, "volume reverted to legacy snapshot");
                Ok(StepDisposition::Completed)
            }
            Err(err) if err.is_not_found() => {
                warn!(snapshot_id = %handle.id, "legacy snapshot already gone; skipping revert");
                Ok(StepDisposition::Skipped(String::from(
                    "legacy snapshot already removed",
                )))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn delete_legacy(&mut self) -> Result<StepDisposition, TeardownError> {
        if let Some(reason) = self.legacy_skip_reason() {
            self.job_mut()?.legacy_snapshot_id = None;
            self.save_job()?;
            return Ok(StepDisposition::Skipped(reason.to_owned()));
        }
        let Some(handle) = self.legacy_handle()? else {
            return Ok(StepDisposition::Skipped(String::from(
                "no legacy snapshot recorded",
            )));
        };
        let disposition = match self.services.snapshots().delete(&handle).await {
            Ok(()) => {
                info!(snapshot_id = %handle.id, "legacy snapshot deleted");
                StepDisposition::Completed
            }
            Err(err) if err.is_not_found() => {
                StepDisposition::Skipped(String::from("legacy snapshot already removed"))
            }
            Err(err) => return Err(err.into()),
        };
        self.job_mut()?.legacy_snapshot_id = None;
        self.save_job()?;
        Ok(disposition)
    }

    async fn return_volumes(&mut self) -> Result<(), TeardownError> {
        let moved = self
            .services
            .volumes()
            .return_all_to_hub(&self.context.context_id, &self.context.volumes)
            .await?;
        info!(context_id = %self.context.context_id, returned = moved.len(), "volumes back on hub");
        self.volumes_released = false;
        self.returned_volumes = moved;
        Ok(())
    }

    async fn delete_vm(&mut self) -> Result<StepDisposition, TeardownError> {
        let context_id = self.context.context_id.clone();
        let Some(vm_id) = self.destination.clone() else {
            self.services.store.set_destination_vm(&context_id, None)?;
            return Ok(StepDisposition::Skipped(String::from(
                "no destination VM to delete",
            )));
        };
        let deleted = self.services.lifecycle().delete(&vm_id).await?;
        self.services.store.set_destination_vm(&context_id, None)?;
        self.destination = None;
        if deleted {
            self.deleted_vm = Some(vm_id);
            Ok(StepDisposition::Completed)
        } else {
            Ok(StepDisposition::Skipped(String::from(
                "destination VM already deleted",
            )))
        }
    }

    fn close_job(&mut self) -> Result<(), TeardownError> {
        self.job_mut()?.set_status(JobStatus::Cleanup);
        self.save_job()
    }

    fn reset_context(&mut self) -> Result<(), TeardownError> {
        self.services
            .store
            .update_context_status(&self.context.context_id, ContextStatus::ReadyForFailover)?;
        Ok(())
    }

    async fn power_on_source(&mut self) -> Result<(), TeardownError> {
        let change = self
            .services
            .source_power()
            .power_on(&self.context.vm_id)
            .await?;
        self.source_power = Some(change);
        Ok(())
    }
}
