use std::sync::Arc;

use tracing::{info, warn};

use crate::model::{SnapshotBackendKind, SnapshotHandle, SnapshotSet, VolumeId, VolumeReference};

use super::{SnapshotBackend, SnapshotError};

/// One volume whose snapshot operation failed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SnapshotFailure {
    /// Affected volume.
    pub volume_id: VolumeId,
    /// Error message.
    pub message: String,
}

/// Outcome of snapshotting every volume.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CreateReport {
    /// Snapshots that were taken.
    pub snapshots: SnapshotSet,
    /// Volumes that could not be snapshotted.
    pub failures: Vec<SnapshotFailure>,
}

/// Outcome of cleaning up a snapshot set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Volumes whose snapshot was handled.
    pub completed: Vec<VolumeId>,
    /// Volumes whose snapshot could not be handled.
    pub failures: Vec<SnapshotFailure>,
}

impl CleanupReport {
    /// Returns `true` when every snapshot was handled.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Joins the failure messages for reporting.
    #[must_use]
    pub fn failure_summary(&self) -> String {
        self.failures
            .iter()
            .map(|failure| format!("{}: {}", failure.volume_id, failure.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Applies snapshot operations across all volumes of a context.
#[derive(Clone)]
pub struct MultiVolumeSnapshots {
    per_volume: Arc<dyn SnapshotBackend>,
    distributed: Arc<dyn SnapshotBackend>,
}

impl MultiVolumeSnapshots {
    /// Combines the two snapshot backends.
    #[must_use]
    pub const fn new(per_volume: Arc<dyn SnapshotBackend>, distributed: Arc<dyn SnapshotBackend>) -> Self {
        Self {
            per_volume,
            distributed,
        }
    }

    fn backend(&self, kind: SnapshotBackendKind) -> &dyn SnapshotBackend {
        match kind {
            SnapshotBackendKind::PerVolume => self.per_volume.as_ref(),
            SnapshotBackendKind::DistributedBlock => self.distributed.as_ref(),
        }
    }

    /// Snapshots every volume, named `{base_name}-{disk_id}`.
    ///
    /// Individual failures are collected; the call only fails when no
    /// volume could be snapshotted.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::NoneCreated`] when every volume failed.
    pub async fn create_all(
        &self,
        kind: SnapshotBackendKind,
        volumes: &[VolumeReference],
        base_name: &str,
    ) -> Result<CreateReport, SnapshotError> {
        let backend = self.backend(kind);
        let mut report = CreateReport::default();
        for volume in volumes {
            let name = format!("{base_name}-{}", volume.disk_id);
            match backend.create(volume, &name).await {
                Ok(handle) => {
                    info!(volume_id = %volume.volume_id, snapshot_id = %handle.id, "snapshot created");
                    report.snapshots.insert(handle);
                }
                Err(err) => {
                    warn!(volume_id = %volume.volume_id, error = %err, "snapshot creation failed");
                    report.failures.push(SnapshotFailure {
                        volume_id: volume.volume_id.clone(),
                        message: err.to_string(),
                    });
                }
            }
        }

        if report.snapshots.is_empty() && !volumes.is_empty() {
            let first = report
                .failures
                .first()
                .map_or_else(String::new, |failure| failure.message.clone());
            return Err(SnapshotError::NoneCreated {
                failed: report.failures.len(),
                first,
            });
        }
        Ok(report)
    }

    /// Reverts one snapshot.
    ///
    /// # Errors
    ///
    /// Returns the backend's [`SnapshotError`].
    pub async fn revert(&self, handle: &SnapshotHandle) -> Result<(), SnapshotError> {
        self.backend(handle.backend).revert(handle).await
    }

    /// Deletes one snapshot.
    ///
    /// # Errors
    ///
    /// Returns the backend's [`SnapshotError`].
    pub async fn delete(&self, handle: &SnapshotHandle) -> Result<(), SnapshotError> {
        self.backend(handle.backend).delete(handle).await
    }

    /// Reverts and deletes every snapshot in `set`, continuing past
    /// failures. Handled snapshots are removed from `set`; failed ones stay
    /// tracked so a later cleanup can retry them.
    pub async fn cleanup_all(&self, set: &mut SnapshotSet) -> CleanupReport {
        let handles: Vec<SnapshotHandle> = set.iter().cloned().collect();
        let mut report = CleanupReport::default();
        for handle in handles {
            match self.cleanup_one(&handle).await {
                Ok(()) => {
                    set.remove(&handle.volume_id);
                    report.completed.push(handle.volume_id);
                }
                Err(err) => {
                    warn!(volume_id = %handle.volume_id, snapshot_id = %handle.id, error = %err, "snapshot cleanup failed");
                    report.failures.push(SnapshotFailure {
                        volume_id: handle.volume_id,
                        message: err.to_string(),
                    });
                }
            }
        }
        report
    }

    async fn cleanup_one(&self, handle: &SnapshotHandle) -> Result<(), SnapshotError> {
        let backend = self.backend(handle.backend);
        match backend.revert(handle).await {
            Ok(()) => info!(volume_id = %handle.volume_id, snapshot_id = %handle.id, "volume reverted to snapshot"),
            Err(err) if err.is_not_found() => {
                warn!(snapshot_id = %handle.id, "snapshot already gone; skipping revert");
                return Ok(());
            }
            Err(err) => return Err(err),
        }
        match backend.delete(handle).await {
            Ok(()) => {
                info!(snapshot_id = %handle.id, "snapshot deleted");
                Ok(())
            }
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err),
        }
    }
}
