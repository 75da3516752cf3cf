//! Volume snapshots protecting a cutover.
//!
//! Two backends can take snapshots: the destination platform's per-volume
//! API and the distributed block-storage CLI. [`MultiVolumeSnapshots`] fans
//! a create, revert, or cleanup out across every volume of a context and
//! routes each handle back to the backend that produced it.

use thiserror::Error;

use crate::backend::BackendFuture;
use crate::command::CommandError;
use crate::model::{SnapshotBackendKind, SnapshotHandle, VolumeReference};

mod distributed;
mod gateway;
mod multi;

pub use distributed::{BlockSnapshotCli, BlockSnapshotSettings};
pub use gateway::GatewaySnapshots;
pub use multi::{CleanupReport, CreateReport, MultiVolumeSnapshots, SnapshotFailure};

/// Errors raised by snapshot backends.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// The snapshot does not exist.
    #[error("snapshot {snapshot_id} not found")]
    NotFound {
        /// Requested snapshot.
        snapshot_id: String,
    },
    /// The backend rejected the request or could not be reached.
    #[error("snapshot backend error: {message}")]
    Backend {
        /// Human-readable error message.
        message: String,
    },
    /// The snapshot CLI reported a failure.
    #[error("snapshot {action} reported failure: {message}")]
    Reported {
        /// `creation`, `rollback`, or `deletion`.
        action: &'static str,
        /// Reported reason.
        message: String,
    },
    /// The snapshot CLI could not be started.
    #[error(transparent)]
    Command(#[from] CommandError),
    /// No volume could be snapshotted.
    #[error("no snapshots created: {failed} volume(s) failed, first error: {first}")]
    NoneCreated {
        /// Number of failed volumes.
        failed: usize,
        /// First failure message.
        first: String,
    },
}

impl SnapshotError {
    /// Returns `true` when the snapshot was missing.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// A snapshot technology.
pub trait SnapshotBackend: Send + Sync {
    /// Which technology this backend drives.
    fn kind(&self) -> SnapshotBackendKind;

    /// Snapshots `volume` under `name`.
    fn create<'a>(
        &'a self,
        volume: &'a VolumeReference,
        name: &'a str,
    ) -> BackendFuture<'a, SnapshotHandle, SnapshotError>;

    /// Restores the protected volume to the snapshot.
    fn revert<'a>(&'a self, handle: &'a SnapshotHandle) -> BackendFuture<'a, (), SnapshotError>;

    /// Removes the snapshot.
    fn delete<'a>(&'a self, handle: &'a SnapshotHandle) -> BackendFuture<'a, (), SnapshotError>;
}

#[cfg(test)]
mod tests;
