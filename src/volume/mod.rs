//! Volume moves through the volume management daemon.
//!
//! The daemon serialises every attach and detach. Each request returns an
//! operation record that is polled until it completes, fails, or is
//! cancelled. [`VolumeOperations`] builds the moves the orchestrators need on
//! top of that protocol and keeps the store's ownership record in step.

use std::collections::BTreeMap;

use serde::Deserialize;
use thiserror::Error;

use crate::backend::BackendFuture;
use crate::model::{VmId, VolumeId};
use crate::store::StoreError;

mod daemon;
mod ops;

pub use daemon::DaemonClient;
pub use ops::{AttachAs, VolumeOperations};

/// State of a daemon operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Queued.
    Pending,
    /// Running.
    Executing,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Abandoned before completion.
    Cancelled,
    /// Any state this client does not know.
    #[serde(other)]
    Unknown,
}

/// Operation record returned by the daemon.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
pub struct VolumeOperation {
    /// Operation identifier.
    pub id: String,
    /// Operation kind (`attach`, `detach`, ...).
    #[serde(rename = "type", default)]
    pub operation_type: String,
    /// Current state.
    pub status: OperationStatus,
    /// Volume the operation acts on.
    pub volume_id: VolumeId,
    /// Target VM, when attaching.
    #[serde(default)]
    pub vm_id: Option<VmId>,
    /// Result fields reported on completion.
    #[serde(default)]
    pub response: BTreeMap<String, serde_json::Value>,
    /// Failure reason.
    #[serde(default)]
    pub error: Option<String>,
}

impl VolumeOperation {
    /// Device path reported by a completed attach.
    #[must_use]
    pub fn device_path(&self) -> Option<String> {
        self.response
            .get("device_path")
            .and_then(serde_json::Value::as_str)
            .map(str::to_owned)
    }
}

/// Where a volume is attached, according to the daemon.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
pub struct DeviceMapping {
    /// Volume identifier.
    pub volume_id: VolumeId,
    /// VM holding the volume.
    pub vm_id: VmId,
    /// Device path on that VM.
    #[serde(default)]
    pub device_path: Option<String>,
}

/// Errors raised by volume operations.
#[derive(Debug, Error)]
pub enum VolumeError {
    /// The daemon could not be reached.
    #[error("volume daemon request failed: {message}")]
    Transport {
        /// Human-readable error message.
        message: String,
    },
    /// The daemon rejected the request.
    #[error("volume daemon returned {status}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body.
        message: String,
    },
    /// The operation finished with an error.
    #[error("operation failed: {message}")]
    OperationFailed {
        /// Daemon operation.
        operation_id: String,
        /// Reported reason.
        message: String,
    },
    /// The operation was cancelled.
    #[error("operation {operation_id} was cancelled")]
    OperationCancelled {
        /// Daemon operation.
        operation_id: String,
    },
    /// The operation did not finish in time.
    #[error("operation {operation_id} did not complete within {waited_secs}s")]
    Timeout {
        /// Daemon operation.
        operation_id: String,
        /// Seconds waited.
        waited_secs: u64,
    },
    /// Attaching to the destination failed and the volume went back to
    /// the hub.
    #[error("failed to attach volume {volume_id} to {vm_id}: {message}")]
    AttachFailed {
        /// Volume that was moved back.
        volume_id: VolumeId,
        /// Destination VM.
        vm_id: VmId,
        /// Attach failure.
        message: String,
    },
    /// The volume is attached to nothing after a failed move or return.
    #[error(
        "volume {volume_id} is orphaned: {message}; reattaching to the hub also failed ({reattach})"
    )]
    Orphaned {
        /// Orphaned volume.
        volume_id: VolumeId,
        /// What left the volume detached.
        message: String,
        /// Reattach failure.
        reattach: String,
    },
    /// The ownership record could not be updated.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl VolumeError {
    /// Returns `true` for failures worth one automatic retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transport { .. })
            || matches!(self, Self::Api { status, .. } if *status >= 500)
    }
}

/// Operations exposed by the volume daemon.
pub trait VolumeDaemon: Send + Sync {
    /// Submits an attach of `volume_id` to `vm_id` as a data volume.
    fn attach<'a>(
        &'a self,
        volume_id: &'a VolumeId,
        vm_id: &'a VmId,
    ) -> BackendFuture<'a, VolumeOperation, VolumeError>;

    /// Submits an attach of `volume_id` to `vm_id` as its boot volume.
    fn attach_root<'a>(
        &'a self,
        volume_id: &'a VolumeId,
        vm_id: &'a VmId,
    ) -> BackendFuture<'a, VolumeOperation, VolumeError>;

    /// Submits a detach of `volume_id` from whatever holds it.
    fn detach<'a>(&'a self, volume_id: &'a VolumeId) -> BackendFuture<'a, VolumeOperation, VolumeError>;

    /// Reads an operation record.
    fn operation<'a>(&'a self, operation_id: &'a str) -> BackendFuture<'a, VolumeOperation, VolumeError>;

    /// Reads where a volume is attached; `None` when detached.
    fn device_mapping<'a>(
        &'a self,
        volume_id: &'a VolumeId,
    ) -> BackendFuture<'a, Option<DeviceMapping>, VolumeError>;

    /// Checks that the daemon is serving requests.
    fn health(&self) -> BackendFuture<'_, (), VolumeError>;
}
