//! Destination VM lifecycle.
//!
//! [`ComputePlatform`] is the narrow surface the control plane needs from
//! the destination platform. [`VmLifecycle`] layers the waiting and
//! idempotence rules on top: stopping or deleting a VM that is already gone
//! succeeds, and start-up waits until the VM reports running.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::time::{Instant, sleep};
use tracing::{info, warn};

use crate::backend::BackendFuture;
use crate::model::{PowerState, VmId, VmSpec};

mod gateway;

pub use gateway::GatewayPlatform;

/// Errors raised by the destination platform.
#[derive(Debug, Error)]
pub enum PlatformError {
    /// The referenced object does not exist.
    #[error("{kind} {id} not found")]
    NotFound {
        /// Object kind (`vm`, `volume`, `snapshot`).
        kind: &'static str,
        /// Requested identifier.
        id: String,
    },
    /// The gateway could not be reached.
    #[error("platform request failed: {message}")]
    Transport {
        /// Human-readable error message.
        message: String,
    },
    /// The gateway rejected the request.
    #[error("platform API error {status}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body.
        message: String,
    },
    /// The VM did not reach the expected state in time.
    #[error("VM {vm_id} did not become {expected} within {waited_secs}s")]
    Timeout {
        /// Destination VM.
        vm_id: VmId,
        /// Expected state label.
        expected: &'static str,
        /// Seconds waited.
        waited_secs: u64,
    },
}

impl PlatformError {
    /// Returns `true` when the object was missing.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Role of a volume attached to a destination VM.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformVolumeKind {
    /// Boot volume provisioned with the VM.
    Root,
    /// Additional data volume.
    Data,
}

/// A volume as reported by the destination platform.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
pub struct PlatformVolume {
    /// Platform volume identifier.
    pub id: String,
    /// Volume role.
    #[serde(rename = "type")]
    pub kind: PlatformVolumeKind,
}

/// Destination platform operations.
pub trait ComputePlatform: Send + Sync {
    /// Creates a stopped VM and returns its identifier.
    fn create_vm<'a>(&'a self, spec: &'a VmSpec) -> BackendFuture<'a, VmId, PlatformError>;

    /// Requests start-up.
    fn power_on<'a>(&'a self, vm_id: &'a VmId) -> BackendFuture<'a, (), PlatformError>;

    /// Requests shutdown.
    fn power_off<'a>(&'a self, vm_id: &'a VmId) -> BackendFuture<'a, (), PlatformError>;

    /// Reads the power state.
    fn power_state<'a>(&'a self, vm_id: &'a VmId) -> BackendFuture<'a, PowerState, PlatformError>;

    /// Destroys a VM.
    fn delete_vm<'a>(&'a self, vm_id: &'a VmId) -> BackendFuture<'a, (), PlatformError>;

    /// Lists volumes attached to a VM.
    fn vm_volumes<'a>(
        &'a self,
        vm_id: &'a VmId,
    ) -> BackendFuture<'a, Vec<PlatformVolume>, PlatformError>;

    /// Detaches a platform volume from its VM.
    fn detach_volume<'a>(&'a self, volume_id: &'a str) -> BackendFuture<'a, (), PlatformError>;

    /// Destroys a detached platform volume.
    fn delete_volume<'a>(&'a self, volume_id: &'a str) -> BackendFuture<'a, (), PlatformError>;
}

/// What a stop request did.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StopOutcome {
    /// The VM was running and has been stopped.
    Stopped,
    /// The VM was already stopped.
    AlreadyStopped,
    /// The VM does not exist.
    Absent,
}

/// Creates, starts, stops, and deletes destination VMs.
pub struct VmLifecycle {
    platform: Arc<dyn ComputePlatform>,
    poll_interval: Duration,
    start_timeout: Duration,
    stop_timeout: Duration,
}

impl VmLifecycle {
    /// Creates a lifecycle driver that polls every 5 s and waits up to 300 s
    /// for start-up and shutdown.
    #[must_use]
    pub fn new(platform: Arc<dyn ComputePlatform>) -> Self {
        Self {
            platform,
            poll_interval: Duration::from_secs(5),
            start_timeout: Duration::from_secs(300),
            stop_timeout: Duration::from_secs(300),
        }
    }

    /// Overrides the polling cadence and deadlines.
    ///
    /// This is primarily used by tests to keep timeout scenarios fast.
    #[must_use]
    pub const fn with_timings(
        mut self,
        poll_interval: Duration,
        start_timeout: Duration,
        stop_timeout: Duration,
    ) -> Self {
        self.poll_interval = poll_interval;
        self.start_timeout = start_timeout;
        self.stop_timeout = stop_timeout;
        self
    }

    /// Creates the destination VM. Creation is not retried.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError`] when the platform rejects the request.
    pub async fn create(&self, spec: &VmSpec) -> Result<VmId, PlatformError> {
        let vm_id = self.platform.create_vm(spec).await?;
        info!(vm_id = %vm_id, name = %spec.name, "destination VM created");
        Ok(vm_id)
    }

    /// Removes the boot volume the platform provisioned with a new VM, so the
    /// replicated OS volume can take its place. Returns the removed ids.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError`] when listing, detaching, or deleting fails.
    pub async fn delete_default_root_volume(
        &self,
        vm_id: &VmId,
    ) -> Result<Vec<String>, PlatformError> {
        let mut removed = Vec::new();
        for volume in self.platform.vm_volumes(vm_id).await? {
            if volume.kind != PlatformVolumeKind::Root {
                continue;
            }
            self.platform.detach_volume(&volume.id).await?;
            self.platform.delete_volume(&volume.id).await?;
            info!(vm_id = %vm_id, volume_id = %volume.id, "default root volume removed");
            removed.push(volume.id);
        }
        Ok(removed)
    }

    /// Starts a VM and waits until it reports running.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Timeout`] when the VM does not come up in
    /// time, or the platform error that interrupted start-up.
    pub async fn start(&self, vm_id: &VmId) -> Result<(), PlatformError> {
        self.platform.power_on(vm_id).await?;
        self.wait_for(vm_id, PowerState::On, "running", self.start_timeout)
            .await?;
        info!(vm_id = %vm_id, "destination VM running");
        Ok(())
    }

    /// Stops a VM and waits until it reports stopped. Missing VMs are not
    /// an error.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError`] when the platform fails or the VM keeps
    /// running past the deadline.
    pub async fn stop(&self, vm_id: &VmId) -> Result<StopOutcome, PlatformError> {
        match self.platform.power_state(vm_id).await {
            Err(err) if err.is_not_found() => return Ok(StopOutcome::Absent),
            Err(err) => return Err(err),
            Ok(PowerState::Off) => return Ok(StopOutcome::AlreadyStopped),
            Ok(_) => {}
        }
        match self.platform.power_off(vm_id).await {
            Err(err) if err.is_not_found() => return Ok(StopOutcome::Absent),
            other => other?,
        }
        self.wait_for(vm_id, PowerState::Off, "stopped", self.stop_timeout)
            .await?;
        info!(vm_id = %vm_id, "destination VM stopped");
        Ok(StopOutcome::Stopped)
    }

    /// Deletes a VM. Returns `false` when it was already gone.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError`] for failures other than a missing VM.
    pub async fn delete(&self, vm_id: &VmId) -> Result<bool, PlatformError> {
        match self.platform.delete_vm(vm_id).await {
            Ok(()) => {
                info!(vm_id = %vm_id, "destination VM deleted");
                Ok(true)
            }
            Err(err) if err.is_not_found() => {
                info!(vm_id = %vm_id, "destination VM already deleted");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Returns `true` when the VM reports running.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError`] when the state cannot be read.
    pub async fn is_running(&self, vm_id: &VmId) -> Result<bool, PlatformError> {
        Ok(self.platform.power_state(vm_id).await? == PowerState::On)
    }

    async fn wait_for(
        &self,
        vm_id: &VmId,
        wanted: PowerState,
        expected: &'static str,
        timeout: Duration,
    ) -> Result<(), PlatformError> {
        let deadline = Instant::now() + timeout;
        while Instant::now() <= deadline {
            match self.platform.power_state(vm_id).await {
                Ok(state) if state == wanted => return Ok(()),
                Ok(_) => {}
                Err(err) if err.is_not_found() => return Err(err),
                Err(err) => warn!(vm_id = %vm_id, error = %err, "power state check failed"),
            }
            sleep(self.poll_interval).await;
        }
        Err(PlatformError::Timeout {
            vm_id: vm_id.clone(),
            expected,
            waited_secs: timeout.as_secs(),
        })
    }
}
