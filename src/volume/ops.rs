use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, warn};

use crate::model::{ContextId, OperationMode, VmId, VolumeId, VolumeReference};
use crate::store::FailoverStore;

use super::{OperationStatus, VolumeDaemon, VolumeError, VolumeOperation};

const HUB_REATTACH_ATTEMPTS: usize = 2;

/// How a volume is attached.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AttachAs {
    /// As the VM's boot volume.
    Root,
    /// As an additional data volume.
    Data,
}

#[derive(Clone, Copy)]
enum Request<'a> {
    Attach(&'a VolumeId, &'a VmId, AttachAs),
    Detach(&'a VolumeId),
}

/// Volume moves between the hub appliance and destination VMs.
pub struct VolumeOperations {
    daemon: Arc<dyn VolumeDaemon>,
    store: Arc<dyn FailoverStore>,
    hub_vm_id: VmId,
    poll_interval: Duration,
    attach_timeout: Duration,
    detach_timeout: Duration,
}

impl VolumeOperations {
    /// Creates the engine. Operations are polled every 2 s; attaches wait up
    /// to 300 s and detaches up to 180 s.
    #[must_use]
    pub fn new(daemon: Arc<dyn VolumeDaemon>, store: Arc<dyn FailoverStore>, hub_vm_id: VmId) -> Self {
        Self {
            daemon,
            store,
            hub_vm_id,
            poll_interval: Duration::from_secs(2),
            attach_timeout: Duration::from_secs(300),
            detach_timeout: Duration::from_secs(180),
        }
    }

    /// Overrides the polling cadence and deadlines.
    ///
    /// This is primarily used by tests to keep timeout scenarios fast.
    #[must_use]
    pub const fn with_timings(
        mut self,
        poll_interval: Duration,
        attach_timeout: Duration,
        detach_timeout: Duration,
    ) -> Self {
        self.poll_interval = poll_interval;
        self.attach_timeout = attach_timeout;
        self.detach_timeout = detach_timeout;
        self
    }

    /// Hub appliance that owns volumes between cutovers.
    #[must_use]
    pub const fn hub_vm_id(&self) -> &VmId {
        &self.hub_vm_id
    }

    /// Detaches a volume and clears its owner.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError`] when the daemon operation fails or the store
    /// cannot be updated.
    pub async fn detach(&self, context_id: &ContextId, volume_id: &VolumeId) -> Result<(), VolumeError> {
        let operation = self.submit(Request::Detach(volume_id)).await?;
        self.wait(operation, self.detach_timeout).await?;
        self.store
            .set_volume_owner(context_id, volume_id, None, None)?;
        info!(volume_id = %volume_id, "volume detached");
        Ok(())
    }

    /// Attaches a volume and records its new owner. Returns the device path
    /// reported by the daemon.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError`] when the daemon operation fails or the store
    /// cannot be updated.
    pub async fn attach(
        &self,
        context_id: &ContextId,
        volume_id: &VolumeId,
        vm_id: &VmId,
        attach_as: AttachAs,
    ) -> Result<Option<String>, VolumeError> {
        let operation = self
            .submit(Request::Attach(volume_id, vm_id, attach_as))
            .await?;
        let done = self.wait(operation, self.attach_timeout).await?;
        let device_path = done.device_path();
        self.store.set_volume_owner(
            context_id,
            volume_id,
            Some(vm_id.clone()),
            device_path.clone(),
        )?;
        info!(volume_id = %volume_id, vm_id = %vm_id, device_path = ?device_path, "volume attached");
        Ok(device_path)
    }

    /// Moves a volume from wherever it is to `destination`.
    ///
    /// If the attach fails the volume is returned to the hub. When that
    /// also fails the volume is orphaned; this is logged as critical.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError::AttachFailed`] after a successful return to
    /// the hub, [`VolumeError::Orphaned`] when the return failed too, or the
    /// detach error.
    pub async fn move_to_destination(
        &self,
        context_id: &ContextId,
        volume: &VolumeReference,
        destination: &VmId,
        attach_as: AttachAs,
    ) -> Result<Option<String>, VolumeError> {
        let volume_id = &volume.volume_id;
        match self.daemon.device_mapping(volume_id).await? {
            Some(mapping) if &mapping.vm_id == destination => {
                debug!(volume_id = %volume_id, "volume already on destination");
                return Ok(mapping.device_path);
            }
            Some(_) => self.detach(context_id, volume_id).await?,
            None => {}
        }

        match self.attach(context_id, volume_id, destination, attach_as).await {
            Ok(device_path) => Ok(device_path),
            Err(err) => {
                warn!(volume_id = %volume_id, vm_id = %destination, error = %err, "attach failed; returning volume to hub");
                Err(self
                    .recover_to_hub(context_id, volume_id, destination, err.to_string())
                    .await)
            }
        }
    }

    async fn recover_to_hub(
        &self,
        context_id: &ContextId,
        volume_id: &VolumeId,
        destination: &VmId,
        message: String,
    ) -> VolumeError {
        match self.reattach_to_hub(context_id, volume_id).await {
            Ok(()) => VolumeError::AttachFailed {
                volume_id: volume_id.clone(),
                vm_id: destination.clone(),
                message,
            },
            Err(reattach) => self.orphaned(
                volume_id,
                format!("attach to {destination} failed: {message}"),
                reattach,
            ),
        }
    }

    /// Attaches a detached volume to the hub, retrying once. Returns the
    /// last attach error when every attempt failed.
    async fn reattach_to_hub(&self, context_id: &ContextId, volume_id: &VolumeId) -> Result<(), String> {
        let mut last = String::new();
        for attempt in 1..=HUB_REATTACH_ATTEMPTS {
            match self
                .attach(context_id, volume_id, &self.hub_vm_id, AttachAs::Data)
                .await
            {
                Ok(_) => return Ok(()),
                Err(err) => {
                    warn!(volume_id = %volume_id, attempt, error = %err, "reattach to hub failed");
                    last = err.to_string();
                }
            }
        }
        Err(last)
    }

    fn orphaned(&self, volume_id: &VolumeId, message: String, reattach: String) -> VolumeError {
        error!(
            severity = "CRITICAL",
            volume_id = %volume_id,
            hub_vm_id = %self.hub_vm_id,
            "CRITICAL: volume is attached to nothing; manual reattachment to the hub is required"
        );
        VolumeError::Orphaned {
            volume_id: volume_id.clone(),
            message,
            reattach,
        }
    }

    /// Detaches every listed volume that is held by a VM other than the hub.
    /// Returns the volumes that were detached.
    ///
    /// # Errors
    ///
    /// Returns the first [`VolumeError`] raised.
    pub async fn detach_from_non_hub(
        &self,
        context_id: &ContextId,
        volumes: &[VolumeReference],
    ) -> Result<Vec<VolumeId>, VolumeError> {
        let mut detached = Vec::new();
        for volume in volumes {
            let Some(mapping) = self.daemon.device_mapping(&volume.volume_id).await? else {
                continue;
            };
            if mapping.vm_id == self.hub_vm_id {
                continue;
            }
            self.detach(context_id, &volume.volume_id).await?;
            detached.push(volume.volume_id.clone());
        }
        Ok(detached)
    }

    /// Attaches every listed volume that is not on the hub back to it.
    /// Returns the volumes that were moved.
    ///
    /// Every volume is attempted even after one fails. A volume that cannot
    /// be reattached after its retries is reported as orphaned.
    ///
    /// # Errors
    ///
    /// Returns the first [`VolumeError`] raised; [`VolumeError::Orphaned`]
    /// when a detached volume could not be reattached.
    pub async fn return_all_to_hub(
        &self,
        context_id: &ContextId,
        volumes: &[VolumeReference],
    ) -> Result<Vec<VolumeId>, VolumeError> {
        let mut moved = Vec::new();
        let mut first_error = None;
        for volume in volumes {
            match self.return_to_hub(context_id, &volume.volume_id).await {
                Ok(true) => moved.push(volume.volume_id.clone()),
                Ok(false) => {}
                Err(err) => {
                    warn!(volume_id = %volume.volume_id, error = %err, "volume not returned to hub");
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(moved),
        }
    }

    async fn return_to_hub(&self, context_id: &ContextId, volume_id: &VolumeId) -> Result<bool, VolumeError> {
        match self.daemon.device_mapping(volume_id).await? {
            Some(mapping) if mapping.vm_id == self.hub_vm_id => return Ok(false),
            Some(_) => self.detach(context_id, volume_id).await?,
            None => {}
        }
        self.reattach_to_hub(context_id, volume_id)
            .await
            .map_err(|reattach| {
                self.orphaned(
                    volume_id,
                    String::from("volume was detached for its return to the hub"),
                    reattach,
                )
            })?;
        Ok(true)
    }

    /// Sets the operation mode of every volume of a context.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError::Store`] when the store cannot be updated.
    pub fn switch_mode(&self, context_id: &ContextId, mode: OperationMode) -> Result<(), VolumeError> {
        self.store.set_operation_mode(context_id, mode)?;
        info!(context_id = %context_id, mode = ?mode, "volume operation mode switched");
        Ok(())
    }

    /// Current device path of a volume, preferring the daemon's view.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError`] when the daemon cannot be queried.
    pub async fn device_path(&self, volume: &VolumeReference) -> Result<Option<String>, VolumeError> {
        let mapping = self.daemon.device_mapping(&volume.volume_id).await?;
        Ok(mapping
            .and_then(|found| found.device_path)
            .or_else(|| volume.device_path.clone()))
    }

    async fn submit(&self, request: Request<'_>) -> Result<VolumeOperation, VolumeError> {
        match self.send(request).await {
            Err(err) if err.is_transient() => {
                warn!(error = %err, "volume daemon request failed; retrying once");
                self.send(request).await
            }
            other => other,
        }
    }

    async fn send(&self, request: Request<'_>) -> Result<VolumeOperation, VolumeError> {
        match request {
            Request::Attach(volume_id, vm_id, AttachAs::Root) => {
                self.daemon.attach_root(volume_id, vm_id).await
            }
            Request::Attach(volume_id, vm_id, AttachAs::Data) => {
                self.daemon.attach(volume_id, vm_id).await
            }
            Request::Detach(volume_id) => self.daemon.detach(volume_id).await,
        }
    }

    async fn wait(
        &self,
        operation: VolumeOperation,
        timeout: Duration,
    ) -> Result<VolumeOperation, VolumeError> {
        let deadline = Instant::now() + timeout;
        let mut current = operation;
        loop {
            match current.status {
                OperationStatus::Completed => return Ok(current),
                OperationStatus::Failed => {
                    return Err(VolumeError::OperationFailed {
                        message: current
                            .error
                            .unwrap_or_else(|| String::from("no detail reported")),
                        operation_id: current.id,
                    });
                }
                OperationStatus::Cancelled => {
                    return Err(VolumeError::OperationCancelled {
                        operation_id: current.id,
                    });
                }
                OperationStatus::Pending | OperationStatus::Executing | OperationStatus::Unknown => {}
            }
            if Instant::now() > deadline {
                return Err(VolumeError::Timeout {
                    operation_id: current.id,
                    waited_secs: timeout.as_secs(),
                });
            }
            sleep(self.poll_interval).await;
            match self.daemon.operation(&current.id).await {
                Ok(next) => current = next,
                Err(err) => debug!(operation_id = %current.id, error = %err, "operation status check failed"),
            }
        }
    }
}
