//! Persisted failover state.
//!
//! The orchestrators only need a handful of record operations: read and
//! write VM contexts, their network mappings, and their failover jobs. Two
//! implementations are provided: [`MemoryStore`] for embedding and tests, and
//! [`JsonStateStore`], which keeps one JSON document per record under a
//! state directory.

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::model::{
    ContextId, ContextStatus, FailoverJob, JobId, NetworkMapping, OperationMode, VmContext, VmId,
    VolumeId,
};

mod json;
mod memory;

pub use json::JsonStateStore;
pub use memory::MemoryStore;

/// Errors raised by state stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Raised when a record does not exist.
    #[error("{kind} {id} not found")]
    NotFound {
        /// Record kind (`context`, `job`).
        kind: &'static str,
        /// Requested identifier.
        id: String,
    },
    /// Raised when file system operations fail.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when a stored document cannot be decoded or encoded.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// Offending document.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
}

/// Record operations used by the orchestrators.
///
/// Implementors provide the primitive reads and writes; the provided
/// methods perform read-modify-write updates that land as one write.
pub trait FailoverStore: Send + Sync {
    /// Loads a VM context.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when the context does not exist.
    fn context(&self, context_id: &ContextId) -> Result<VmContext, StoreError>;

    /// Inserts or replaces a VM context.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the record cannot be written.
    fn save_context(&self, context: &VmContext) -> Result<(), StoreError>;

    /// Loads the network mappings of a context.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the mappings cannot be read. A context
    /// without mappings yields an empty list.
    fn network_mappings(&self, context_id: &ContextId) -> Result<Vec<NetworkMapping>, StoreError>;

    /// Replaces the network mappings of a context.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the mappings cannot be written.
    fn save_network_mappings(
        &self,
        context_id: &ContextId,
        mappings: &[NetworkMapping],
    ) -> Result<(), StoreError>;

    /// Lists the jobs of a context, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the jobs cannot be read.
    fn jobs(&self, context_id: &ContextId) -> Result<Vec<FailoverJob>, StoreError>;

    /// Inserts or replaces a job.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the record cannot be written.
    fn save_job(&self, job: &FailoverJob) -> Result<(), StoreError>;

    /// Loads one job of a context.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when the job does not exist.
    fn job(&self, context_id: &ContextId, job_id: &JobId) -> Result<FailoverJob, StoreError> {
        self.jobs(context_id)?
            .into_iter()
            .find(|job| &job.job_id == job_id)
            .ok_or_else(|| StoreError::NotFound {
                kind: "job",
                id: job_id.to_string(),
            })
    }

    /// Loads the most recent job of a context, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the jobs cannot be read.
    fn latest_job(&self, context_id: &ContextId) -> Result<Option<FailoverJob>, StoreError> {
        Ok(self.jobs(context_id)?.pop())
    }

    /// Sets the lifecycle status of a context.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the context cannot be read or written.
    fn update_context_status(
        &self,
        context_id: &ContextId,
        status: ContextStatus,
    ) -> Result<(), StoreError> {
        let mut context = self.context(context_id)?;
        context.status = status;
        self.save_context(&context)
    }

    /// Records the destination VM currently hosting a context.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the context cannot be read or written.
    fn set_destination_vm(
        &self,
        context_id: &ContextId,
        vm_id: Option<VmId>,
    ) -> Result<(), StoreError> {
        let mut context = self.context(context_id)?;
        context.destination_vm_id = vm_id;
        self.save_context(&context)
    }

    /// Flips the operation mode of every volume of a context in one write.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the context cannot be read or written.
    fn set_operation_mode(
        &self,
        context_id: &ContextId,
        mode: OperationMode,
    ) -> Result<(), StoreError> {
        let mut context = self.context(context_id)?;
        for volume in &mut context.volumes {
            volume.operation_mode = mode;
        }
        self.save_context(&context)
    }

    /// Records which VM a volume is attached to, and where.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when the volume is not part of the
    /// context.
    fn set_volume_owner(
        &self,
        context_id: &ContextId,
        volume_id: &VolumeId,
        owner: Option<VmId>,
        device_path: Option<String>,
    ) -> Result<(), StoreError> {
        let mut context = self.context(context_id)?;
        let volume = context
            .volume_mut(volume_id)
            .ok_or_else(|| StoreError::NotFound {
                kind: "volume",
                id: volume_id.to_string(),
            })?;
        volume.attached_vm_id = owner;
        volume.device_path = device_path;
        self.save_context(&context)
    }

    /// Persists the sanitized summary of the last operation.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the context cannot be read or written.
    fn save_operation_summary(
        &self,
        context_id: &ContextId,
        summary: serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut context = self.context(context_id)?;
        context.last_operation_summary = Some(summary);
        self.save_context(&context)
    }
}
