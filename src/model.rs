//! Persistent records shared by the failover and cleanup pipelines.
//!
//! These types mirror the rows the control plane keeps per VM context: the
//! context itself (with its volumes and lifecycle status), the failover job,
//! and the snapshot handles protecting each volume.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Disk identifier the replication pipeline assigns to the boot volume.
pub const OS_DISK_ID: &str = "disk-2000";

macro_rules! newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wraps a raw identifier.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub const fn as_str(&self) -> &str {
                self.0.as_str()
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

newtype!(
    /// Identifier of a replicated VM context.
    ContextId
);
newtype!(
    /// Identifier of a failover job record.
    JobId
);
newtype!(
    /// Identifier of a VM on either the source or the destination platform.
    VmId
);
newtype!(
    /// Identifier of a block volume managed by the volume daemon.
    VolumeId
);

impl JobId {
    /// Generates a fresh random job identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// Which kind of cutover a job performs.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverKind {
    /// Production cutover.
    Live,
    /// Sandboxed, non-destructive cutover.
    Test,
}

impl FailoverKind {
    /// Stable lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Test => "test",
        }
    }
}

impl fmt::Display for FailoverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a failover job record.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, nothing executed yet.
    Pending,
    /// Pre-flight checks running.
    Validating,
    /// Phases running.
    Executing,
    /// Every phase finished.
    Completed,
    /// A phase failed and the job stopped.
    Failed,
    /// The job's resources were cleaned up by a rollback.
    Cleanup,
}

impl JobStatus {
    /// Stable lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Validating => "validating",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cleanup => "cleanup",
        }
    }
}

/// Lifecycle status of a VM context.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextStatus {
    /// Replication is still establishing its first sync point.
    Replicating,
    /// At least one sync completed; failover may start.
    ReadyForFailover,
    /// A test cutover is running on the destination.
    FailedOverTest,
    /// The VM was cut over for production.
    FailedOverLive,
}

impl ContextStatus {
    /// Context status reached after a successful failover of `kind`.
    #[must_use]
    pub const fn failed_over(kind: FailoverKind) -> Self {
        match kind {
            FailoverKind::Live => Self::FailedOverLive,
            FailoverKind::Test => Self::FailedOverTest,
        }
    }

    /// Stable lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Replicating => "replicating",
            Self::ReadyForFailover => "ready_for_failover",
            Self::FailedOverTest => "failed_over_test",
            Self::FailedOverLive => "failed_over_live",
        }
    }
}

/// Which subsystem currently controls a volume.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationMode {
    /// Owned by the replication hub appliance.
    #[default]
    Hub,
    /// Owned by a failover run.
    Failover,
}

/// A volume that belongs to a VM context.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct VolumeReference {
    /// Volume identifier known to the volume daemon.
    pub volume_id: VolumeId,
    /// Source disk identifier (`disk-2000` for the boot disk).
    pub disk_id: String,
    /// Device path on the current owner, when attached.
    #[serde(default)]
    pub device_path: Option<String>,
    /// Provisioned size in bytes.
    pub size_bytes: u64,
    /// VM that currently has the volume attached.
    #[serde(default)]
    pub attached_vm_id: Option<VmId>,
    /// Ownership flag.
    #[serde(default)]
    pub operation_mode: OperationMode,
}

impl VolumeReference {
    /// Returns `true` for the boot volume.
    #[must_use]
    pub fn is_os_disk(&self) -> bool {
        self.disk_id == OS_DISK_ID
    }
}

/// Replicated VM and its current failover state.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct VmContext {
    /// Context identifier.
    pub context_id: ContextId,
    /// Source VM identifier.
    pub vm_id: VmId,
    /// Source VM display name.
    pub vm_name: String,
    /// Lifecycle status.
    pub status: ContextStatus,
    /// Change-tracking id of the last completed sync, empty when none.
    #[serde(default)]
    pub current_change_id: Option<String>,
    /// Guest OS family as reported by discovery (`windows`, `linux`, ...).
    #[serde(default)]
    pub os_type: String,
    /// Virtual CPU count.
    pub cpu_count: u32,
    /// Memory in MiB.
    pub memory_mb: u64,
    /// Names of the source networks the VM is connected to.
    #[serde(default)]
    pub networks: Vec<String>,
    /// Volumes replicated for this VM.
    #[serde(default)]
    pub volumes: Vec<VolumeReference>,
    /// Destination VM currently hosting the context, if any.
    #[serde(default)]
    pub destination_vm_id: Option<VmId>,
    /// Sanitized summary of the last failover or rollback.
    #[serde(default)]
    pub last_operation_summary: Option<serde_json::Value>,
}

impl VmContext {
    /// Returns the boot volume, if the context has one.
    #[must_use]
    pub fn os_volume(&self) -> Option<&VolumeReference> {
        self.volumes.iter().find(|volume| volume.is_os_disk())
    }

    /// Iterates over non-boot volumes.
    pub fn data_volumes(&self) -> impl Iterator<Item = &VolumeReference> {
        self.volumes.iter().filter(|volume| !volume.is_os_disk())
    }

    /// Looks up a volume by identifier.
    #[must_use]
    pub fn volume(&self, volume_id: &VolumeId) -> Option<&VolumeReference> {
        self.volumes
            .iter()
            .find(|volume| &volume.volume_id == volume_id)
    }

    pub(crate) fn volume_mut(&mut self, volume_id: &VolumeId) -> Option<&mut VolumeReference> {
        self.volumes
            .iter_mut()
            .find(|volume| &volume.volume_id == volume_id)
    }
}

/// Snapshot technology that produced a handle.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotBackendKind {
    /// Per-volume snapshots through the destination platform API.
    PerVolume,
    /// Distributed block-storage snapshots through the storage CLI.
    DistributedBlock,
}

/// A point-in-time snapshot protecting one volume.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct SnapshotHandle {
    /// Snapshot identifier understood by the backend.
    pub id: String,
    /// Snapshot name.
    pub name: String,
    /// Backend that owns the snapshot.
    pub backend: SnapshotBackendKind,
    /// Protected volume.
    pub volume_id: VolumeId,
    /// Source disk identifier of the protected volume.
    pub disk_id: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Snapshots tracked for a job, at most one per volume.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct SnapshotSet(BTreeMap<VolumeId, SnapshotHandle>);

impl SnapshotSet {
    /// Creates an empty set.
    #[must_use]
    pub const fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Tracks a handle, replacing any earlier handle for the same volume.
    pub fn insert(&mut self, handle: SnapshotHandle) -> Option<SnapshotHandle> {
        self.0.insert(handle.volume_id.clone(), handle)
    }

    /// Stops tracking the snapshot of `volume_id`.
    pub fn remove(&mut self, volume_id: &VolumeId) -> Option<SnapshotHandle> {
        self.0.remove(volume_id)
    }

    /// Returns the handle protecting `volume_id`.
    #[must_use]
    pub fn get(&self, volume_id: &VolumeId) -> Option<&SnapshotHandle> {
        self.0.get(volume_id)
    }

    /// Returns `true` when a handle with snapshot id `id` is tracked.
    #[must_use]
    pub fn contains_snapshot(&self, id: &str) -> bool {
        self.0.values().any(|handle| handle.id == id)
    }

    /// Iterates over tracked handles in volume order.
    pub fn iter(&self) -> impl Iterator<Item = &SnapshotHandle> {
        self.0.values()
    }

    /// Number of tracked handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` when nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<SnapshotHandle> for SnapshotSet {
    fn from_iter<T: IntoIterator<Item = SnapshotHandle>>(iter: T) -> Self {
        let mut set = Self::new();
        for handle in iter {
            set.insert(handle);
        }
        set
    }
}

/// Failover job record.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct FailoverJob {
    /// Job identifier.
    pub job_id: JobId,
    /// Context the job acts on.
    pub context_id: ContextId,
    /// Source VM identifier.
    pub vm_id: VmId,
    /// Cutover kind.
    pub failover_type: FailoverKind,
    /// Current status.
    pub status: JobStatus,
    /// Destination VM once created.
    #[serde(default)]
    pub destination_vm_id: Option<VmId>,
    /// Snapshot id written by older releases that tracked a single
    /// boot-volume snapshot per job.
    #[serde(default)]
    pub legacy_snapshot_id: Option<String>,
    /// Snapshots protecting the job's volumes.
    #[serde(default)]
    pub snapshots: SnapshotSet,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
    /// Completion time, for completed jobs.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl FailoverJob {
    /// Creates a pending job for `context`.
    #[must_use]
    pub fn new(job_id: JobId, context: &VmContext, failover_type: FailoverKind) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            context_id: context.context_id.clone(),
            vm_id: context.vm_id.clone(),
            failover_type,
            status: JobStatus::Pending,
            destination_vm_id: None,
            legacy_snapshot_id: None,
            snapshots: SnapshotSet::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Moves the job to `status`, stamping the modification time.
    pub fn set_status(&mut self, status: JobStatus) {
        let now = Utc::now();
        self.status = status;
        self.updated_at = now;
        if status == JobStatus::Completed {
            self.completed_at = Some(now);
        }
    }
}

/// Maps a source network to a destination network for one context.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct NetworkMapping {
    /// Owning context.
    pub context_id: ContextId,
    /// Source network name.
    pub source_network_name: String,
    /// Destination network identifier.
    pub destination_network_id: String,
    /// Whether this mapping targets the isolated test network.
    pub is_test_network: bool,
}

/// Power state reported by either platform.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    /// Running.
    On,
    /// Stopped.
    Off,
    /// Transitioning or unknown.
    Other,
}

impl PowerState {
    /// Parses the loose state labels used by the source agent and the
    /// destination gateway.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "poweredon" | "running" | "on" => Self::On,
            "poweredoff" | "stopped" | "off" => Self::Off,
            _ => Self::Other,
        }
    }
}

/// Destination VM creation parameters.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct VmSpec {
    /// Destination VM name.
    pub name: String,
    /// Virtual CPU count.
    pub cpu_count: u32,
    /// Memory in MiB.
    pub memory_mb: u64,
    /// Destination networks in NIC order.
    pub network_ids: Vec<String>,
    /// Guest OS family hint.
    pub os_type: String,
}
