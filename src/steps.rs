//! Catalogue of the phases emitted by the failover and cleanup pipelines.
//!
//! Step identifiers are stable: they are recorded by the job tracker and
//! used by the sanitizer and the CLI to render progress. All presentation
//! data lives in a single table keyed by [`FailoverStep`].

use std::fmt;

use crate::tracker::StepStatus;

/// Phase of a failover, cleanup, or rollback run.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum FailoverStep {
    /// Pre-flight validation.
    Validation,
    /// Power off the source VM before a live cutover.
    SourceVmPowerOff,
    /// Last incremental sync before a live cutover.
    FinalSync,
    /// Flip volume ownership to the failover run.
    VolumeModeSwitchFailover,
    /// Snapshot every volume of the context.
    MultiVolumeSnapshotCreation,
    /// Offline driver injection into the boot volume.
    VirtioDriverInjection,
    /// Create the destination VM.
    VmCreation,
    /// Move volumes from the hub to the destination VM.
    VolumeAttachment,
    /// Boot the destination VM and confirm it runs.
    VmStartupAndValidation,
    /// Record the final failover status.
    StatusUpdate,
    /// Load the job being cleaned up.
    FailoverJobRetrieval,
    /// Stop the destination VM.
    TestVmShutdown,
    /// Detach every volume from the destination VM.
    VolumeDetachment,
    /// Revert and delete every tracked snapshot.
    MultiVolumeSnapshotCleanup,
    /// Flip volume ownership back to the hub.
    VolumeModeSwitchHub,
    /// Revert the single snapshot recorded by older jobs.
    LegacySnapshotRollback,
    /// Delete the single snapshot recorded by older jobs.
    LegacySnapshotDeletion,
    /// Reattach volumes to the hub appliance.
    VolumeReattachmentToHub,
    /// Delete the destination VM.
    TestVmDeletion,
    /// Mark the job as cleaned up.
    FailoverJobStatusUpdate,
    /// Reset the VM context to `ready_for_failover`.
    VmContextStatusUpdate,
    /// Power the source VM back on after a live rollback.
    SourceVmPowerOn,
}

/// Coarse grouping used when rendering progress.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StepCategory {
    /// Reading state, validating inputs.
    Setup,
    /// Making the VM and its volumes ready.
    Preparation,
    /// Creating and starting destination resources.
    Execution,
    /// Tearing destination resources down.
    Cleanup,
    /// Writing final status.
    Finalization,
}

impl StepCategory {
    /// Stable lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::Preparation => "preparation",
            Self::Execution => "execution",
            Self::Cleanup => "cleanup",
            Self::Finalization => "finalization",
        }
    }
}

/// Error-message family the sanitizer applies to a step.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorFamily {
    /// Driver injection.
    Driver,
    /// Destination VM creation.
    VmCreation,
    /// Network mapping.
    Network,
    /// Volume ownership moves.
    Volume,
    /// Power management on either side.
    Power,
    /// Snapshot handling.
    Snapshot,
    /// Pre-flight validation.
    Validation,
    /// Everything else.
    Generic,
}

/// Presentation data for one step.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StepInfo {
    /// Stable identifier recorded by the tracker.
    pub id: &'static str,
    /// Operator-facing name.
    pub display_name: &'static str,
    /// Progress grouping.
    pub category: StepCategory,
    /// One-line description.
    pub description: &'static str,
    /// Icon shown next to the step.
    pub icon: &'static str,
    /// Sanitizer family.
    pub family: ErrorFamily,
}

const fn info(
    id: &'static str,
    display_name: &'static str,
    category: StepCategory,
    description: &'static str,
    icon: &'static str,
    family: ErrorFamily,
) -> StepInfo {
    StepInfo {
        id,
        display_name,
        category,
        description,
        icon,
        family,
    }
}

const GENERIC_DESCRIPTION: &str = "Performing operation step";
const DEFAULT_ICON: &str = "📋";
const CLEANUP_ICON: &str = "🧹";

impl FailoverStep {
    /// Every step, in catalogue order.
    pub const ALL: [Self; 22] = [
        Self::Validation,
        Self::SourceVmPowerOff,
        Self::FinalSync,
        Self::VolumeModeSwitchFailover,
        Self::MultiVolumeSnapshotCreation,
        Self::VirtioDriverInjection,
        Self::VmCreation,
        Self::VolumeAttachment,
        Self::VmStartupAndValidation,
        Self::StatusUpdate,
        Self::FailoverJobRetrieval,
        Self::TestVmShutdown,
        Self::VolumeDetachment,
        Self::MultiVolumeSnapshotCleanup,
        Self::VolumeModeSwitchHub,
        Self::LegacySnapshotRollback,
        Self::LegacySnapshotDeletion,
        Self::VolumeReattachmentToHub,
        Self::TestVmDeletion,
        Self::FailoverJobStatusUpdate,
        Self::VmContextStatusUpdate,
        Self::SourceVmPowerOn,
    ];

    /// Returns the presentation record for this step.
    #[must_use]
    pub const fn info(self) -> StepInfo {
        use ErrorFamily as F;
        use StepCategory as C;
        match self {
            Self::Validation => info(
                "validation",
                "Pre-flight Validation",
                C::Setup,
                "Checking VM is ready for failover operation",
                "🔍",
                F::Validation,
            ),
            Self::SourceVmPowerOff => info(
                "source-vm-power-off",
                "Powering Off Source VM",
                C::Preparation,
                "Shutting down source VM to ensure data consistency",
                "🔌",
                F::Power,
            ),
            Self::FinalSync => info(
                "final-sync",
                "Final Data Synchronization",
                C::Preparation,
                "Synchronizing final changes before failover",
                "🔄",
                F::Generic,
            ),
            Self::VolumeModeSwitchFailover => info(
                "volume-mode-switch-failover",
                "Configuring Storage Mode",
                C::Preparation,
                GENERIC_DESCRIPTION,
                DEFAULT_ICON,
                F::Generic,
            ),
            Self::MultiVolumeSnapshotCreation => info(
                "multi-volume-snapshot-creation",
                "Creating Backup Snapshots",
                C::Preparation,
                "Creating backup snapshots of all VM disks for rollback protection",
                "📸",
                F::Snapshot,
            ),
            Self::VirtioDriverInjection => info(
                "virtio-driver-injection",
                "Preparing Drivers for Compatibility",
                C::Preparation,
                "Preparing VM for KVM virtualization platform",
                "💾",
                F::Driver,
            ),
            Self::VmCreation => info(
                "vm-creation",
                "Creating Destination VM",
                C::Execution,
                "Creating VM on destination platform with specified configuration",
                "🖥️",
                F::VmCreation,
            ),
            Self::VolumeAttachment => info(
                "volume-attachment",
                "Attaching Storage Volumes",
                C::Execution,
                "Connecting storage volumes to destination VM",
                "🔗",
                F::Volume,
            ),
            Self::VmStartupAndValidation => info(
                "vm-startup-and-validation",
                "Starting and Validating VM",
                C::Execution,
                "Starting VM and verifying it boots correctly",
                "🚀",
                F::Power,
            ),
            Self::StatusUpdate => info(
                "status-update",
                "Updating VM Status",
                C::Finalization,
                "Updating VM status in system",
                DEFAULT_ICON,
                F::Generic,
            ),
            Self::FailoverJobRetrieval => info(
                "failover-job-retrieval",
                "Retrieving Operation Details",
                C::Setup,
                GENERIC_DESCRIPTION,
                DEFAULT_ICON,
                F::Generic,
            ),
            Self::TestVmShutdown => info(
                "test-vm-shutdown",
                "Shutting Down Test VM",
                C::Cleanup,
                "Shutting down test VM to prepare for cleanup",
                CLEANUP_ICON,
                F::Generic,
            ),
            Self::VolumeDetachment => info(
                "volume-detachment",
                "Detaching Storage Volumes",
                C::Cleanup,
                "Disconnecting storage volumes from VM",
                CLEANUP_ICON,
                F::Volume,
            ),
            Self::MultiVolumeSnapshotCleanup => info(
                "multi-volume-snapshot-cleanup",
                "Cleaning Up Storage Snapshots",
                C::Cleanup,
                "Cleaning up all backup snapshots",
                CLEANUP_ICON,
                F::Snapshot,
            ),
            Self::VolumeModeSwitchHub => info(
                "volume-mode-switch-hub",
                "Preparing Storage Volumes",
                C::Cleanup,
                GENERIC_DESCRIPTION,
                CLEANUP_ICON,
                F::Generic,
            ),
            Self::LegacySnapshotRollback => info(
                "legacy-snapshot-rollback",
                "Rolling Back to Backup",
                C::Cleanup,
                "Restoring volumes to pre-failover state",
                CLEANUP_ICON,
                F::Snapshot,
            ),
            Self::LegacySnapshotDeletion => info(
                "legacy-snapshot-deletion",
                "Cleaning Up Backups",
                C::Cleanup,
                "Removing temporary backup snapshots",
                CLEANUP_ICON,
                F::Snapshot,
            ),
            Self::VolumeReattachmentToHub => info(
                "volume-reattachment-to-hub",
                "Restoring Storage Configuration",
                C::Cleanup,
                GENERIC_DESCRIPTION,
                CLEANUP_ICON,
                F::Volume,
            ),
            Self::TestVmDeletion => info(
                "test-vm-deletion",
                "Removing Test VM",
                C::Cleanup,
                "Removing test VM from destination platform",
                CLEANUP_ICON,
                F::Generic,
            ),
            Self::FailoverJobStatusUpdate => info(
                "failover-job-status-update",
                "Updating Operation Status",
                C::Finalization,
                GENERIC_DESCRIPTION,
                DEFAULT_ICON,
                F::Generic,
            ),
            Self::VmContextStatusUpdate => info(
                "vm-context-status-update",
                "Finalizing VM State",
                C::Finalization,
                GENERIC_DESCRIPTION,
                DEFAULT_ICON,
                F::Generic,
            ),
            Self::SourceVmPowerOn => info(
                "source-vm-power-on",
                "Powering On Source VM",
                C::Finalization,
                "Restarting source VM after failover",
                "⚡",
                F::Power,
            ),
        }
    }

    /// Stable identifier.
    #[must_use]
    pub const fn id(self) -> &'static str {
        self.info().id
    }

    /// Operator-facing name.
    #[must_use]
    pub const fn display_name(self) -> &'static str {
        self.info().display_name
    }

    /// Looks a step up by its stable identifier.
    #[must_use]
    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|step| step.id() == id)
    }
}

impl fmt::Display for FailoverStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Operator-facing name for any step identifier.
///
/// Unknown identifiers are rendered by title-casing their kebab-case words.
#[must_use]
pub fn display_name_for(step_id: &str) -> String {
    if let Some(step) = FailoverStep::from_id(step_id) {
        return step.display_name().to_owned();
    }
    step_id
        .split('-')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            chars.next().map_or_else(String::new, |first| {
                first.to_uppercase().chain(chars).collect::<String>()
            })
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Icon for a step's status.
#[must_use]
pub const fn status_icon(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Completed => "✅",
        StepStatus::Failed => "❌",
        StepStatus::Running => "⏳",
        StepStatus::Pending => "🔲",
        StepStatus::Skipped => "⏭️",
    }
}
