//! Offline driver injection into the boot volume.
//!
//! Windows guests need paravirtual drivers before they can boot on the
//! destination. The injection tool runs against the boot volume's device
//! while it is still attached to the hub. If the tool fails, the boot volume
//! is reverted to its protection snapshot so a half-modified disk never
//! reaches the destination.

use std::ffi::OsString;
use std::sync::Arc;

use camino::Utf8PathBuf;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::command::{CommandError, CommandRunner};
use crate::model::{SnapshotHandle, VmId};
use crate::snapshot::MultiVolumeSnapshots;

/// Guest family as far as driver injection is concerned.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GuestFamily {
    /// Needs drivers.
    Windows,
    /// Ships drivers in-kernel.
    Linux,
    /// Explicitly reported as `other`.
    Other,
    /// Missing or unrecognised label, including `otherGuest`.
    Unknown,
}

impl GuestFamily {
    /// Classifies a discovery OS label.
    #[must_use]
    pub fn classify(os_type: &str) -> Self {
        let lowered = os_type.trim().to_ascii_lowercase();
        if lowered == "other" {
            Self::Other
        } else if lowered.contains("windows") || lowered.starts_with("win") {
            Self::Windows
        } else if ["linux", "ubuntu", "debian", "rhel", "centos", "rocky", "suse", "alma"]
            .iter()
            .any(|name| lowered.contains(name))
        {
            Self::Linux
        } else {
            Self::Unknown
        }
    }

    /// Returns the reason to skip injection for this family, if any.
    #[must_use]
    pub const fn skip_reason(self) -> Option<&'static str> {
        match self {
            Self::Linux => Some("Linux guests include paravirtual drivers"),
            Self::Other => Some("guest OS does not need driver injection"),
            Self::Windows | Self::Unknown => None,
        }
    }
}

/// What an injection call did.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InjectionOutcome {
    /// The tool ran successfully.
    Completed {
        /// Tool log file.
        log_path: Utf8PathBuf,
    },
    /// Injection was not needed.
    Skipped {
        /// Why it was skipped.
        reason: String,
    },
}

/// Errors raised by driver injection.
#[derive(Debug, Error)]
pub enum InjectionError {
    /// The boot volume has no device path on the hub.
    #[error("boot volume has no device path; cannot inject drivers")]
    MissingDevice,
    /// The tool could not be started.
    #[error(transparent)]
    Spawn(#[from] CommandError),
    /// The tool failed; the boot volume was reverted.
    #[error("driver injection failed with exit code {code:?} (log: {log_path}): {stderr}")]
    Failed {
        /// Tool exit code.
        code: Option<i32>,
        /// Tool log file.
        log_path: Utf8PathBuf,
        /// Trimmed standard error.
        stderr: String,
    },
    /// The tool failed and the boot volume could not be reverted.
    #[error(
        "driver injection failed ({message}) and snapshot revert failed ({revert}): boot volume state unknown, manual intervention required"
    )]
    RevertFailed {
        /// Injection failure.
        message: String,
        /// Revert failure.
        revert: String,
    },
}

/// Inputs for one injection run.
#[derive(Clone, Copy, Debug)]
pub struct InjectionRequest<'a> {
    /// Source VM, used to name the run.
    pub vm_id: &'a VmId,
    /// Guest OS label from discovery.
    pub os_type: &'a str,
    /// Boot volume device on the hub.
    pub device_path: Option<&'a str>,
    /// Snapshot protecting the boot volume.
    pub protection: Option<&'a SnapshotHandle>,
    /// Unix timestamp used to name the run.
    pub timestamp: i64,
}

/// Runs the driver injection tool through `sudo`.
pub struct DriverInjector {
    runner: Arc<dyn CommandRunner>,
    script: Utf8PathBuf,
    log_dir: Utf8PathBuf,
}

impl DriverInjector {
    /// Creates an injector running `script` and logging under `log_dir`.
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>, script: Utf8PathBuf, log_dir: Utf8PathBuf) -> Self {
        Self {
            runner,
            script,
            log_dir,
        }
    }

    /// Log file the tool writes for `job_id`.
    #[must_use]
    pub fn log_path(&self, job_id: &str) -> Utf8PathBuf {
        self.log_dir.join(format!("virtv2v-{job_id}.log"))
    }

    /// Injects drivers when the guest needs them.
    ///
    /// # Errors
    ///
    /// Returns [`InjectionError::Failed`] when the tool fails and the boot
    /// volume was reverted, [`InjectionError::RevertFailed`] when the revert
    /// failed too, or another variant when the tool cannot run.
    pub async fn inject(
        &self,
        request: InjectionRequest<'_>,
        snapshots: &MultiVolumeSnapshots,
    ) -> Result<InjectionOutcome, InjectionError> {
        let family = GuestFamily::classify(request.os_type);
        if let Some(reason) = family.skip_reason() {
            info!(vm_id = %request.vm_id, os_type = request.os_type, "skipping driver injection");
            return Ok(InjectionOutcome::Skipped {
                reason: reason.to_owned(),
            });
        }
        if family == GuestFamily::Unknown {
            warn!(vm_id = %request.vm_id, os_type = request.os_type, "guest OS not recognised; injecting drivers anyway");
        }

        let device = request.device_path.ok_or(InjectionError::MissingDevice)?;
        let job_id = format!("virtio-{}-{}", request.vm_id, request.timestamp);
        let log_path = self.log_path(&job_id);
        let args = [
            OsString::from(self.script.as_str()),
            OsString::from(device),
            OsString::from(&job_id),
        ];

        info!(vm_id = %request.vm_id, device, log_path = %log_path, "running driver injection");
        let output = self.runner.run("sudo", &args).await?;
        if output.is_success() {
            info!(vm_id = %request.vm_id, "driver injection completed");
            return Ok(InjectionOutcome::Completed { log_path });
        }

        let failure = InjectionError::Failed {
            code: output.code,
            log_path,
            stderr: output.stderr.trim().to_owned(),
        };
        Err(Self::revert_after_failure(failure, request.protection, snapshots).await)
    }

    async fn revert_after_failure(
        failure: InjectionError,
        protection: Option<&SnapshotHandle>,
        snapshots: &MultiVolumeSnapshots,
    ) -> InjectionError {
        let Some(handle) = protection else {
            warn!(error = %failure, "driver injection failed and no snapshot protects the boot volume");
            return failure;
        };
        match snapshots.revert(handle).await {
            Ok(()) => {
                info!(snapshot_id = %handle.id, "boot volume reverted after failed injection");
                failure
            }
            Err(err) => {
                error!(
                    snapshot_id = %handle.id,
                    error = %err,
                    "boot volume revert failed after injection failure; manual intervention required"
                );
                InjectionError::RevertFailed {
                    message: failure.to_string(),
                    revert: err.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SnapshotBackendKind, VolumeId};
    use crate::test_support::{FakeSnapshots, ScriptedRunner};
    use chrono::Utc;
    use rstest::rstest;

    fn injector(runner: &ScriptedRunner) -> DriverInjector {
        DriverInjector::new(
            Arc::new(runner.clone()),
            Utf8PathBuf::from("/opt/inject.sh"),
            Utf8PathBuf::from("/var/log/cutover"),
        )
    }

    fn snapshots(fake: &FakeSnapshots) -> MultiVolumeSnapshots {
        MultiVolumeSnapshots::new(Arc::new(fake.clone()), Arc::new(fake.clone()))
    }

    fn handle(fake: &FakeSnapshots) -> SnapshotHandle {
        let handle = SnapshotHandle {
            id: String::from("snap-os"),
            name: String::from("test-failover-web01-disk-2000"),
            backend: SnapshotBackendKind::PerVolume,
            volume_id: VolumeId::from("vol-os"),
            disk_id: String::from("disk-2000"),
            created_at: Utc::now(),
        };
        fake.seed(handle.clone());
        handle
    }

    fn request<'a>(vm: &'a VmId, os: &'a str, protection: Option<&'a SnapshotHandle>) -> InjectionRequest<'a> {
        InjectionRequest {
            vm_id: vm,
            os_type: os,
            device_path: Some("/dev/vdb"),
            protection,
            timestamp: 1_700_000_000,
        }
    }

    #[rstest]
    #[case("windows", GuestFamily::Windows)]
    #[case("Microsoft Windows Server 2019", GuestFamily::Windows)]
    #[case("ubuntu64Guest", GuestFamily::Linux)]
    #[case("other", GuestFamily::Other)]
    #[case("otherGuest", GuestFamily::Unknown)]
    #[case("unknown", GuestFamily::Unknown)]
    #[case("freebsd", GuestFamily::Unknown)]
    #[case("", GuestFamily::Unknown)]
    fn classifies_guest_labels(#[case] label: &str, #[case] expected: GuestFamily) {
        assert_eq!(GuestFamily::classify(label), expected);
    }

    #[rstest]
    #[tokio::test(flavor = "current_thread")]
    async fn runs_tool_for_windows_guest() {
        let runner = ScriptedRunner::new();
        runner.push_success();
        let fake = FakeSnapshots::new(SnapshotBackendKind::PerVolume);
        let vm = VmId::from("vm-42");

        let outcome = injector(&runner)
            .inject(request(&vm, "windows", None), &snapshots(&fake))
            .await
            .unwrap_or_else(|err| panic!("inject: {err}"));

        assert_eq!(
            outcome,
            InjectionOutcome::Completed {
                log_path: Utf8PathBuf::from("/var/log/cutover/virtv2v-virtio-vm-42-1700000000.log"),
            }
        );
        let invocations = runner.invocations();
        assert_eq!(
            invocations.first().map(|call| call.command_string()),
            Some(String::from(
                "sudo /opt/inject.sh /dev/vdb virtio-vm-42-1700000000"
            ))
        );
    }

    #[rstest]
    #[tokio::test(flavor = "current_thread")]
    async fn skips_linux_guest_without_running_tool() {
        let runner = ScriptedRunner::new();
        let fake = FakeSnapshots::new(SnapshotBackendKind::PerVolume);
        let vm = VmId::from("vm-42");
        let outcome = injector(&runner)
            .inject(request(&vm, "rhel8_64Guest", None), &snapshots(&fake))
            .await
            .unwrap_or_else(|err| panic!("inject: {err}"));
        assert!(matches!(outcome, InjectionOutcome::Skipped { .. }));
        assert!(runner.invocations().is_empty());
    }

    #[rstest]
    #[case("otherGuest")]
    #[case("unknown")]
    #[case("freebsd")]
    #[tokio::test(flavor = "current_thread")]
    async fn unrecognised_guest_still_gets_drivers(#[case] os_type: &str) {
        let runner = ScriptedRunner::new();
        runner.push_success();
        let fake = FakeSnapshots::new(SnapshotBackendKind::PerVolume);
        let vm = VmId::from("vm-42");

        let outcome = injector(&runner)
            .inject(request(&vm, os_type, None), &snapshots(&fake))
            .await
            .unwrap_or_else(|err| panic!("inject: {err}"));

        assert!(matches!(outcome, InjectionOutcome::Completed { .. }));
        assert_eq!(runner.invocations().len(), 1);
    }

    #[rstest]
    #[tokio::test(flavor = "current_thread")]
    async fn explicit_other_guest_is_skipped() {
        let runner = ScriptedRunner::new();
        let fake = FakeSnapshots::new(SnapshotBackendKind::PerVolume);
        let vm = VmId::from("vm-42");

        let outcome = injector(&runner)
            .inject(request(&vm, "other", None), &snapshots(&fake))
            .await
            .unwrap_or_else(|err| panic!("inject: {err}"));

        assert!(matches!(outcome, InjectionOutcome::Skipped { .. }));
        assert!(runner.invocations().is_empty());
    }

    #[rstest]
    #[tokio::test(flavor = "current_thread")]
    async fn failure_reverts_boot_volume() {
        let runner = ScriptedRunner::new();
        runner.push_failure(3);
        let fake = FakeSnapshots::new(SnapshotBackendKind::PerVolume);
        let protection = handle(&fake);
        let vm = VmId::from("vm-42");

        let err = injector(&runner)
            .inject(request(&vm, "windows", Some(&protection)), &snapshots(&fake))
            .await
            .err()
            .unwrap_or_else(|| panic!("expected failure"));

        assert!(matches!(err, InjectionError::Failed { code: Some(3), .. }));
        assert_eq!(fake.calls(), vec![String::from("revert:snap-os")]);
    }

    #[rstest]
    #[tokio::test(flavor = "current_thread")]
    async fn failed_revert_demands_manual_intervention() {
        let runner = ScriptedRunner::new();
        runner.push_failure(1);
        let fake = FakeSnapshots::new(SnapshotBackendKind::PerVolume);
        let protection = handle(&fake);
        fake.fail_revert_for("vol-os");
        let vm = VmId::from("vm-42");

        let err = injector(&runner)
            .inject(request(&vm, "", Some(&protection)), &snapshots(&fake))
            .await
            .err()
            .unwrap_or_else(|| panic!("expected failure"));

        assert!(matches!(err, InjectionError::RevertFailed { .. }));
        assert!(err.to_string().contains("manual intervention required"));
    }
}
