//! Unit tests for the snapshot fan-out and the block snapshot client.

use std::sync::Arc;

use rstest::{fixture, rstest};

use super::*;
use crate::model::{SnapshotSet, VolumeId};
use crate::test_support::{FakeSnapshots, ScriptedRunner, sample_context};

struct Fixture {
    per_volume: FakeSnapshots,
    distributed: FakeSnapshots,
    snapshots: MultiVolumeSnapshots,
}

#[fixture]
fn backends() -> Fixture {
    let per_volume = FakeSnapshots::new(SnapshotBackendKind::PerVolume);
    let distributed = FakeSnapshots::new(SnapshotBackendKind::DistributedBlock);
    let snapshots = MultiVolumeSnapshots::new(
        Arc::new(per_volume.clone()),
        Arc::new(distributed.clone()),
    );
    Fixture {
        per_volume,
        distributed,
        snapshots,
    }
}

fn volumes() -> Vec<VolumeReference> {
    sample_context().volumes
}

#[rstest]
#[tokio::test(flavor = "current_thread")]
async fn create_all_names_snapshots_after_disks(backends: Fixture) {
    let report = backends
        .snapshots
        .create_all(SnapshotBackendKind::PerVolume, &volumes(), "test-failover-web01-1700000000")
        .await
        .unwrap_or_else(|err| panic!("create: {err}"));

    assert_eq!(report.snapshots.len(), 2);
    assert!(report.failures.is_empty());
    assert_eq!(
        backends.per_volume.calls(),
        vec![
            String::from("create:vol-os:test-failover-web01-1700000000-disk-2000"),
            String::from("create:vol-data:test-failover-web01-1700000000-disk-2001"),
        ]
    );
    assert!(backends.distributed.calls().is_empty());
}

#[rstest]
#[tokio::test(flavor = "current_thread")]
async fn create_all_keeps_partial_results(backends: Fixture) {
    backends.distributed.fail_create_for("vol-data");

    let report = backends
        .snapshots
        .create_all(SnapshotBackendKind::DistributedBlock, &volumes(), "live")
        .await
        .unwrap_or_else(|err| panic!("create: {err}"));

    assert_eq!(report.snapshots.len(), 1);
    assert!(report.snapshots.get(&VolumeId::from("vol-os")).is_some());
    assert_eq!(report.failures.len(), 1);
    assert_eq!(
        report.failures.first().map(|failure| failure.volume_id.clone()),
        Some(VolumeId::from("vol-data"))
    );
}

#[rstest]
#[tokio::test(flavor = "current_thread")]
async fn create_all_fails_when_nothing_was_created(backends: Fixture) {
    backends.per_volume.fail_create_for("vol-os");
    backends.per_volume.fail_create_for("vol-data");

    let result = backends
        .snapshots
        .create_all(SnapshotBackendKind::PerVolume, &volumes(), "test")
        .await;

    assert!(matches!(
        result,
        Err(SnapshotError::NoneCreated { failed: 2, ref first }) if first.contains("quota")
    ));
}

#[rstest]
#[tokio::test(flavor = "current_thread")]
async fn cleanup_keeps_failed_entries_for_retry(backends: Fixture) {
    let mut set = backends
        .snapshots
        .create_all(SnapshotBackendKind::PerVolume, &volumes(), "test")
        .await
        .unwrap_or_else(|err| panic!("create: {err}"))
        .snapshots;
    backends.per_volume.fail_revert_for("vol-data");

    let report = backends.snapshots.cleanup_all(&mut set).await;

    assert!(!report.is_clean());
    assert_eq!(report.completed, vec![VolumeId::from("vol-os")]);
    assert!(report.failure_summary().contains("vol-data: snapshot backend error: volume is busy"));
    assert_eq!(set.len(), 1);
    assert!(set.get(&VolumeId::from("vol-data")).is_some());
    assert_eq!(backends.per_volume.live_ids(), vec![String::from("snap-2")]);
}

#[rstest]
#[tokio::test(flavor = "current_thread")]
async fn second_cleanup_makes_no_calls(backends: Fixture) {
    let mut set = backends
        .snapshots
        .create_all(SnapshotBackendKind::DistributedBlock, &volumes(), "live")
        .await
        .unwrap_or_else(|err| panic!("create: {err}"))
        .snapshots;
    let first = backends.snapshots.cleanup_all(&mut set).await;
    assert!(first.is_clean());
    assert!(set.is_empty());
    let calls = backends.distributed.calls().len();

    let second = backends.snapshots.cleanup_all(&mut set).await;

    assert!(second.is_clean());
    assert!(second.completed.is_empty());
    assert_eq!(backends.distributed.calls().len(), calls);
}

#[rstest]
#[tokio::test(flavor = "current_thread")]
async fn missing_snapshot_counts_as_cleaned(backends: Fixture) {
    let mut set: SnapshotSet = backends
        .snapshots
        .create_all(SnapshotBackendKind::PerVolume, &volumes(), "test")
        .await
        .unwrap_or_else(|err| panic!("create: {err}"))
        .snapshots;
    backends.per_volume.forget("snap-1");

    let report = backends.snapshots.cleanup_all(&mut set).await;

    assert!(report.is_clean());
    assert!(set.is_empty());
    assert_eq!(backends.per_volume.count("delete"), 1);
}

fn block_cli(runner: &ScriptedRunner) -> BlockSnapshotCli {
    BlockSnapshotCli::new(
        Arc::new(runner.clone()),
        BlockSnapshotSettings {
            client: String::from("/opt/cutover/bin/rbd-client.py"),
            api_url: String::from("http://storage.local"),
            api_port: 8900,
        },
    )
}

fn os_volume() -> VolumeReference {
    sample_context()
        .os_volume()
        .cloned()
        .unwrap_or_else(|| panic!("sample context has an OS volume"))
}

#[rstest]
#[tokio::test(flavor = "current_thread")]
async fn block_cli_reads_snapshot_id_from_metadata() {
    let runner = ScriptedRunner::new();
    runner.push_output(
        Some(0),
        r#"{"success": true, "metadata": {"snapshot_id": "rbd-snap-9"}}"#,
        "",
    );

    let handle = block_cli(&runner)
        .create(&os_volume(), "live-web01-disk-2000")
        .await
        .unwrap_or_else(|err| panic!("create: {err}"));

    assert_eq!(handle.id, "rbd-snap-9");
    assert_eq!(handle.backend, SnapshotBackendKind::DistributedBlock);
    assert_eq!(
        runner.invocations().first().map(|call| call.command_string()),
        Some(String::from(
            "python3 /opt/cutover/bin/rbd-client.py create vol-os live-web01-disk-2000 --api-url http://storage.local --api-port 8900"
        ))
    );
}

#[rstest]
#[tokio::test(flavor = "current_thread")]
async fn block_cli_maps_reported_failures() {
    let runner = ScriptedRunner::new();
    runner.push_output(
        Some(1),
        r#"{"success": false, "error": "pool is read-only"}"#,
        "",
    );
    runner.push_output(
        Some(1),
        r#"{"success": false, "error": "snapshot not found"}"#,
        "",
    );
    runner.push_output(Some(2), "Traceback (most recent call last)", "ImportError: rados");
    let cli = block_cli(&runner);
    let volume = os_volume();

    let failed = cli.create(&volume, "live").await;
    assert!(matches!(
        failed,
        Err(SnapshotError::Reported { action: "creation", ref message }) if message == "pool is read-only"
    ));

    let handle = SnapshotHandle {
        id: String::from("rbd-snap-9"),
        name: String::from("live-web01-disk-2000"),
        backend: SnapshotBackendKind::DistributedBlock,
        volume_id: volume.volume_id.clone(),
        disk_id: volume.disk_id.clone(),
        created_at: chrono::Utc::now(),
    };
    let missing = cli.revert(&handle).await;
    assert!(missing.as_ref().is_err_and(SnapshotError::is_not_found));

    let garbled = cli.delete(&handle).await;
    assert!(matches!(
        garbled,
        Err(SnapshotError::Reported { action: "deletion", ref message }) if message == "ImportError: rados"
    ));
}
