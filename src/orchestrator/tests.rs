//! Unit tests for the failover orchestrator.

use rstest::{fixture, rstest};

use super::*;
use crate::model::{ContextId, PowerState};
use crate::store::FailoverStore;
use crate::test_support::{CONTEXT_ID, HUB_VM, TestBed};
use crate::tracker::{JobTracker, StepStatus};

const TIMESTAMP: i64 = 1_700_000_000;

#[fixture]
fn bed() -> TestBed {
    TestBed::new()
}

fn test_request() -> FailoverRequest {
    FailoverRequest::test(CONTEXT_ID, "vm-4201", "web01").timestamp(TIMESTAMP)
}

fn live_request() -> FailoverRequest {
    FailoverRequest::live(CONTEXT_ID, "vm-4201", "web01").timestamp(TIMESTAMP)
}

fn step_status(bed: &TestBed, job_id: &JobId, step: FailoverStep) -> Option<StepStatus> {
    bed.tracker
        .steps(job_id)
        .into_iter()
        .find(|record| record.step == step)
        .map(|record| record.status)
}

fn expect_step_failure(result: Result<FailoverOutcome, FailoverError>) -> (JobId, FailoverStep, PhaseError) {
    match result {
        Err(FailoverError::StepFailed { job_id, step, source }) => (job_id, step, *source),
        other => panic!("expected a step failure, got {other:?}"),
    }
}

#[rstest]
fn plan_for_test_failover_skips_source_phases() {
    let config = test_request()
        .validate()
        .unwrap_or_else(|err| panic!("validate: {err}"));
    assert_eq!(
        FailoverOrchestrator::plan(&config),
        vec![
            FailoverStep::Validation,
            FailoverStep::VolumeModeSwitchFailover,
            FailoverStep::MultiVolumeSnapshotCreation,
            FailoverStep::VirtioDriverInjection,
            FailoverStep::VmCreation,
            FailoverStep::VolumeAttachment,
            FailoverStep::VmStartupAndValidation,
            FailoverStep::StatusUpdate,
        ]
    );
}

#[rstest]
fn plan_for_live_failover_powers_off_and_syncs_first() {
    let config = live_request()
        .validate()
        .unwrap_or_else(|err| panic!("validate: {err}"));
    let plan = FailoverOrchestrator::plan(&config);
    assert_eq!(plan.len(), 10);
    assert_eq!(
        plan.get(..3),
        Some(
            &[
                FailoverStep::Validation,
                FailoverStep::SourceVmPowerOff,
                FailoverStep::FinalSync,
            ][..]
        )
    );
}

#[rstest]
fn plan_drops_optional_phases() {
    let config = test_request()
        .skip_validation(true)
        .skip_driver_injection(true)
        .snapshot_backend(SnapshotStrategy::None)
        .validate()
        .unwrap_or_else(|err| panic!("validate: {err}"));
    let plan = FailoverOrchestrator::plan(&config);
    assert!(!plan.contains(&FailoverStep::Validation));
    assert!(!plan.contains(&FailoverStep::VirtioDriverInjection));
    assert!(!plan.contains(&FailoverStep::MultiVolumeSnapshotCreation));
    assert_eq!(plan.len(), 5);
}

#[rstest]
#[tokio::test(flavor = "current_thread")]
async fn test_failover_moves_volumes_and_starts_destination(bed: TestBed) {
    bed.runner.push_success();
    let services = bed.services();

    let outcome = FailoverOrchestrator::new(&services)
        .execute(&test_request())
        .await
        .unwrap_or_else(|err| panic!("failover: {err}"));

    let vm_id = VmId::from("dest-vm-1");
    assert_eq!(outcome.destination_vm_id, vm_id);
    assert_eq!(bed.platform.vm_state(&vm_id), Some(PowerState::On));
    assert!(bed.platform.calls().contains(&String::from("create_vm:web01-test-1700000000")));
    assert_eq!(bed.daemon.attached_to(&"vol-os".into()), Some(vm_id.clone()));
    assert_eq!(bed.daemon.attached_to(&"vol-data".into()), Some(vm_id.clone()));
    assert!(bed.daemon.calls().contains(&String::from("attach_root:vol-os:dest-vm-1")));
    assert_eq!(outcome.snapshots.len(), 2);
    assert_eq!(
        outcome.validation.map(|report| report.readiness_score),
        Some(100)
    );

    let invocations = bed.runner.invocations();
    assert_eq!(invocations.len(), 1);
    assert_eq!(
        invocations.first().map(|call| call.command_string()),
        Some(String::from(
            "sudo /opt/cutover/bin/inject.sh /dev/vdb virtio-vm-4201-1700000000"
        ))
    );

    let context = bed.context().unwrap_or_else(|err| panic!("context: {err}"));
    assert_eq!(context.status, ContextStatus::FailedOverTest);
    assert_eq!(context.destination_vm_id, Some(vm_id));
    let job = bed
        .store
        .job(&context.context_id, &outcome.job_id)
        .unwrap_or_else(|err| panic!("job: {err}"));
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.snapshots.len(), 2);
    assert!(job.completed_at.is_some());

    let progress = bed.tracker.progress(&outcome.job_id);
    assert_eq!(progress.steps_completed, progress.steps_total);
    assert_eq!(bed.tracker.job_status(&outcome.job_id), Some(JobStatus::Completed));
    let summary = context
        .last_operation_summary
        .unwrap_or_else(|| panic!("summary stored"));
    assert_eq!(summary.get("status"), Some(&serde_json::json!("completed")));
    assert_eq!(summary.get("progress"), Some(&serde_json::json!(100)));
}

#[rstest]
#[tokio::test(flavor = "current_thread")]
async fn live_failover_powers_off_source_and_runs_final_sync(bed: TestBed) {
    bed.runner.push_success();
    let services = bed.services();

    let outcome = FailoverOrchestrator::new(&services)
        .execute(&live_request())
        .await
        .unwrap_or_else(|err| panic!("failover: {err}"));

    assert_eq!(bed.agent.state(), PowerState::Off);
    assert_eq!(bed.replication.started(), 1);
    assert!(bed.platform.calls().contains(&String::from("create_vm:web01")));
    assert_eq!(bed.distributed.count("create"), 2);
    assert_eq!(bed.per_volume.count("create"), 0);
    let context = bed.context().unwrap_or_else(|err| panic!("context: {err}"));
    assert_eq!(context.status, ContextStatus::FailedOverLive);
    assert_eq!(
        step_status(&bed, &outcome.job_id, FailoverStep::FinalSync),
        Some(StepStatus::Completed)
    );
}

#[rstest]
#[tokio::test(flavor = "current_thread")]
async fn failed_validation_changes_nothing(bed: TestBed) {
    let mut context = bed.context().unwrap_or_else(|err| panic!("context: {err}"));
    context.current_change_id = None;
    bed.store
        .save_context(&context)
        .unwrap_or_else(|err| panic!("save: {err}"));
    let services = bed.services();

    let result = FailoverOrchestrator::new(&services)
        .execute(&test_request())
        .await;

    let (job_id, step, error) = expect_step_failure(result);
    assert_eq!(step, FailoverStep::Validation);
    assert!(matches!(error, PhaseError::Validation { .. }));
    assert!(error.to_string().contains("No valid change id found"));
    assert!(bed.platform.calls().is_empty());
    assert!(bed.daemon.calls().is_empty());
    assert!(bed.per_volume.calls().is_empty());
    assert_eq!(
        step_status(&bed, &job_id, FailoverStep::VmCreation),
        Some(StepStatus::Pending)
    );
    let untouched = bed.context().unwrap_or_else(|err| panic!("context: {err}"));
    assert_eq!(untouched.status, ContextStatus::ReadyForFailover);
    let job = bed
        .store
        .job(&untouched.context_id, &job_id)
        .unwrap_or_else(|err| panic!("job: {err}"));
    assert_eq!(job.status, JobStatus::Failed);
}

#[rstest]
#[tokio::test(flavor = "current_thread")]
async fn test_injection_failure_reverts_and_stops(bed: TestBed) {
    bed.runner.push_failure(1);
    let services = bed.services();

    let result = FailoverOrchestrator::new(&services)
        .execute(&test_request())
        .await;

    let (job_id, step, error) = expect_step_failure(result);
    assert_eq!(step, FailoverStep::VirtioDriverInjection);
    assert!(matches!(error, PhaseError::Injection(_)));
    assert!(bed.per_volume.calls().contains(&String::from("revert:snap-1")));
    assert_eq!(bed.platform.count("create_vm"), 0);
    for later in [
        FailoverStep::VmCreation,
        FailoverStep::VolumeAttachment,
        FailoverStep::VmStartupAndValidation,
        FailoverStep::StatusUpdate,
    ] {
        assert_eq!(step_status(&bed, &job_id, later), Some(StepStatus::Pending));
    }

    let context = bed.context().unwrap_or_else(|err| panic!("context: {err}"));
    let summary = context
        .last_operation_summary
        .unwrap_or_else(|| panic!("summary stored"));
    assert_eq!(
        summary.get("failed_step_internal"),
        Some(&serde_json::json!("virtio-driver-injection"))
    );
    let encoded = summary.to_string();
    assert!(!encoded.contains("inject.sh"));
}

#[rstest]
#[tokio::test(flavor = "current_thread")]
async fn live_injection_failure_is_recorded_and_skipped(bed: TestBed) {
    bed.runner.push_failure(1);
    let services = bed.services();

    let outcome = FailoverOrchestrator::new(&services)
        .execute(&live_request())
        .await
        .unwrap_or_else(|err| panic!("failover: {err}"));

    assert!(bed.distributed.calls().contains(&String::from("revert:snap-1")));
    assert_eq!(
        step_status(&bed, &outcome.job_id, FailoverStep::VirtioDriverInjection),
        Some(StepStatus::Skipped)
    );
    assert!(matches!(
        outcome.injection,
        Some(InjectionOutcome::Skipped { ref reason }) if reason.starts_with("driver injection failed")
    ));
    let context = bed.context().unwrap_or_else(|err| panic!("context: {err}"));
    assert_eq!(context.status, ContextStatus::FailedOverLive);
}

#[rstest]
#[tokio::test(flavor = "current_thread")]
async fn linux_guest_skips_injection(bed: TestBed) {
    bed.set_os_type("linux")
        .unwrap_or_else(|err| panic!("set os: {err}"));
    let services = bed.services();

    let outcome = FailoverOrchestrator::new(&services)
        .execute(&test_request())
        .await
        .unwrap_or_else(|err| panic!("failover: {err}"));

    assert!(bed.runner.invocations().is_empty());
    assert_eq!(
        step_status(&bed, &outcome.job_id, FailoverStep::VirtioDriverInjection),
        Some(StepStatus::Skipped)
    );
    assert!(matches!(outcome.injection, Some(InjectionOutcome::Skipped { .. })));
}

#[rstest]
#[tokio::test(flavor = "current_thread")]
async fn attach_failure_returns_volume_to_hub_and_keeps_destination(bed: TestBed) {
    bed.runner.push_success();
    bed.daemon.fail_attach_to("dest-vm-1");
    let services = bed.services();

    let result = FailoverOrchestrator::new(&services)
        .execute(&test_request())
        .await;

    let (job_id, step, error) = expect_step_failure(result);
    assert_eq!(step, FailoverStep::VolumeAttachment);
    assert!(matches!(error, PhaseError::Volume(VolumeError::AttachFailed { .. })));
    assert_eq!(bed.daemon.attached_to(&"vol-os".into()), Some(VmId::from(HUB_VM)));
    let job = bed
        .store
        .job(&ContextId::from(CONTEXT_ID), &job_id)
        .unwrap_or_else(|err| panic!("job: {err}"));
    assert_eq!(job.destination_vm_id, Some(VmId::from("dest-vm-1")));
    assert_eq!(job.status, JobStatus::Failed);
}

#[rstest]
#[tokio::test(flavor = "current_thread")]
async fn failed_live_failover_blocks_a_new_attempt_until_reversed(bed: TestBed) {
    bed.runner.push_success();
    bed.platform.fail_on("create_vm");
    let services = bed.services();
    let orchestrator = FailoverOrchestrator::new(&services);

    let (job_id, step, _) = expect_step_failure(orchestrator.execute(&live_request()).await);
    assert_eq!(step, FailoverStep::VmCreation);
    let context = bed.context().unwrap_or_else(|err| panic!("context: {err}"));
    assert_eq!(context.status, ContextStatus::FailedOverLive);
    let job = bed
        .store
        .job(&context.context_id, &job_id)
        .unwrap_or_else(|err| panic!("job: {err}"));
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.snapshots.len(), 2);

    let retry = orchestrator.execute(&live_request()).await;
    assert!(matches!(
        retry,
        Err(FailoverError::AlreadyFailedOver { status: "failed_over_live", .. })
    ));

    bed.store
        .update_context_status(&context.context_id, ContextStatus::ReadyForFailover)
        .unwrap_or_else(|err| panic!("status: {err}"));
    let blocked = orchestrator.execute(&live_request()).await;
    assert!(matches!(
        blocked,
        Err(FailoverError::PendingCleanup { job_id: ref pending, .. }) if pending == &job_id
    ));
    let jobs = bed
        .store
        .jobs(&context.context_id)
        .unwrap_or_else(|err| panic!("jobs: {err}"));
    assert_eq!(jobs.len(), 1);
}

#[rstest]
#[tokio::test(flavor = "current_thread")]
async fn unmapped_network_without_default_fails_vm_creation(bed: TestBed) {
    let mut context = bed.context().unwrap_or_else(|err| panic!("context: {err}"));
    context.networks.push(String::from("Backup LAN"));
    bed.store
        .save_context(&context)
        .unwrap_or_else(|err| panic!("save: {err}"));
    bed.runner.push_success();
    let mut services = bed.services();
    services.settings.default_network_id = None;

    let result = FailoverOrchestrator::new(&services)
        .execute(&test_request().skip_validation(true))
        .await;

    let (_, step, error) = expect_step_failure(result);
    assert_eq!(step, FailoverStep::VmCreation);
    assert!(error.to_string().contains("Backup LAN"));
    assert_eq!(bed.platform.count("create_vm"), 0);
}

#[rstest]
#[tokio::test(flavor = "current_thread")]
async fn context_already_failed_over_is_rejected(bed: TestBed) {
    bed.store
        .update_context_status(&ContextId::from(CONTEXT_ID), ContextStatus::FailedOverTest)
        .unwrap_or_else(|err| panic!("status: {err}"));
    let services = bed.services();

    let result = FailoverOrchestrator::new(&services)
        .execute(&test_request())
        .await;

    assert!(matches!(
        result,
        Err(FailoverError::AlreadyFailedOver { status: "failed_over_test", .. })
    ));
    assert!(bed.per_volume.calls().is_empty());
}

#[rstest]
#[tokio::test(flavor = "current_thread")]
async fn invalid_request_is_rejected_before_any_job(bed: TestBed) {
    let services = bed.services();
    let result = FailoverOrchestrator::new(&services)
        .execute(&test_request().power_off_source(true))
        .await;
    assert!(matches!(
        result,
        Err(FailoverError::Config(FailoverConfigError::TestPowersOffSource))
    ));
    let jobs = bed
        .store
        .jobs(&ContextId::from(CONTEXT_ID))
        .unwrap_or_else(|err| panic!("jobs: {err}"));
    assert!(jobs.is_empty());
}
