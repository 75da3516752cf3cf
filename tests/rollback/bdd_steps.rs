//! BDD step definitions for cleanup and rollback.

use cutover::model::PowerState;
use cutover::store::FailoverStore;
use cutover::test_support::{CONTEXT_ID, HUB_VM};
use cutover::{
    CleanupOrchestrator, ContextId, FailoverKind, FailoverOrchestrator, FailoverRequest,
    FailoverStep, RollbackOptions, VmId, VolumeId,
};
use rstest_bdd_macros::{given, then, when};
use tokio::runtime::Runtime;

use super::test_helpers::{CleanupFailure, RollbackContext};

const TIMESTAMP: i64 = 1_700_000_000;

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

fn runtime() -> Runtime {
    Runtime::new().unwrap_or_else(|err| panic!("tokio runtime should start: {err}"))
}

fn fail_over(rollback_context: &RollbackContext, request: &FailoverRequest) -> bool {
    rollback_context.bed.runner.push_success();
    let services = rollback_context.bed.services();
    runtime()
        .block_on(async { FailoverOrchestrator::new(&services).execute(request).await })
        .is_ok()
}

#[given("a completed test failover")]
fn completed_test_failover(rollback_context: RollbackContext) -> RollbackContext {
    let request = FailoverRequest::test(CONTEXT_ID, "vm-4201", "web01").timestamp(TIMESTAMP);
    assert!(fail_over(&rollback_context, &request), "test failover should succeed");
    rollback_context
}

#[given("a completed live failover")]
fn completed_live_failover(rollback_context: RollbackContext) -> RollbackContext {
    let request = FailoverRequest::live(CONTEXT_ID, "vm-4201", "web01").timestamp(TIMESTAMP);
    assert!(fail_over(&rollback_context, &request), "live failover should succeed");
    rollback_context
}

#[given("a live failover that failed at VM creation")]
fn failed_live_failover(rollback_context: RollbackContext) -> RollbackContext {
    rollback_context.bed.platform.fail_on("create_vm");
    let request = FailoverRequest::live(CONTEXT_ID, "vm-4201", "web01").timestamp(TIMESTAMP);
    assert!(!fail_over(&rollback_context, &request), "live failover should fail");
    rollback_context
}

#[given("the volume daemon is unreachable")]
fn daemon_unreachable(rollback_context: RollbackContext) -> RollbackContext {
    rollback_context.bed.daemon.set_unreachable(true);
    rollback_context
}

fn record_cleanup(
    mut rollback_context: RollbackContext,
    options: Option<RollbackOptions>,
) -> RollbackContext {
    rollback_context.deletions_before = rollback_context.bed.platform.count("delete_vm");
    let services = rollback_context.bed.services();
    let context_id = ContextId::from(CONTEXT_ID);
    let result = runtime().block_on(async {
        let orchestrator = CleanupOrchestrator::new(&services);
        match &options {
            Some(options) => orchestrator.rollback(&context_id, options).await,
            None => orchestrator.cleanup(&context_id).await,
        }
    });
    rollback_context
        .outcomes
        .push(result.map_err(CleanupFailure::from));
    rollback_context
}

#[when("I clean up the failover")]
fn clean_up(rollback_context: RollbackContext) -> RollbackContext {
    record_cleanup(rollback_context, None)
}

#[when("I clean up the failover again")]
fn clean_up_again(rollback_context: RollbackContext) -> RollbackContext {
    record_cleanup(rollback_context, None)
}

#[when("I roll back and power the source on")]
fn roll_back_powering_on(rollback_context: RollbackContext) -> RollbackContext {
    record_cleanup(
        rollback_context,
        Some(RollbackOptions::defaults_for(FailoverKind::Live)),
    )
}

#[when("I roll back without force")]
fn roll_back_unforced(rollback_context: RollbackContext) -> RollbackContext {
    let options = RollbackOptions {
        power_on_source: false,
        ..RollbackOptions::defaults_for(FailoverKind::Live)
    };
    record_cleanup(rollback_context, Some(options))
}

#[when("I roll back with force")]
fn roll_back_forced(rollback_context: RollbackContext) -> RollbackContext {
    let options = RollbackOptions {
        power_on_source: false,
        force_cleanup: true,
        failover_type: FailoverKind::Live,
    };
    record_cleanup(rollback_context, Some(options))
}

#[when("I roll back with force and power the source on")]
fn roll_back_forced_powering_on(rollback_context: RollbackContext) -> RollbackContext {
    let options = RollbackOptions {
        force_cleanup: true,
        ..RollbackOptions::defaults_for(FailoverKind::Live)
    };
    record_cleanup(rollback_context, Some(options))
}

#[then("the cleanup succeeds")]
fn cleanup_succeeds(rollback_context: &RollbackContext) -> Result<(), StepError> {
    if rollback_context.outcomes.is_empty() {
        return Err(StepError::Assertion(String::from("missing outcome")));
    }
    match rollback_context
        .outcomes
        .iter()
        .find_map(|outcome| outcome.as_ref().err())
    {
        None => Ok(()),
        Some(failure) => Err(StepError::Assertion(format!(
            "expected success, got failure: {}",
            failure.message
        ))),
    }
}

fn failure(rollback_context: &RollbackContext) -> Result<&CleanupFailure, StepError> {
    match rollback_context.last_outcome() {
        Some(Err(failure)) => Ok(failure),
        Some(Ok(outcome)) => Err(StepError::Assertion(format!(
            "expected failure, got {outcome:?}"
        ))),
        None => Err(StepError::Assertion(String::from("missing outcome"))),
    }
}

fn parse_step(step: &str) -> Result<FailoverStep, StepError> {
    FailoverStep::from_id(step).ok_or_else(|| StepError::Assertion(format!("unknown step: {step}")))
}

#[then("the cleanup fails at step \"{step}\"")]
fn cleanup_fails_at(rollback_context: &RollbackContext, step: String) -> Result<(), StepError> {
    let expected = parse_step(&step)?;
    let failure = failure(rollback_context)?;
    if failure.aborted_at == Some(expected) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected abort at {expected}, got: {}",
            failure.message
        )))
    }
}

#[then("the first rollback stopped at step \"{step}\"")]
fn first_rollback_stopped_at(
    rollback_context: &RollbackContext,
    step: String,
) -> Result<(), StepError> {
    let expected = parse_step(&step)?;
    match rollback_context.outcomes.first() {
        Some(Err(failure)) if failure.aborted_at == Some(expected) => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected the first rollback to stop at {expected}, got {other:?}"
        ))),
    }
}

#[then("the cleanup reports failed step \"{step}\"")]
fn cleanup_reports(rollback_context: &RollbackContext, step: String) -> Result<(), StepError> {
    let expected = parse_step(&step)?;
    let failure = failure(rollback_context)?;
    if failure.aborted_at.is_none() && failure.failed_steps.contains(&expected) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {expected} among the reported failures, got: {}",
            failure.message
        )))
    }
}

#[then("every volume is attached to the hub")]
fn volumes_on_hub(rollback_context: &RollbackContext) -> Result<(), StepError> {
    let hub = VmId::from(HUB_VM);
    for volume_id in [VolumeId::from("vol-os"), VolumeId::from("vol-data")] {
        let owner = rollback_context.bed.daemon.attached_to(&volume_id);
        if owner.as_ref() != Some(&hub) {
            return Err(StepError::Assertion(format!(
                "volume {volume_id} is attached to {owner:?}"
            )));
        }
    }
    Ok(())
}

#[then("no destination VM exists")]
fn no_destination(rollback_context: &RollbackContext) -> Result<(), StepError> {
    let vms = rollback_context.bed.platform.vm_ids();
    let context = rollback_context
        .bed
        .context()
        .map_err(|err| StepError::Assertion(err.to_string()))?;
    if vms.is_empty() && context.destination_vm_id.is_none() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "unexpected VMs {vms:?}, context destination {:?}",
            context.destination_vm_id
        )))
    }
}

#[then("the context status is \"{status}\"")]
fn context_status(rollback_context: &RollbackContext, status: String) -> Result<(), StepError> {
    let context = rollback_context
        .bed
        .context()
        .map_err(|err| StepError::Assertion(err.to_string()))?;
    if context.status.as_str() == status {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected status {status}, got {}",
            context.status.as_str()
        )))
    }
}

fn tracked_snapshots(rollback_context: &RollbackContext) -> Result<usize, StepError> {
    rollback_context
        .bed
        .store
        .latest_job(&ContextId::from(CONTEXT_ID))
        .map_err(|err| StepError::Assertion(err.to_string()))?
        .map(|job| job.snapshots.len())
        .ok_or_else(|| StepError::Assertion(String::from("no failover job recorded")))
}

#[then("no protection snapshot remains")]
fn no_snapshots(rollback_context: &RollbackContext) -> Result<(), StepError> {
    let bed = &rollback_context.bed;
    let live: Vec<String> = bed
        .per_volume
        .live_ids()
        .into_iter()
        .chain(bed.distributed.live_ids())
        .collect();
    let tracked = tracked_snapshots(rollback_context)?;
    if live.is_empty() && tracked == 0 {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "snapshots left behind: {live:?}, {tracked} still tracked"
        )))
    }
}

#[then("the protection snapshots are still tracked")]
fn snapshots_tracked(rollback_context: &RollbackContext) -> Result<(), StepError> {
    let tracked = tracked_snapshots(rollback_context)?;
    let live = rollback_context.bed.distributed.live_ids().len();
    if tracked == 2 && live == 2 {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected 2 tracked and live snapshots, got {tracked} tracked and {live} live"
        )))
    }
}

#[then("every protection snapshot was reverted once")]
fn snapshots_reverted_once(rollback_context: &RollbackContext) -> Result<(), StepError> {
    let reverts = rollback_context.bed.distributed.count("revert");
    if reverts == 2 {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected 2 snapshot reverts, got {reverts}"
        )))
    }
}

#[then("the repeated cleanup deleted nothing")]
fn repeated_cleanup_idle(rollback_context: &RollbackContext) -> Result<(), StepError> {
    let Some(Ok(outcome)) = rollback_context.last_outcome() else {
        return Err(StepError::Assertion(String::from("expected a successful repeat")));
    };
    let deletions = rollback_context.bed.platform.count("delete_vm");
    if outcome.deleted_vm.is_none()
        && outcome.returned_volumes.is_empty()
        && deletions == rollback_context.deletions_before
    {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "repeat cleanup acted: {outcome:?}, {deletions} VM deletions"
        )))
    }
}

#[then("the source VM is powered on")]
fn source_on(rollback_context: &RollbackContext) -> Result<(), StepError> {
    match rollback_context.bed.agent.state() {
        PowerState::On => Ok(()),
        other => Err(StepError::Assertion(format!("source VM is {other:?}"))),
    }
}
