//! BDD step definitions for the failover workflow.

use cutover::model::PowerState;
use cutover::store::FailoverStore;
use cutover::tracker::{JobTracker, StepStatus};
use cutover::{FailoverOrchestrator, FailoverRequest, FailoverStep};
use rstest_bdd_macros::{given, then, when};
use tokio::runtime::Runtime;

use super::test_helpers::{FailoverContext, FailoverFailure};

const TIMESTAMP: i64 = 1_700_000_000;

/// Fragments that must never reach an operator.
const TOOLING: &[&str] = &["sudo", "/opt/", "/dev/", "exit code", "inject.sh"];

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

#[given("a replicated VM ready for failover")]
fn ready_vm(failover_context: FailoverContext) -> FailoverContext {
    failover_context
}

#[given("a replicated VM that was never synced")]
fn unsynced_vm(failover_context: FailoverContext) -> FailoverContext {
    let mut context = failover_context
        .bed
        .context()
        .unwrap_or_else(|err| panic!("sample context should load: {err}"));
    context.current_change_id = None;
    failover_context
        .bed
        .store
        .save_context(&context)
        .unwrap_or_else(|err| panic!("context should save: {err}"));
    failover_context
}

#[given("the driver injection tool succeeds")]
fn injection_succeeds(failover_context: FailoverContext) -> FailoverContext {
    failover_context.bed.runner.push_success();
    failover_context
}

#[given("the driver injection tool fails")]
fn injection_fails(failover_context: FailoverContext) -> FailoverContext {
    failover_context.bed.runner.push_output(
        Some(1),
        "",
        "sudo: /opt/cutover/bin/inject.sh: virt-v2v exited with exit code 1",
    );
    failover_context
}

fn run_failover(
    mut failover_context: FailoverContext,
    request: &FailoverRequest,
) -> Result<FailoverContext, StepError> {
    let runtime = Runtime::new().map_err(|err| StepError::Assertion(err.to_string()))?;
    let services = failover_context.bed.services();
    let result =
        runtime.block_on(async { FailoverOrchestrator::new(&services).execute(request).await });
    failover_context.outcome = Some(result.map_err(FailoverFailure::from));
    Ok(failover_context)
}

#[when("I start a test failover")]
fn start_test_failover(failover_context: FailoverContext) -> Result<FailoverContext, StepError> {
    let request = FailoverRequest::test(FailoverContext::context_id(), "vm-4201", "web01")
        .timestamp(TIMESTAMP);
    run_failover(failover_context, &request)
}

#[when("I start a live failover")]
fn start_live_failover(failover_context: FailoverContext) -> Result<FailoverContext, StepError> {
    let request = FailoverRequest::live(FailoverContext::context_id(), "vm-4201", "web01")
        .timestamp(TIMESTAMP);
    run_failover(failover_context, &request)
}

#[then("the failover succeeds")]
fn failover_succeeds(failover_context: &FailoverContext) -> Result<(), StepError> {
    match &failover_context.outcome {
        Some(Ok(_)) => Ok(()),
        Some(Err(failure)) => Err(StepError::Assertion(format!(
            "expected success, got failure: {}",
            failure.message
        ))),
        None => Err(StepError::Assertion(String::from("missing outcome"))),
    }
}

#[then("the failover fails at step \"{step}\"")]
fn failover_fails_at(failover_context: &FailoverContext, step: String) -> Result<(), StepError> {
    let expected = FailoverStep::from_id(&step)
        .ok_or_else(|| StepError::Assertion(format!("unknown step: {step}")))?;
    let Some(Err(failure)) = &failover_context.outcome else {
        return Err(StepError::Assertion(String::from("expected failure outcome")));
    };
    if failure.step == Some(expected) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected failure at {expected}, got {:?}: {}",
            failure.step, failure.message
        )))
    }
}

#[then("the destination VM is running")]
fn destination_running(failover_context: &FailoverContext) -> Result<(), StepError> {
    let Some(Ok(outcome)) = &failover_context.outcome else {
        return Err(StepError::Assertion(String::from("expected success outcome")));
    };
    match failover_context.bed.platform.vm_state(&outcome.destination_vm_id) {
        Some(PowerState::On) => Ok(()),
        other => Err(StepError::Assertion(format!(
            "destination VM {} is {other:?}",
            outcome.destination_vm_id
        ))),
    }
}

#[then("every volume is attached to the destination VM")]
fn volumes_on_destination(failover_context: &FailoverContext) -> Result<(), StepError> {
    let Some(Ok(outcome)) = &failover_context.outcome else {
        return Err(StepError::Assertion(String::from("expected success outcome")));
    };
    for volume_id in FailoverContext::volume_ids() {
        let owner = failover_context.bed.daemon.attached_to(&volume_id);
        if owner.as_ref() != Some(&outcome.destination_vm_id) {
            return Err(StepError::Assertion(format!(
                "volume {volume_id} is attached to {owner:?}"
            )));
        }
    }
    Ok(())
}

#[then("every volume is attached to the hub")]
fn volumes_on_hub(failover_context: &FailoverContext) -> Result<(), StepError> {
    let hub = FailoverContext::hub();
    for volume_id in FailoverContext::volume_ids() {
        let owner = failover_context.bed.daemon.attached_to(&volume_id);
        if owner.as_ref() != Some(&hub) {
            return Err(StepError::Assertion(format!(
                "volume {volume_id} is attached to {owner:?}"
            )));
        }
    }
    Ok(())
}

#[then("no destination VM exists")]
fn no_destination(failover_context: &FailoverContext) -> Result<(), StepError> {
    let vms = failover_context.bed.platform.vm_ids();
    if vms.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!("unexpected VMs: {vms:?}")))
    }
}

#[then("the context status is \"{status}\"")]
fn context_status(failover_context: &FailoverContext, status: String) -> Result<(), StepError> {
    let context = failover_context
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

#[then("the source VM is still powered on")]
fn source_still_on(failover_context: &FailoverContext) -> Result<(), StepError> {
    let agent = &failover_context.bed.agent;
    if agent.state() == PowerState::On && agent.calls().is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "source agent saw {:?}",
            agent.calls()
        )))
    }
}

#[then("the source VM is powered off")]
fn source_off(failover_context: &FailoverContext) -> Result<(), StepError> {
    match failover_context.bed.agent.state() {
        PowerState::Off => Ok(()),
        other => Err(StepError::Assertion(format!("source VM is {other:?}"))),
    }
}

#[then("a final sync ran")]
fn final_sync_ran(failover_context: &FailoverContext) -> Result<(), StepError> {
    if failover_context.bed.replication.started() == 1 {
        Ok(())
    } else {
        Err(StepError::Assertion(String::from(
            "expected one incremental replication",
        )))
    }
}

#[then("the step \"{step}\" is recorded as skipped")]
fn step_skipped(failover_context: &FailoverContext, step: String) -> Result<(), StepError> {
    let expected = FailoverStep::from_id(&step)
        .ok_or_else(|| StepError::Assertion(format!("unknown step: {step}")))?;
    let Some(Ok(outcome)) = &failover_context.outcome else {
        return Err(StepError::Assertion(String::from("expected success outcome")));
    };
    let record = failover_context
        .bed
        .tracker
        .steps(&outcome.job_id)
        .into_iter()
        .find(|record| record.step == expected)
        .ok_or_else(|| StepError::Assertion(format!("step {step} was not journalled")))?;
    if record.status == StepStatus::Skipped {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "step {step} is {:?}",
            record.status
        )))
    }
}

#[then("the sanitized error hides the tooling details")]
fn sanitized_error(failover_context: &FailoverContext) -> Result<(), StepError> {
    let Some(Err(failure)) = &failover_context.outcome else {
        return Err(StepError::Assertion(String::from("expected failure outcome")));
    };
    let message = failure
        .user_message
        .as_deref()
        .ok_or_else(|| StepError::Assertion(String::from("missing sanitized message")))?;
    let lowered = message.to_lowercase();
    match TOOLING.iter().find(|fragment| lowered.contains(*fragment)) {
        None => Ok(()),
        Some(fragment) => Err(StepError::Assertion(format!(
            "sanitized message leaks {fragment}: {message}"
        ))),
    }
}
