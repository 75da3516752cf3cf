//! Shared fixtures for failover BDD scenarios.

use cutover::test_support::{CONTEXT_ID, HUB_VM, TestBed};
use cutover::{FailoverError, FailoverOutcome, FailoverStep, JobId, VmId, VolumeId};
use rstest::fixture;

/// Failure details captured from a failed run.
#[derive(Clone, Debug)]
pub struct FailoverFailure {
    pub job_id: Option<JobId>,
    pub step: Option<FailoverStep>,
    pub message: String,
    pub user_message: Option<String>,
}

impl From<FailoverError> for FailoverFailure {
    fn from(err: FailoverError) -> Self {
        let user_message = err.sanitized().map(|message| message.user_message);
        let (job_id, step) = match &err {
            FailoverError::StepFailed { job_id, step, .. } => (Some(job_id.clone()), Some(*step)),
            _ => (None, None),
        };
        Self {
            job_id,
            step,
            message: err.to_string(),
            user_message,
        }
    }
}

#[derive(Clone, Debug)]
pub struct FailoverContext {
    pub bed: TestBed,
    pub outcome: Option<Result<FailoverOutcome, FailoverFailure>>,
}

#[fixture]
pub fn failover_context() -> FailoverContext {
    FailoverContext {
        bed: TestBed::new(),
        outcome: None,
    }
}

impl FailoverContext {
    pub fn volume_ids() -> [VolumeId; 2] {
        [VolumeId::from("vol-os"), VolumeId::from("vol-data")]
    }

    pub fn hub() -> VmId {
        VmId::from(HUB_VM)
    }

    pub const fn context_id() -> &'static str {
        CONTEXT_ID
    }
}
