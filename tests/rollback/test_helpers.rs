//! Shared fixtures for rollback BDD scenarios.

use cutover::test_support::TestBed;
use cutover::{CleanupError, CleanupOutcome, FailoverStep};
use rstest::fixture;

/// Failure details captured from a failed cleanup.
#[derive(Clone, Debug)]
pub struct CleanupFailure {
    /// Step that stopped an unforced run.
    pub aborted_at: Option<FailoverStep>,
    /// Steps reported by a forced run.
    pub failed_steps: Vec<FailoverStep>,
    /// Rendered error.
    pub message: String,
}

impl From<CleanupError> for CleanupFailure {
    fn from(err: CleanupError) -> Self {
        let (aborted_at, failed_steps) = match &err {
            CleanupError::Step { step, .. } => (Some(*step), Vec::new()),
            CleanupError::Incomplete { failures, .. } => (
                None,
                failures.iter().map(|failure| failure.step).collect(),
            ),
            CleanupError::SourcePowerOn { .. } => (Some(FailoverStep::SourceVmPowerOn), Vec::new()),
            CleanupError::Store(_) => (None, Vec::new()),
        };
        Self {
            aborted_at,
            failed_steps,
            message: err.to_string(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RollbackContext {
    pub bed: TestBed,
    pub outcomes: Vec<Result<CleanupOutcome, CleanupFailure>>,
    /// Platform deletions seen before the latest cleanup started.
    pub deletions_before: usize,
}

#[fixture]
pub fn rollback_context() -> RollbackContext {
    RollbackContext {
        bed: TestBed::new(),
        outcomes: Vec::new(),
        deletions_before: 0,
    }
}

impl RollbackContext {
    pub fn last_outcome(&self) -> Option<&Result<CleanupOutcome, CleanupFailure>> {
        self.outcomes.last()
    }
}
