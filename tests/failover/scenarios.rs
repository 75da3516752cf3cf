//! BDD scenarios for the failover workflow.

use rstest_bdd_macros::scenario;

use super::test_helpers::{FailoverContext, failover_context};

#[scenario(
    path = "tests/features/failover.feature",
    name = "Test failover boots an isolated copy"
)]
fn scenario_test_failover(failover_context: FailoverContext) {
    drop(failover_context);
}

#[scenario(
    path = "tests/features/failover.feature",
    name = "Live failover powers off the source and runs a final sync"
)]
fn scenario_live_failover(failover_context: FailoverContext) {
    drop(failover_context);
}

#[scenario(
    path = "tests/features/failover.feature",
    name = "Failed validation stops before any change"
)]
fn scenario_failed_validation(failover_context: FailoverContext) {
    drop(failover_context);
}

#[scenario(
    path = "tests/features/failover.feature",
    name = "Live driver injection failure does not stop the cutover"
)]
fn scenario_live_injection_failure(failover_context: FailoverContext) {
    drop(failover_context);
}

#[scenario(
    path = "tests/features/failover.feature",
    name = "Test driver injection failure is fatal"
)]
fn scenario_test_injection_failure(failover_context: FailoverContext) {
    drop(failover_context);
}
