//! BDD scenarios for the cleanup and rollback workflow.

use rstest_bdd_macros::scenario;

use super::test_helpers::{RollbackContext, rollback_context};

#[scenario(
    path = "tests/features/rollback.feature",
    name = "Cleaning up a test failover restores the hub"
)]
fn scenario_cleanup_restores_hub(rollback_context: RollbackContext) {
    drop(rollback_context);
}

#[scenario(
    path = "tests/features/rollback.feature",
    name = "Cleanup can be repeated safely"
)]
fn scenario_repeated_cleanup(rollback_context: RollbackContext) {
    drop(rollback_context);
}

#[scenario(
    path = "tests/features/rollback.feature",
    name = "Rolling back a live failover powers the source on"
)]
fn scenario_live_rollback(rollback_context: RollbackContext) {
    drop(rollback_context);
}

#[scenario(
    path = "tests/features/rollback.feature",
    name = "Unforced rollback stops when the volume daemon is unreachable"
)]
fn scenario_unforced_rollback(rollback_context: RollbackContext) {
    drop(rollback_context);
}

#[scenario(
    path = "tests/features/rollback.feature",
    name = "Forced rollback keeps going when the volume daemon is unreachable"
)]
fn scenario_forced_rollback(rollback_context: RollbackContext) {
    drop(rollback_context);
}

#[scenario(
    path = "tests/features/rollback.feature",
    name = "Forced rollback finishes a failed live failover after an aborted attempt"
)]
fn scenario_forced_after_aborted_rollback(rollback_context: RollbackContext) {
    drop(rollback_context);
}
