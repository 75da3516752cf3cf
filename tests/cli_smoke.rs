//! Behavioural smoke tests for the CLI entrypoint.

use assert_cmd::cargo::cargo_bin_cmd;
use cutover::store::{FailoverStore, JsonStateStore};
use cutover::test_support::{CONTEXT_ID, sample_context, sample_mappings};
use cutover::ContextId;
use predicates::prelude::PredicateBooleanExt;
use predicates::str::contains;
use tempfile::TempDir;

fn isolated_cmd(home: &TempDir) -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("cutover");
    cmd.current_dir(home.path())
        .env("HOME", home.path())
        .env("XDG_CONFIG_HOME", home.path())
        .env_remove("CUTOVER_HUB_VM_ID")
        .env_remove("CUTOVER_STATE_DIR")
        .env_remove("CUTOVER_LOG");
    cmd
}

fn temp_dir() -> TempDir {
    TempDir::new().unwrap_or_else(|err| panic!("temp dir: {err}"))
}

#[test]
fn cli_without_arguments_prints_usage() {
    let mut cmd = cargo_bin_cmd!("cutover");
    cmd.assert().failure().stderr(contains("Usage"));
}

#[test]
fn explain_prints_sanitized_message_only() {
    let mut cmd = cargo_bin_cmd!("cutover");
    cmd.args([
        "explain",
        "virtio-driver-injection",
        "sudo /opt/cutover/bin/inject.sh: virt-v2v exited with exit code 1",
    ]);

    cmd.assert()
        .success()
        .stdout(contains("\"user_message\"").and(contains("/opt/cutover").not()))
        .stdout(contains("\"actionable_steps\""));
}

#[test]
fn failover_without_hub_reports_configuration_error() {
    let home = temp_dir();
    let mut cmd = isolated_cmd(&home);
    cmd.args(["test", CONTEXT_ID]);

    cmd.assert()
        .failure()
        .code(1)
        .stderr(contains("configuration error").and(contains("CUTOVER_HUB_VM_ID")));
}

#[test]
fn networks_reads_the_state_directory() {
    let home = temp_dir();
    let state_dir = home.path().join("state");
    let store = JsonStateStore::new(state_dir.to_string_lossy().into_owned());
    store
        .save_context(&sample_context())
        .unwrap_or_else(|err| panic!("save context: {err}"));
    store
        .save_network_mappings(&ContextId::from(CONTEXT_ID), &sample_mappings())
        .unwrap_or_else(|err| panic!("save mappings: {err}"));

    let mut cmd = isolated_cmd(&home);
    cmd.env("CUTOVER_HUB_VM_ID", "hub-vm")
        .env("CUTOVER_STATE_DIR", &state_dir)
        .args(["networks", CONTEXT_ID]);

    cmd.assert()
        .success()
        .stdout(contains("\"has_production\": true").and(contains("\"has_test\": true")));
}

#[test]
fn unknown_context_is_reported() {
    let home = temp_dir();
    let mut cmd = isolated_cmd(&home);
    cmd.env("CUTOVER_HUB_VM_ID", "hub-vm")
        .env("CUTOVER_STATE_DIR", home.path().join("state"))
        .args(["networks", "ctx-missing"]);

    cmd.assert()
        .failure()
        .code(1)
        .stderr(contains("context ctx-missing not found"));
}
