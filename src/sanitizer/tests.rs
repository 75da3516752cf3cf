//! Tests for error sanitization.

use super::*;
use rstest::rstest;

const BLOCKLIST: &[&str] = &[
    "virt-v2v",
    "v2v",
    "virtio",
    "inject-virtio-drivers",
    "snapshot_client",
    "python3",
    "linstor",
    "cloudstack",
    "vma",
    "sudo",
    "/dev/",
    "/opt/",
    "/var/log",
    "exit code",
];

const PHASES: &[&str] = &[
    "virtio-driver-injection",
    "vm-creation",
    "network-mapping",
    "volume-attachment",
    "volume-detachment",
    "source-vm-power-off",
    "source-vm-power-on",
    "multi-volume-snapshot-creation",
    "multi-volume-snapshot-cleanup",
    "validation",
    "final-sync",
    "status-update",
    "made-up-step",
];

const ERRORS: &[&str] = &[
    "virt-v2v exited with exit code 1: /dev/vdb busy",
    "sudo /opt/migratekit/bin/inject-virtio-drivers.sh: virtio package missing",
    "CloudStack API error 431: network id 7f3a not found",
    "insufficient capacity in zone; service offering rejected",
    "volume daemon: volume vol-1 is attached to vm 42",
    "VMA unreachable: connection refused to 10.0.0.4",
    "python3 /opt/migratekit/linstor/snapshot_client.py rollback failed",
    "permission denied opening /var/log/migratekit/virtv2v-x.log",
    "request timeout after 30s",
    "replication not replicated: change id missing",
    "",
];

#[test]
fn user_messages_never_leak_blocklisted_tokens() {
    for phase in PHASES {
        for error in ERRORS {
            let sanitized = sanitize(phase, Some(error));
            let lowered = sanitized.user_message.to_lowercase();
            for token in BLOCKLIST {
                assert!(
                    !lowered.contains(token),
                    "{phase} leaked {token:?} for {error:?}: {}",
                    sanitized.user_message
                );
            }
            for step in &sanitized.actionable_steps {
                assert!(
                    !step.contains("/opt/") && !step.contains("/dev/"),
                    "{phase} leaked a path into remediation: {step}"
                );
            }
            assert_eq!(sanitized.technical_detail, *error);
        }
    }
}

#[test]
fn missing_error_is_success() {
    let sanitized = sanitize("vm-creation", None);
    assert_eq!(sanitized.user_message, "Operation completed successfully");
    assert_eq!(sanitized.category, Category::Success);
    assert_eq!(sanitized.severity, Severity::Info);
    assert!(sanitized.actionable_steps.is_empty());
}

#[rstest]
#[case::v2v_exit(
    "virtio-driver-injection",
    "virt-v2v failed with exit code 1",
    "Driver injection failed - VM may not be compatible with automated conversion",
    Category::Compatibility
)]
#[case::virtio_missing(
    "driver-injection",
    "virtio-win iso not found",
    "Required driver package not available on system",
    Category::Configuration
)]
#[case::quota(
    "vm-creation",
    "Quota exceeded for account",
    "Insufficient resources on destination platform",
    Category::Platform
)]
#[case::network_not_found(
    "destination-vm-creation",
    "network abc not found",
    "Network configuration error - specified network not available",
    Category::Network
)]
#[case::mapping(
    "network-mapping",
    "vm network not mapped",
    "Network mapping not configured for this VM",
    Category::Configuration
)]
#[case::already_attached(
    "volume-attachment",
    "volume is attached to another vm",
    "Storage volume is already in use",
    Category::Storage
)]
#[case::daemon(
    "volume-detachment",
    "daemon returned 500",
    "Storage management service error",
    Category::Platform
)]
#[case::detach(
    "volume-detachment",
    "detach of vol-3 rejected",
    "Storage detachment error - volume cannot be disconnected",
    Category::Storage
)]
#[case::vma(
    "source-vm-power-off",
    "VMA connection reset",
    "Cannot connect to source environment",
    Category::Connectivity
)]
#[case::snapshot_create(
    "multi-volume-snapshot-creation",
    "snapshot creation reported failure: pool full",
    "Backup snapshot creation failed",
    Category::Storage
)]
#[case::validation_state(
    "validation",
    "VM status is failed_over_test",
    "VM is not in valid state for this operation",
    Category::Configuration
)]
fn family_rules_pick_the_expected_message(
    #[case] phase: &str,
    #[case] error: &str,
    #[case] message: &str,
    #[case] category: Category,
) {
    let sanitized = sanitize(phase, Some(error));
    assert_eq!(sanitized.user_message, message);
    assert_eq!(sanitized.category, category);
}

#[rstest]
#[case("multi-volume-snapshot-cleanup", "revert of snap-1 failed", Severity::Critical)]
#[case("source-vm-power-on", "power operation refused", Severity::Warning)]
#[case("validation", "anything at all", Severity::Warning)]
#[case("vm-creation", "anything at all", Severity::Error)]
fn severities_follow_the_rule_tables(
    #[case] phase: &str,
    #[case] error: &str,
    #[case] severity: Severity,
) {
    assert_eq!(sanitize(phase, Some(error)).severity, severity);
}

#[rstest]
#[case("final-sync", "request timeout", "Final Data Synchronization failed", Category::Connectivity)]
#[case("status-update", "row not found", "Updating VM Status failed", Category::Configuration)]
#[case("some-new-step", "weird", "Operation failed", Category::Unknown)]
fn generic_messages_use_the_step_table(
    #[case] phase: &str,
    #[case] error: &str,
    #[case] message: &str,
    #[case] category: Category,
) {
    let sanitized = sanitize(phase, Some(error));
    assert_eq!(sanitized.user_message, message);
    assert_eq!(sanitized.category, category);
    assert_eq!(sanitized.severity, Severity::Error);
}

#[test]
fn suggestions_cover_every_category() {
    for category in [
        Category::Compatibility,
        Category::Network,
        Category::Storage,
        Category::Configuration,
        Category::Connectivity,
        Category::Platform,
        Category::Unknown,
    ] {
        assert!(!actionable_suggestions(category).is_empty());
    }
}

#[test]
fn serialised_message_omits_technical_detail() {
    let sanitized = sanitize("vm-creation", Some("cloudstack api 530"));
    let json = serde_json::to_value(&sanitized)
        .unwrap_or_else(|err| panic!("serialise sanitized message: {err}"));
    assert!(json.get("technical_detail").is_none());
    assert_eq!(
        json.get("category").and_then(serde_json::Value::as_str),
        Some("platform")
    );
}
