//! Pattern tables for each error family.
//!
//! A rule matches when every group in `when` has at least one substring
//! present in the lowercased error text. An empty `when` always matches, so
//! each table ends with its family default.

use super::{Category, Severity};

pub(super) struct Rule {
    pub(super) when: &'static [&'static [&'static str]],
    pub(super) message: &'static str,
    pub(super) category: Category,
    pub(super) severity: Severity,
    pub(super) steps: &'static [&'static str],
}

impl Rule {
    pub(super) fn matches(&self, lowered: &str) -> bool {
        self.when
            .iter()
            .all(|group| group.iter().any(|needle| lowered.contains(needle)))
    }
}

const fn rule(
    when: &'static [&'static [&'static str]],
    message: &'static str,
    category: Category,
    steps: &'static [&'static str],
) -> Rule {
    Rule {
        when,
        message,
        category,
        severity: Severity::Error,
        steps,
    }
}

const fn with_severity(mut rule: Rule, severity: Severity) -> Rule {
    rule.severity = severity;
    rule
}

pub(super) static DRIVER: &[Rule] = &[
    rule(
        &[&["v2v"], &["exit code", "failed"]],
        "Driver injection failed - VM may not be compatible with automated conversion",
        Category::Compatibility,
        &[
            "Try live failover instead (no driver modification required)",
            "Verify VM is running Windows operating system",
            "Ensure VM disk is not corrupted",
            "Check VM is in a bootable state",
        ],
    ),
    rule(
        &[&["v2v"]],
        "Driver injection process error - automated tool encountered issue",
        Category::Compatibility,
        &[
            "Try live failover instead",
            "Contact support for manual driver installation",
        ],
    ),
    rule(
        &[&["virtio"], &["not found", "missing"]],
        "Required driver package not available on system",
        Category::Configuration,
        &[
            "Contact administrator - driver package needs to be installed",
            "Try live failover as a workaround",
        ],
    ),
    rule(
        &[&["virtio"]],
        "KVM driver installation failed - compatibility issue",
        Category::Compatibility,
        &[
            "Try live failover (no driver modification)",
            "Verify VM is Windows-based",
        ],
    ),
    rule(
        &[&["/dev/", "device"]],
        "Storage access error during driver preparation",
        Category::Storage,
        &[
            "Verify storage volumes are attached",
            "Check disk is not in use by another process",
            "Try operation again",
        ],
    ),
    rule(
        &[&["permission", "denied"]],
        "System permissions error during driver preparation",
        Category::Configuration,
        &["Contact administrator - system permissions need adjustment"],
    ),
    rule(
        &[],
        "Driver preparation failed - unable to inject required drivers",
        Category::Compatibility,
        &[
            "Try live failover instead (no driver modification required)",
            "Verify VM is Windows-based and accessible",
        ],
    ),
];

pub(super) static VM_CREATION: &[Rule] = &[
    rule(
        &[&["network"], &["not found"]],
        "Network configuration error - specified network not available",
        Category::Network,
        &[
            "Verify network mapping is configured",
            "Check that target network exists in destination platform",
            "Update network mapping in settings",
        ],
    ),
    rule(
        &[&["network"]],
        "Network configuration error during VM creation",
        Category::Network,
        &[
            "Review network mapping configuration",
            "Verify target network is accessible",
        ],
    ),
    rule(
        &[&["insufficient", "quota", "capacity"]],
        "Insufficient resources on destination platform",
        Category::Platform,
        &[
            "Check available CPU, memory, and storage on destination",
            "Free up resources or adjust VM specifications",
            "Contact administrator if quota limits need adjustment",
        ],
    ),
    rule(
        &[&["template", "offering"]],
        "Platform configuration error - VM template or service offering issue",
        Category::Configuration,
        &[
            "Verify platform configuration is complete",
            "Check template and service offering are available",
            "Contact administrator to review platform settings",
        ],
    ),
    rule(
        &[&["api", "cloudstack"]],
        "Platform communication error - could not create VM",
        Category::Platform,
        &[
            "Check platform connectivity",
            "Verify platform credentials are valid",
            "Try operation again",
        ],
    ),
    rule(
        &[],
        "VM creation failed on destination platform",
        Category::Platform,
        &[
            "Verify platform is accessible and properly configured",
            "Check resource availability on destination",
            "Review platform logs for additional details",
        ],
    ),
];

pub(super) static NETWORK: &[Rule] = &[
    rule(
        &[&["not found"]],
        "Network not found - target network is not available",
        Category::Network,
        &[
            "Verify network mapping is configured for this VM",
            "Check that target network exists on destination platform",
            "Update network mapping in VM settings",
        ],
    ),
    rule(
        &[&["mapping", "not mapped"]],
        "Network mapping not configured for this VM",
        Category::Configuration,
        &[
            "Configure network mapping before attempting failover",
            "Go to VM settings → Network Mapping",
            "Map each source network to a destination network",
        ],
    ),
    rule(
        &[&["network id", "networkid"]],
        "Network configuration error - cannot resolve network identifier",
        Category::Configuration,
        &[
            "Verify network mapping configuration",
            "Check that target network exists",
            "Reconfigure network mapping if needed",
        ],
    ),
    rule(
        &[],
        "Network configuration error during failover",
        Category::Network,
        &[
            "Review network mapping configuration",
            "Verify target networks are accessible",
            "Check platform network connectivity",
        ],
    ),
];

pub(super) static VOLUME: &[Rule] = &[
    rule(
        &[&["already attached", "is attached"]],
        "Storage volume is already in use",
        Category::Storage,
        &[
            "Wait for previous operation to complete",
            "Check if test VM is still running",
            "Try rollback operation to clean up",
        ],
    ),
    rule(
        &[&["not found", "does not exist"]],
        "Storage volume not found",
        Category::Storage,
        &[
            "Verify VM has completed at least one replication",
            "Check storage volumes exist on destination platform",
            "Try running a new replication job",
        ],
    ),
    rule(
        &[&["detach"]],
        "Storage detachment error - volume cannot be disconnected",
        Category::Storage,
        &[
            "Ensure VM is powered off",
            "Check volume is not locked by another process",
            "Try operation again after a few moments",
        ],
    ),
    rule(
        &[&["volume daemon", "daemon"]],
        "Storage management service error",
        Category::Platform,
        &[
            "Contact administrator - storage service may need attention",
            "Try operation again",
        ],
    ),
    rule(
        &[],
        "Storage operation failed",
        Category::Storage,
        &[
            "Verify storage volumes are accessible",
            "Check destination platform storage health",
            "Try operation again",
        ],
    ),
];

pub(super) static POWER: &[Rule] = &[
    rule(
        &[&["vma"], &["unreachable", "connection", "timeout"]],
        "Cannot connect to source environment",
        Category::Connectivity,
        &[
            "Verify source environment is online and accessible",
            "Check network connectivity between source and destination",
            "Try operation again once connectivity is restored",
        ],
    ),
    rule(
        &[&["not found", "does not exist"]],
        "Source VM not found",
        Category::Configuration,
        &[
            "Verify VM still exists in source environment",
            "Check VM has not been renamed or deleted",
            "Refresh VM discovery",
        ],
    ),
    with_severity(
        rule(
            &[&["power", "already"]],
            "VM power state change failed - VM may already be in requested state",
            Category::Platform,
            &[
                "Verify current VM power state",
                "Operation may have already succeeded",
                "Try operation again if needed",
            ],
        ),
        Severity::Warning,
    ),
    rule(
        &[&["permission", "credential"]],
        "Insufficient permissions to manage VM power state",
        Category::Configuration,
        &[
            "Verify source environment credentials are valid",
            "Check user has permissions to manage VM power",
            "Update credentials if needed",
        ],
    ),
    rule(
        &[],
        "VM power management operation failed",
        Category::Platform,
        &[
            "Verify VM is accessible",
            "Check VM is not locked or in maintenance",
            "Try operation again",
        ],
    ),
];

pub(super) static SNAPSHOT: &[Rule] = &[
    rule(
        &[&["create", "creation"]],
        "Backup snapshot creation failed",
        Category::Storage,
        &[
            "Check available storage space on destination platform",
            "Verify storage system is healthy",
            "Try operation again after freeing up space",
        ],
    ),
    rule(
        &[&["not found"]],
        "Backup snapshot not found",
        Category::Storage,
        &[
            "Snapshot may have been automatically cleaned up",
            "Try creating a new test failover",
        ],
    ),
    with_severity(
        rule(
            &[&["revert", "rollback"]],
            "Snapshot rollback failed - cannot restore to previous state",
            Category::Storage,
            &[
                "Contact administrator immediately",
                "Do not attempt further operations on this VM",
                "Manual intervention may be required",
            ],
        ),
        Severity::Critical,
    ),
    rule(
        &[],
        "Backup snapshot operation failed",
        Category::Storage,
        &[
            "Check storage system health",
            "Verify sufficient space available",
            "Try operation again",
        ],
    ),
];

pub(super) static VALIDATION: &[Rule] = &[
    with_severity(
        rule(
            &[&["replication", "not replicated"]],
            "VM is not ready for failover - replication required first",
            Category::Configuration,
            &[
                "Run a replication job before attempting failover",
                "Verify VM status is 'ready_for_failover'",
            ],
        ),
        Severity::Warning,
    ),
    with_severity(
        rule(
            &[&["network"], &["mapping"]],
            "Network mapping not configured - required for failover",
            Category::Configuration,
            &[
                "Configure network mapping before failover",
                "Go to VM settings → Network Mapping",
                "Map each source network to destination network",
            ],
        ),
        Severity::Warning,
    ),
    with_severity(
        rule(
            &[&["state", "status"]],
            "VM is not in valid state for this operation",
            Category::Configuration,
            &[
                "Check current VM status",
                "Complete any pending operations first",
                "Verify VM is in 'ready_for_failover' state",
            ],
        ),
        Severity::Warning,
    ),
    with_severity(
        rule(
            &[],
            "Pre-flight validation failed - VM not ready for operation",
            Category::Configuration,
            &[
                "Review VM configuration and status",
                "Ensure all prerequisites are met",
                "Check validation errors for specific issues",
            ],
        ),
        Severity::Warning,
    ),
];

/// Category and steps for the generic family, keyed on the error text.
pub(super) static GENERIC: &[Rule] = &[
    rule(
        &[&["timeout"]],
        "",
        Category::Connectivity,
        &[
            "Check network connectivity",
            "Try operation again",
            "Increase timeout if issue persists",
        ],
    ),
    rule(
        &[&["not found"]],
        "",
        Category::Configuration,
        &[
            "Verify required resources exist",
            "Check configuration is complete",
        ],
    ),
    rule(
        &[&["permission", "denied"]],
        "",
        Category::Configuration,
        &["Contact administrator - permissions need adjustment"],
    ),
    rule(
        &[],
        "",
        Category::Unknown,
        &[
            "Review operation details for more information",
            "Try operation again",
            "Contact administrator if issue persists",
        ],
    ),
];
