//! Operator-facing error messages.
//!
//! Raw errors from collaborators carry tool names, device paths, and vendor
//! strings. [`sanitize`] maps them to a canned message, category, severity,
//! and remediation list chosen by the failing step's family; the raw text is
//! kept only in [`SanitizedMessage::technical_detail`].

use std::fmt;

use serde::Serialize;

use crate::steps::{ErrorFamily, FailoverStep};

mod rules;

use rules::Rule;

/// Broad class of a failure.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// The VM cannot be converted automatically.
    Compatibility,
    /// Destination networking.
    Network,
    /// Volumes and snapshots.
    Storage,
    /// Missing or inconsistent settings.
    Configuration,
    /// A remote system could not be reached.
    Connectivity,
    /// The destination platform misbehaved.
    Platform,
    /// Nothing more specific is known.
    Unknown,
    /// No failure.
    Success,
}

impl Category {
    /// Stable lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Compatibility => "compatibility",
            Self::Network => "network",
            Self::Storage => "storage",
            Self::Configuration => "configuration",
            Self::Connectivity => "connectivity",
            Self::Platform => "platform",
            Self::Unknown => "unknown",
            Self::Success => "success",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How urgently an operator must act.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational.
    Info,
    /// Worth a look; the operation may still be fine.
    Warning,
    /// The operation failed.
    Error,
    /// Manual intervention is required.
    Critical,
}

impl Severity {
    /// Stable lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

/// Sanitized rendering of an error.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct SanitizedMessage {
    /// Safe, canned text for end users.
    pub user_message: String,
    /// Raw error text for operator logs only.
    #[serde(skip_serializing)]
    pub technical_detail: String,
    /// Failure class.
    pub category: Category,
    /// Urgency.
    pub severity: Severity,
    /// Remediation hints.
    pub actionable_steps: Vec<String>,
}

/// Sanitizes `error` raised by the step identified by `step_id`.
///
/// `None` yields the success message.
#[must_use]
pub fn sanitize(step_id: &str, error: Option<&str>) -> SanitizedMessage {
    let Some(raw) = error else {
        return SanitizedMessage {
            user_message: String::from("Operation completed successfully"),
            technical_detail: String::new(),
            category: Category::Success,
            severity: Severity::Info,
            actionable_steps: Vec::new(),
        };
    };

    let lowered = raw.to_lowercase();
    match family_for(step_id) {
        ErrorFamily::Driver => apply(rules::DRIVER, &lowered, raw),
        ErrorFamily::VmCreation => apply(rules::VM_CREATION, &lowered, raw),
        ErrorFamily::Network => apply(rules::NETWORK, &lowered, raw),
        ErrorFamily::Volume => apply(rules::VOLUME, &lowered, raw),
        ErrorFamily::Power => apply(rules::POWER, &lowered, raw),
        ErrorFamily::Snapshot => apply(rules::SNAPSHOT, &lowered, raw),
        ErrorFamily::Validation => apply(rules::VALIDATION, &lowered, raw),
        ErrorFamily::Generic => generic(step_id, &lowered, raw),
    }
}

/// Convenience wrapper for a typed step and any displayable error.
#[must_use]
pub fn sanitize_step(step: FailoverStep, error: &dyn fmt::Display) -> SanitizedMessage {
    sanitize(step.id(), Some(&error.to_string()))
}

/// Generic remediation hints for a category.
#[must_use]
pub fn actionable_suggestions(category: Category) -> Vec<String> {
    let steps: &[&str] = match category {
        Category::Compatibility => &[
            "Try live failover instead (no driver modification)",
            "Verify VM operating system compatibility",
            "Check VM is not corrupted",
        ],
        Category::Network => &[
            "Verify network mapping configuration",
            "Check target network is accessible",
            "Review network settings",
        ],
        Category::Storage => &[
            "Verify storage volumes are accessible",
            "Check sufficient storage space available",
            "Review storage platform health",
        ],
        Category::Platform => &[
            "Verify destination platform connectivity",
            "Check platform credentials are valid",
            "Review platform logs for details",
        ],
        Category::Connectivity => &[
            "Check network connectivity",
            "Verify source environment is accessible",
            "Try operation again",
        ],
        Category::Configuration => &[
            "Review configuration settings",
            "Verify all required fields are set",
            "Check prerequisites are met",
        ],
        Category::Unknown | Category::Success => &[
            "Try operation again",
            "Contact administrator if issue persists",
        ],
    };
    owned(steps)
}

fn family_for(step_id: &str) -> ErrorFamily {
    if let Some(step) = FailoverStep::from_id(step_id) {
        return step.info().family;
    }
    match step_id {
        "driver-injection" => ErrorFamily::Driver,
        "destination-vm-creation" => ErrorFamily::VmCreation,
        "network-configuration" | "network-mapping" => ErrorFamily::Network,
        "volume-operations" => ErrorFamily::Volume,
        "snapshot-creation" => ErrorFamily::Snapshot,
        "pre-flight-validation" => ErrorFamily::Validation,
        _ => ErrorFamily::Generic,
    }
}

fn apply(table: &[Rule], lowered: &str, raw: &str) -> SanitizedMessage {
    table
        .iter()
        .find(|rule| rule.matches(lowered))
        .map_or_else(
            || generic("", lowered, raw),
            |rule| SanitizedMessage {
                user_message: rule.message.to_owned(),
                technical_detail: raw.to_owned(),
                category: rule.category,
                severity: rule.severity,
                actionable_steps: owned(rule.steps),
            },
        )
}

fn generic(step_id: &str, lowered: &str, raw: &str) -> SanitizedMessage {
    let user_message = FailoverStep::from_id(step_id).map_or_else(
        || String::from("Operation failed"),
        |step| format!("{} failed", step.display_name()),
    );
    let (category, steps) = rules::GENERIC
        .iter()
        .find(|rule| rule.matches(lowered))
        .map_or((Category::Unknown, &[][..]), |rule| {
            (rule.category, rule.steps)
        });
    SanitizedMessage {
        user_message,
        technical_detail: raw.to_owned(),
        category,
        severity: Severity::Error,
        actionable_steps: owned(steps),
    }
}

fn owned(steps: &[&str]) -> Vec<String> {
    steps.iter().map(|step| (*step).to_owned()).collect()
}

#[cfg(test)]
mod tests;
