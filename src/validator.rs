//! Pre-flight readiness checks.
//!
//! Each check is a [`PreflightCheck`] evaluated against a snapshot of the
//! context, its network mappings, and the source VM's power state. A failed
//! critical check blocks the failover; a failed warning check is reported
//! but does not.

use serde::Serialize;
use tracing::info;

use crate::model::{FailoverKind, NetworkMapping, PowerState, VmContext};

/// Number of change-id characters shown in the sync check message.
const CHANGE_ID_PREVIEW: usize = 20;

/// How a failed check affects readiness.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckSeverity {
    /// Failure blocks the failover.
    Critical,
    /// Failure is reported only.
    Warning,
}

/// Outcome of one check.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    /// The check passed.
    Pass,
    /// The check failed.
    Fail,
}

/// Result of evaluating one check.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct CheckResult {
    /// Check name.
    pub name: &'static str,
    /// Check severity.
    pub severity: CheckSeverity,
    /// Outcome.
    pub status: CheckStatus,
    /// Operator-facing explanation.
    pub message: String,
}

/// What the source agent said about the VM before validation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SourceObservation {
    /// The agent reported a power state.
    Reported(PowerState),
    /// The agent could not be asked.
    Unavailable(String),
}

/// Inputs shared by every check.
#[derive(Clone, Copy, Debug)]
pub struct ValidationInput<'a> {
    /// Context being failed over.
    pub context: &'a VmContext,
    /// The context's network mappings.
    pub mappings: &'a [NetworkMapping],
    /// Requested failover kind.
    pub kind: FailoverKind,
    /// Whether a live failover powers the source off first.
    pub powers_off_source: bool,
    /// Source VM power state.
    pub source: &'a SourceObservation,
}

/// One readiness check.
pub trait PreflightCheck: Send + Sync {
    /// Display name.
    fn name(&self) -> &'static str;

    /// Severity of a failure.
    fn severity(&self) -> CheckSeverity;

    /// Evaluates the check, returning the status and message.
    fn evaluate(&self, input: &ValidationInput<'_>) -> (CheckStatus, String);
}

/// Aggregated readiness result.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ValidationReport {
    /// `false` when a critical check failed.
    pub is_valid: bool,
    /// Passed checks as a percentage of all checks.
    pub readiness_score: u32,
    /// Every check result, in evaluation order.
    pub checks: Vec<CheckResult>,
    /// Messages of failed critical checks.
    pub errors: Vec<String>,
    /// Messages of failed warning checks.
    pub warnings: Vec<String>,
}

impl ValidationReport {
    /// Joins the error messages for reporting.
    #[must_use]
    pub fn error_summary(&self) -> String {
        self.errors.join("; ")
    }
}

/// Runs an ordered list of checks.
pub struct PreflightValidator {
    checks: Vec<Box<dyn PreflightCheck>>,
}

impl Default for PreflightValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl PreflightValidator {
    /// Creates a validator with the built-in checks.
    #[must_use]
    pub fn new() -> Self {
        Self {
            checks: vec![
                Box::new(VmExistence),
                Box::new(SyncStatus),
                Box::new(NetworkMappings),
                Box::new(VmState),
            ],
        }
    }

    /// Appends a check.
    #[must_use]
    pub fn with_check(mut self, check: impl PreflightCheck + 'static) -> Self {
        self.checks.push(Box::new(check));
        self
    }

    /// Evaluates every check.
    #[must_use]
    pub fn validate(&self, input: &ValidationInput<'_>) -> ValidationReport {
        let mut report = ValidationReport {
            is_valid: true,
            readiness_score: 0,
            checks: Vec::with_capacity(self.checks.len()),
            errors: Vec::new(),
            warnings: Vec::new(),
        };

        for check in &self.checks {
            let (status, message) = check.evaluate(input);
            let severity = check.severity();
            if status == CheckStatus::Fail {
                match severity {
                    CheckSeverity::Critical => {
                        report.is_valid = false;
                        report.errors.push(message.clone());
                    }
                    CheckSeverity::Warning => report.warnings.push(message.clone()),
                }
            }
            report.checks.push(CheckResult {
                name: check.name(),
                severity,
                status,
                message,
            });
        }

        let passed = report
            .checks
            .iter()
            .filter(|check| check.status == CheckStatus::Pass)
            .count();
        report.readiness_score = (passed * 100)
            .checked_div(report.checks.len())
            .and_then(|score| u32::try_from(score).ok())
            .unwrap_or(0);

        info!(
            context_id = %input.context.context_id,
            failover_type = %input.kind,
            is_valid = report.is_valid,
            errors = report.errors.len(),
            warnings = report.warnings.len(),
            readiness_score = report.readiness_score,
            "failover readiness validation completed"
        );
        report
    }
}

struct VmExistence;

impl PreflightCheck for VmExistence {
    fn name(&self) -> &'static str {
        "VM Existence"
    }

    fn severity(&self) -> CheckSeverity {
        CheckSeverity::Critical
    }

    fn evaluate(&self, input: &ValidationInput<'_>) -> (CheckStatus, String) {
        let vm_id = &input.context.vm_id;
        if vm_id.trim().is_empty() {
            return (
                CheckStatus::Fail,
                format!(
                    "context {} has no source VM identifier",
                    input.context.context_id
                ),
            );
        }
        if input.context.volumes.is_empty() {
            return (
                CheckStatus::Fail,
                format!("VM {vm_id} has no replicated volumes"),
            );
        }
        (
            CheckStatus::Pass,
            String::from("VM exists and is accessible"),
        )
    }
}

struct SyncStatus;

impl PreflightCheck for SyncStatus {
    fn name(&self) -> &'static str {
        "Sync Status"
    }

    fn severity(&self) -> CheckSeverity {
        CheckSeverity::Critical
    }

    fn evaluate(&self, input: &ValidationInput<'_>) -> (CheckStatus, String) {
        match input
            .context
            .current_change_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
        {
            Some(change_id) => {
                let preview: String = change_id.chars().take(CHANGE_ID_PREVIEW).collect();
                (
                    CheckStatus::Pass,
                    format!("VM has valid change id from successful sync: {preview}..."),
                )
            }
            None => (
                CheckStatus::Fail,
                String::from("No valid change id found - VM must be synced at least once"),
            ),
        }
    }
}

struct NetworkMappings;

impl PreflightCheck for NetworkMappings {
    fn name(&self) -> &'static str {
        "Network Mappings"
    }

    fn severity(&self) -> CheckSeverity {
        CheckSeverity::Critical
    }

    fn evaluate(&self, input: &ValidationInput<'_>) -> (CheckStatus, String) {
        let want_test = input.kind == FailoverKind::Test;
        let mut unmapped = Vec::new();
        let mut mistagged = Vec::new();

        for network in &input.context.networks {
            let mut named = input
                .mappings
                .iter()
                .filter(|mapping| &mapping.source_network_name == network)
                .peekable();
            if named.peek().is_none() {
                unmapped.push(network.as_str());
                continue;
            }
            if !named.any(|mapping| mapping.is_test_network == want_test) {
                mistagged.push(format!(
                    "network {network} not configured for {} failover",
                    input.kind
                ));
            }
        }

        if unmapped.is_empty() && mistagged.is_empty() {
            return (
                CheckStatus::Pass,
                String::from("All networks properly mapped"),
            );
        }

        let mut message = String::from("Network mapping validation failed:");
        if !unmapped.is_empty() {
            message.push_str(&format!(" unmapped networks: {}", unmapped.join(", ")));
        }
        if !mistagged.is_empty() {
            if !unmapped.is_empty() {
                message.push(';');
            }
            message.push_str(&format!(" invalid mappings: {}", mistagged.join("; ")));
        }
        (CheckStatus::Fail, message)
    }
}

struct VmState;

impl PreflightCheck for VmState {
    fn name(&self) -> &'static str {
        "VM State"
    }

    fn severity(&self) -> CheckSeverity {
        CheckSeverity::Warning
    }

    fn evaluate(&self, input: &ValidationInput<'_>) -> (CheckStatus, String) {
        match input.source {
            SourceObservation::Unavailable(reason) => (
                CheckStatus::Fail,
                format!("source VM power state unavailable: {reason}"),
            ),
            SourceObservation::Reported(PowerState::On)
                if input.kind == FailoverKind::Live && !input.powers_off_source =>
            {
                (
                    CheckStatus::Fail,
                    String::from(
                        "source VM is running and will not be powered off; writes after the last sync will be lost",
                    ),
                )
            }
            SourceObservation::Reported(state) => (
                CheckStatus::Pass,
                format!("source VM power state is {}", power_label(*state)),
            ),
        }
    }
}

const fn power_label(state: PowerState) -> &'static str {
    match state {
        PowerState::On => "on",
        PowerState::Off => "off",
        PowerState::Other => "transitioning",
    }
}
