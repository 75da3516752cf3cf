//! Sanitized operation summaries persisted on the VM context.
//!
//! The summary outlives the process that ran the operation. It carries the
//! job's progress counters and, for failures, the sanitizer's rendering of
//! the failing step's error; raw error text is never included.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::model::{ContextId, FailoverKind, JobId};
use crate::sanitizer::{Category, Severity, sanitize};
use crate::store::FailoverStore;
use crate::tracker::JobTracker;

/// Kind of operation a summary describes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OperationType {
    /// A failover of the given kind.
    Failover(FailoverKind),
    /// Test environment teardown.
    Cleanup,
    /// Live cutover reversal.
    Rollback,
}

impl OperationType {
    /// Stable label stored in the summary.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Failover(FailoverKind::Test) => "test_failover",
            Self::Failover(FailoverKind::Live) => "live_failover",
            Self::Cleanup => "cleanup",
            Self::Rollback => "rollback",
        }
    }
}

/// Sanitized summary of the last failover, cleanup, or rollback.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct OperationSummary {
    /// Tracker job identifier.
    pub job_id: JobId,
    /// Caller correlation id.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub external_job_id: String,
    /// `test_failover`, `live_failover`, `cleanup`, or `rollback`.
    pub operation_type: &'static str,
    /// `completed` or `failed`.
    pub status: &'static str,
    /// Completed steps as a percentage of planned steps.
    pub progress: u32,
    /// When the summary was built.
    pub timestamp: DateTime<Utc>,
    /// Seconds since the first step started.
    pub duration_seconds: i64,
    /// Completed steps.
    pub steps_completed: usize,
    /// Planned steps.
    pub steps_total: usize,
    /// Display name of the failed step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
    /// Stable id of the failed step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step_internal: Option<&'static str>,
    /// Sanitized error message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Sanitized error category.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_category: Option<Category>,
    /// Sanitized error severity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_severity: Option<Severity>,
    /// Remediation hints.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub actionable_steps: Vec<String>,
}

impl OperationSummary {
    /// Builds a summary from the tracker's journal for `job_id`.
    ///
    /// `error` is the raw failure, if any; only its sanitized rendering is
    /// kept, and only when a failed step is recorded.
    #[must_use]
    pub fn from_job(
        tracker: &dyn JobTracker,
        job_id: &JobId,
        external_job_id: &str,
        operation: OperationType,
        error: Option<&str>,
    ) -> Self {
        let steps = tracker.steps(job_id);
        let progress = tracker.progress(job_id);
        let now = Utc::now();
        let started = steps.iter().filter_map(|record| record.started_at).min();

        let mut summary = Self {
            job_id: job_id.clone(),
            external_job_id: external_job_id.to_owned(),
            operation_type: operation.as_str(),
            status: if error.is_some() { "failed" } else { "completed" },
            progress: (progress.steps_completed * 100)
                .checked_div(progress.steps_total)
                .and_then(|value| u32::try_from(value).ok())
                .unwrap_or(0),
            timestamp: now,
            duration_seconds: started.map_or(0, |start| (now - start).num_seconds()),
            steps_completed: progress.steps_completed,
            steps_total: progress.steps_total,
            failed_step: None,
            failed_step_internal: None,
            error_message: None,
            error_category: None,
            error_severity: None,
            actionable_steps: Vec::new(),
        };

        if let (Some(raw), Some(step)) = (error, progress.failed_step) {
            let sanitized = sanitize(step.id(), Some(raw));
            summary.failed_step = Some(step.display_name().to_owned());
            summary.failed_step_internal = Some(step.id());
            summary.error_message = Some(sanitized.user_message);
            summary.error_category = Some(sanitized.category);
            summary.error_severity = Some(sanitized.severity);
            summary.actionable_steps = sanitized.actionable_steps;
        }
        summary
    }

    /// Stores the summary on the context.
    ///
    /// Failures are logged and otherwise ignored: a missing summary never
    /// changes the outcome of the operation it describes.
    pub fn persist(&self, store: &dyn FailoverStore, context_id: &ContextId) {
        let value = match serde_json::to_value(self) {
            Ok(value) => value,
            Err(err) => {
                warn!(context_id = %context_id, error = %err, "failed to encode operation summary");
                return;
            }
        };
        match store.save_operation_summary(context_id, value) {
            Ok(()) => info!(
                context_id = %context_id,
                operation = self.operation_type,
                status = self.status,
                "operation summary stored"
            ),
            Err(err) => {
                warn!(context_id = %context_id, error = %err, "failed to store operation summary");
            }
        }
    }
}
