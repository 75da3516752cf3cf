//! Final incremental sync before a live cutover.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{Instant, sleep};
use tracing::{debug, info};

use crate::backend::{BackendFuture, HTTP_CLIENT, endpoint, error_text};
use crate::model::{ContextId, VmId};

/// Progress of a replication job.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ReplicationStatus {
    /// Still copying.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed {
        /// Reported reason.
        message: String,
    },
}

/// Errors raised by the replication service or while waiting on it.
#[derive(Debug, Error)]
pub enum ReplicationError {
    /// The service could not be reached.
    #[error("replication service request failed: {message}")]
    Transport {
        /// Human-readable error message.
        message: String,
    },
    /// The service rejected the request.
    #[error("replication service returned {status}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body.
        message: String,
    },
    /// The sync finished with an error.
    #[error("final sync {job_id} failed: {message}")]
    SyncFailed {
        /// Replication job.
        job_id: String,
        /// Reported reason.
        message: String,
    },
    /// The sync did not finish in time.
    #[error("final sync {job_id} did not complete within {waited_secs}s")]
    Timeout {
        /// Replication job.
        job_id: String,
        /// Seconds waited.
        waited_secs: u64,
    },
}

/// Operations exposed by the replication service.
pub trait ReplicationService: Send + Sync {
    /// Starts an incremental sync and returns its job identifier.
    fn start_incremental<'a>(
        &'a self,
        context_id: &'a ContextId,
        vm_id: &'a VmId,
    ) -> BackendFuture<'a, String, ReplicationError>;

    /// Reads the status of a sync job.
    fn status<'a>(&'a self, job_id: &'a str) -> BackendFuture<'a, ReplicationStatus, ReplicationError>;
}

#[derive(Serialize)]
struct StartRequest<'a> {
    context_id: &'a str,
    vm_id: &'a str,
    replication_type: &'static str,
}

#[derive(Deserialize)]
struct StartResponse {
    job_id: String,
}

#[derive(Deserialize)]
struct StatusResponse {
    status: String,
    #[serde(default)]
    error: Option<String>,
}

/// HTTP client for the replication service.
#[derive(Clone, Debug)]
pub struct ReplicationClient {
    base_url: String,
}

impl ReplicationClient {
    /// Creates a client for the service at `base_url`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

fn transport(err: &reqwest::Error) -> ReplicationError {
    ReplicationError::Transport {
        message: err.to_string(),
    }
}

impl ReplicationService for ReplicationClient {
    fn start_incremental<'a>(
        &'a self,
        context_id: &'a ContextId,
        vm_id: &'a VmId,
    ) -> BackendFuture<'a, String, ReplicationError> {
        Box::pin(async move {
            let url = endpoint(&self.base_url, "/api/v1/replications");
            let response = HTTP_CLIENT
                .post(&url)
                .json(&StartRequest {
                    context_id,
                    vm_id,
                    replication_type: "incremental",
                })
                .send()
                .await
                .map_err(|err| transport(&err))?;
            if !response.status().is_success() {
                return Err(ReplicationError::Api {
                    status: response.status().as_u16(),
                    message: error_text(response).await,
                });
            }
            let body: StartResponse = response.json().await.map_err(|err| transport(&err))?;
            Ok(body.job_id)
        })
    }

    fn status<'a>(&'a self, job_id: &'a str) -> BackendFuture<'a, ReplicationStatus, ReplicationError> {
        Box::pin(async move {
            let url = endpoint(&self.base_url, &format!("/api/v1/replications/{job_id}"));
            let response = HTTP_CLIENT
                .get(&url)
                .send()
                .await
                .map_err(|err| transport(&err))?;
            if !response.status().is_success() {
                return Err(ReplicationError::Api {
                    status: response.status().as_u16(),
                    message: error_text(response).await,
                });
            }
            let body: StatusResponse = response.json().await.map_err(|err| transport(&err))?;
            Ok(match body.status.as_str() {
                "completed" => ReplicationStatus::Completed,
                "failed" | "cancelled" => ReplicationStatus::Failed {
                    message: body.error.unwrap_or(body.status),
                },
                _ => ReplicationStatus::Running,
            })
        })
    }
}

/// Runs a final sync and waits for it to finish.
pub struct FinalSync {
    service: Arc<dyn ReplicationService>,
    poll_interval: Duration,
    timeout: Duration,
}

impl FinalSync {
    /// Creates a runner that polls every 2 s for up to 30 minutes.
    #[must_use]
    pub fn new(service: Arc<dyn ReplicationService>) -> Self {
        Self {
            service,
            poll_interval: Duration::from_secs(2),
            timeout: Duration::from_secs(30 * 60),
        }
    }

    /// Overrides the polling cadence and deadline.
    ///
    /// This is primarily used by tests to keep timeout scenarios fast.
    #[must_use]
    pub const fn with_timings(mut self, poll_interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.timeout = timeout;
        self
    }

    /// Starts an incremental sync of `vm_id` and waits for completion.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicationError`] when the sync cannot start, fails, or
    /// outlives the deadline.
    pub async fn run(&self, context_id: &ContextId, vm_id: &VmId) -> Result<String, ReplicationError> {
        let job_id = self.service.start_incremental(context_id, vm_id).await?;
        info!(context_id = %context_id, job_id = %job_id, "final sync started");

        let deadline = Instant::now() + self.timeout;
        while Instant::now() <= deadline {
            match self.service.status(&job_id).await {
                Ok(ReplicationStatus::Completed) => {
                    info!(job_id = %job_id, "final sync completed");
                    return Ok(job_id);
                }
                Ok(ReplicationStatus::Failed { message }) => {
                    return Err(ReplicationError::SyncFailed { job_id, message });
                }
                Ok(ReplicationStatus::Running) => {}
                Err(err) => debug!(job_id = %job_id, error = %err, "sync status check failed"),
            }
            sleep(self.poll_interval).await;
        }

        Err(ReplicationError::Timeout {
            job_id,
            waited_secs: self.timeout.as_secs(),
        })
    }
}
