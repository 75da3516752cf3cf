//! Source VM power control.
//!
//! Power changes go through an agent running next to the source
//! virtualization manager. Credentials are fetched from a
//! [`CredentialStore`] for every call and never logged.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{Instant, sleep};
use tracing::{info, warn};

use crate::backend::{BackendFuture, HTTP_CLIENT, endpoint, error_text};
use crate::model::{PowerState, VmId};

const AGENT_TIMEOUT: Duration = Duration::from_secs(60);
const AGENT_POWER_ON_WAIT_SECS: u64 = 180;
const AGENT_POWER_OFF_WAIT_SECS: u64 = 300;

/// Login for the source virtualization manager.
#[derive(Clone, PartialEq, Eq)]
pub struct SourceCredentials {
    host: String,
    username: String,
    password: String,
}

impl SourceCredentials {
    /// Bundles a host, user, and password.
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            password: password.into(),
        }
    }

    /// Manager host name.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Login name.
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }
}

impl fmt::Debug for SourceCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceCredentials")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Raised when credentials cannot be produced.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("source credentials unavailable: {message}")]
pub struct CredentialError {
    /// Human-readable reason.
    pub message: String,
}

/// Supplies source credentials on demand.
pub trait CredentialStore: Send + Sync {
    /// Returns the credentials for the source manager.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError`] when no usable credentials exist.
    fn source_credentials(&self) -> Result<SourceCredentials, CredentialError>;
}

/// Serves credentials resolved from configuration at start-up.
#[derive(Clone, Debug)]
pub struct ConfigCredentialStore {
    credentials: Result<SourceCredentials, CredentialError>,
}

impl ConfigCredentialStore {
    /// Wraps resolved credentials, or the reason they are missing.
    #[must_use]
    pub const fn new(credentials: Result<SourceCredentials, CredentialError>) -> Self {
        Self { credentials }
    }
}

impl CredentialStore for ConfigCredentialStore {
    fn source_credentials(&self) -> Result<SourceCredentials, CredentialError> {
        self.credentials.clone()
    }
}

/// Errors raised while changing source power state.
#[derive(Debug, Error)]
pub enum SourcePowerError {
    /// Credentials were unavailable.
    #[error(transparent)]
    Credentials(#[from] CredentialError),
    /// The agent could not be reached.
    #[error("source agent request failed: {message}")]
    Transport {
        /// Human-readable error message.
        message: String,
    },
    /// The agent rejected the request.
    #[error("source agent returned {status}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body.
        message: String,
    },
    /// The agent replied but the VM did not reach the requested state.
    #[error("source agent reported failure for VM {vm_id}: {message}")]
    Rejected {
        /// Source VM.
        vm_id: VmId,
        /// Agent message.
        message: String,
    },
    /// The VM did not reach the requested state in time.
    #[error("VM power-{action} timeout: VM still {state} after {waited_secs}s")]
    Timeout {
        /// `on` or `off`.
        action: &'static str,
        /// Last observed power state.
        state: String,
        /// Seconds waited.
        waited_secs: u64,
    },
}

/// Power operations exposed by the source agent.
pub trait SourcePowerAgent: Send + Sync {
    /// Requests power-on and returns the state the agent reports afterwards.
    fn power_on<'a>(
        &'a self,
        vm_id: &'a VmId,
        credentials: &'a SourceCredentials,
    ) -> BackendFuture<'a, PowerState, SourcePowerError>;

    /// Requests power-off and returns the state the agent reports afterwards.
    fn power_off<'a>(
        &'a self,
        vm_id: &'a VmId,
        credentials: &'a SourceCredentials,
    ) -> BackendFuture<'a, PowerState, SourcePowerError>;

    /// Reads the current power state.
    fn power_state<'a>(
        &'a self,
        vm_id: &'a VmId,
        credentials: &'a SourceCredentials,
    ) -> BackendFuture<'a, PowerState, SourcePowerError>;
}

#[derive(Serialize)]
struct PowerRequest<'a> {
    vm_id: &'a str,
    vcenter: &'a str,
    username: &'a str,
    password: &'a str,
    timeout: u64,
}

#[derive(Deserialize)]
struct PowerResponse {
    success: bool,
    #[serde(default)]
    new_state: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct PowerStateResponse {
    power_state: String,
}

/// HTTP client for the source power agent.
#[derive(Clone, Debug)]
pub struct AgentClient {
    base_url: String,
}

impl AgentClient {
    /// Creates a client for the agent at `base_url`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    async fn change_power(
        &self,
        vm_id: &VmId,
        credentials: &SourceCredentials,
        action: &str,
        wait_secs: u64,
    ) -> Result<PowerState, SourcePowerError> {
        let url = endpoint(&self.base_url, &format!("/api/v1/vm/{vm_id}/{action}"));
        let request = PowerRequest {
            vm_id,
            vcenter: &credentials.host,
            username: &credentials.username,
            password: &credentials.password,
            timeout: wait_secs,
        };
        let response = HTTP_CLIENT
            .post(&url)
            .json(&request)
            .timeout(AGENT_TIMEOUT)
            .send()
            .await
            .map_err(|err| SourcePowerError::Transport {
                message: err.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(SourcePowerError::Api {
                status: response.status().as_u16(),
                message: error_text(response).await,
            });
        }
        let body: PowerResponse =
            response
                .json()
                .await
                .map_err(|err| SourcePowerError::Transport {
                    message: err.to_string(),
                })?;
        if !body.success {
            return Err(SourcePowerError::Rejected {
                vm_id: vm_id.clone(),
                message: body.error.unwrap_or_else(|| String::from("no detail")),
            });
        }
        Ok(body
            .new_state
            .as_deref()
            .map_or(PowerState::Other, PowerState::parse))
    }
}

impl SourcePowerAgent for AgentClient {
    fn power_on<'a>(
        &'a self,
        vm_id: &'a VmId,
        credentials: &'a SourceCredentials,
    ) -> BackendFuture<'a, PowerState, SourcePowerError> {
        Box::pin(self.change_power(vm_id, credentials, "power-on", AGENT_POWER_ON_WAIT_SECS))
    }

    fn power_off<'a>(
        &'a self,
        vm_id: &'a VmId,
        credentials: &'a SourceCredentials,
    ) -> BackendFuture<'a, PowerState, SourcePowerError> {
        Box::pin(self.change_power(vm_id, credentials, "power-off", AGENT_POWER_OFF_WAIT_SECS))
    }

    fn power_state<'a>(
        &'a self,
        vm_id: &'a VmId,
        credentials: &'a SourceCredentials,
    ) -> BackendFuture<'a, PowerState, SourcePowerError> {
        Box::pin(async move {
            let url = endpoint(&self.base_url, &format!("/api/v1/vm/{vm_id}/power-state"));
            let response = HTTP_CLIENT
                .get(&url)
                .query(&[
                    ("vcenter", credentials.host.as_str()),
                    ("username", credentials.username.as_str()),
                    ("password", credentials.password.as_str()),
                ])
                .timeout(AGENT_TIMEOUT)
                .send()
                .await
                .map_err(|err| SourcePowerError::Transport {
                    message: err.to_string(),
                })?;
            if !response.status().is_success() {
                return Err(SourcePowerError::Api {
                    status: response.status().as_u16(),
                    message: error_text(response).await,
                });
            }
            let body: PowerStateResponse =
                response
                    .json()
                    .await
                    .map_err(|err| SourcePowerError::Transport {
                        message: err.to_string(),
                    })?;
            Ok(PowerState::parse(&body.power_state))
        })
    }
}

/// What a power request changed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PowerChange {
    /// The VM was already in the requested state.
    AlreadyInState,
    /// The VM was switched.
    Switched,
}

/// Drives the source agent and waits for the VM to settle.
pub struct SourcePower {
    agent: Arc<dyn SourcePowerAgent>,
    credentials: Arc<dyn CredentialStore>,
    poll_interval: Duration,
    power_on_timeout: Duration,
    power_off_timeout: Duration,
}

impl SourcePower {
    /// Creates a controller with production timings: poll every 10 s, wait
    /// up to 180 s for power-on and 300 s for power-off.
    #[must_use]
    pub fn new(agent: Arc<dyn SourcePowerAgent>, credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            agent,
            credentials,
            poll_interval: Duration::from_secs(10),
            power_on_timeout: Duration::from_secs(AGENT_POWER_ON_WAIT_SECS),
            power_off_timeout: Duration::from_secs(AGENT_POWER_OFF_WAIT_SECS),
        }
    }

    /// Overrides the polling cadence and both deadlines.
    ///
    /// This is primarily used by tests to keep timeout scenarios fast.
    #[must_use]
    pub const fn with_timings(
        mut self,
        poll_interval: Duration,
        power_on_timeout: Duration,
        power_off_timeout: Duration,
    ) -> Self {
        self.poll_interval = poll_interval;
        self.power_on_timeout = power_on_timeout;
        self.power_off_timeout = power_off_timeout;
        self
    }

    /// Powers the source VM off unless it is already off.
    ///
    /// # Errors
    ///
    /// Returns [`SourcePowerError`] when credentials are missing, the agent
    /// fails, or the VM is still running once the deadline passes.
    pub async fn power_off(&self, vm_id: &VmId) -> Result<PowerChange, SourcePowerError> {
        let credentials = self.credentials.source_credentials()?;
        if self.agent.power_state(vm_id, &credentials).await? == PowerState::Off {
            info!(vm_id = %vm_id, "source VM already powered off");
            return Ok(PowerChange::AlreadyInState);
        }
        let state = self.agent.power_off(vm_id, &credentials).await?;
        if state != PowerState::Off {
            self.wait_for(vm_id, &credentials, PowerState::Off, "off", self.power_off_timeout)
                .await?;
        }
        info!(vm_id = %vm_id, "source VM powered off");
        Ok(PowerChange::Switched)
    }

    /// Powers the source VM on when it is off.
    ///
    /// A VM in any state other than off is left alone.
    ///
    /// # Errors
    ///
    /// Returns [`SourcePowerError::Timeout`] when the VM is not running once
    /// the deadline passes, or another variant when the agent fails.
    pub async fn power_on(&self, vm_id: &VmId) -> Result<PowerChange, SourcePowerError> {
        let credentials = self.credentials.source_credentials()?;
        let current = self.agent.power_state(vm_id, &credentials).await?;
        if current != PowerState::Off {
            info!(vm_id = %vm_id, state = ?current, "source VM not powered off; leaving as is");
            return Ok(PowerChange::AlreadyInState);
        }
        let state = self.agent.power_on(vm_id, &credentials).await?;
        if state != PowerState::On {
            self.wait_for(vm_id, &credentials, PowerState::On, "on", self.power_on_timeout)
                .await?;
        }
        info!(vm_id = %vm_id, "source VM powered on");
        Ok(PowerChange::Switched)
    }

    /// Reads the source VM's current power state.
    ///
    /// # Errors
    ///
    /// Returns [`SourcePowerError`] when credentials are missing or the agent
    /// fails.
    pub async fn state(&self, vm_id: &VmId) -> Result<PowerState, SourcePowerError> {
        let credentials = self.credentials.source_credentials()?;
        self.agent.power_state(vm_id, &credentials).await
    }

    async fn wait_for(
        &self,
        vm_id: &VmId,
        credentials: &SourceCredentials,
        wanted: PowerState,
        action: &'static str,
        timeout: Duration,
    ) -> Result<(), SourcePowerError> {
        let deadline = Instant::now() + timeout;
        while Instant::now() <= deadline {
            sleep(self.poll_interval).await;
            match self.agent.power_state(vm_id, credentials).await {
                Ok(state) if state == wanted => return Ok(()),
                Ok(_) => {}
                Err(err) => warn!(vm_id = %vm_id, error = %err, "power state check failed"),
            }
        }

        let last = self.agent.power_state(vm_id, credentials).await?;
        if last == wanted {
            return Ok(());
        }
        Err(SourcePowerError::Timeout {
            action,
            state: power_label(last).to_owned(),
            waited_secs: timeout.as_secs(),
        })
    }
}

const fn power_label(state: PowerState) -> &'static str {
    match state {
        PowerState::On => "poweredOn",
        PowerState::Off => "poweredOff",
        PowerState::Other => "transitioning",
    }
}
