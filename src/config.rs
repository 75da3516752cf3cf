//! Control plane configuration loaded via `ortho-config`.

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::source::SourceCredentials;

/// Endpoints and paths the control plane talks to, merged from defaults,
/// `cutover.toml`, and `CUTOVER_*` environment variables.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "CUTOVER")]
pub struct ControlPlaneConfig {
    /// Base URL of the volume management daemon.
    #[ortho_config(default = "http://localhost:8090".to_owned())]
    pub volume_daemon_url: String,
    /// Base URL of the destination platform gateway.
    #[ortho_config(default = "http://localhost:8080".to_owned())]
    pub platform_url: String,
    /// Bearer token for the destination platform gateway.
    pub platform_api_key: Option<String>,
    /// Base URL of the source power agent.
    #[ortho_config(default = "http://localhost:9081".to_owned())]
    pub source_agent_url: String,
    /// Source virtualization manager host passed to the power agent.
    pub source_host: Option<String>,
    /// Source virtualization manager user.
    pub source_username: Option<String>,
    /// Source virtualization manager password.
    pub source_password: Option<String>,
    /// Base URL of the replication service.
    #[ortho_config(default = "http://localhost:8082".to_owned())]
    pub replication_url: String,
    /// Identifier of the hub appliance that owns volumes between cutovers.
    #[ortho_config(default = String::new())]
    pub hub_vm_id: String,
    /// Destination network used when a source network has no mapping.
    pub default_network_id: Option<String>,
    /// Directory holding the JSON state documents.
    #[ortho_config(default = "/var/lib/cutover".to_owned())]
    pub state_dir: String,
    /// Driver injection tool, run through `sudo`.
    #[ortho_config(default = "/opt/cutover/bin/inject-virtio-drivers.sh".to_owned())]
    pub injection_script: String,
    /// Directory receiving one driver injection log per run.
    #[ortho_config(default = "/var/log/cutover".to_owned())]
    pub injection_log_dir: String,
    /// Distributed block-storage snapshot client script.
    #[ortho_config(default = "/opt/cutover/bin/block_snapshot.py".to_owned())]
    pub snapshot_client: String,
    /// Storage controller URL handed to the snapshot client.
    #[ortho_config(default = "http://localhost".to_owned())]
    pub snapshot_api_url: String,
    /// Storage controller port handed to the snapshot client.
    #[ortho_config(default = 3370)]
    pub snapshot_api_port: u16,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
    section: &'static str,
}

impl FieldMetadata {
    const fn new(
        description: &'static str,
        env_var: &'static str,
        toml_key: &'static str,
        section: &'static str,
    ) -> Self {
        Self {
            description,
            env_var,
            toml_key,
            section,
        }
    }
}

impl ControlPlaneConfig {
    fn require_field(value: Option<&str>, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.is_none_or(|raw| raw.trim().is_empty()) {
            return Err(ConfigError::MissingField(format!(
                "missing {}: set {} or add {} to [{}] in cutover.toml",
                metadata.description, metadata.env_var, metadata.toml_key, metadata.section
            )));
        }
        Ok(())
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("cutover")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Checks the fields every failover and rollback needs.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] naming the first empty field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_field(
            Some(&self.volume_daemon_url),
            &FieldMetadata::new(
                "volume daemon URL",
                "CUTOVER_VOLUME_DAEMON_URL",
                "volume_daemon_url",
                "endpoints",
            ),
        )?;
        Self::require_field(
            Some(&self.platform_url),
            &FieldMetadata::new(
                "destination platform URL",
                "CUTOVER_PLATFORM_URL",
                "platform_url",
                "endpoints",
            ),
        )?;
        Self::require_field(
            Some(&self.hub_vm_id),
            &FieldMetadata::new("hub VM ID", "CUTOVER_HUB_VM_ID", "hub_vm_id", "hub"),
        )?;
        Self::require_field(
            Some(&self.state_dir),
            &FieldMetadata::new("state directory", "CUTOVER_STATE_DIR", "state_dir", "state"),
        )?;
        Ok(())
    }

    /// Builds source platform credentials from the configured values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when the host, user, or password
    /// is missing.
    pub fn source_credentials(&self) -> Result<SourceCredentials, ConfigError> {
        Self::require_field(
            self.source_host.as_deref(),
            &FieldMetadata::new("source host", "CUTOVER_SOURCE_HOST", "source_host", "source"),
        )?;
        Self::require_field(
            self.source_username.as_deref(),
            &FieldMetadata::new(
                "source username",
                "CUTOVER_SOURCE_USERNAME",
                "source_username",
                "source",
            ),
        )?;
        Self::require_field(
            self.source_password.as_deref(),
            &FieldMetadata::new(
                "source password",
                "CUTOVER_SOURCE_PASSWORD",
                "source_password",
                "source",
            ),
        )?;
        Ok(SourceCredentials::new(
            self.source_host.clone().unwrap_or_default(),
            self.source_username.clone().unwrap_or_default(),
            self.source_password.clone().unwrap_or_default(),
        ))
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
