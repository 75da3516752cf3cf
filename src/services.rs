//! Collaborators handed to the orchestrators.
//!
//! [`Services`] replaces process-wide singletons: every external system is
//! an `Arc<dyn _>` field, so tests swap in fakes and production wires the
//! HTTP and process adapters through [`Services::connect`].

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;

use crate::command::{CommandRunner, ProcessCommandRunner};
use crate::config::{ConfigError, ControlPlaneConfig};
use crate::injection::DriverInjector;
use crate::lifecycle::{ComputePlatform, GatewayPlatform, VmLifecycle};
use crate::model::VmId;
use crate::replication::{FinalSync, ReplicationClient, ReplicationService};
use crate::snapshot::{
    BlockSnapshotCli, BlockSnapshotSettings, GatewaySnapshots, MultiVolumeSnapshots, SnapshotBackend,
};
use crate::source::{
    AgentClient, ConfigCredentialStore, CredentialError, CredentialStore, SourcePower,
    SourcePowerAgent,
};
use crate::store::{FailoverStore, JsonStateStore};
use crate::tracker::{JobTracker, MemoryTracker};
use crate::volume::{DaemonClient, VolumeDaemon, VolumeOperations};

/// Polling cadences and deadlines for every wait loop.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Timings {
    /// Volume daemon operation polling interval.
    pub volume_poll: Duration,
    /// Attach deadline.
    pub volume_attach_timeout: Duration,
    /// Detach deadline.
    pub volume_detach_timeout: Duration,
    /// Destination VM power polling interval.
    pub vm_poll: Duration,
    /// Destination VM start-up deadline.
    pub vm_start_timeout: Duration,
    /// Destination VM shutdown deadline.
    pub vm_stop_timeout: Duration,
    /// Source VM power polling interval.
    pub source_poll: Duration,
    /// Source VM power-on deadline.
    pub source_power_on_timeout: Duration,
    /// Source VM power-off deadline.
    pub source_power_off_timeout: Duration,
    /// Final sync polling interval.
    pub sync_poll: Duration,
    /// Final sync deadline.
    pub sync_timeout: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            volume_poll: Duration::from_secs(2),
            volume_attach_timeout: Duration::from_secs(300),
            volume_detach_timeout: Duration::from_secs(180),
            vm_poll: Duration::from_secs(5),
            vm_start_timeout: Duration::from_secs(300),
            vm_stop_timeout: Duration::from_secs(300),
            source_poll: Duration::from_secs(10),
            source_power_on_timeout: Duration::from_secs(180),
            source_power_off_timeout: Duration::from_secs(300),
            sync_poll: Duration::from_secs(2),
            sync_timeout: Duration::from_secs(30 * 60),
        }
    }
}

impl Timings {
    /// Millisecond timings for tests.
    #[must_use]
    pub const fn immediate() -> Self {
        let poll = Duration::from_millis(1);
        let timeout = Duration::from_millis(50);
        Self {
            volume_poll: poll,
            volume_attach_timeout: timeout,
            volume_detach_timeout: timeout,
            vm_poll: poll,
            vm_start_timeout: timeout,
            vm_stop_timeout: timeout,
            source_poll: poll,
            source_power_on_timeout: timeout,
            source_power_off_timeout: timeout,
            sync_poll: poll,
            sync_timeout: timeout,
        }
    }
}

/// Deployment settings the orchestrators read.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Settings {
    /// Hub appliance owning volumes between cutovers.
    pub hub_vm_id: VmId,
    /// Fallback destination network.
    pub default_network_id: Option<String>,
    /// Driver injection tool.
    pub injection_script: Utf8PathBuf,
    /// Driver injection log directory.
    pub injection_log_dir: Utf8PathBuf,
    /// Wait loop timings.
    pub timings: Timings,
}

/// External systems used by the failover and cleanup orchestrators.
#[derive(Clone)]
pub struct Services {
    /// Persisted contexts, mappings, and jobs.
    pub store: Arc<dyn FailoverStore>,
    /// Job and step journal.
    pub tracker: Arc<dyn JobTracker>,
    /// Destination platform.
    pub platform: Arc<dyn ComputePlatform>,
    /// Volume management daemon.
    pub volume_daemon: Arc<dyn VolumeDaemon>,
    /// Per-volume snapshot backend.
    pub per_volume_snapshots: Arc<dyn SnapshotBackend>,
    /// Distributed block-storage snapshot backend.
    pub distributed_snapshots: Arc<dyn SnapshotBackend>,
    /// External command execution.
    pub commands: Arc<dyn CommandRunner>,
    /// Source power agent.
    pub source_agent: Arc<dyn SourcePowerAgent>,
    /// Source credentials.
    pub credentials: Arc<dyn CredentialStore>,
    /// Replication service.
    pub replication: Arc<dyn ReplicationService>,
    /// Deployment settings.
    pub settings: Settings,
}

impl Services {
    /// Wires the production adapters described by `config`.
    ///
    /// Source credentials are resolved lazily: a configuration without them
    /// still supports test failovers, and power operations report the
    /// missing field when attempted.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a required field is missing.
    pub fn connect(config: &ControlPlaneConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let gateway = GatewayPlatform::new(&config.platform_url, config.platform_api_key.clone());
        let commands: Arc<dyn CommandRunner> = Arc::new(ProcessCommandRunner);
        let credentials = config
            .source_credentials()
            .map_err(|err| CredentialError {
                message: err.to_string(),
            });

        Ok(Self {
            store: Arc::new(JsonStateStore::new(config.state_dir.as_str())),
            tracker: Arc::new(MemoryTracker::new()),
            platform: Arc::new(gateway.clone()),
            volume_daemon: Arc::new(DaemonClient::new(&config.volume_daemon_url)),
            per_volume_snapshots: Arc::new(GatewaySnapshots::new(gateway)),
            distributed_snapshots: Arc::new(BlockSnapshotCli::new(
                Arc::clone(&commands),
                BlockSnapshotSettings {
                    client: config.snapshot_client.clone(),
                    api_url: config.snapshot_api_url.clone(),
                    api_port: config.snapshot_api_port,
                },
            )),
            commands,
            source_agent: Arc::new(AgentClient::new(&config.source_agent_url)),
            credentials: Arc::new(ConfigCredentialStore::new(credentials)),
            replication: Arc::new(ReplicationClient::new(&config.replication_url)),
            settings: Settings {
                hub_vm_id: VmId::from(config.hub_vm_id.as_str()),
                default_network_id: config.default_network_id.clone(),
                injection_script: Utf8PathBuf::from(&config.injection_script),
                injection_log_dir: Utf8PathBuf::from(&config.injection_log_dir),
                timings: Timings::default(),
            },
        })
    }

    /// Destination VM lifecycle driver.
    #[must_use]
    pub fn lifecycle(&self) -> VmLifecycle {
        let timings = &self.settings.timings;
        VmLifecycle::new(Arc::clone(&self.platform)).with_timings(
            timings.vm_poll,
            timings.vm_start_timeout,
            timings.vm_stop_timeout,
        )
    }

    /// Volume move engine.
    #[must_use]
    pub fn volumes(&self) -> VolumeOperations {
        let timings = &self.settings.timings;
        VolumeOperations::new(
            Arc::clone(&self.volume_daemon),
            Arc::clone(&self.store),
            self.settings.hub_vm_id.clone(),
        )
        .with_timings(
            timings.volume_poll,
            timings.volume_attach_timeout,
            timings.volume_detach_timeout,
        )
    }

    /// Snapshot fan-out over both backends.
    #[must_use]
    pub fn snapshots(&self) -> MultiVolumeSnapshots {
        MultiVolumeSnapshots::new(
            Arc::clone(&self.per_volume_snapshots),
            Arc::clone(&self.distributed_snapshots),
        )
    }

    /// Source power controller.
    #[must_use]
    pub fn source_power(&self) -> SourcePower {
        let timings = &self.settings.timings;
        SourcePower::new(Arc::clone(&self.source_agent), Arc::clone(&self.credentials))
            .with_timings(
                timings.source_poll,
                timings.source_power_on_timeout,
                timings.source_power_off_timeout,
            )
    }

    /// Final sync runner.
    #[must_use]
    pub fn final_sync(&self) -> FinalSync {
        let timings = &self.settings.timings;
        FinalSync::new(Arc::clone(&self.replication))
            .with_timings(timings.sync_poll, timings.sync_timeout)
    }

    /// Driver injector.
    #[must_use]
    pub fn injector(&self) -> DriverInjector {
        DriverInjector::new(
            Arc::clone(&self.commands),
            self.settings.injection_script.clone(),
            self.settings.injection_log_dir.clone(),
        )
    }
}
