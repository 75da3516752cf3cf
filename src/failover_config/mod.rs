//! Failover request resolution.
//!
//! Callers describe a run with a flat [`FailoverRequest`], usually built from
//! [`FailoverRequest::live`] or [`FailoverRequest::test`] and a handful of
//! overrides. [`FailoverRequest::validate`] turns it into a
//! [`FailoverConfig`] whose [`FailoverType`] can only express the options
//! that are legal for its kind, so the orchestrators never re-check
//! cross-field rules.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{ContextId, FailoverKind, VmId};

/// How the destination VM is named.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VmNaming {
    /// Reuse the source VM name.
    Exact,
    /// Append `-test-{timestamp}`.
    Suffixed,
}

/// Which class of destination networks the VM is connected to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkStrategy {
    /// Production-tagged mappings.
    Production,
    /// Test-tagged, isolated mappings.
    Isolated,
    /// Mappings chosen per network, still filtered by the failover's tag.
    Custom,
}

/// Snapshot technology protecting the run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStrategy {
    /// Per-volume platform snapshots.
    PerVolume,
    /// Distributed block-storage snapshots.
    DistributedBlock,
    /// No protection snapshot.
    None,
}

/// Flat, serialisable failover request as received from callers.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct FailoverRequest {
    /// Context to fail over.
    pub context_id: ContextId,
    /// Source VM identifier.
    pub vm_id: VmId,
    /// Source VM name.
    pub vm_name: String,
    /// Requested kind.
    pub failover_type: FailoverKind,
    /// Destination naming rule.
    pub vm_naming: VmNaming,
    /// Snapshot technology.
    pub snapshot_backend: SnapshotStrategy,
    /// Network selection.
    pub network_strategy: NetworkStrategy,
    /// Power the source VM off first.
    pub power_off_source: bool,
    /// Run a last incremental sync first.
    pub perform_final_sync: bool,
    /// Allow cleanup to reverse the run.
    pub cleanup_enabled: bool,
    /// Skip pre-flight validation.
    pub skip_validation: bool,
    /// Skip driver injection.
    pub skip_driver_injection: bool,
    /// Unix timestamp used to derive names.
    pub timestamp: i64,
}

impl FailoverRequest {
    /// Request with the defaults of a production cutover.
    pub fn live(context_id: impl Into<ContextId>, vm_id: impl Into<VmId>, vm_name: &str) -> Self {
        Self {
            context_id: context_id.into(),
            vm_id: vm_id.into(),
            vm_name: vm_name.to_owned(),
            failover_type: FailoverKind::Live,
            vm_naming: VmNaming::Exact,
            snapshot_backend: SnapshotStrategy::DistributedBlock,
            network_strategy: NetworkStrategy::Production,
            power_off_source: true,
            perform_final_sync: true,
            cleanup_enabled: true,
            skip_validation: false,
            skip_driver_injection: false,
            timestamp: Utc::now().timestamp(),
        }
    }

    /// Request with the defaults of a sandboxed test cutover.
    pub fn test(context_id: impl Into<ContextId>, vm_id: impl Into<VmId>, vm_name: &str) -> Self {
        Self {
            failover_type: FailoverKind::Test,
            vm_naming: VmNaming::Suffixed,
            snapshot_backend: SnapshotStrategy::PerVolume,
            network_strategy: NetworkStrategy::Isolated,
            power_off_source: false,
            perform_final_sync: false,
            ..Self::live(context_id, vm_id, vm_name)
        }
    }

    /// Overrides the source power-off flag.
    #[must_use]
    pub const fn power_off_source(mut self, enabled: bool) -> Self {
        self.power_off_source = enabled;
        self
    }

    /// Overrides the final-sync flag.
    #[must_use]
    pub const fn final_sync(mut self, enabled: bool) -> Self {
        self.perform_final_sync = enabled;
        self
    }

    /// Overrides the naming rule.
    #[must_use]
    pub const fn vm_naming(mut self, naming: VmNaming) -> Self {
        self.vm_naming = naming;
        self
    }

    /// Overrides the network strategy.
    #[must_use]
    pub const fn network_strategy(mut self, strategy: NetworkStrategy) -> Self {
        self.network_strategy = strategy;
        self
    }

    /// Overrides the snapshot technology.
    #[must_use]
    pub const fn snapshot_backend(mut self, backend: SnapshotStrategy) -> Self {
        self.snapshot_backend = backend;
        self
    }

    /// Skips pre-flight validation.
    #[must_use]
    pub const fn skip_validation(mut self, skip: bool) -> Self {
        self.skip_validation = skip;
        self
    }

    /// Skips driver injection.
    #[must_use]
    pub const fn skip_driver_injection(mut self, skip: bool) -> Self {
        self.skip_driver_injection = skip;
        self
    }

    /// Pins the naming timestamp.
    #[must_use]
    pub const fn timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Checks every cross-field rule and produces a [`FailoverConfig`].
    ///
    /// # Errors
    ///
    /// Returns the first [`FailoverConfigError`] found. Identifier fields are
    /// checked before the kind-specific rules.
    pub fn validate(&self) -> Result<FailoverConfig, FailoverConfigError> {
        require("context_id", &self.context_id)?;
        require("vm_id", &self.vm_id)?;
        require("vm_name", &self.vm_name)?;

        let failover_type = match self.failover_type {
            FailoverKind::Live => self.live_type()?,
            FailoverKind::Test => self.test_type()?,
        };

        Ok(FailoverConfig {
            context_id: self.context_id.clone(),
            vm_id: self.vm_id.clone(),
            vm_name: self.vm_name.trim().to_owned(),
            failover_type,
            snapshot_backend: self.snapshot_backend,
            cleanup_enabled: self.cleanup_enabled,
            skip_validation: self.skip_validation,
            skip_driver_injection: self.skip_driver_injection,
            timestamp: self.timestamp,
        })
    }

    fn live_type(&self) -> Result<FailoverType, FailoverConfigError> {
        if self.vm_naming != VmNaming::Exact {
            return Err(FailoverConfigError::LiveRequiresExactNaming);
        }
        let network = match self.network_strategy {
            NetworkStrategy::Production => LiveNetwork::Production,
            NetworkStrategy::Custom => LiveNetwork::Custom,
            NetworkStrategy::Isolated => {
                return Err(FailoverConfigError::LiveIsolatedNetwork);
            }
        };
        Ok(FailoverType::Live {
            power_off_source: self.power_off_source,
            perform_final_sync: self.perform_final_sync,
            network,
        })
    }

    fn test_type(&self) -> Result<FailoverType, FailoverConfigError> {
        if self.power_off_source {
            return Err(FailoverConfigError::TestPowersOffSource);
        }
        if self.perform_final_sync {
            return Err(FailoverConfigError::TestFinalSync);
        }
        if self.vm_naming != VmNaming::Suffixed {
            return Err(FailoverConfigError::TestRequiresSuffixedNaming);
        }
        let network = match self.network_strategy {
            NetworkStrategy::Isolated => TestNetwork::Isolated,
            NetworkStrategy::Custom => TestNetwork::Custom,
            NetworkStrategy::Production => {
                return Err(FailoverConfigError::TestProductionNetwork);
            }
        };
        Ok(FailoverType::Test { network })
    }
}

fn require(field: &'static str, value: &str) -> Result<(), FailoverConfigError> {
    if value.trim().is_empty() {
        return Err(FailoverConfigError::MissingField { field });
    }
    Ok(())
}

/// Networks a live cutover may use.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LiveNetwork {
    /// Production-tagged mappings.
    Production,
    /// Per-network production mappings.
    Custom,
}

/// Networks a test cutover may use.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TestNetwork {
    /// Test-tagged, isolated mappings.
    Isolated,
    /// Per-network test mappings.
    Custom,
}

/// Validated failover kind, carrying only the options legal for it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailoverType {
    /// Production cutover. Always keeps the source VM name.
    Live {
        /// Power the source off before the cutover.
        power_off_source: bool,
        /// Run a final incremental sync before the cutover.
        perform_final_sync: bool,
        /// Network selection.
        network: LiveNetwork,
    },
    /// Sandboxed cutover. Never touches the source VM and always uses a
    /// suffixed name.
    Test {
        /// Network selection.
        network: TestNetwork,
    },
}

/// Validated, immutable description of a failover run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FailoverConfig {
    /// Context to fail over.
    pub context_id: ContextId,
    /// Source VM identifier.
    pub vm_id: VmId,
    /// Source VM name.
    pub vm_name: String,
    /// Kind-specific options.
    pub failover_type: FailoverType,
    /// Snapshot technology.
    pub snapshot_backend: SnapshotStrategy,
    /// Allow cleanup to reverse the run.
    pub cleanup_enabled: bool,
    /// Skip pre-flight validation.
    pub skip_validation: bool,
    /// Skip driver injection.
    pub skip_driver_injection: bool,
    /// Unix timestamp used to derive names.
    pub timestamp: i64,
}

impl FailoverConfig {
    /// Untagged kind.
    #[must_use]
    pub const fn kind(&self) -> FailoverKind {
        match self.failover_type {
            FailoverType::Live { .. } => FailoverKind::Live,
            FailoverType::Test { .. } => FailoverKind::Test,
        }
    }

    /// Returns `true` for production cutovers.
    #[must_use]
    pub const fn is_live_failover(&self) -> bool {
        matches!(self.failover_type, FailoverType::Live { .. })
    }

    /// Returns `true` when the source VM is powered off first.
    #[must_use]
    pub const fn requires_source_power_off(&self) -> bool {
        matches!(
            self.failover_type,
            FailoverType::Live {
                power_off_source: true,
                ..
            }
        )
    }

    /// Returns `true` when a final sync runs first.
    #[must_use]
    pub const fn requires_final_sync(&self) -> bool {
        matches!(
            self.failover_type,
            FailoverType::Live {
                perform_final_sync: true,
                ..
            }
        )
    }

    /// Returns `true` when only test-tagged network mappings may be used.
    #[must_use]
    pub const fn uses_test_networks(&self) -> bool {
        matches!(self.failover_type, FailoverType::Test { .. })
    }

    /// Name of the VM created on the destination.
    #[must_use]
    pub fn destination_vm_name(&self) -> String {
        match self.failover_type {
            FailoverType::Live { .. } => self.vm_name.clone(),
            FailoverType::Test { .. } => format!("{}-test-{}", self.vm_name, self.timestamp),
        }
    }

    /// Base name for protection snapshots.
    #[must_use]
    pub fn snapshot_name(&self) -> String {
        format!(
            "{}-failover-{}-{}",
            self.kind().as_str(),
            self.vm_name,
            self.timestamp
        )
    }

    /// Correlation id recorded with the tracker job.
    #[must_use]
    pub fn external_job_id(&self) -> String {
        format!(
            "unified-{}-failover-{}-{}",
            self.kind().as_str(),
            self.vm_name,
            self.timestamp
        )
    }
}

/// Violations reported by [`FailoverRequest::validate`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum FailoverConfigError {
    /// Raised when an identifier field is blank.
    #[error("{field} must not be empty")]
    MissingField {
        /// Name of the empty field.
        field: &'static str,
    },
    /// Raised when a test cutover asks to power off the source VM.
    #[error("test failover must not power off the source VM")]
    TestPowersOffSource,
    /// Raised when a test cutover asks for a final sync.
    #[error("test failover must not perform a final sync")]
    TestFinalSync,
    /// Raised when a test cutover would reuse the source VM name.
    #[error("test failover requires suffixed VM naming")]
    TestRequiresSuffixedNaming,
    /// Raised when a test cutover would join production networks.
    #[error("test failover must not use the production network strategy")]
    TestProductionNetwork,
    /// Raised when a live cutover would rename the VM.
    #[error("live failover requires exact VM naming")]
    LiveRequiresExactNaming,
    /// Raised when a live cutover would join isolated test networks.
    #[error("live failover must not use the isolated network strategy")]
    LiveIsolatedNetwork,
}
