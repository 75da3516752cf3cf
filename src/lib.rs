//! Core library for the cutover control plane.
//!
//! The crate fails replicated VMs over from the source hypervisor onto the
//! destination compute platform and reverses those failovers. A test
//! failover boots an isolated copy while the source keeps running; a live
//! failover powers the source off, runs a last sync, and cuts over for
//! production. Both are fixed sequences of tracked steps driven by
//! [`FailoverOrchestrator`], and both are undone by [`CleanupOrchestrator`].
//!
//! External systems sit behind traits collected in [`Services`], so the
//! orchestrators run unchanged against the HTTP and process adapters or the
//! in-memory fakes in [`test_support`].

pub mod backend;
pub mod command;
pub mod config;
pub mod failover_config;
pub mod injection;
pub mod lifecycle;
pub mod model;
pub mod network;
pub mod orchestrator;
pub mod replication;
pub mod rollback;
pub mod sanitizer;
pub mod services;
pub mod snapshot;
pub mod source;
pub mod steps;
pub mod store;
pub mod summary;
pub mod test_support;
pub mod tracker;
pub mod validator;
pub mod volume;

pub use backend::BackendFuture;
pub use config::{ConfigError, ControlPlaneConfig};
pub use failover_config::{
    FailoverConfig, FailoverConfigError, FailoverRequest, NetworkStrategy, SnapshotStrategy,
    VmNaming,
};
pub use model::{
    ContextId, ContextStatus, FailoverJob, FailoverKind, JobId, JobStatus, VmContext, VmId,
    VolumeId,
};
pub use orchestrator::{FailoverError, FailoverOrchestrator, FailoverOutcome, PhaseError};
pub use rollback::{
    CleanupError, CleanupOrchestrator, CleanupOutcome, RollbackDecision, RollbackOptions,
    StepFailure, TeardownError, rollback_decision,
};
pub use sanitizer::{SanitizedMessage, sanitize, sanitize_step};
pub use services::{Services, Settings, Timings};
pub use steps::FailoverStep;
pub use store::{FailoverStore, JsonStateStore, MemoryStore, StoreError};
pub use tracker::{JobTracker, MemoryTracker};
pub use validator::{PreflightValidator, ValidationReport};
