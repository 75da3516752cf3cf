//! Distributed block-storage snapshots through the storage client script.
//!
//! The script is invoked as
//! `python3 <client> <create|rollback|delete> <volume> <name> --api-url <url> --api-port <port>`
//! and prints a JSON object with `success`, `error`, and `metadata` fields.

use std::ffi::OsString;
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tracing::debug;

use crate::backend::BackendFuture;
use crate::command::CommandRunner;
use crate::model::{SnapshotBackendKind, SnapshotHandle, VolumeReference};

use super::{SnapshotBackend, SnapshotError};

const INTERPRETER: &str = "python3";

/// Where the storage controller lives.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockSnapshotSettings {
    /// Client script path.
    pub client: String,
    /// Controller URL.
    pub api_url: String,
    /// Controller port.
    pub api_port: u16,
}

#[derive(Deserialize)]
struct ClientReply {
    success: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    metadata: Option<ClientMetadata>,
}

#[derive(Deserialize)]
struct ClientMetadata {
    #[serde(default)]
    snapshot_id: Option<String>,
}

/// Snapshot backend driving the storage client script.
pub struct BlockSnapshotCli {
    runner: Arc<dyn CommandRunner>,
    settings: BlockSnapshotSettings,
}

impl BlockSnapshotCli {
    /// Creates a backend that runs the client through `runner`.
    #[must_use]
    pub const fn new(runner: Arc<dyn CommandRunner>, settings: BlockSnapshotSettings) -> Self {
        Self { runner, settings }
    }

    async fn invoke(
        &self,
        action: &'static str,
        subcommand: &str,
        volume: &str,
        name: &str,
    ) -> Result<ClientReply, SnapshotError> {
        let args: Vec<OsString> = [
            self.settings.client.as_str(),
            subcommand,
            volume,
            name,
            "--api-url",
            self.settings.api_url.as_str(),
            "--api-port",
        ]
        .into_iter()
        .map(OsString::from)
        .chain(std::iter::once(OsString::from(
            self.settings.api_port.to_string(),
        )))
        .collect();

        debug!(subcommand, volume, name, "running snapshot client");
        let output = self.runner.run(INTERPRETER, &args).await?;
        let reply: ClientReply = match serde_json::from_str(output.stdout.trim()) {
            Ok(reply) => reply,
            Err(err) => {
                let detail = if output.stderr.trim().is_empty() {
                    err.to_string()
                } else {
                    output.stderr.trim().to_owned()
                };
                return Err(SnapshotError::Reported {
                    action,
                    message: detail,
                });
            }
        };
        if reply.success && output.is_success() {
            return Ok(reply);
        }
        let message = reply
            .error
            .unwrap_or_else(|| format!("exit code {:?}", output.code));
        if message.to_ascii_lowercase().contains("not found") {
            return Err(SnapshotError::NotFound {
                snapshot_id: name.to_owned(),
            });
        }
        Err(SnapshotError::Reported { action, message })
    }
}

impl SnapshotBackend for BlockSnapshotCli {
    fn kind(&self) -> SnapshotBackendKind {
        SnapshotBackendKind::DistributedBlock
    }

    fn create<'a>(
        &'a self,
        volume: &'a VolumeReference,
        name: &'a str,
    ) -> BackendFuture<'a, SnapshotHandle, SnapshotError> {
        Box::pin(async move {
            let reply = self.invoke("creation", "create", &volume.volume_id, name).await?;
            let id = reply
                .metadata
                .and_then(|metadata| metadata.snapshot_id)
                .unwrap_or_else(|| name.to_owned());
            Ok(SnapshotHandle {
                id,
                name: name.to_owned(),
                backend: SnapshotBackendKind::DistributedBlock,
                volume_id: volume.volume_id.clone(),
                disk_id: volume.disk_id.clone(),
                created_at: Utc::now(),
            })
        })
    }

    fn revert<'a>(&'a self, handle: &'a SnapshotHandle) -> BackendFuture<'a, (), SnapshotError> {
        Box::pin(async move {
            self.invoke("rollback", "rollback", &handle.volume_id, &handle.name)
                .await
                .map(drop)
        })
    }

    fn delete<'a>(&'a self, handle: &'a SnapshotHandle) -> BackendFuture<'a, (), SnapshotError> {
        Box::pin(async move {
            self.invoke("deletion", "delete", &handle.volume_id, &handle.name)
                .await
                .map(drop)
        })
    }
}
