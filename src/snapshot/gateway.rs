//! Per-volume snapshots through the destination platform gateway.

use chrono::Utc;
use reqwest::Method;
use serde::{Deserialize, Serialize};

use crate::backend::BackendFuture;
use crate::lifecycle::{GatewayPlatform, PlatformError};
use crate::model::{SnapshotBackendKind, SnapshotHandle, VolumeReference};

use super::{SnapshotBackend, SnapshotError};

#[derive(Serialize)]
struct CreateSnapshot<'a> {
    name: &'a str,
}

#[derive(Deserialize)]
struct CreatedSnapshot {
    id: String,
}

/// Snapshot backend using the gateway's volume snapshot endpoints.
#[derive(Clone, Debug)]
pub struct GatewaySnapshots {
    gateway: GatewayPlatform,
}

impl GatewaySnapshots {
    /// Wraps a gateway client.
    #[must_use]
    pub const fn new(gateway: GatewayPlatform) -> Self {
        Self { gateway }
    }
}

impl From<PlatformError> for SnapshotError {
    fn from(value: PlatformError) -> Self {
        match value {
            PlatformError::NotFound { id, .. } => Self::NotFound { snapshot_id: id },
            other => Self::Backend {
                message: other.to_string(),
            },
        }
    }
}

impl SnapshotBackend for GatewaySnapshots {
    fn kind(&self) -> SnapshotBackendKind {
        SnapshotBackendKind::PerVolume
    }

    fn create<'a>(
        &'a self,
        volume: &'a VolumeReference,
        name: &'a str,
    ) -> BackendFuture<'a, SnapshotHandle, SnapshotError> {
        Box::pin(async move {
            let path = format!("/api/v1/volumes/{}/snapshots", volume.volume_id);
            let created: CreatedSnapshot = GatewayPlatform::send_json(
                self.gateway
                    .request(Method::POST, &path)
                    .json(&CreateSnapshot { name }),
                "volume",
                &volume.volume_id,
            )
            .await?;
            Ok(SnapshotHandle {
                id: created.id,
                name: name.to_owned(),
                backend: SnapshotBackendKind::PerVolume,
                volume_id: volume.volume_id.clone(),
                disk_id: volume.disk_id.clone(),
                created_at: Utc::now(),
            })
        })
    }

    fn revert<'a>(&'a self, handle: &'a SnapshotHandle) -> BackendFuture<'a, (), SnapshotError> {
        Box::pin(async move {
            let path = format!("/api/v1/snapshots/{}/revert", handle.id);
            GatewayPlatform::send_empty(
                self.gateway.request(Method::POST, &path),
                "snapshot",
                &handle.id,
            )
            .await?;
            Ok(())
        })
    }

    fn delete<'a>(&'a self, handle: &'a SnapshotHandle) -> BackendFuture<'a, (), SnapshotError> {
        Box::pin(async move {
            let path = format!("/api/v1/snapshots/{}", handle.id);
            GatewayPlatform::send_empty(
                self.gateway.request(Method::DELETE, &path),
                "snapshot",
                &handle.id,
            )
            .await?;
            Ok(())
        })
    }
}
