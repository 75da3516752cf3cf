//! HTTP client for the volume daemon.

use reqwest::StatusCode;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::backend::{BackendFuture, HTTP_CLIENT, endpoint, error_text};
use crate::model::{VmId, VolumeId};

use super::{DeviceMapping, VolumeDaemon, VolumeError, VolumeOperation};

#[derive(Serialize)]
struct AttachRequest<'a> {
    vm_id: &'a str,
}

/// Talks to the daemon's `/api/v1` endpoints.
#[derive(Clone, Debug)]
pub struct DaemonClient {
    base_url: String,
}

impl DaemonClient {
    /// Creates a client for the daemon at `base_url`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: Option<&AttachRequest<'_>>,
    ) -> Result<T, VolumeError> {
        let builder = HTTP_CLIENT.post(endpoint(&self.base_url, path));
        let request = match body {
            Some(payload) => builder.json(payload),
            None => builder,
        };
        let response = request.send().await.map_err(|err| VolumeError::Transport {
            message: err.to_string(),
        })?;
        decode(response).await
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response, VolumeError> {
        HTTP_CLIENT
            .get(endpoint(&self.base_url, path))
            .send()
            .await
            .map_err(|err| VolumeError::Transport {
                message: err.to_string(),
            })
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, VolumeError> {
    if !response.status().is_success() {
        return Err(VolumeError::Api {
            status: response.status().as_u16(),
            message: error_text(response).await,
        });
    }
    response.json().await.map_err(|err| VolumeError::Transport {
        message: err.to_string(),
    })
}

impl VolumeDaemon for DaemonClient {
    fn attach<'a>(
        &'a self,
        volume_id: &'a VolumeId,
        vm_id: &'a VmId,
    ) -> BackendFuture<'a, VolumeOperation, VolumeError> {
        Box::pin(async move {
            self.post(
                &format!("/api/v1/volumes/{volume_id}/attach"),
                Some(&AttachRequest { vm_id }),
            )
            .await
        })
    }

    fn attach_root<'a>(
        &'a self,
        volume_id: &'a VolumeId,
        vm_id: &'a VmId,
    ) -> BackendFuture<'a, VolumeOperation, VolumeError> {
        Box::pin(async move {
            self.post(
                &format!("/api/v1/volumes/{volume_id}/attach-root"),
                Some(&AttachRequest { vm_id }),
            )
            .await
        })
    }

    fn detach<'a>(&'a self, volume_id: &'a VolumeId) -> BackendFuture<'a, VolumeOperation, VolumeError> {
        Box::pin(async move {
            self.post(&format!("/api/v1/volumes/{volume_id}/detach"), None)
                .await
        })
    }

    fn operation<'a>(&'a self, operation_id: &'a str) -> BackendFuture<'a, VolumeOperation, VolumeError> {
        Box::pin(async move {
            let response = self
                .get(&format!("/api/v1/operations/{operation_id}"))
                .await?;
            decode(response).await
        })
    }

    fn device_mapping<'a>(
        &'a self,
        volume_id: &'a VolumeId,
    ) -> BackendFuture<'a, Option<DeviceMapping>, VolumeError> {
        Box::pin(async move {
            let response = self
                .get(&format!("/api/v1/volumes/{volume_id}/device"))
                .await?;
            if response.status() == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            decode(response).await.map(Some)
        })
    }

    fn health(&self) -> BackendFuture<'_, (), VolumeError> {
        Box::pin(async move {
            let response = self.get("/health").await?;
            if response.status().is_success() {
                Ok(())
            } else {
                Err(VolumeError::Api {
                    status: response.status().as_u16(),
                    message: error_text(response).await,
                })
            }
        })
    }
}
