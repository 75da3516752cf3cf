//! HTTP client for the destination platform gateway.

use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::backend::{BackendFuture, HTTP_CLIENT, endpoint, error_text};
use crate::model::{PowerState, VmId, VmSpec};

use super::{ComputePlatform, PlatformError, PlatformVolume};

/// Talks to the destination gateway's REST API.
#[derive(Clone)]
pub struct GatewayPlatform {
    base_url: String,
    api_key: Option<String>,
}

impl std::fmt::Debug for GatewayPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayPlatform")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct CreatedVm {
    id: String,
}

#[derive(Deserialize)]
struct VmState {
    state: String,
}

impl GatewayPlatform {
    /// Creates a client for the gateway at `base_url`.
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key,
        }
    }

    pub(crate) fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = HTTP_CLIENT.request(method, endpoint(&self.base_url, path));
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    pub(crate) async fn send_json<T: DeserializeOwned>(
        builder: RequestBuilder,
        kind: &'static str,
        id: &str,
    ) -> Result<T, PlatformError> {
        let response = Self::send(builder, kind, id).await?;
        response
            .json()
            .await
            .map_err(|err| PlatformError::Transport {
                message: err.to_string(),
            })
    }

    pub(crate) async fn send_empty(
        builder: RequestBuilder,
        kind: &'static str,
        id: &str,
    ) -> Result<(), PlatformError> {
        Self::send(builder, kind, id).await.map(drop)
    }

    async fn send(
        builder: RequestBuilder,
        kind: &'static str,
        id: &str,
    ) -> Result<reqwest::Response, PlatformError> {
        let response = builder
            .send()
            .await
            .map_err(|err| PlatformError::Transport {
                message: err.to_string(),
            })?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(PlatformError::NotFound {
                kind,
                id: id.to_owned(),
            });
        }
        if !response.status().is_success() {
            return Err(PlatformError::Api {
                status: response.status().as_u16(),
                message: error_text(response).await,
            });
        }
        Ok(response)
    }
}

impl ComputePlatform for GatewayPlatform {
    fn create_vm<'a>(&'a self, spec: &'a VmSpec) -> BackendFuture<'a, VmId, PlatformError> {
        Box::pin(async move {
            let created: CreatedVm = Self::send_json(
                self.request(Method::POST, "/api/v1/vms").json(spec),
                "vm",
                &spec.name,
            )
            .await?;
            Ok(VmId::from(created.id))
        })
    }

    fn power_on<'a>(&'a self, vm_id: &'a VmId) -> BackendFuture<'a, (), PlatformError> {
        Box::pin(Self::send_empty(
            self.request(Method::POST, &format!("/api/v1/vms/{vm_id}/start")),
            "vm",
            vm_id,
        ))
    }

    fn power_off<'a>(&'a self, vm_id: &'a VmId) -> BackendFuture<'a, (), PlatformError> {
        Box::pin(Self::send_empty(
            self.request(Method::POST, &format!("/api/v1/vms/{vm_id}/stop")),
            "vm",
            vm_id,
        ))
    }

    fn power_state<'a>(&'a self, vm_id: &'a VmId) -> BackendFuture<'a, PowerState, PlatformError> {
        Box::pin(async move {
            let state: VmState = Self::send_json(
                self.request(Method::GET, &format!("/api/v1/vms/{vm_id}")),
                "vm",
                vm_id,
            )
            .await?;
            Ok(PowerState::parse(&state.state))
        })
    }

    fn delete_vm<'a>(&'a self, vm_id: &'a VmId) -> BackendFuture<'a, (), PlatformError> {
        Box::pin(Self::send_empty(
            self.request(Method::DELETE, &format!("/api/v1/vms/{vm_id}")),
            "vm",
            vm_id,
        ))
    }

    fn vm_volumes<'a>(
        &'a self,
        vm_id: &'a VmId,
    ) -> BackendFuture<'a, Vec<PlatformVolume>, PlatformError> {
        Box::pin(Self::send_json(
            self.request(Method::GET, &format!("/api/v1/vms/{vm_id}/volumes")),
            "vm",
            vm_id,
        ))
    }

    fn detach_volume<'a>(&'a self, volume_id: &'a str) -> BackendFuture<'a, (), PlatformError> {
        Box::pin(Self::send_empty(
            self.request(Method::POST, &format!("/api/v1/volumes/{volume_id}/detach")),
            "volume",
            volume_id,
        ))
    }

    fn delete_volume<'a>(&'a self, volume_id: &'a str) -> BackendFuture<'a, (), PlatformError> {
        Box::pin(Self::send_empty(
            self.request(Method::DELETE, &format!("/api/v1/volumes/{volume_id}")),
            "volume",
            volume_id,
        ))
    }
}
