//! Scaleway Instances provider.
//!
//! Reads and power actions go through `scaleway-rs`; server creation and
//! commercial type changes use the HTTP API directly because the SDK does
//! not expose them.

mod config;
mod error;
mod image;

use std::sync::LazyLock;
use std::time::Duration;

use scaleway_rs::{ScalewayApi, ScalewayApiError, ScalewayInstance};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::fleet::{DEFAULT_SSH_USER, Instance, ProviderMetadata};

use super::{
    Capabilities, InstanceSpec, InstanceStatus, PowerAction, PowerState, Provider, ProviderError,
    ProviderFuture, SIZE_FIELD, metadata_field,
};
use image::ImageQuery;

pub use config::ScalewayConfig;
pub use error::ScalewayProviderError;

/// Name recorded in provider metadata.
pub const PROVIDER_NAME: &str = "scaleway";

/// Metadata key holding the server identifier.
pub const ID_FIELD: &str = "id";

/// Metadata key holding the availability zone.
pub const ZONE_FIELD: &str = "zone";

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const SCALEWAY_INSTANCE_API_BASE: &str = "https://api.scaleway.com/instance/v1";

static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

#[derive(Serialize)]
struct CreateServerRequest {
    name: String,
    commercial_type: String,
    image: String,
    project: String,
    routed_ip_enabled: bool,
    dynamic_ip_required: bool,
    tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    organization: Option<String>,
}

#[derive(Deserialize)]
struct CreateServerResponse {
    server: ScalewayInstance,
}

#[derive(Serialize)]
struct UpdateServerRequest<'a> {
    commercial_type: &'a str,
}

/// Provider backed by the Scaleway Instances API.
#[derive(Clone)]
pub struct ScalewayProvider {
    api: ScalewayApi,
    config: ScalewayConfig,
    secret_key: String,
}

impl std::fmt::Debug for ScalewayProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScalewayProvider")
            .field("zone", &self.config.default_zone)
            .finish_non_exhaustive()
    }
}

/// Maps a Scaleway server state onto [`PowerState`].
#[must_use]
pub fn power_state(state: &str) -> PowerState {
    match state {
        "running" => PowerState::Running,
        "stopped" | "stopped in place" => PowerState::Stopped,
        _ => PowerState::Pending,
    }
}

const fn action_name(action: PowerAction) -> &'static str {
    match action {
        PowerAction::Boot => "poweron",
        PowerAction::Shutdown => "poweroff",
        PowerAction::Reboot => "reboot",
    }
}

fn is_instance_type_error(api_err: &ScalewayApiError, instance_type: &str) -> bool {
    matches!(api_err.resource.as_deref(), Some("commercial_type"))
        || api_err
            .resource_id
            .as_deref()
            .is_some_and(|id| id == instance_type)
        || (api_err.etype == "invalid_arguments"
            && api_err
                .message
                .to_ascii_lowercase()
                .contains("commercial_type"))
}

impl ScalewayProvider {
    /// Constructs a provider from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ScalewayProviderError::Config`] when the configuration fails
    /// validation.
    pub fn new(config: ScalewayConfig) -> Result<Self, ScalewayProviderError> {
        config.validate()?;
        let secret_key = config.secret_key()?.to_owned();
        Ok(Self {
            api: ScalewayApi::new(&secret_key),
            config,
            secret_key,
        })
    }

    fn location(instance: &Instance) -> Result<(&str, &str), ProviderError> {
        Ok((
            metadata_field(instance, ZONE_FIELD)?,
            metadata_field(instance, ID_FIELD)?,
        ))
    }

    async fn fetch(&self, zone: &str, id: &str) -> Result<Option<ScalewayInstance>, ScalewayProviderError> {
        let mut servers = self
            .api
            .list_instances(zone)
            .servers(id)
            .per_page(1)
            .run_async()
            .await?;
        Ok(servers.pop())
    }

    async fn create_server(
        &self,
        spec: &InstanceSpec,
        zone: &str,
        commercial_type: &str,
    ) -> Result<ScalewayInstance, ScalewayProviderError> {
        let query = ImageQuery {
            label: spec
                .image
                .clone()
                .unwrap_or_else(|| self.config.default_image.clone()),
            arch: self.config.default_architecture.clone(),
            zone: zone.to_owned(),
            project: self.config.project_id()?.to_owned(),
            organization: self.config.default_organization_id.clone(),
        };
        let image_id = self.resolve_image_id(&query).await?;

        let payload = CreateServerRequest {
            name: spec.name.clone(),
            commercial_type: commercial_type.to_owned(),
            image: image_id,
            project: query.project.clone(),
            routed_ip_enabled: true,
            dynamic_ip_required: true,
            tags: vec![String::from("overcast"), spec.cluster.clone()],
            organization: query.organization.clone(),
        };
        let url = format!("{SCALEWAY_INSTANCE_API_BASE}/zones/{zone}/servers");
        let response = HTTP_CLIENT
            .post(&url)
            .header("X-Auth-Token", &self.secret_key)
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        let body = response.bytes().await?;

        if status.is_success() {
            let parsed: CreateServerResponse =
                serde_json::from_slice(&body).map_err(|err| ScalewayProviderError::Api {
                    message: err.to_string(),
                })?;
            return Ok(parsed.server);
        }
        if let Ok(api_err) = serde_json::from_slice::<ScalewayApiError>(&body)
            && is_instance_type_error(&api_err, commercial_type)
        {
            return Err(ScalewayProviderError::InstanceTypeUnavailable {
                instance_type: commercial_type.to_owned(),
                zone: zone.to_owned(),
            });
        }
        Err(ScalewayProviderError::Api {
            message: String::from_utf8_lossy(&body).into_owned(),
        })
    }

    async fn power_on_if_needed(
        &self,
        zone: &str,
        server: &ScalewayInstance,
    ) -> Result<(), ScalewayProviderError> {
        if server.state == "running" {
            return Ok(());
        }
        if server.allowed_actions.iter().any(|action| action == "poweron") {
            self.api
                .perform_instance_action_async(zone, &server.id, "poweron")
                .await?;
            return Ok(());
        }
        Err(ScalewayProviderError::PowerOnNotAllowed {
            instance_id: server.id.clone(),
            state: server.state.clone(),
        })
    }

    async fn update_commercial_type(
        &self,
        zone: &str,
        id: &str,
        commercial_type: &str,
    ) -> Result<(), ScalewayProviderError> {
        let url = format!("{SCALEWAY_INSTANCE_API_BASE}/zones/{zone}/servers/{id}");
        let response = HTTP_CLIENT
            .patch(&url)
            .header("X-Auth-Token", &self.secret_key)
            .json(&UpdateServerRequest { commercial_type })
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.bytes().await?;
        if let Ok(api_err) = serde_json::from_slice::<ScalewayApiError>(&body)
            && is_instance_type_error(&api_err, commercial_type)
        {
            return Err(ScalewayProviderError::InstanceTypeUnavailable {
                instance_type: commercial_type.to_owned(),
                zone: zone.to_owned(),
            });
        }
        Err(ScalewayProviderError::Api {
            message: String::from_utf8_lossy(&body).into_owned(),
        })
    }
}

fn status_of(server: Option<ScalewayInstance>) -> InstanceStatus {
    server.map_or_else(
        || InstanceStatus::new(PowerState::Gone),
        |found| InstanceStatus {
            state: power_state(&found.state),
            ip: found.public_ip.map(|ip| ip.address),
            ssh_port: None,
            metadata: None,
        },
    )
}

impl Provider for ScalewayProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::all()
    }

    fn describe<'a>(&'a self, instance: &'a Instance) -> ProviderFuture<'a, InstanceStatus> {
        Box::pin(async move {
            let (zone, id) = Self::location(instance)?;
            let server = self.fetch(zone, id).await?;
            let status = status_of(server);
            debug!(instance = %instance.name, state = %status.state, "described scaleway server");
            Ok(status)
        })
    }

    fn submit_create<'a>(&'a self, spec: &'a InstanceSpec) -> ProviderFuture<'a, Instance> {
        Box::pin(async move {
            let zone = spec
                .region
                .clone()
                .unwrap_or_else(|| self.config.default_zone.clone());
            let commercial_type = spec
                .size
                .clone()
                .unwrap_or_else(|| self.config.default_instance_type.clone());
            let server = self.create_server(spec, &zone, &commercial_type).await?;
            self.power_on_if_needed(&zone, &server).await?;

            let mut instance = Instance::new(
                spec.name.clone(),
                server
                    .public_ip
                    .as_ref()
                    .map(|ip| ip.address.clone())
                    .unwrap_or_default(),
            );
            instance.ssh_key.clone_from(&spec.ssh_key);
            instance.user = spec
                .user
                .clone()
                .unwrap_or_else(|| DEFAULT_SSH_USER.to_owned());
            instance.provider = Some(
                ProviderMetadata::new(PROVIDER_NAME)
                    .with_field(ID_FIELD, server.id)
                    .with_field(ZONE_FIELD, zone)
                    .with_field(SIZE_FIELD, commercial_type),
            );
            Ok(instance)
        })
    }

    fn submit_power<'a>(
        &'a self,
        instance: &'a Instance,
        action: PowerAction,
    ) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            let (zone, id) = Self::location(instance)?;
            self.api
                .perform_instance_action_async(zone, id, action_name(action))
                .await
                .map_err(ScalewayProviderError::from)?;
            Ok(())
        })
    }

    fn submit_destroy<'a>(&'a self, instance: &'a Instance) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            let (zone, id) = Self::location(instance)?;
            // terminate removes the server and its volumes even while running.
            self.api
                .perform_instance_action_async(zone, id, "terminate")
                .await
                .map_err(ScalewayProviderError::from)?;
            Ok(())
        })
    }

    fn submit_resize<'a>(
        &'a self,
        instance: &'a Instance,
        size: &'a str,
    ) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            let (zone, id) = Self::location(instance)?;
            self.update_commercial_type(zone, id, size).await?;
            Ok(())
        })
    }
}
