//! Docker implementation of the container runtime driver.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use bollard::models::{
    ContainerCreateBody,
    EndpointSettings,
    HostConfig,
    NetworkCreateRequest,
    NetworkingConfig,
    PortBinding,
};
use bollard::query_parameters::{
    CreateContainerOptions,
    CreateImageOptions,
    ListContainersOptions,
    ListNetworksOptions,
    RemoveContainerOptions,
    StartContainerOptions,
    StopContainerOptions,
};
use bollard::Docker;
use futures_util::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    image_for_runtime,
    ContainerRuntime,
    RuntimeConfig,
    FUNCTION_PORT,
    MANAGED_LABEL,
    NETWORK_NAME,
};
use crate::error::{Error, Result};

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the engine's standard local socket.
    pub fn new() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::Runtime(format!("failed to connect to Docker daemon: {e}")))?;
        Ok(Self { docker })
    }

    /// Connect to a specific Unix socket (with or without a `unix://`
    /// prefix).
    pub fn with_socket(address: &str) -> Result<Self> {
        let socket_path = address.trim_start_matches("unix://");
        let docker = Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| {
                Error::Runtime(format!("failed to connect to Docker daemon at {address}: {e}"))
            })?;
        Ok(Self { docker })
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(Error::Runtime(format!(
                "failed to inspect image {image}: {e}"
            ))),
        }
    }

    /// Ensure an image is available locally, pulling it if necessary.
    async fn ensure_image(&self, image: &str, architecture: &str) -> Result<()> {
        if self.image_exists(image).await? {
            debug!(image, "image already present locally");
            return Ok(());
        }

        info!(image, "pulling image");
        let platform = if architecture.is_empty() {
            None
        } else {
            Some(format!("linux/{architecture}"))
        };
        let options = CreateImageOptions {
            from_image: Some(image.to_string()),
            platform: platform.unwrap_or_default(),
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            match progress {
                Ok(update) => {
                    if let Some(status) = update.status {
                        debug!(image, status = %status, "pull progress");
                    }
                }
                Err(e) => {
                    return Err(Error::Runtime(format!("failed to pull image {image}: {e}")))
                }
            }
        }

        info!(image, "image pulled");
        Ok(())
    }

    /// Ensure the user-defined bridge network exists.
    async fn ensure_network(&self) -> Result<()> {
        let networks = self
            .docker
            .list_networks(None::<ListNetworksOptions>)
            .await
            .map_err(|e| Error::Runtime(format!("failed to list networks: {e}")))?;

        if networks
            .iter()
            .any(|network| network.name.as_deref() == Some(NETWORK_NAME))
        {
            return Ok(());
        }

        self.docker
            .create_network(NetworkCreateRequest {
                name: NETWORK_NAME.to_string(),
                ..Default::default()
            })
            .await
            .map_err(|e| Error::Runtime(format!("failed to create network {NETWORK_NAME}: {e}")))?;

        info!(network = NETWORK_NAME, "created container network");
        Ok(())
    }

    fn container_spec(
        config: &RuntimeConfig,
        image: &str,
    ) -> Result<(String, ContainerCreateBody)> {
        let code_path = std::path::absolute(Path::new(&config.code_path)).map_err(|e| {
            Error::RuntimeConfig(format!(
                "failed to resolve code path {}: {e}",
                config.code_path
            ))
        })?;

        let container_name = format!("{}-{}", config.name, Uuid::new_v4());

        let env: Vec<String> = config
            .environment
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();

        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(format!("{FUNCTION_PORT}/tcp"), HashMap::new());

        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            format!("{FUNCTION_PORT}/tcp"),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(config.port.to_string()),
            }]),
        );

        let host_config = HostConfig {
            binds: Some(vec![format!("{}:/var/task", code_path.display())]),
            port_bindings: Some(port_bindings),
            ..Default::default()
        };

        let mut labels = HashMap::new();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());

        let mut endpoints = HashMap::new();
        endpoints.insert(NETWORK_NAME.to_string(), EndpointSettings::default());

        let body = ContainerCreateBody {
            image: Some(image.to_string()),
            cmd: if config.cmd.is_empty() {
                None
            } else {
                Some(config.cmd.clone())
            },
            entrypoint: if config.entrypoint.is_empty() {
                None
            } else {
                Some(config.entrypoint.clone())
            },
            env: Some(env),
            labels: Some(labels),
            exposed_ports: Some(exposed_ports),
            networking_config: Some(NetworkingConfig {
                endpoints_config: Some(endpoints),
            }),
            host_config: Some(host_config),
            ..Default::default()
        };

        Ok((container_name, body))
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn start_container(&self, config: &RuntimeConfig) -> Result<String> {
        let image = if !config.image.is_empty() {
            config.image.clone()
        } else if !config.runtime.is_empty() {
            image_for_runtime(&config.runtime)
        } else {
            return Err(Error::RuntimeConfig(
                "one of image or runtime must be specified".to_string(),
            ));
        };

        self.ensure_image(&image, &config.architecture).await?;

        // Evict any prior container for this function before binding its
        // port again.
        self.clean_by_name_prefix(&config.name).await?;
        self.ensure_network().await?;

        let (container_name, body) = Self::container_spec(config, &image)?;

        let options = CreateContainerOptions {
            name: Some(container_name.clone()),
            ..Default::default()
        };
        let created = self
            .docker
            .create_container(Some(options), body)
            .await
            .map_err(|e| {
                Error::Runtime(format!("failed to create container {container_name}: {e}"))
            })?;

        self.docker
            .start_container(&created.id, None::<StartContainerOptions>)
            .await
            .map_err(|e| {
                Error::Runtime(format!("failed to start container {container_name}: {e}"))
            })?;

        info!(
            container = %container_name,
            id = %created.id,
            image = %image,
            port = config.port,
            "container started"
        );
        Ok(created.id)
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        // 5 second grace before the engine kills the container.
        let options = StopContainerOptions {
            t: Some(5),
            ..Default::default()
        };
        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => {
                info!(container = id, "container stopped");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                warn!(container = id, "container not found, ignoring stop");
                Ok(())
            }
            Err(e) => Err(Error::Runtime(format!(
                "failed to stop container {id}: {e}"
            ))),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => {
                info!(container = id, "container removed");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                warn!(container = id, "container not found, ignoring remove");
                Ok(())
            }
            Err(e) => Err(Error::Runtime(format!(
                "failed to remove container {id}: {e}"
            ))),
        }
    }

    async fn clean_by_name_prefix(&self, prefix: &str) -> Result<()> {
        let options = ListContainersOptions {
            all: true,
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| Error::Runtime(format!("failed to list containers: {e}")))?;

        for container in containers {
            let Some(name) = container
                .names
                .as_ref()
                .and_then(|names| names.first())
                .map(|name| name.trim_start_matches('/').to_string())
            else {
                continue;
            };
            if !name.contains(prefix) {
                continue;
            }
            let Some(id) = container.id else { continue };
            info!(container = %name, "removing stale container");
            self.remove_container(&id).await?;
        }
        Ok(())
    }
}
