//! Container lifecycle driver.
//!
//! The scheduler addresses the container engine through the
//! [`ContainerRuntime`] trait so it can be exercised against a fake engine
//! in tests. [`DockerRuntime`] is the production implementation, talking to
//! the engine's standard local socket.

mod docker;

use std::collections::HashMap;

use async_trait::async_trait;
pub use docker::DockerRuntime;

use crate::error::Result;

/// Container port each function listens on for invocation events.
pub const FUNCTION_PORT: u16 = 8080;

/// User-defined bridge network all function containers join.
pub const NETWORK_NAME: &str = "simla-network";

/// Label attached to every container this daemon creates.
pub const MANAGED_LABEL: &str = "simla";

/// Per-invocation descriptor for starting a function container.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    pub name: String,
    /// Language runtime tag; used to derive the image when `image` is empty.
    pub runtime: String,
    pub image: String,
    pub architecture: String,
    /// Host path of the user code, bind-mounted at `/var/task`.
    pub code_path: String,
    pub cmd: Vec<String>,
    pub entrypoint: Vec<String>,
    pub environment: HashMap<String, String>,
    /// Host port the container's invocation endpoint is published on.
    pub port: u16,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Ensure the image and network exist, evict stale containers for this
    /// function, then create and start a fresh container. Returns its id.
    async fn start_container(&self, config: &RuntimeConfig) -> Result<String>;

    /// Stop a container with a short grace period. A missing container is
    /// treated as already stopped.
    async fn stop_container(&self, id: &str) -> Result<()>;

    /// Force-remove a container. A missing container is treated as removed.
    async fn remove_container(&self, id: &str) -> Result<()>;

    /// Remove every container, running or not, whose name contains `prefix`.
    async fn clean_by_name_prefix(&self, prefix: &str) -> Result<()>;
}

/// Derive the default emulation image for a language runtime tag.
pub(crate) fn image_for_runtime(runtime: &str) -> String {
    format!("public.ecr.aws/lambda/{runtime}:latest")
}
