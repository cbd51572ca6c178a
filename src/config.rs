//! Daemon configuration.
//!
//! Loaded from a YAML file, by default `.simla.yaml` in the working
//! directory. The `services` map is the configuration collaborator the
//! scheduler consults when it has to cold-start a function.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;

const LOCAL_ENV: &str = "local";

/// A route exposed by the API gateway, mapping an HTTP path to a function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub path: String,
    pub method: String,
    pub service: String,
}

/// API gateway listener settings.
#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Port the gateway listens on.
    #[serde_inline_default(8080)]
    pub port: u16,
    /// Stage prefix under which all routes are registered (e.g. `v1`).
    #[serde_inline_default("v1".to_string())]
    pub stage: String,
    /// Listen address for the gateway server.
    #[serde_inline_default("0.0.0.0".to_string())]
    pub listen_addr: String,
    #[serde(default)]
    pub routes: Vec<Route>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            stage: "v1".to_string(),
            listen_addr: "0.0.0.0".to_string(),
            routes: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// Socket address to bind to.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.listen_addr, self.port)
    }
}

/// Per-function settings used to build the container for that function.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    /// Language runtime tag (e.g. `go`, `nodejs20.x`). Used to derive the
    /// image when no explicit image is given.
    #[serde(default)]
    pub runtime: String,
    /// Explicit image reference, overriding the runtime-derived one.
    #[serde(default)]
    pub image: String,
    /// CPU architecture (e.g. `amd64`, `arm64`).
    #[serde(default)]
    pub architecture: String,
    /// Host path of the user code, bind-mounted at `/var/task`.
    #[serde(default)]
    pub code_path: String,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

/// Container engine connection settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockerConfig {
    /// Docker daemon socket. The engine's standard local socket when unset.
    #[serde(default)]
    pub address: Option<String>,
}

/// Top-level daemon configuration.
#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Environment name (e.g. "local", "staging"). Controls log formatting.
    #[serde_inline_default(LOCAL_ENV.to_string())]
    pub env: String,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub services: HashMap<String, ServiceConfig>,
    #[serde(default)]
    pub docker: DockerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            env: LOCAL_ENV.to_string(),
            gateway: GatewayConfig::default(),
            services: HashMap::new(),
            docker: DockerConfig::default(),
        }
    }
}

impl Config {
    pub fn from_path(path: &Path) -> Result<Config> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_yaml_str(&config_str)
    }

    fn from_yaml_str(config_str: &str) -> Result<Config> {
        let mut config: Config = serde_yaml::from_str(config_str)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&mut self) -> Result<()> {
        for (name, service) in &self.services {
            if service.image.is_empty() && service.runtime.is_empty() {
                anyhow::bail!("service {}: one of image or runtime must be set", name);
            }
        }
        Ok(())
    }

    /// Look up a function's configuration by name.
    pub fn get_service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.get(name)
    }

    pub fn structured_logging(&self) -> bool {
        self.env != LOCAL_ENV
    }
}
