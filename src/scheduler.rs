//! The invocation scheduler.
//!
//! Owns the start/route state machine: each invocation ensures a healthy
//! container exists for the target function, cold-starting one under the
//! per-function startup lock when needed, then routes the invocation event
//! to it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::health::{invocation_url, HealthProber};
use crate::registry::{ServiceRegistry, Status};
use crate::router::Router;
use crate::runtime::{ContainerRuntime, RuntimeConfig};

const INVOKE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Scheduler {
    config: Config,
    registry: Arc<ServiceRegistry>,
    runtime: Arc<dyn ContainerRuntime>,
    health: HealthProber,
    router: Router,
    invoke_timeout: Duration,
    /// Per-function startup locks. The map itself is held only for lookup;
    /// the named lock is held for the duration of a start.
    start_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Scheduler {
    pub fn new(
        config: Config,
        registry: Arc<ServiceRegistry>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        Self::with_parts(
            config,
            registry,
            runtime,
            HealthProber::new(),
            Router::new(),
            INVOKE_TIMEOUT,
        )
    }

    /// Scheduler with caller-supplied prober, router and timeout. Tests use
    /// this to shorten the production timings.
    pub fn with_parts(
        config: Config,
        registry: Arc<ServiceRegistry>,
        runtime: Arc<dyn ContainerRuntime>,
        health: HealthProber,
        router: Router,
        invoke_timeout: Duration,
    ) -> Self {
        Self {
            config,
            registry,
            runtime,
            health,
            router,
            invoke_timeout,
            start_locks: Mutex::new(HashMap::new()),
        }
    }

    fn startup_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.start_locks.lock().expect("startup lock map poisoned");
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Route one invocation event to the named function, cold-starting its
    /// container first when necessary. The payload is opaque bytes.
    pub async fn invoke(
        &self,
        name: &str,
        payload: Bytes,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        let service = self.registry.get_or_create(name).await?;

        if service.status != Status::Running || !service.healthy {
            info!(service = name, "service not running or unhealthy, starting");
            self.start_service(name, cancel).await?;
        }

        let url = invocation_url(service.port);
        let result = tokio::time::timeout(
            self.invoke_timeout,
            self.router
                .send_request(name, &url, &HashMap::new(), payload, cancel),
        )
        .await
        .unwrap_or_else(|_| Err(Error::Timeout(name.to_string())));

        match result {
            Ok((body, _status)) => {
                info!(service = name, "service invoked");
                Ok(body)
            }
            Err(err @ Error::ServiceInvocation { .. }) => {
                warn!(service = name, error = %err, "invocation failed");
                Err(err)
            }
            Err(err) => {
                warn!(service = name, error = %err, "invocation failed");
                Err(Error::ServiceInvocation {
                    name: name.to_string(),
                    status: err.status_code(),
                    body: err.to_string(),
                })
            }
        }
    }

    /// Bring the named function to Running/healthy. Concurrent calls for the
    /// same function serialize on its startup lock; at most one container
    /// start is in flight per function.
    pub async fn start_service(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        let service = self
            .registry
            .get(name)
            .await
            .ok_or_else(|| Error::ServiceNotFound(name.to_string()))?;

        if service.status == Status::Running && service.healthy {
            return Ok(());
        }

        let lock = self.startup_lock(name);
        let _guard = lock.lock().await;

        // Another request may have completed the start while we waited.
        if let Some(current) = self.registry.get(name).await {
            if current.status == Status::Running && current.healthy {
                return Ok(());
            }
        }

        let Some(service_config) = self.config.get_service(name) else {
            return Err(Error::ServiceNotFound(name.to_string()));
        };

        info!(service = name, port = service.port, "starting service container");

        let runtime_config = RuntimeConfig {
            name: name.to_string(),
            runtime: service_config.runtime.clone(),
            image: service_config.image.clone(),
            architecture: service_config.architecture.clone(),
            code_path: service_config.code_path.clone(),
            cmd: service_config.cmd.clone(),
            entrypoint: service_config.entrypoint.clone(),
            environment: service_config.environment.clone(),
            port: service.port,
        };

        let container_id = match self.runtime.start_container(&runtime_config).await {
            Ok(id) => id,
            Err(err) => {
                self.mark_failed(name).await;
                return Err(err);
            }
        };

        if let Err(err) = self
            .health
            .wait_for_healthy(name, service.port, cancel)
            .await
        {
            self.mark_failed(name).await;
            return Err(err);
        }

        self.registry.update_status(name, Status::Running).await?;
        self.registry.update_health(name, true).await?;
        self.registry.update_container_id(name, &container_id).await?;

        info!(service = name, container = %container_id, "service started");
        Ok(())
    }

    /// Stop the named function's container. A function that is not Running
    /// is left untouched.
    pub async fn stop_service(&self, name: &str) -> Result<()> {
        let Some(service) = self.registry.get(name).await else {
            warn!(service = name, "service not found in registry");
            return Ok(());
        };

        if service.status != Status::Running {
            info!(service = name, "service not running");
            return Ok(());
        }

        info!(service = name, "stopping service container");
        self.registry.update_status(name, Status::Pending).await?;
        self.runtime.stop_container(&service.id).await?;
        self.registry.update_status(name, Status::Stopped).await?;

        info!(service = name, "service stopped");
        Ok(())
    }

    async fn mark_failed(&self, name: &str) {
        if let Err(err) = self.registry.update_status(name, Status::Failed).await {
            warn!(service = name, error = %err, "failed to record failed status");
        }
    }
}
