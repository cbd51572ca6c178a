//! Daemon wiring: registry, container runtime, scheduler, gateway.

use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::gateway::Gateway;
use crate::registry::ServiceRegistry;
use crate::runtime::{ContainerRuntime, DockerRuntime};
use crate::scheduler::Scheduler;

pub struct Service {
    gateway: Gateway,
}

impl Service {
    pub async fn new(config: Config) -> Result<Self> {
        let registry = Arc::new(ServiceRegistry::new());
        registry.load().await?;

        let runtime: Arc<dyn ContainerRuntime> = match &config.docker.address {
            Some(address) => Arc::new(DockerRuntime::with_socket(address)?),
            None => Arc::new(DockerRuntime::new()?),
        };

        let gateway_config = config.gateway.clone();
        let scheduler = Arc::new(Scheduler::new(config, registry, runtime));

        Ok(Self {
            gateway: Gateway::new(gateway_config, scheduler),
        })
    }

    /// Serve the gateway until ctrl-c or SIGTERM.
    pub async fn run(self) -> Result<()> {
        let cancel = CancellationToken::new();
        let gateway = self.gateway;

        let mut server = tokio::spawn({
            let cancel = cancel.clone();
            async move { gateway.serve(cancel).await }
        });

        tokio::select! {
            _ = shutdown_signal() => {
                info!("shutdown signal received, stopping gateway");
                cancel.cancel();
                (&mut server).await??;
            }
            result = &mut server => {
                result??;
            }
        }

        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
