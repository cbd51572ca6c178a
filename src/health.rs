//! Health probing of function invocation endpoints.
//!
//! A function is considered healthy when its emulated invocation endpoint
//! answers a GET with a 2xx. [`HealthProber::wait_for_healthy`] polls the
//! endpoint after a cold start until it comes up, the ceiling elapses, or
//! the caller cancels.

use std::time::Duration;

use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Invocation endpoint inside the emulated function container. Doubles as
/// the health probe target.
pub const INVOCATION_PATH: &str = "/2015-03-31/functions/function/invocations";

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(500);
const WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Invocation URL for a function published on `port`.
pub fn invocation_url(port: u16) -> String {
    format!("http://localhost:{port}{INVOCATION_PATH}")
}

pub struct HealthProber {
    client: Client,
    poll_interval: Duration,
    wait_timeout: Duration,
}

impl HealthProber {
    pub fn new() -> Self {
        Self::with_timeouts(PROBE_TIMEOUT, POLL_INTERVAL, WAIT_TIMEOUT)
    }

    /// Prober with caller-chosen timings. Tests use this to avoid the
    /// production 30-second ceiling.
    pub fn with_timeouts(
        probe_timeout: Duration,
        poll_interval: Duration,
        wait_timeout: Duration,
    ) -> Self {
        let client = Client::builder()
            .timeout(probe_timeout)
            .build()
            .expect("failed to build health probe client");
        Self {
            client,
            poll_interval,
            wait_timeout,
        }
    }

    /// One probe against the function's invocation endpoint.
    async fn probe(&self, name: &str, port: u16) -> Result<()> {
        let url = invocation_url(port);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::HealthCheckFailed {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        if response.status().is_success() {
            return Ok(());
        }
        Err(Error::HealthCheckFailed {
            name: name.to_string(),
            reason: format!("status {}", response.status()),
        })
    }

    /// Whether the function currently answers its invocation endpoint.
    pub async fn is_healthy(&self, name: &str, port: u16) -> bool {
        match self.probe(name, port).await {
            Ok(()) => true,
            Err(e) => {
                debug!(service = name, error = %e, "health probe failed");
                false
            }
        }
    }

    /// Poll until the endpoint answers 2xx, the ceiling elapses, or the
    /// caller cancels. Individual probe failures are logged and retried on
    /// the next tick.
    pub async fn wait_for_healthy(
        &self,
        name: &str,
        port: u16,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.wait_timeout;
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The interval's first tick completes immediately; consume it so no
        // probe lands before the first tick boundary.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Error::Canceled(name.to_string()));
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(Error::Timeout(name.to_string()));
                }
                _ = ticker.tick() => {
                    match self.probe(name, port).await {
                        Ok(()) => return Ok(()),
                        Err(e) => warn!(service = name, error = %e, "health check attempt failed"),
                    }
                }
            }
        }
    }
}

impl Default for HealthProber {
    fn default() -> Self {
        Self::new()
    }
}
