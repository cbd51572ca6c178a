//! Single-shot invocation routing to function containers.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Router {
    client: Client,
}

impl Router {
    pub fn new() -> Self {
        Self::with_timeout(REQUEST_TIMEOUT)
    }

    /// Router with a caller-chosen client timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build router client");
        Self { client }
    }

    /// POST the invocation payload to a function's invocation endpoint and
    /// return the response body and status.
    ///
    /// `name` labels diagnostics only; it is never put on the wire. A non-2xx
    /// response is an error carrying the upstream status and body.
    pub async fn send_request(
        &self,
        name: &str,
        url: &str,
        headers: &HashMap<String, String>,
        payload: Bytes,
        cancel: &CancellationToken,
    ) -> Result<(Bytes, u16)> {
        let mut request = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        for (key, value) in headers {
            request = request.header(key, value);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Canceled(name.to_string())),
            result = request.body(payload).send() => result.map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(name.to_string())
                } else {
                    debug!(service = name, error = %e, "transport failure");
                    Error::Connection(name.to_string())
                }
            })?,
        };

        let status = response.status();
        let body = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Canceled(name.to_string())),
            result = response.bytes() => result.map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(name.to_string())
                } else {
                    Error::Connection(name.to_string())
                }
            })?,
        };

        if status.is_success() {
            return Ok((body, status.as_u16()));
        }

        Err(Error::ServiceInvocation {
            name: name.to_string(),
            status: status.as_u16(),
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}
