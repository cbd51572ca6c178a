//! HTTP gateway in front of the scheduler.
//!
//! Exposes the configured routes under the stage prefix, wraps each inbound
//! request in an API-Gateway-style invocation event, and forwards it to the
//! scheduler as opaque bytes. Any scheduler error surfaces as a 502 with a
//! short message; the details go to the logs.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, on, MethodFilter};
use axum::Router as AxumRouter;
use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::GatewayConfig;
use crate::scheduler::Scheduler;

/// Synthesized invocation event, in the shape functions behind an HTTP API
/// gateway expect.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequestEvent {
    pub version: String,
    pub route_key: String,
    pub raw_path: String,
    pub raw_query_string: String,
    pub headers: HashMap<String, String>,
    pub cookies: Vec<String>,
    pub request_context: RequestContext,
    pub body: String,
    pub is_base64_encoded: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    pub account_id: String,
    pub route_key: String,
    pub stage: String,
    pub time: String,
    pub http: HttpDescription,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpDescription {
    pub method: String,
    pub path: String,
    pub protocol: String,
    pub source_ip: String,
    pub user_agent: String,
}

#[derive(Clone)]
struct GatewayState {
    scheduler: Arc<Scheduler>,
    stage: String,
}

pub struct Gateway {
    config: GatewayConfig,
    scheduler: Arc<Scheduler>,
}

impl Gateway {
    pub fn new(config: GatewayConfig, scheduler: Arc<Scheduler>) -> Self {
        Self { config, scheduler }
    }

    /// Build the axum router from the configured routes.
    pub fn router(&self) -> AxumRouter {
        let state = GatewayState {
            scheduler: self.scheduler.clone(),
            stage: self.config.stage.clone(),
        };

        let mut app = AxumRouter::<GatewayState>::new()
            .route(&format!("/{}/health", self.config.stage), get(health_handler));

        for route in &self.config.routes {
            let path = format!("/{}{}", self.config.stage, normalize_path(&route.path));
            let Some(filter) = method_filter(&route.method) else {
                error!(method = %route.method, path = %path, "unsupported route method, skipping");
                continue;
            };

            info!(
                method = %route.method,
                path = %path,
                service = %route.service,
                "registering route"
            );

            let service = route.service.clone();
            app = app.route(
                &path,
                on(
                    filter,
                    move |State(state): State<GatewayState>,
                          method: Method,
                          uri: Uri,
                          headers: HeaderMap,
                          body: Bytes| {
                        handle_invoke(state, service.clone(), method, uri, headers, body)
                    },
                ),
            );
        }

        app.layer(TraceLayer::new_for_http()).with_state(state)
    }

    /// Serve the gateway until the cancellation token fires.
    pub async fn serve(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let app = self.router();
        let addr = self.config.socket_addr();
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind gateway on {addr}"))?;
        info!(addr = %addr, "gateway listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await
            .context("gateway server error")
    }
}

async fn health_handler() -> &'static str {
    "OK"
}

async fn handle_invoke(
    state: GatewayState,
    service: String,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let event = match build_event(&state.stage, &method, &uri, &headers, &body) {
        Ok(event) => event,
        Err(err) => {
            error!(service = %service, error = %err, "failed to build invocation event");
            return (StatusCode::BAD_REQUEST, "failed to build invocation event").into_response();
        }
    };

    let cancel = CancellationToken::new();
    match state
        .scheduler
        .invoke(&service, Bytes::from(event), &cancel)
        .await
    {
        Ok(response) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            response,
        )
            .into_response(),
        Err(err) => {
            error!(service = %service, error = %err, "failed to invoke service");
            (StatusCode::BAD_GATEWAY, "failed to process request").into_response()
        }
    }
}

fn build_event(
    stage: &str,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: &Bytes,
) -> serde_json::Result<Vec<u8>> {
    let route_key = format!("{} {}", method, uri.path());

    let header_map: HashMap<String, String> = headers
        .iter()
        .filter_map(|(key, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (key.to_string(), value.to_string()))
        })
        .collect();

    let cookies: Vec<String> = headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok().map(str::to_string))
        .collect();

    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let event = HttpRequestEvent {
        version: "2.0".to_string(),
        route_key: route_key.clone(),
        raw_path: uri.path().to_string(),
        raw_query_string: uri.query().unwrap_or_default().to_string(),
        headers: header_map,
        cookies,
        request_context: RequestContext {
            account_id: "012345678901".to_string(),
            route_key,
            stage: stage.to_string(),
            time: Utc::now().to_rfc3339(),
            http: HttpDescription {
                method: method.to_string(),
                path: uri.path().to_string(),
                protocol: "HTTP/1.1".to_string(),
                source_ip: String::new(),
                user_agent,
            },
        },
        body: String::from_utf8_lossy(body).into_owned(),
        is_base64_encoded: false,
    };

    serde_json::to_vec(&event)
}

fn method_filter(method: &str) -> Option<MethodFilter> {
    match method.to_ascii_uppercase().as_str() {
        "GET" => Some(MethodFilter::GET),
        "POST" => Some(MethodFilter::POST),
        "PUT" => Some(MethodFilter::PUT),
        "DELETE" => Some(MethodFilter::DELETE),
        "PATCH" => Some(MethodFilter::PATCH),
        "HEAD" => Some(MethodFilter::HEAD),
        "OPTIONS" => Some(MethodFilter::OPTIONS),
        _ => None,
    }
}

fn normalize_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}
