//! End-to-end gateway tests: HTTP request in, scheduler, fake runtime,
//! local function listener, response out.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::routing::get;
use axum::Router as AxumRouter;
use bytes::Bytes;

use simla::config::{Config, GatewayConfig, Route, ServiceConfig};
use simla::error::Result;
use simla::gateway::Gateway;
use simla::health::{HealthProber, INVOCATION_PATH};
use simla::registry::ServiceRegistry;
use simla::router::Router;
use simla::runtime::{ContainerRuntime, RuntimeConfig};
use simla::scheduler::Scheduler;

#[derive(Default)]
struct FakeRuntime {
    starts: AtomicUsize,
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn start_container(&self, config: &RuntimeConfig) -> Result<String> {
        let count = self.starts.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("{}-container-{count}", config.name))
    }

    async fn stop_container(&self, _id: &str) -> Result<()> {
        Ok(())
    }

    async fn remove_container(&self, _id: &str) -> Result<()> {
        Ok(())
    }

    async fn clean_by_name_prefix(&self, _prefix: &str) -> Result<()> {
        Ok(())
    }
}

/// Function listener that echoes the invocation event it received.
async fn spawn_function_server() -> u16 {
    let app = AxumRouter::new().route(
        INVOCATION_PATH,
        get(|| async { "OK" }).post(|body: Bytes| async move { body }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

/// Spin up the whole stack and return the gateway's base URL.
async fn spawn_gateway(function_port: u16) -> String {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(ServiceRegistry::with_base_port(
        dir.path().join("registry.yaml"),
        function_port,
    ));
    registry.load().await.unwrap();
    // Keep the registry file alive for the duration of the test process.
    std::mem::forget(dir);

    let gateway_config = GatewayConfig {
        stage: "v1".to_string(),
        routes: vec![
            Route {
                path: "/hello".to_string(),
                method: "POST".to_string(),
                service: "hello".to_string(),
            },
            Route {
                path: "/ghost".to_string(),
                method: "POST".to_string(),
                service: "ghost".to_string(),
            },
        ],
        ..Default::default()
    };

    let mut config = Config::default();
    config.gateway = gateway_config.clone();
    config.services.insert(
        "hello".to_string(),
        ServiceConfig {
            runtime: "go".to_string(),
            code_path: ".".to_string(),
            ..Default::default()
        },
    );

    let scheduler = Arc::new(Scheduler::with_parts(
        config,
        registry,
        Arc::new(FakeRuntime::default()),
        HealthProber::with_timeouts(
            Duration::from_secs(1),
            Duration::from_millis(20),
            Duration::from_secs(2),
        ),
        Router::with_timeout(Duration::from_secs(2)),
        Duration::from_secs(5),
    ));

    let app = Gateway::new(gateway_config, scheduler).router();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("http://{addr}")
}

#[tokio::test]
async fn test_happy_path_invocation() {
    let function_port = spawn_function_server().await;
    let base = spawn_gateway(function_port).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{base}/v1/hello"))
        .body("{\"name\":\"Simla\"}")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "application/json"
    );

    // The function saw a synthesized gateway event wrapping the request.
    let body = response.text().await.unwrap();
    let event: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(event["version"], "2.0");
    assert_eq!(event["rawPath"], "/v1/hello");
    assert_eq!(event["routeKey"], "POST /v1/hello");
    assert_eq!(event["body"], "{\"name\":\"Simla\"}");
}

#[tokio::test]
async fn test_unknown_service_is_a_bad_gateway() {
    let function_port = spawn_function_server().await;
    let base = spawn_gateway(function_port).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{base}/v1/ghost"))
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 502);
}

#[tokio::test]
async fn test_unregistered_path_is_not_found() {
    let function_port = spawn_function_server().await;
    let base = spawn_gateway(function_port).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{base}/v1/missing"))
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn test_method_mismatch_is_rejected() {
    let function_port = spawn_function_server().await;
    let base = spawn_gateway(function_port).await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("{base}/v1/hello"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 405);
}

#[tokio::test]
async fn test_health_endpoint() {
    let function_port = spawn_function_server().await;
    let base = spawn_gateway(function_port).await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("{base}/v1/health"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().await.unwrap(), "OK");
}

#[tokio::test]
async fn test_opaque_payload_reaches_the_function() {
    // An invalid-JSON request body is still wrapped and delivered; rejecting
    // it is the function's business, not the scheduler's.
    let function_port = spawn_function_server().await;
    let base = spawn_gateway(function_port).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{base}/v1/hello"))
        .body("Simla")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);

    let event: serde_json::Value =
        serde_json::from_str(&response.text().await.unwrap()).unwrap();
    assert_eq!(event["body"], "Simla");
}
