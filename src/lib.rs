//! Simla: a local emulator for a serverless function platform.
//!
//! HTTP requests arrive on the gateway, are mapped to a named function,
//! a container implementing the function's invocation protocol is lazily
//! started and health checked, and the synthesized invocation event is
//! routed to it.

pub mod config;
pub mod error;
pub mod gateway;
pub mod health;
pub mod registry;
pub mod router;
pub mod runtime;
pub mod scheduler;
pub mod service;
pub mod tracing;

// Re-export key types for convenience
pub use config::Config;
pub use error::Error;
pub use registry::ServiceRegistry;
pub use runtime::{ContainerRuntime, DockerRuntime, RuntimeConfig};
pub use scheduler::Scheduler;
