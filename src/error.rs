//! Error taxonomy shared across the daemon.
//!
//! Every failure that can cross a component boundary is a discriminable
//! variant here, so callers can branch on the kind (the gateway maps them to
//! HTTP statuses, the scheduler decides what to record in the registry).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("service {0} not found")]
    ServiceNotFound(String),

    #[error("service {0} already exists")]
    ServiceAlreadyExists(String),

    #[error("request timed out for service {0}")]
    Timeout(String),

    #[error("request canceled for service {0}")]
    Canceled(String),

    #[error("failed to connect to service {0}")]
    Connection(String),

    #[error("service {name} returned {status}: {body}")]
    ServiceInvocation {
        name: String,
        status: u16,
        body: String,
    },

    #[error("health check failed for service {name}: {reason}")]
    HealthCheckFailed { name: String, reason: String },

    #[error("invalid runtime config: {0}")]
    RuntimeConfig(String),

    #[error("container runtime error: {0}")]
    Runtime(String),

    #[error("failed to load registry: {0}")]
    RegistryLoad(String),

    #[error("failed to save registry: {0}")]
    RegistrySave(String),
}

impl Error {
    /// HTTP status attributed to a failed invocation.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Timeout(_) | Error::Canceled(_) => 408,
            Error::ServiceInvocation { status, .. } => *status,
            _ => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_and_cancel_map_to_request_timeout() {
        assert_eq!(Error::Timeout("hello".to_string()).status_code(), 408);
        assert_eq!(Error::Canceled("hello".to_string()).status_code(), 408);
    }

    #[test]
    fn invocation_error_keeps_its_status() {
        let err = Error::ServiceInvocation {
            name: "hello".to_string(),
            status: 503,
            body: "unavailable".to_string(),
        };
        assert_eq!(err.status_code(), 503);
    }

    #[test]
    fn transport_failures_are_server_errors() {
        assert_eq!(Error::Connection("hello".to_string()).status_code(), 500);
        assert_eq!(Error::Runtime("boom".to_string()).status_code(), 500);
    }
}
