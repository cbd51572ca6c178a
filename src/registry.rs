//! Persisted registry of known functions and their allocated ports.
//!
//! The registry is the authoritative map of function name to allocated host
//! port and container identity. Every mutation is snapshotted to
//! `$HOME/.simla/registry.yaml` inside the write-lock critical section, so
//! the file never lags behind an observed in-memory state and a daemon
//! restart re-assigns identical ports to previously known functions.
//!
//! Status and health are deliberately not persisted: containers may be gone
//! after a restart, so loaded entries always come back Pending/unhealthy and
//! are re-validated on first use.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use crate::error::{Error, Result};

pub const DEFAULT_BASE_PORT: u16 = 9000;

const REGISTRY_FILE: &str = "registry.yaml";

/// Lifecycle status of a registered function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Running,
    Stopped,
    Failed,
}

/// A registered function and its allocated resources.
#[derive(Debug, Clone)]
pub struct Service {
    pub name: String,
    /// Container id; empty until the first successful start.
    pub id: String,
    /// Allocated host port, stable for the lifetime of the entry.
    pub port: u16,
    pub status: Status,
    pub healthy: bool,
    pub last_checked: Option<DateTime<Utc>>,
    pub failure_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedService {
    id: String,
    port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snapshot {
    base_port: u16,
    last_allocated_port: u16,
    #[serde(default)]
    services: HashMap<String, PersistedService>,
}

struct RegistryState {
    base_port: u16,
    last_allocated_port: u16,
    services: HashMap<String, Service>,
}

pub struct ServiceRegistry {
    path: PathBuf,
    state: RwLock<RegistryState>,
}

impl ServiceRegistry {
    /// Registry backed by `$HOME/.simla/registry.yaml`.
    pub fn new() -> Self {
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::with_path(home.join(".simla").join(REGISTRY_FILE))
    }

    pub fn with_path(path: impl AsRef<Path>) -> Self {
        Self::with_base_port(path, DEFAULT_BASE_PORT)
    }

    /// Registry with a caller-chosen port range. Tests use this to make the
    /// allocator land on a port a local listener is already bound to.
    pub fn with_base_port(path: impl AsRef<Path>, base_port: u16) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            state: RwLock::new(RegistryState {
                base_port,
                last_allocated_port: base_port - 1,
                services: HashMap::new(),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the snapshot from disk. A missing file is not an error: the
    /// containing directory is created and the registry starts empty.
    pub async fn load(&self) -> Result<()> {
        let mut state = self.state.write().await;
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => {
                let snapshot: Snapshot = serde_yaml::from_str(&contents)
                    .map_err(|e| Error::RegistryLoad(e.to_string()))?;
                state.base_port = snapshot.base_port;
                state.last_allocated_port = snapshot.last_allocated_port;
                state.services = snapshot
                    .services
                    .into_iter()
                    .map(|(name, persisted)| {
                        let service = Service {
                            name: name.clone(),
                            id: persisted.id,
                            port: persisted.port,
                            status: Status::Pending,
                            healthy: false,
                            last_checked: None,
                            failure_count: 0,
                        };
                        (name, service)
                    })
                    .collect();
                info!(
                    path = %self.path.display(),
                    services = state.services.len(),
                    "loaded registry"
                );
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if let Some(dir) = self.path.parent() {
                    tokio::fs::create_dir_all(dir)
                        .await
                        .map_err(|e| Error::RegistryLoad(e.to_string()))?;
                }
                state.services.clear();
                info!(path = %self.path.display(), "registry file missing, starting empty");
                Ok(())
            }
            Err(e) => Err(Error::RegistryLoad(e.to_string())),
        }
    }

    /// Write the snapshot to disk. Called with the write lock held.
    async fn persist(&self, state: &RegistryState) -> Result<()> {
        let snapshot = Snapshot {
            base_port: state.base_port,
            last_allocated_port: state.last_allocated_port,
            services: state
                .services
                .iter()
                .map(|(name, service)| {
                    (
                        name.clone(),
                        PersistedService {
                            id: service.id.clone(),
                            port: service.port,
                        },
                    )
                })
                .collect(),
        };
        let contents =
            serde_yaml::to_string(&snapshot).map_err(|e| Error::RegistrySave(e.to_string()))?;
        // Write-then-rename so a crash mid-write cannot corrupt the snapshot.
        let tmp = self.path.with_extension("yaml.tmp");
        tokio::fs::write(&tmp, contents)
            .await
            .map_err(|e| Error::RegistrySave(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| Error::RegistrySave(e.to_string()))?;
        Ok(())
    }

    pub async fn save(&self) -> Result<()> {
        let state = self.state.write().await;
        self.persist(&state).await
    }

    /// Return the entry for `name`, allocating a port and inserting a fresh
    /// Pending entry if the function has never been seen. This is the atomic
    /// "allocate port" primitive: the counter advances only for new names.
    pub async fn get_or_create(&self, name: &str) -> Result<Service> {
        let mut state = self.state.write().await;
        if let Some(service) = state.services.get(name) {
            return Ok(service.clone());
        }

        let port = state.last_allocated_port + 1;
        state.last_allocated_port = port;
        let service = Service {
            name: name.to_string(),
            id: String::new(),
            port,
            status: Status::Pending,
            healthy: false,
            last_checked: None,
            failure_count: 0,
        };
        state.services.insert(name.to_string(), service.clone());
        self.persist(&state).await?;
        info!(service = name, port, "registered new service");
        Ok(service)
    }

    pub async fn get(&self, name: &str) -> Option<Service> {
        self.state.read().await.services.get(name).cloned()
    }

    pub async fn list(&self) -> Vec<Service> {
        self.state.read().await.services.values().cloned().collect()
    }

    pub async fn last_allocated_port(&self) -> u16 {
        self.state.read().await.last_allocated_port
    }

    pub async fn update_status(&self, name: &str, status: Status) -> Result<()> {
        let mut state = self.state.write().await;
        let service = state
            .services
            .get_mut(name)
            .ok_or_else(|| Error::ServiceNotFound(name.to_string()))?;
        service.status = status;
        // healthy = true implies status = Running.
        if status != Status::Running {
            service.healthy = false;
        }
        self.persist(&state).await
    }

    pub async fn update_health(&self, name: &str, healthy: bool) -> Result<()> {
        let mut state = self.state.write().await;
        let service = state
            .services
            .get_mut(name)
            .ok_or_else(|| Error::ServiceNotFound(name.to_string()))?;
        service.healthy = healthy;
        service.last_checked = Some(Utc::now());
        if healthy {
            service.failure_count = 0;
        } else {
            service.failure_count += 1;
        }
        self.persist(&state).await
    }

    pub async fn update_container_id(&self, name: &str, id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let service = state
            .services
            .get_mut(name)
            .ok_or_else(|| Error::ServiceNotFound(name.to_string()))?;
        service.id = id.to_string();
        self.persist(&state).await
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[tokio::test]
    async fn test_first_allocation_gets_base_port() {
        let dir = tempdir().unwrap();
        let registry = ServiceRegistry::with_path(dir.path().join("registry.yaml"));
        registry.load().await.unwrap();

        let hello = registry.get_or_create("hello").await.unwrap();
        assert_eq!(hello.port, DEFAULT_BASE_PORT);
        assert_eq!(hello.status, Status::Pending);
        assert!(!hello.healthy);
        assert!(hello.id.is_empty());

        let world = registry.get_or_create("world").await.unwrap();
        assert_eq!(world.port, DEFAULT_BASE_PORT + 1);
        assert_eq!(registry.last_allocated_port().await, DEFAULT_BASE_PORT + 1);
    }

    #[tokio::test]
    async fn test_existing_entry_keeps_port_and_counter() {
        let dir = tempdir().unwrap();
        let registry = ServiceRegistry::with_path(dir.path().join("registry.yaml"));
        registry.load().await.unwrap();

        let first = registry.get_or_create("hello").await.unwrap();
        let second = registry.get_or_create("hello").await.unwrap();
        assert_eq!(first.port, second.port);
        assert_eq!(registry.last_allocated_port().await, first.port);
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("registry.yaml");

        let registry = ServiceRegistry::with_path(&path);
        registry.load().await.unwrap();
        registry.get_or_create("hello").await.unwrap();
        registry.get_or_create("world").await.unwrap();
        registry.update_status("hello", Status::Running).await.unwrap();
        registry.update_health("hello", true).await.unwrap();
        registry.update_container_id("hello", "a1b2c3").await.unwrap();

        let reloaded = ServiceRegistry::with_path(&path);
        reloaded.load().await.unwrap();
        assert_eq!(reloaded.last_allocated_port().await, DEFAULT_BASE_PORT + 1);

        let hello = reloaded.get("hello").await.unwrap();
        assert_eq!(hello.port, DEFAULT_BASE_PORT);
        assert_eq!(hello.id, "a1b2c3");
        // Status and health are not persisted.
        assert_eq!(hello.status, Status::Pending);
        assert!(!hello.healthy);

        let world = reloaded.get("world").await.unwrap();
        assert_eq!(world.port, DEFAULT_BASE_PORT + 1);
        assert!(world.id.is_empty());
    }

    #[tokio::test]
    async fn test_missing_file_starts_empty_and_creates_directory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("registry.yaml");
        let registry = ServiceRegistry::with_path(&path);
        registry.load().await.unwrap();
        assert!(registry.list().await.is_empty());
        assert!(path.parent().unwrap().exists());
    }

    #[tokio::test]
    async fn test_load_rejects_malformed_snapshot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("registry.yaml");
        tokio::fs::write(&path, "services: [not, a, map]").await.unwrap();

        let registry = ServiceRegistry::with_path(&path);
        let err = registry.load().await.unwrap_err();
        assert!(matches!(err, Error::RegistryLoad(_)));
    }

    #[tokio::test]
    async fn test_non_running_status_clears_health() {
        let dir = tempdir().unwrap();
        let registry = ServiceRegistry::with_path(dir.path().join("registry.yaml"));
        registry.load().await.unwrap();
        registry.get_or_create("hello").await.unwrap();

        registry.update_status("hello", Status::Running).await.unwrap();
        registry.update_health("hello", true).await.unwrap();
        assert!(registry.get("hello").await.unwrap().healthy);

        registry.update_status("hello", Status::Stopped).await.unwrap();
        let hello = registry.get("hello").await.unwrap();
        assert_eq!(hello.status, Status::Stopped);
        assert!(!hello.healthy);
    }

    #[tokio::test]
    async fn test_update_unknown_service_fails() {
        let dir = tempdir().unwrap();
        let registry = ServiceRegistry::with_path(dir.path().join("registry.yaml"));
        registry.load().await.unwrap();

        let err = registry.update_status("ghost", Status::Failed).await.unwrap_err();
        assert!(matches!(err, Error::ServiceNotFound(_)));
    }

    #[tokio::test]
    async fn test_failure_count_tracks_consecutive_failures() {
        let dir = tempdir().unwrap();
        let registry = ServiceRegistry::with_path(dir.path().join("registry.yaml"));
        registry.load().await.unwrap();
        registry.get_or_create("hello").await.unwrap();

        registry.update_health("hello", false).await.unwrap();
        registry.update_health("hello", false).await.unwrap();
        assert_eq!(registry.get("hello").await.unwrap().failure_count, 2);
        assert!(registry.get("hello").await.unwrap().last_checked.is_some());

        registry.update_status("hello", Status::Running).await.unwrap();
        registry.update_health("hello", true).await.unwrap();
        assert_eq!(registry.get("hello").await.unwrap().failure_count, 0);
    }
}
