//! Container runtime capability.
//!
//! The supervisor talks to an abstract [`ContainerBackend`]; the Docker
//! implementation goes through bollard with a per-call deadline, and the
//! null backend keeps lifecycle state in memory for tests and dry runs.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use apiary_core::{HiveError, HiveResult};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::models::HostConfig;
use bollard::Docker;
use chrono::{DateTime, Utc};

pub const DEFAULT_CALL_DEADLINE: Duration = Duration::from_secs(30);

/// A host-to-container mount binding.
#[derive(Debug, Clone)]
pub struct ContainerBind {
    pub host: PathBuf,
    pub container: String,
    pub read_only: bool,
}

impl ContainerBind {
    fn to_docker(&self) -> String {
        let mode = if self.read_only { ":ro" } else { "" };
        format!("{}:{}{}", self.host.display(), self.container, mode)
    }
}

/// Everything needed to create an agent container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Stable container name; creation is idempotent per name.
    pub name: String,
    pub image: String,
    pub env: Vec<(String, String)>,
    pub binds: Vec<ContainerBind>,
}

/// Observed container state from a fresh inspect.
#[derive(Debug, Clone, Default)]
pub struct ContainerState {
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub state: String,
}

/// The abstract runtime the supervisor drives. Handles are opaque strings
/// owned by the backend.
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    async fn create(&self, spec: &ContainerSpec) -> HiveResult<String>;
    async fn start(&self, handle: &str) -> HiveResult<()>;
    async fn stop(&self, handle: &str) -> HiveResult<()>;
    async fn remove(&self, handle: &str) -> HiveResult<()>;
    async fn inspect(&self, handle: &str) -> HiveResult<ContainerState>;
}

/// Docker backend over the local daemon socket.
pub struct DockerBackend {
    docker: Docker,
    deadline: Duration,
}

impl DockerBackend {
    pub fn connect(deadline: Duration) -> HiveResult<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| HiveError::ContainerRuntime(format!("docker connect failed: {e}")))?;
        Ok(Self { docker, deadline })
    }

    async fn bounded<T, F>(&self, what: &str, fut: F) -> HiveResult<T>
    where
        F: std::future::Future<Output = Result<T, bollard::errors::Error>>,
    {
        match tokio::time::timeout(self.deadline, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(HiveError::ContainerRuntime(format!("{what}: {e}"))),
            Err(_) => Err(HiveError::ContainerRuntime(format!(
                "{what}: deadline of {}s exceeded",
                self.deadline.as_secs()
            ))),
        }
    }
}

#[async_trait]
impl ContainerBackend for DockerBackend {
    async fn create(&self, spec: &ContainerSpec) -> HiveResult<String> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(
                spec.env
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>(),
            ),
            host_config: Some(HostConfig {
                binds: Some(spec.binds.iter().map(ContainerBind::to_docker).collect()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let response = self
            .bounded("create container", self.docker.create_container(Some(options), config))
            .await?;
        Ok(response.id)
    }

    async fn start(&self, handle: &str) -> HiveResult<()> {
        self.bounded(
            "start container",
            self.docker
                .start_container(handle, None::<StartContainerOptions<String>>),
        )
        .await
    }

    async fn stop(&self, handle: &str) -> HiveResult<()> {
        self.bounded(
            "stop container",
            self.docker
                .stop_container(handle, Some(StopContainerOptions { t: 10 })),
        )
        .await
    }

    async fn remove(&self, handle: &str) -> HiveResult<()> {
        self.bounded(
            "remove container",
            self.docker.remove_container(
                handle,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            ),
        )
        .await
    }

    async fn inspect(&self, handle: &str) -> HiveResult<ContainerState> {
        let response = self
            .bounded(
                "inspect container",
                self.docker
                    .inspect_container(handle, None::<InspectContainerOptions>),
            )
            .await?;
        let state = response.state.unwrap_or_default();
        Ok(ContainerState {
            running: state.running.unwrap_or(false),
            started_at: state
                .started_at
                .as_deref()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc)),
            state: state
                .status
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        })
    }
}

#[derive(Debug, Clone)]
struct NullEntry {
    running: bool,
    started_at: Option<DateTime<Utc>>,
}

/// In-memory backend: no containers, full lifecycle bookkeeping.
#[derive(Default)]
pub struct NullBackend {
    entries: Mutex<HashMap<String, NullEntry>>,
}

impl NullBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContainerBackend for NullBackend {
    async fn create(&self, spec: &ContainerSpec) -> HiveResult<String> {
        let handle = format!("null-{}", spec.name);
        let mut entries = self.entries.lock().expect("null backend lock poisoned");
        if entries.contains_key(&handle) {
            return Err(HiveError::AlreadyExists(handle));
        }
        entries.insert(
            handle.clone(),
            NullEntry {
                running: false,
                started_at: None,
            },
        );
        Ok(handle)
    }

    async fn start(&self, handle: &str) -> HiveResult<()> {
        let mut entries = self.entries.lock().expect("null backend lock poisoned");
        let entry = entries
            .get_mut(handle)
            .ok_or_else(|| HiveError::NotFound(handle.to_string()))?;
        entry.running = true;
        entry.started_at = Some(Utc::now());
        Ok(())
    }

    async fn stop(&self, handle: &str) -> HiveResult<()> {
        let mut entries = self.entries.lock().expect("null backend lock poisoned");
        let entry = entries
            .get_mut(handle)
            .ok_or_else(|| HiveError::NotFound(handle.to_string()))?;
        entry.running = false;
        Ok(())
    }

    async fn remove(&self, handle: &str) -> HiveResult<()> {
        let mut entries = self.entries.lock().expect("null backend lock poisoned");
        entries
            .remove(handle)
            .ok_or_else(|| HiveError::NotFound(handle.to_string()))?;
        Ok(())
    }

    async fn inspect(&self, handle: &str) -> HiveResult<ContainerState> {
        let entries = self.entries.lock().expect("null backend lock poisoned");
        let entry = entries
            .get(handle)
            .ok_or_else(|| HiveError::NotFound(handle.to_string()))?;
        Ok(ContainerState {
            running: entry.running,
            started_at: entry.started_at,
            state: if entry.running { "running" } else { "exited" }.to_string(),
        })
    }
}

/// Pick a backend from `CONTAINER_BACKEND` (`docker` default, `null`).
pub fn backend_from_env(deadline: Duration) -> HiveResult<std::sync::Arc<dyn ContainerBackend>> {
    let selector = std::env::var("CONTAINER_BACKEND").unwrap_or_else(|_| "docker".to_string());
    match selector.as_str() {
        "docker" => Ok(std::sync::Arc::new(DockerBackend::connect(deadline)?)),
        "null" => Ok(std::sync::Arc::new(NullBackend::new())),
        other => Err(HiveError::Validation(format!(
            "unknown CONTAINER_BACKEND '{other}' (expected 'docker' or 'null')"
        ))),
    }
}
