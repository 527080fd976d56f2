//! Agent lifecycle: container creation, start/stop, removal, and the
//! hierarchy file contract.
//!
//! The supervisor never trusts a cached `running` flag: `status()` always
//! performs a fresh inspect. Containers persist across stops and are only
//! destroyed by explicit removal, which requires the agent to already be
//! gone from the registry.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use apiary_core::{Bee, BeeStatus, HiveError, HiveEvent, HiveResult, NodeId, SwarmConfig};
use apiary_store::{DataRoot, SwarmRegistry};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::bus::EventBus;
use crate::container::{ContainerBackend, ContainerBind, ContainerSpec};
use crate::counter::InboxCounter;
use crate::router::MailRouter;
use crate::watcher::OutboxWatchers;

/// One neighbor entry in an agent's hierarchy file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeighborRef {
    pub id: NodeId,
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: String,
}

/// The file contract at `state/hierarchy.json`: the only channel by which
/// an agent learns its neighborhood. Never the global graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HierarchyFile {
    pub agent_id: NodeId,
    pub receives_tasks_from: Vec<NeighborRef>,
    pub can_delegate_to: Vec<NeighborRef>,
}

/// Static pieces of the container spec shared by all agents.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub image: String,
    pub provider_api_key: Option<String>,
    pub default_model: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            image: "apiary/bee:latest".to_string(),
            provider_api_key: None,
            default_model: "claude-sonnet-4-5".to_string(),
        }
    }
}

pub struct Supervisor {
    root: DataRoot,
    backend: Arc<dyn ContainerBackend>,
    registry: Arc<SwarmRegistry>,
    router: Arc<MailRouter>,
    watchers: Arc<OutboxWatchers>,
    counter: InboxCounter,
    bus: Arc<EventBus>,
    config: SupervisorConfig,
    /// Known container handles by agent. Handles persist across stops.
    containers: Mutex<HashMap<NodeId, String>>,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        root: DataRoot,
        backend: Arc<dyn ContainerBackend>,
        registry: Arc<SwarmRegistry>,
        router: Arc<MailRouter>,
        watchers: Arc<OutboxWatchers>,
        counter: InboxCounter,
        bus: Arc<EventBus>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            root,
            backend,
            registry,
            router,
            watchers,
            counter,
            bus,
            config,
            containers: Mutex::new(HashMap::new()),
        }
    }

    /// Start an agent: provision its directories and contracts, bring the
    /// container up, and begin watching its outbox.
    pub async fn start(&self, id: &NodeId) -> HiveResult<BeeStatus> {
        let swarm = self.registry.get().await;
        let bee = swarm
            .bee(id)
            .cloned()
            .ok_or_else(|| HiveError::UnknownNode(id.clone()))?;

        self.root.ensure_agent_dirs(id).await?;
        self.provision_soul(&bee).await?;
        self.write_hierarchy(&swarm, id).await?;

        let handle = self.ensure_container(&bee).await?;
        self.backend.start(&handle).await?;
        let state = self.backend.inspect(&handle).await?;

        self.watchers.watch(
            id.clone(),
            self.root.agent_outbox(id),
            self.router.clone(),
        );
        self.counter.register(id.clone());
        self.counter.set_running(id.clone(), true);

        let status = BeeStatus {
            id: id.clone(),
            running: state.running,
            container_id: Some(handle),
            started_at: state.started_at,
        };
        self.bus.publish(HiveEvent::BeeStatus {
            status: status.clone(),
        });
        tracing::info!(agent = %id, "agent started");
        Ok(status)
    }

    /// Stop the container and the outbox watcher. Pending inbox mail stays
    /// where it is.
    pub async fn stop(&self, id: &NodeId) -> HiveResult<BeeStatus> {
        let handle = {
            let containers = self.containers.lock().await;
            containers.get(id).cloned()
        };
        if let Some(handle) = &handle {
            self.backend.stop(handle).await?;
        }
        self.watchers.unwatch(id);
        self.counter.set_running(id.clone(), false);

        let status = BeeStatus {
            id: id.clone(),
            running: false,
            container_id: handle,
            started_at: None,
        };
        self.bus.publish(HiveEvent::BeeStatus {
            status: status.clone(),
        });
        tracing::info!(agent = %id, "agent stopped");
        Ok(status)
    }

    /// Destroy the container and purge the agent's data subtree. The agent
    /// must already have been removed from the registry.
    pub async fn remove(&self, id: &NodeId) -> HiveResult<()> {
        if self.registry.get().await.bee(id).is_some() {
            return Err(HiveError::Busy(format!(
                "agent '{id}' is still registered; remove it from the swarm first"
            )));
        }

        self.watchers.unwatch(id);
        self.counter.set_running(id.clone(), false);
        self.counter.unregister(id);

        let handle = {
            let mut containers = self.containers.lock().await;
            containers.remove(id)
        };
        if let Some(handle) = handle {
            // Best effort: a vanished container must not block the purge.
            if let Err(err) = self.backend.stop(&handle).await {
                tracing::debug!(agent = %id, error = %err, "stop before remove failed");
            }
            self.backend.remove(&handle).await?;
        }

        self.root.purge_agent(id).await?;
        tracing::info!(agent = %id, "agent removed");
        Ok(())
    }

    /// Fresh inspect; never served from cache.
    pub async fn status(&self, id: &NodeId) -> HiveResult<BeeStatus> {
        let handle = {
            let containers = self.containers.lock().await;
            containers.get(id).cloned()
        };
        match handle {
            None => Ok(BeeStatus {
                id: id.clone(),
                running: false,
                container_id: None,
                started_at: None,
            }),
            Some(handle) => {
                let state = self.backend.inspect(&handle).await?;
                Ok(BeeStatus {
                    id: id.clone(),
                    running: state.running,
                    container_id: Some(handle),
                    started_at: state.started_at,
                })
            }
        }
    }

    /// Compute the hierarchy contract for one agent from a topology
    /// snapshot and write it atomically into the agent's state dir.
    pub async fn write_hierarchy(&self, swarm: &SwarmConfig, id: &NodeId) -> HiveResult<()> {
        let hierarchy = self.hierarchy_for(swarm, id).await;
        let path = self.root.hierarchy_path(id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(&hierarchy)
            .map_err(|e| HiveError::Validation(format!("hierarchy serialization failed: {e}")))?;
        let tmp = path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&json).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    pub async fn hierarchy_for(&self, swarm: &SwarmConfig, id: &NodeId) -> HierarchyFile {
        let topology = self.router.topology().await;
        let neighbor = |node: &NodeId| NeighborRef {
            id: node.clone(),
            name: swarm.node_name(node),
            node_type: node_type(node),
        };
        HierarchyFile {
            agent_id: id.clone(),
            receives_tasks_from: topology.upstream_of(id).map(&neighbor).collect(),
            can_delegate_to: topology.downstream_of(id).map(&neighbor).collect(),
        }
    }

    /// Rewrite hierarchy files for every provisioned agent. Called after
    /// each topology change.
    pub async fn refresh_hierarchies(&self) -> HiveResult<()> {
        let swarm = self.registry.get().await;
        for bee in &swarm.bees {
            if fs::try_exists(self.root.agent_state(&bee.id)).await? {
                self.write_hierarchy(&swarm, &bee.id).await?;
            }
        }
        Ok(())
    }

    /// Registry view joined with fresh container state.
    pub async fn list(&self) -> HiveResult<Vec<BeeStatus>> {
        let swarm = self.registry.get().await;
        let mut statuses = Vec::with_capacity(swarm.bees.len());
        for bee in &swarm.bees {
            statuses.push(self.status(&bee.id).await?);
        }
        Ok(statuses)
    }

    async fn provision_soul(&self, bee: &Bee) -> HiveResult<()> {
        let Some(soul) = &bee.soul else {
            return Ok(());
        };
        let path = self.root.soul_path(&bee.id);
        // Provisioning only: the soul file is never rewritten once present.
        if !fs::try_exists(&path).await? {
            fs::write(&path, soul.as_bytes()).await?;
        }
        Ok(())
    }

    async fn ensure_container(&self, bee: &Bee) -> HiveResult<String> {
        let mut containers = self.containers.lock().await;
        if let Some(handle) = containers.get(&bee.id) {
            return Ok(handle.clone());
        }
        let spec = self.container_spec(bee);
        let handle = match self.backend.create(&spec).await {
            Ok(handle) => handle,
            Err(HiveError::AlreadyExists(_)) => spec.name.clone(),
            Err(err) => return Err(err),
        };
        containers.insert(bee.id.clone(), handle.clone());
        Ok(handle)
    }

    fn container_spec(&self, bee: &Bee) -> ContainerSpec {
        let id = &bee.id;
        let model = bee
            .model
            .clone()
            .unwrap_or_else(|| self.config.default_model.clone());
        let mut env = vec![
            ("AGENT_ID".to_string(), id.to_string()),
            ("AGENT_NAME".to_string(), bee.name.clone()),
            ("MODEL".to_string(), model),
        ];
        if let Some(key) = &self.config.provider_api_key {
            env.push(("PROVIDER_API_KEY".to_string(), key.clone()));
        }

        let bind = |host: PathBuf, container: &str, read_only: bool| ContainerBind {
            host,
            container: container.to_string(),
            read_only,
        };
        ContainerSpec {
            name: format!("apiary-{id}"),
            image: self.config.image.clone(),
            env,
            binds: vec![
                bind(self.root.agent_inbox(id), "/hive/inbox", false),
                bind(self.root.agent_outbox(id), "/hive/outbox", false),
                bind(self.root.agent_state(id), "/hive/state", false),
                bind(self.root.agent_logs(id), "/hive/logs", false),
                bind(self.root.agent_workspace(id), "/hive/workspace", false),
                bind(self.root.agent_session(id), "/hive/session", false),
                bind(self.root.soul_path(id), "/hive/soul.md", true),
            ],
        }
    }
}

fn node_type(node: &NodeId) -> String {
    if node.is_human() {
        "human"
    } else if node.is_mailbox() {
        "mailbox"
    } else {
        "bee"
    }
    .to_string()
}
