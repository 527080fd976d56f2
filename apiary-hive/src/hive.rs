//! The orchestrator runtime facade.
//!
//! [`Hive`] wires the stores, the router, the watchers, the counter, and
//! the supervisor together, recovers the inflight spool from a previous
//! process, and exposes the operation set the gateway and CLI call into.
//! Every registry mutation flows through one path: validate, persist,
//! rebuild the topology snapshot, rewrite affected hierarchy files, and
//! announce `swarm:updated`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use apiary_core::{
    AttachmentRef, Bee, BeeStatus, Connection, HiveError, HiveEvent, HiveResult, Mail, MailType,
    MergedConnection, NodeId, QueueSnapshot, SwarmConfig, Topology,
};
use apiary_store::{mail_store, BlobMeta, BlobStore, DataRoot, HumanStore, SwarmRegistry};
use tokio::fs;
use tokio_util::sync::CancellationToken;

use crate::bus::{EventBus, EventStream};
use crate::container::{ContainerBackend, DEFAULT_CALL_DEADLINE};
use crate::counter::InboxCounter;
use crate::router::MailRouter;
use crate::supervisor::{HierarchyFile, Supervisor, SupervisorConfig};
use crate::watcher::OutboxWatchers;

#[derive(Debug, Clone)]
pub struct HiveConfig {
    pub data_root: PathBuf,
    /// Seed `human <-> bee` edges when a bee is added.
    pub auto_connect_human: bool,
    pub supervisor: SupervisorConfig,
    pub container_deadline: Duration,
}

impl HiveConfig {
    pub fn from_env() -> Self {
        let supervisor = SupervisorConfig {
            image: std::env::var("BEE_IMAGE").unwrap_or_else(|_| "apiary/bee:latest".to_string()),
            provider_api_key: std::env::var("PROVIDER_API_KEY").ok(),
            ..Default::default()
        };
        Self {
            data_root: DataRoot::from_env().path().to_path_buf(),
            auto_connect_human: std::env::var("AUTO_CONNECT_HUMAN")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            supervisor,
            container_deadline: DEFAULT_CALL_DEADLINE,
        }
    }
}

pub struct Hive {
    root: DataRoot,
    registry: Arc<SwarmRegistry>,
    router: Arc<MailRouter>,
    watchers: Arc<OutboxWatchers>,
    counter: InboxCounter,
    supervisor: Supervisor,
    bus: Arc<EventBus>,
    human_inbox: Arc<HumanStore>,
    human_outbox: Arc<HumanStore>,
    blobs: BlobStore,
    auto_connect_human: bool,
    cancel: CancellationToken,
}

impl Hive {
    /// Bring the orchestrator up over a data root: load the registry, build
    /// the topology snapshot, start the counter, and re-route anything a
    /// previous process left in the inflight spool.
    pub async fn bootstrap(
        config: HiveConfig,
        backend: Arc<dyn ContainerBackend>,
    ) -> HiveResult<Arc<Self>> {
        let root = DataRoot::new(config.data_root.clone());
        root.ensure_base_dirs().await?;

        let registry = Arc::new(SwarmRegistry::open(root.swarm_path()).await?);
        let swarm = registry.get().await;

        let bus = Arc::new(EventBus::default());
        let human_inbox = Arc::new(HumanStore::new(root.human_inbox_path()));
        let human_outbox = Arc::new(HumanStore::new(root.human_outbox_path()));
        let router = Arc::new(MailRouter::new(
            root.clone(),
            Arc::new(Topology::from_connections(&swarm.connections)),
            human_inbox.clone(),
            bus.clone(),
        ));
        let watchers = Arc::new(OutboxWatchers::new());
        let counter = InboxCounter::new(
            root.clone(),
            human_inbox.clone(),
            human_outbox.clone(),
            bus.clone(),
        );
        let supervisor = Supervisor::new(
            root.clone(),
            backend,
            registry.clone(),
            router.clone(),
            watchers.clone(),
            counter.clone(),
            bus.clone(),
            config.supervisor,
        );

        let cancel = CancellationToken::new();
        counter.spawn(cancel.clone());

        let hive = Arc::new(Self {
            blobs: BlobStore::new(root.files_dir()),
            root,
            registry,
            router,
            watchers,
            counter,
            supervisor,
            bus,
            human_inbox,
            human_outbox,
            auto_connect_human: config.auto_connect_human,
            cancel,
        });

        hive.sync_counter(&swarm).await?;
        let recovered = hive.router.recover_inflight().await?;
        if recovered > 0 {
            tracing::info!(recovered, "re-routed inflight mail from previous run");
        }
        Ok(hive)
    }

    /// Stop background tasks and release OS watches.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.watchers.unwatch_all();
    }

    // --- swarm configuration ------------------------------------------------

    pub async fn swarm_get(&self) -> SwarmConfig {
        self.registry.get().await
    }

    pub async fn swarm_put(&self, config: SwarmConfig) -> HiveResult<()> {
        self.registry.put(config).await?;
        self.after_config_change().await
    }

    /// Add one bee; optionally seed its human edges.
    pub async fn add_bee(&self, bee: Bee) -> HiveResult<()> {
        if self.registry.get().await.bee(&bee.id).is_some() {
            return Err(HiveError::AlreadyExists(format!("agent '{}'", bee.id)));
        }
        let auto_connect = self.auto_connect_human;
        self.registry
            .update(|cfg| {
                let id = bee.id.clone();
                cfg.bees.push(bee.clone());
                if auto_connect {
                    let mut edges = directed_edges(cfg);
                    edges.insert((NodeId::human(), id.clone()));
                    edges.insert((id, NodeId::human()));
                    cfg.connections = edges_to_connections(edges);
                }
            })
            .await?;
        self.root.ensure_agent_dirs(&bee.id).await?;
        self.after_config_change().await
    }

    /// Stop, deregister, destroy the container, and purge data.
    pub async fn remove_node(&self, id: &NodeId) -> HiveResult<()> {
        if self.registry.get().await.bee(id).is_none() {
            return Err(HiveError::NotFound(format!("agent '{id}'")));
        }
        self.supervisor.stop(id).await.ok();
        self.registry
            .update(|cfg| {
                cfg.bees.retain(|b| &b.id != id);
                cfg.connections
                    .retain(|c| &c.from != id && &c.to != id);
            })
            .await?;
        self.supervisor.remove(id).await?;
        self.after_config_change().await
    }

    // --- connections --------------------------------------------------------

    pub async fn connect(&self, from: NodeId, to: NodeId, bidir: bool) -> HiveResult<()> {
        self.mutate_edges(|edges| {
            edges.insert((from.clone(), to.clone()));
            if bidir {
                edges.insert((to.clone(), from.clone()));
            }
        })
        .await
    }

    pub async fn disconnect(&self, from: NodeId, to: NodeId, bidir: bool) -> HiveResult<()> {
        self.mutate_edges(|edges| {
            edges.remove(&(from.clone(), to.clone()));
            if bidir {
                edges.remove(&(to.clone(), from.clone()));
            }
        })
        .await
    }

    pub async fn set_bidirectional(
        &self,
        from: NodeId,
        to: NodeId,
        enabled: bool,
    ) -> HiveResult<()> {
        self.mutate_edges(|edges| {
            if enabled {
                edges.insert((to.clone(), from.clone()));
            } else {
                edges.remove(&(to.clone(), from.clone()));
            }
        })
        .await
    }

    /// Display-merged connection view.
    pub async fn merged_connections(&self) -> Vec<MergedConnection> {
        self.router.topology().await.merge()
    }

    pub async fn detect_cycles(&self) -> Vec<Vec<NodeId>> {
        self.router.topology().await.detect_cycles()
    }

    // --- mail ---------------------------------------------------------------

    /// Send mail as the human. Fails synchronously with `NoRoute` when the
    /// graph has no `human -> to` edge; the send is recorded in the human
    /// outbox history either way it routes downstream.
    pub async fn send_human_mail(
        &self,
        to: NodeId,
        subject: String,
        body: String,
        attachments: Option<Vec<AttachmentRef>>,
    ) -> HiveResult<Mail> {
        let human = NodeId::human();
        self.router.check_route(&human, &to).await?;

        let mut mail = Mail::new(human, to, subject, body, MailType::Human);
        mail.attachments = attachments;
        self.human_outbox.append(mail.clone()).await?;
        self.bus.publish(HiveEvent::MailSent {
            mail: Box::new(mail.clone()),
        });
        self.router.route(mail.clone()).await;
        Ok(mail)
    }

    pub async fn human_inbox(&self) -> HiveResult<Vec<Mail>> {
        self.human_inbox.list().await
    }

    pub async fn human_outbox(&self) -> HiveResult<Vec<Mail>> {
        self.human_outbox.list().await
    }

    /// Enumerate a node's pending inbox mail without consuming it.
    pub async fn node_inbox(&self, id: &NodeId) -> HiveResult<Vec<Mail>> {
        mail_store::read_queue(&self.root.inbox_for(id)?).await
    }

    pub async fn node_outbox(&self, id: &NodeId) -> HiveResult<Vec<Mail>> {
        mail_store::read_queue(&self.root.outbox_for(id)?).await
    }

    pub async fn counts(&self) -> HiveResult<BTreeMap<NodeId, QueueSnapshot>> {
        self.counter.snapshot().await
    }

    // --- agents -------------------------------------------------------------

    pub async fn start_agent(&self, id: &NodeId) -> HiveResult<BeeStatus> {
        self.supervisor.start(id).await
    }

    pub async fn stop_agent(&self, id: &NodeId) -> HiveResult<BeeStatus> {
        self.supervisor.stop(id).await
    }

    pub async fn agent_status(&self, id: &NodeId) -> HiveResult<BeeStatus> {
        if self.registry.get().await.bee(id).is_none() {
            return Err(HiveError::UnknownNode(id.clone()));
        }
        self.supervisor.status(id).await
    }

    pub async fn list_agents(&self) -> HiveResult<Vec<BeeStatus>> {
        self.supervisor.list().await
    }

    pub async fn hierarchy(&self, id: &NodeId) -> HiveResult<HierarchyFile> {
        let swarm = self.registry.get().await;
        if swarm.bee(id).is_none() {
            return Err(HiveError::UnknownNode(id.clone()));
        }
        Ok(self.supervisor.hierarchy_for(&swarm, id).await)
    }

    /// Tail of the agent's append-only transcript log.
    pub async fn transcript(&self, id: &NodeId, limit: usize) -> HiveResult<Vec<String>> {
        if self.registry.get().await.bee(id).is_none() {
            return Err(HiveError::UnknownNode(id.clone()));
        }
        let path = self.root.transcript_path(id);
        if !fs::try_exists(&path).await? {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&path).await?;
        let lines: Vec<String> = contents.lines().map(str::to_string).collect();
        let start = lines.len().saturating_sub(limit);
        Ok(lines[start..].to_vec())
    }

    // --- events, files, canvas ----------------------------------------------

    pub fn subscribe(&self) -> EventStream {
        self.bus.subscribe()
    }

    pub async fn upload_file(
        &self,
        filename: &str,
        mime_type: &str,
        bytes: &[u8],
    ) -> HiveResult<AttachmentRef> {
        self.blobs.store(filename, mime_type, bytes).await
    }

    pub async fn fetch_file(&self, id: &str) -> HiveResult<(BlobMeta, Vec<u8>)> {
        self.blobs.fetch(id).await
    }

    pub async fn file_meta(&self, id: &str) -> HiveResult<BlobMeta> {
        self.blobs.meta(id).await
    }

    /// Opaque canvas layout passthrough.
    pub async fn canvas_get(&self) -> HiveResult<serde_json::Value> {
        let path = self.root.canvas_path();
        if !fs::try_exists(&path).await? {
            return Ok(serde_json::Value::Null);
        }
        let bytes = fs::read(&path).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| HiveError::Validation(format!("canvas layout unreadable: {e}")))
    }

    pub async fn canvas_put(&self, layout: serde_json::Value) -> HiveResult<()> {
        let json = serde_json::to_vec_pretty(&layout)
            .map_err(|e| HiveError::Validation(format!("canvas serialization failed: {e}")))?;
        let path = self.root.canvas_path();
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &json).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    // --- internals ----------------------------------------------------------

    async fn mutate_edges<F>(&self, apply: F) -> HiveResult<()>
    where
        F: FnOnce(&mut BTreeSet<(NodeId, NodeId)>),
    {
        self.registry
            .update(|cfg| {
                let mut edges = directed_edges(cfg);
                apply(&mut edges);
                cfg.connections = edges_to_connections(edges);
            })
            .await?;
        self.after_config_change().await
    }

    /// Shared tail of every registry mutation.
    async fn after_config_change(&self) -> HiveResult<()> {
        let swarm = self.registry.get().await;
        self.router
            .set_topology(Arc::new(Topology::from_connections(&swarm.connections)))
            .await;
        self.supervisor.refresh_hierarchies().await?;
        self.sync_counter(&swarm).await?;
        self.bus.publish(HiveEvent::SwarmUpdated);
        Ok(())
    }

    async fn sync_counter(&self, swarm: &SwarmConfig) -> HiveResult<()> {
        for bee in &swarm.bees {
            self.counter.register(bee.id.clone());
        }
        for mailbox in &swarm.mailboxes {
            if let Some(name) = mailbox.id.mailbox_name() {
                self.root.ensure_mailbox_dirs(name).await?;
            }
            self.counter.register(mailbox.id.clone());
        }
        Ok(())
    }
}

/// Decompose the persisted connection list into a directed-edge set.
fn directed_edges(config: &SwarmConfig) -> BTreeSet<(NodeId, NodeId)> {
    let mut edges = BTreeSet::new();
    for conn in &config.connections {
        edges.insert((conn.from.clone(), conn.to.clone()));
        if conn.bidirectional {
            edges.insert((conn.to.clone(), conn.from.clone()));
        }
    }
    edges
}

/// Canonical persisted form after a connection mutation: one entry per
/// directed edge, sorted.
fn edges_to_connections(edges: BTreeSet<(NodeId, NodeId)>) -> Vec<Connection> {
    edges
        .into_iter()
        .map(|(from, to)| Connection {
            from,
            to,
            bidirectional: false,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::NullBackend;

    async fn hive_in(tmp: &tempfile::TempDir) -> Arc<Hive> {
        let config = HiveConfig {
            data_root: tmp.path().to_path_buf(),
            auto_connect_human: false,
            supervisor: SupervisorConfig::default(),
            container_deadline: DEFAULT_CALL_DEADLINE,
        };
        Hive::bootstrap(config, Arc::new(NullBackend::new()))
            .await
            .unwrap()
    }

    fn bee(id: &str) -> Bee {
        Bee {
            id: NodeId::from(id),
            name: id.to_string(),
            model: None,
            soul: None,
        }
    }

    #[tokio::test]
    async fn test_add_bee_and_connect_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let hive = hive_in(&tmp).await;

        hive.add_bee(bee("b")).await.unwrap();
        hive.connect(NodeId::human(), NodeId::from("b"), true)
            .await
            .unwrap();

        // S3: the registry holds two directed edges...
        let swarm = hive.swarm_get().await;
        assert_eq!(swarm.connections.len(), 2);
        assert!(swarm.connections.iter().all(|c| !c.bidirectional));

        // ...and the merged view collapses them to one entry with the
        // lexicographic minimum as source ("b" < "human").
        let merged = hive.merged_connections().await;
        assert_eq!(merged.len(), 1);
        assert!(merged[0].bidirectional);
        assert_eq!(merged[0].source, NodeId::from("b"));

        hive.shutdown();
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let hive = hive_in(&tmp).await;
        hive.add_bee(bee("a")).await.unwrap();
        hive.add_bee(bee("b")).await.unwrap();

        hive.connect(NodeId::from("a"), NodeId::from("b"), true)
            .await
            .unwrap();
        let once = hive.swarm_get().await.connections;
        hive.connect(NodeId::from("a"), NodeId::from("b"), true)
            .await
            .unwrap();
        let twice = hive.swarm_get().await.connections;
        assert_eq!(once, twice);

        hive.shutdown();
    }

    #[tokio::test]
    async fn test_send_human_mail_requires_route() {
        let tmp = tempfile::tempdir().unwrap();
        let hive = hive_in(&tmp).await;
        hive.add_bee(bee("b")).await.unwrap();

        // No human->b edge yet.
        match hive
            .send_human_mail(NodeId::from("b"), "hi".into(), "x".into(), None)
            .await
        {
            Err(HiveError::NoRoute { .. }) => {}
            other => panic!("expected NoRoute, got {other:?}"),
        }
        assert!(hive.node_inbox(&NodeId::from("b")).await.unwrap().is_empty());
        assert!(hive.human_outbox().await.unwrap().is_empty());

        hive.connect(NodeId::human(), NodeId::from("b"), false)
            .await
            .unwrap();
        let mail = hive
            .send_human_mail(NodeId::from("b"), "hi".into(), "x".into(), None)
            .await
            .unwrap();

        let inbox = hive.node_inbox(&NodeId::from("b")).await.unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].id, mail.id);
        assert_eq!(hive.human_outbox().await.unwrap().len(), 1);

        hive.shutdown();
    }

    #[tokio::test]
    async fn test_auto_connect_human_seeds_edges() {
        let tmp = tempfile::tempdir().unwrap();
        let config = HiveConfig {
            data_root: tmp.path().to_path_buf(),
            auto_connect_human: true,
            supervisor: SupervisorConfig::default(),
            container_deadline: DEFAULT_CALL_DEADLINE,
        };
        let hive = Hive::bootstrap(config, Arc::new(NullBackend::new()))
            .await
            .unwrap();

        hive.add_bee(bee("b")).await.unwrap();
        let merged = hive.merged_connections().await;
        assert_eq!(merged.len(), 1);
        assert!(merged[0].bidirectional);

        hive.shutdown();
    }

    #[tokio::test]
    async fn test_remove_node_purges_everything() {
        let tmp = tempfile::tempdir().unwrap();
        let hive = hive_in(&tmp).await;
        hive.add_bee(bee("b")).await.unwrap();
        hive.connect(NodeId::human(), NodeId::from("b"), true)
            .await
            .unwrap();
        hive.start_agent(&NodeId::from("b")).await.unwrap();

        hive.remove_node(&NodeId::from("b")).await.unwrap();
        let swarm = hive.swarm_get().await;
        assert!(swarm.bees.is_empty());
        assert!(swarm.connections.is_empty());
        assert!(!tmp.path().join("agents/b").exists());

        hive.shutdown();
    }

    #[tokio::test]
    async fn test_swarm_persists_across_bootstrap() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let hive = hive_in(&tmp).await;
            hive.add_bee(bee("b")).await.unwrap();
            hive.connect(NodeId::human(), NodeId::from("b"), false)
                .await
                .unwrap();
            hive.shutdown();
        }
        let hive = hive_in(&tmp).await;
        let swarm = hive.swarm_get().await;
        assert_eq!(swarm.bees.len(), 1);
        assert_eq!(swarm.connections.len(), 1);
        hive.shutdown();
    }

    #[tokio::test]
    async fn test_canvas_passthrough() {
        let tmp = tempfile::tempdir().unwrap();
        let hive = hive_in(&tmp).await;
        assert_eq!(hive.canvas_get().await.unwrap(), serde_json::Value::Null);
        let layout = serde_json::json!({"nodes": [{"id": "b", "x": 10, "y": 20}]});
        hive.canvas_put(layout.clone()).await.unwrap();
        assert_eq!(hive.canvas_get().await.unwrap(), layout);
        hive.shutdown();
    }
}
