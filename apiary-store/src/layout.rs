//! Data-root path schema.
//!
//! Every path the orchestrator touches is derived here, so the directory
//! convention lives in exactly one place:
//!
//! ```text
//! <root>/swarm.json
//! <root>/canvas-layout.json
//! <root>/human/{inbox.json, outbox.json}
//! <root>/agents/<id>/{inbox, outbox, workspace, state, logs, session}
//! <root>/agents/<id>/soul.md
//! <root>/mailboxes/<name>/{inbox, outbox}
//! <root>/files/<fileId>.<ext> + <fileId>.meta.json
//! <root>/inflight/
//! <root>/deadletter/
//! ```

use std::path::{Path, PathBuf};

use apiary_core::{HiveError, HiveResult, NodeId};
use tokio::fs;

/// Handle on the data root directory.
#[derive(Debug, Clone)]
pub struct DataRoot {
    root: PathBuf,
}

impl DataRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve from `DATA_ROOT`, falling back to the platform data dir.
    pub fn from_env() -> Self {
        let root = std::env::var("DATA_ROOT").map(PathBuf::from).unwrap_or_else(|_| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("apiary")
        });
        Self::new(root)
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn swarm_path(&self) -> PathBuf {
        self.root.join("swarm.json")
    }

    /// Opaque canvas layout, passed through the gateway untouched.
    pub fn canvas_path(&self) -> PathBuf {
        self.root.join("canvas-layout.json")
    }

    pub fn human_inbox_path(&self) -> PathBuf {
        self.root.join("human").join("inbox.json")
    }

    pub fn human_outbox_path(&self) -> PathBuf {
        self.root.join("human").join("outbox.json")
    }

    pub fn agent_dir(&self, id: &NodeId) -> PathBuf {
        self.root.join("agents").join(id.as_str())
    }

    pub fn agent_inbox(&self, id: &NodeId) -> PathBuf {
        self.agent_dir(id).join("inbox")
    }

    pub fn agent_outbox(&self, id: &NodeId) -> PathBuf {
        self.agent_dir(id).join("outbox")
    }

    pub fn agent_state(&self, id: &NodeId) -> PathBuf {
        self.agent_dir(id).join("state")
    }

    pub fn agent_logs(&self, id: &NodeId) -> PathBuf {
        self.agent_dir(id).join("logs")
    }

    pub fn agent_workspace(&self, id: &NodeId) -> PathBuf {
        self.agent_dir(id).join("workspace")
    }

    /// Session directory mounted into the agent container for the runtime's
    /// own conversation state.
    pub fn agent_session(&self, id: &NodeId) -> PathBuf {
        self.agent_dir(id).join("session")
    }

    pub fn soul_path(&self, id: &NodeId) -> PathBuf {
        self.agent_dir(id).join("soul.md")
    }

    pub fn hierarchy_path(&self, id: &NodeId) -> PathBuf {
        self.agent_state(id).join("hierarchy.json")
    }

    pub fn transcript_path(&self, id: &NodeId) -> PathBuf {
        self.agent_logs(id).join("transcript.jsonl")
    }

    pub fn mailbox_dir(&self, name: &str) -> PathBuf {
        self.root.join("mailboxes").join(name)
    }

    pub fn mailbox_inbox(&self, name: &str) -> PathBuf {
        self.mailbox_dir(name).join("inbox")
    }

    pub fn mailbox_outbox(&self, name: &str) -> PathBuf {
        self.mailbox_dir(name).join("outbox")
    }

    pub fn files_dir(&self) -> PathBuf {
        self.root.join("files")
    }

    /// Orchestrator-owned spool for mails between outbox-consume and
    /// inbox-deliver; scanned at startup for crash recovery.
    pub fn inflight_dir(&self) -> PathBuf {
        self.root.join("inflight")
    }

    /// Terminal storage for bounces that could not be delivered anywhere.
    pub fn deadletter_dir(&self) -> PathBuf {
        self.root.join("deadletter")
    }

    /// Resolve the inbox directory for any non-human node id.
    pub fn inbox_for(&self, id: &NodeId) -> HiveResult<PathBuf> {
        if id.is_human() {
            return Err(HiveError::validation(
                "node",
                "the human inbox is a single-file store, not a directory",
            ));
        }
        Ok(match id.mailbox_name() {
            Some(name) => self.mailbox_inbox(name),
            None => self.agent_inbox(id),
        })
    }

    /// Resolve the outbox directory for any non-human node id.
    pub fn outbox_for(&self, id: &NodeId) -> HiveResult<PathBuf> {
        if id.is_human() {
            return Err(HiveError::validation(
                "node",
                "the human outbox is a single-file store, not a directory",
            ));
        }
        Ok(match id.mailbox_name() {
            Some(name) => self.mailbox_outbox(name),
            None => self.agent_outbox(id),
        })
    }

    /// Create the base directory skeleton.
    pub async fn ensure_base_dirs(&self) -> HiveResult<()> {
        for dir in [
            self.root.clone(),
            self.root.join("human"),
            self.root.join("agents"),
            self.root.join("mailboxes"),
            self.files_dir(),
            self.inflight_dir(),
            self.deadletter_dir(),
        ] {
            fs::create_dir_all(&dir).await?;
        }
        Ok(())
    }

    /// Create the full subtree for one agent.
    pub async fn ensure_agent_dirs(&self, id: &NodeId) -> HiveResult<()> {
        for dir in [
            self.agent_inbox(id),
            self.agent_outbox(id),
            self.agent_state(id),
            self.agent_logs(id),
            self.agent_workspace(id),
            self.agent_session(id),
        ] {
            fs::create_dir_all(&dir).await?;
        }
        Ok(())
    }

    pub async fn ensure_mailbox_dirs(&self, name: &str) -> HiveResult<()> {
        fs::create_dir_all(self.mailbox_inbox(name)).await?;
        fs::create_dir_all(self.mailbox_outbox(name)).await?;
        Ok(())
    }

    /// Delete an agent's entire data subtree.
    pub async fn purge_agent(&self, id: &NodeId) -> HiveResult<()> {
        let dir = self.agent_dir(id);
        if fs::try_exists(&dir).await? {
            fs::remove_dir_all(&dir).await?;
        }
        Ok(())
    }
}
