//! Per-agent outbox watching.
//!
//! Each running agent gets one long-lived task observing its outbox
//! directory. The task rescans on startup (files written while no watcher
//! was alive still drain), debounces filesystem events so a producer's
//! rename-in has settled, and hands files to the router strictly in sorted
//! order so FIFO per source holds.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use apiary_core::NodeId;
use apiary_store::mail_store;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::router::MailRouter;

/// Quiescence window after the last filesystem event before draining.
const DEBOUNCE: Duration = Duration::from_millis(50);

/// Fallback poll cadence when no OS watcher could be established.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

struct WatchHandle {
    cancel: CancellationToken,
}

/// Manager for the per-agent watcher tasks.
#[derive(Default)]
pub struct OutboxWatchers {
    tasks: Mutex<HashMap<NodeId, WatchHandle>>,
}

impl OutboxWatchers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start watching an agent's outbox. Idempotent: an existing watcher
    /// for the same agent is cancelled and replaced.
    pub fn watch(&self, agent: NodeId, outbox: PathBuf, router: Arc<MailRouter>) {
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let task_agent = agent.clone();

        let mut tasks = self.tasks.lock().expect("watcher table lock poisoned");
        if let Some(previous) = tasks.insert(agent, WatchHandle { cancel }) {
            previous.cancel.cancel();
        }
        drop(tasks);

        tokio::spawn(async move {
            run_watcher(task_agent, outbox, router, task_cancel).await;
        });
    }

    /// Stop the watcher for an agent, releasing its OS watches.
    pub fn unwatch(&self, agent: &NodeId) {
        let mut tasks = self.tasks.lock().expect("watcher table lock poisoned");
        if let Some(handle) = tasks.remove(agent) {
            handle.cancel.cancel();
        }
    }

    pub fn unwatch_all(&self) {
        let mut tasks = self.tasks.lock().expect("watcher table lock poisoned");
        for (_, handle) in tasks.drain() {
            handle.cancel.cancel();
        }
    }

    pub fn is_watching(&self, agent: &NodeId) -> bool {
        self.tasks
            .lock()
            .expect("watcher table lock poisoned")
            .contains_key(agent)
    }
}

async fn run_watcher(
    agent: NodeId,
    outbox: PathBuf,
    router: Arc<MailRouter>,
    cancel: CancellationToken,
) {
    if let Err(err) = tokio::fs::create_dir_all(&outbox).await {
        tracing::error!(agent = %agent, error = %err, "cannot create outbox dir; watcher exiting");
        return;
    }

    // Bridge notify's callback into the async world. The task keeps one
    // sender alive so the channel stays open in polling fallback mode.
    let (event_tx, mut event_rx) = mpsc::channel::<Event>(100);
    let callback_tx = event_tx.clone();
    let watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                let _ = callback_tx.blocking_send(event);
            }
        },
        Config::default(),
    )
    .and_then(|mut w| w.watch(&outbox, RecursiveMode::NonRecursive).map(|()| w));

    let watcher = match watcher {
        Ok(w) => Some(w),
        Err(err) => {
            tracing::warn!(
                agent = %agent,
                error = %err,
                "outbox watch unavailable; falling back to polling"
            );
            None
        }
    };

    // Startup rescan: drain whatever accumulated while unwatched.
    drain(&outbox, &router).await;

    let mut pending = false;
    loop {
        let wait = if pending {
            DEBOUNCE
        } else if watcher.is_none() {
            POLL_INTERVAL
        } else {
            Duration::from_secs(3600)
        };

        tokio::select! {
            () = cancel.cancelled() => break,

            event = event_rx.recv() => {
                match event {
                    Some(event) => {
                        if matches!(
                            event.kind,
                            EventKind::Create(_) | EventKind::Modify(_)
                        ) {
                            pending = true;
                        }
                    }
                    None => break,
                }
            }

            _ = tokio::time::sleep(wait) => {
                pending = false;
                drain(&outbox, &router).await;
            }
        }
    }
    drop(watcher);
    tracing::debug!(agent = %agent, "outbox watcher stopped");
}

/// Hand every visible outbox file to the router, oldest first. Delivery is
/// synchronous per file, which is what preserves FIFO per source.
async fn drain(outbox: &PathBuf, router: &Arc<MailRouter>) {
    let files = match mail_store::list_queue(outbox).await {
        Ok(files) => files,
        Err(err) => {
            tracing::warn!(dir = %outbox.display(), error = %err, "outbox listing failed");
            return;
        }
    };
    for path in files {
        router.consume_outbox_file(&path).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use apiary_core::{Mail, MailType, Topology};
    use apiary_store::mail_store::{read_queue, write_mail};
    use apiary_store::{DataRoot, HumanStore};

    async fn router_for(root: &DataRoot, edges: &[(&str, &str)]) -> Arc<MailRouter> {
        root.ensure_base_dirs().await.unwrap();
        let mut topology = Topology::default();
        for (from, to) in edges {
            topology.add_edge(NodeId::from(*from), NodeId::from(*to), false);
        }
        Arc::new(MailRouter::new(
            root.clone(),
            Arc::new(topology),
            Arc::new(HumanStore::new(root.human_inbox_path())),
            Arc::new(EventBus::default()),
        ))
    }

    async fn wait_for<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..100 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("condition not reached within 5s");
    }

    #[tokio::test]
    async fn test_startup_rescan_drains_preexisting_files() {
        let tmp = tempfile::tempdir().unwrap();
        let root = DataRoot::new(tmp.path());
        let router = router_for(&root, &[("a", "b")]).await;
        let outbox = root.agent_outbox(&NodeId::from("a"));

        // File written before any watcher existed.
        let mail = Mail::new("a", "b", "s", "x", MailType::Agent);
        write_mail(&outbox, &mail).await.unwrap();

        let watchers = OutboxWatchers::new();
        watchers.watch(NodeId::from("a"), outbox.clone(), router);

        let inbox = root.agent_inbox(&NodeId::from("b"));
        wait_for(|| {
            let inbox = inbox.clone();
            async move {
                mail_store::list_queue(&inbox)
                    .await
                    .map(|f| f.len() == 1)
                    .unwrap_or(false)
            }
        })
        .await;

        watchers.unwatch_all();
    }

    #[tokio::test]
    async fn test_new_files_drain_in_fifo_order() {
        let tmp = tempfile::tempdir().unwrap();
        let root = DataRoot::new(tmp.path());
        let router = router_for(&root, &[("a", "b")]).await;
        let outbox = root.agent_outbox(&NodeId::from("a"));

        let watchers = OutboxWatchers::new();
        watchers.watch(NodeId::from("a"), outbox.clone(), router);
        // Give the watcher a beat to finish its startup rescan.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut expected = Vec::new();
        for i in 0..3 {
            let mut mail = Mail::new("a", "b", format!("m{i}"), "x", MailType::Agent);
            mail.timestamp = chrono::Utc::now() + chrono::Duration::milliseconds(i);
            expected.push(mail.id);
            write_mail(&outbox, &mail).await.unwrap();
        }

        let inbox = root.agent_inbox(&NodeId::from("b"));
        wait_for(|| {
            let inbox = inbox.clone();
            async move {
                mail_store::list_queue(&inbox)
                    .await
                    .map(|f| f.len() == 3)
                    .unwrap_or(false)
            }
        })
        .await;

        let delivered = read_queue(&inbox).await.unwrap();
        let ids: Vec<_> = delivered.iter().map(|m| m.id).collect();
        assert_eq!(ids, expected);

        watchers.unwatch_all();
    }

    #[tokio::test]
    async fn test_watch_is_idempotent_and_unwatch_stops() {
        let tmp = tempfile::tempdir().unwrap();
        let root = DataRoot::new(tmp.path());
        let router = router_for(&root, &[("a", "b")]).await;
        let outbox = root.agent_outbox(&NodeId::from("a"));

        let watchers = OutboxWatchers::new();
        let agent = NodeId::from("a");
        watchers.watch(agent.clone(), outbox.clone(), router.clone());
        watchers.watch(agent.clone(), outbox.clone(), router.clone());
        assert!(watchers.is_watching(&agent));

        watchers.unwatch(&agent);
        assert!(!watchers.is_watching(&agent));
    }
}
