//! Real-time queue-depth tracking.
//!
//! One recursive watch over the agents and mailboxes trees marks the
//! counter dirty; a single coalescing timer recounts and publishes
//! `mail:counts` only when the snapshot actually changed. Counts are
//! recomputed from directory listings, so the snapshot converges to the
//! true file counts after any burst.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use apiary_core::{HiveEvent, HiveResult, NodeId, QueueSnapshot};
use apiary_store::{mail_store, DataRoot, HumanStore};
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bus::EventBus;

/// Coalescing window between recounts.
pub const DEFAULT_COALESCE: Duration = Duration::from_millis(200);

struct CounterInner {
    root: DataRoot,
    human_inbox: Arc<HumanStore>,
    human_outbox: Arc<HumanStore>,
    nodes: Mutex<BTreeSet<NodeId>>,
    running: Mutex<BTreeSet<NodeId>>,
    dirty: AtomicBool,
    bus: Arc<EventBus>,
}

#[derive(Clone)]
pub struct InboxCounter {
    inner: Arc<CounterInner>,
}

impl InboxCounter {
    pub fn new(
        root: DataRoot,
        human_inbox: Arc<HumanStore>,
        human_outbox: Arc<HumanStore>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            inner: Arc::new(CounterInner {
                root,
                human_inbox,
                human_outbox,
                nodes: Mutex::new(BTreeSet::new()),
                running: Mutex::new(BTreeSet::new()),
                dirty: AtomicBool::new(true),
                bus,
            }),
        }
    }

    /// Track a node's inbox and outbox. The human node is always tracked.
    pub fn register(&self, node: NodeId) {
        self.inner
            .nodes
            .lock()
            .expect("counter lock poisoned")
            .insert(node);
        self.inner.dirty.store(true, Ordering::Relaxed);
    }

    pub fn unregister(&self, node: &NodeId) {
        self.inner
            .nodes
            .lock()
            .expect("counter lock poisoned")
            .remove(node);
        self.inner.dirty.store(true, Ordering::Relaxed);
    }

    /// Mark an agent as running; `processing` derives from this.
    pub fn set_running(&self, node: NodeId, running: bool) {
        let mut set = self.inner.running.lock().expect("counter lock poisoned");
        if running {
            set.insert(node);
        } else {
            set.remove(&node);
        }
        self.inner.dirty.store(true, Ordering::Relaxed);
    }

    /// Recompute the full snapshot from directory listings.
    pub async fn snapshot(&self) -> HiveResult<BTreeMap<NodeId, QueueSnapshot>> {
        let nodes: Vec<NodeId> = {
            let guard = self.inner.nodes.lock().expect("counter lock poisoned");
            guard.iter().cloned().collect()
        };
        let running: BTreeSet<NodeId> = {
            let guard = self.inner.running.lock().expect("counter lock poisoned");
            guard.clone()
        };

        let mut counts = BTreeMap::new();
        for node in nodes {
            let inbox = mail_store::queue_len(&self.inner.root.inbox_for(&node)?).await?;
            let outbox = mail_store::queue_len(&self.inner.root.outbox_for(&node)?).await?;
            let processing = running.contains(&node) && inbox > 0;
            counts.insert(
                node,
                QueueSnapshot {
                    inbox,
                    outbox,
                    processing,
                },
            );
        }

        counts.insert(
            NodeId::human(),
            QueueSnapshot {
                inbox: self.inner.human_inbox.len().await?,
                outbox: self.inner.human_outbox.len().await?,
                processing: false,
            },
        );
        Ok(counts)
    }

    /// Spawn the watch + coalesce task. Cancellation stops it within the
    /// coalescing window.
    pub fn spawn(&self, cancel: CancellationToken) {
        let counter = self.clone();
        tokio::spawn(async move {
            counter.run(cancel).await;
        });
    }

    async fn run(&self, cancel: CancellationToken) {
        let (event_tx, mut event_rx) = mpsc::channel::<Event>(256);
        let callback_tx = event_tx.clone();
        let watched_dirs = [
            self.inner.root.path().join("agents"),
            self.inner.root.path().join("mailboxes"),
            self.inner.root.path().join("human"),
        ];
        let watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| {
                if let Ok(event) = res {
                    let _ = callback_tx.blocking_send(event);
                }
            },
            Config::default(),
        )
        .and_then(|mut w| {
            for dir in &watched_dirs {
                if dir.is_dir() {
                    w.watch(dir, RecursiveMode::Recursive)?;
                }
            }
            Ok(w)
        });
        let _watcher = match watcher {
            Ok(w) => Some(w),
            Err(err) => {
                tracing::warn!(error = %err, "counter watch unavailable; relying on timer only");
                None
            }
        };

        let mut last: BTreeMap<NodeId, QueueSnapshot> = BTreeMap::new();
        let mut tick = tokio::time::interval(DEFAULT_COALESCE);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,

                event = event_rx.recv() => {
                    if event.is_some() {
                        self.inner.dirty.store(true, Ordering::Relaxed);
                    } else {
                        break;
                    }
                }

                _ = tick.tick() => {
                    if !self.inner.dirty.swap(false, Ordering::Relaxed) {
                        continue;
                    }
                    match self.snapshot().await {
                        Ok(counts) => {
                            if counts != last {
                                last = counts.clone();
                                self.inner.bus.publish(HiveEvent::MailCounts { counts });
                            }
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "queue recount failed");
                        }
                    }
                }
            }
        }
        tracing::debug!("inbox counter stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apiary_core::{Mail, MailType};
    use apiary_store::mail_store::write_mail;

    async fn fixture() -> (tempfile::TempDir, InboxCounter, Arc<EventBus>) {
        let tmp = tempfile::tempdir().unwrap();
        let root = DataRoot::new(tmp.path());
        root.ensure_base_dirs().await.unwrap();
        let bus = Arc::new(EventBus::default());
        let counter = InboxCounter::new(
            root,
            Arc::new(HumanStore::new(tmp.path().join("human/inbox.json"))),
            Arc::new(HumanStore::new(tmp.path().join("human/outbox.json"))),
            bus.clone(),
        );
        (tmp, counter, bus)
    }

    #[tokio::test]
    async fn test_snapshot_matches_directory_contents() {
        let (tmp, counter, _bus) = fixture().await;
        let root = DataRoot::new(tmp.path());
        let node = NodeId::from("b");
        counter.register(node.clone());

        for _ in 0..3 {
            write_mail(
                &root.agent_inbox(&node),
                &Mail::new("human", "b", "s", "x", MailType::Human),
            )
            .await
            .unwrap();
        }
        write_mail(
            &root.agent_outbox(&node),
            &Mail::new("b", "human", "s", "x", MailType::Agent),
        )
        .await
        .unwrap();

        let counts = counter.snapshot().await.unwrap();
        let snap = counts.get(&node).unwrap();
        assert_eq!(snap.inbox, 3);
        assert_eq!(snap.outbox, 1);
        assert!(!snap.processing, "not running yet");

        counter.set_running(node.clone(), true);
        let counts = counter.snapshot().await.unwrap();
        assert!(counts.get(&node).unwrap().processing);
    }

    #[tokio::test]
    async fn test_snapshot_always_includes_human() {
        let (_tmp, counter, _bus) = fixture().await;
        let counts = counter.snapshot().await.unwrap();
        let human = counts.get(&NodeId::human()).unwrap();
        assert_eq!(human.inbox, 0);
        assert!(!human.processing);
    }

    #[tokio::test]
    async fn test_counts_converge_after_drain() {
        let (tmp, counter, _bus) = fixture().await;
        let root = DataRoot::new(tmp.path());
        let node = NodeId::from("b");
        counter.register(node.clone());

        let path = write_mail(
            &root.agent_inbox(&node),
            &Mail::new("human", "b", "s", "x", MailType::Human),
        )
        .await
        .unwrap();
        assert_eq!(counter.snapshot().await.unwrap()[&node].inbox, 1);

        tokio::fs::remove_file(&path).await.unwrap();
        assert_eq!(counter.snapshot().await.unwrap()[&node].inbox, 0);
    }

    #[tokio::test]
    async fn test_coalesced_emission_on_change() {
        let (tmp, counter, bus) = fixture().await;
        let root = DataRoot::new(tmp.path());
        let node = NodeId::from("b");
        root.ensure_agent_dirs(&node).await.unwrap();
        counter.register(node.clone());

        let mut stream = bus.subscribe();
        let cancel = CancellationToken::new();
        counter.spawn(cancel.clone());

        write_mail(
            &root.agent_inbox(&node),
            &Mail::new("human", "b", "s", "x", MailType::Human),
        )
        .await
        .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match stream.recv().await {
                    Some(HiveEvent::MailCounts { counts })
                        if counts.get(&node).map(|s| s.inbox) == Some(1) =>
                    {
                        return counts;
                    }
                    Some(_) => continue,
                    None => panic!("bus closed before counts arrived"),
                }
            }
        })
        .await
        .expect("expected a mail:counts event");
        assert_eq!(event[&node].inbox, 1);

        cancel.cancel();
    }
}
