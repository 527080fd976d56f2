//! Persistent swarm registry: `<root>/swarm.json`.
//!
//! All mutations flow through [`SwarmRegistry`]. The single-writer mutex and
//! the clone-on-read snapshot keep readers consistent while a writer is
//! mid-mutation; persistence is temp-write + fsync + rename.

use std::path::PathBuf;

use apiary_core::{HiveError, HiveResult, SwarmConfig};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

pub struct SwarmRegistry {
    path: PathBuf,
    inner: Mutex<SwarmConfig>,
}

impl SwarmRegistry {
    /// Load the registry from disk, or start empty if no file exists yet.
    pub async fn open(path: PathBuf) -> HiveResult<Self> {
        let config = if fs::try_exists(&path).await? {
            let bytes = fs::read(&path).await?;
            serde_json::from_slice(&bytes)
                .map_err(|e| HiveError::Validation(format!("swarm.json unreadable: {e}")))?
        } else {
            SwarmConfig::default()
        };
        Ok(Self {
            path,
            inner: Mutex::new(config),
        })
    }

    /// Consistent snapshot of the current configuration.
    pub async fn get(&self) -> SwarmConfig {
        self.inner.lock().await.clone()
    }

    /// Validate and persist a full replacement configuration.
    pub async fn put(&self, config: SwarmConfig) -> HiveResult<()> {
        config.validate()?;
        let mut guard = self.inner.lock().await;
        self.persist(&config).await?;
        *guard = config;
        Ok(())
    }

    /// Apply a mutation under the writer lock; the result is validated and
    /// persisted before the in-memory copy is replaced.
    pub async fn update<F>(&self, mutate: F) -> HiveResult<SwarmConfig>
    where
        F: FnOnce(&mut SwarmConfig),
    {
        let mut guard = self.inner.lock().await;
        let mut next = guard.clone();
        mutate(&mut next);
        next.validate()?;
        self.persist(&next).await?;
        *guard = next.clone();
        Ok(next)
    }

    async fn persist(&self, config: &SwarmConfig) -> HiveResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(config)
            .map_err(|e| HiveError::Validation(format!("swarm serialization failed: {e}")))?;
        let tmp = self.path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&json).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apiary_core::{Bee, Connection, NodeId};
    use std::collections::BTreeSet;

    fn sample() -> SwarmConfig {
        SwarmConfig {
            id: "swarm-1".to_string(),
            name: "test".to_string(),
            bees: vec![Bee {
                id: NodeId::from("b"),
                name: "B".to_string(),
                model: None,
                soul: None,
            }],
            mailboxes: vec![],
            connections: vec![Connection {
                from: NodeId::human(),
                to: NodeId::from("b"),
                bidirectional: true,
            }],
        }
    }

    #[tokio::test]
    async fn test_put_then_reopen_roundtrips() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("swarm.json");

        let registry = SwarmRegistry::open(path.clone()).await.unwrap();
        registry.put(sample()).await.unwrap();
        drop(registry);

        let reopened = SwarmRegistry::open(path).await.unwrap();
        let loaded = reopened.get().await;
        assert_eq!(loaded.id, "swarm-1");
        assert_eq!(loaded.bees, sample().bees);
        // Connections compare as sets.
        let loaded_conns: BTreeSet<(String, String, bool)> = loaded
            .connections
            .iter()
            .map(|c| (c.from.to_string(), c.to.to_string(), c.bidirectional))
            .collect();
        let expected: BTreeSet<(String, String, bool)> = sample()
            .connections
            .iter()
            .map(|c| (c.from.to_string(), c.to.to_string(), c.bidirectional))
            .collect();
        assert_eq!(loaded_conns, expected);
    }

    #[tokio::test]
    async fn test_put_rejects_invalid_config() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = SwarmRegistry::open(tmp.path().join("swarm.json"))
            .await
            .unwrap();
        let mut bad = sample();
        bad.connections.push(Connection {
            from: NodeId::from("b"),
            to: NodeId::from("ghost"),
            bidirectional: false,
        });
        assert!(registry.put(bad).await.is_err());
        // The failed put must not have replaced the in-memory state.
        assert!(registry.get().await.connections.len() <= 1);
    }

    #[tokio::test]
    async fn test_update_applies_mutation() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = SwarmRegistry::open(tmp.path().join("swarm.json"))
            .await
            .unwrap();
        registry.put(sample()).await.unwrap();
        let next = registry
            .update(|cfg| {
                cfg.bees.push(Bee {
                    id: NodeId::from("c"),
                    name: "C".to_string(),
                    model: None,
                    soul: None,
                });
            })
            .await
            .unwrap();
        assert_eq!(next.bees.len(), 2);
        assert_eq!(registry.get().await.bees.len(), 2);
    }

    #[tokio::test]
    async fn test_update_rolls_back_on_validation_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = SwarmRegistry::open(tmp.path().join("swarm.json"))
            .await
            .unwrap();
        registry.put(sample()).await.unwrap();
        let result = registry
            .update(|cfg| {
                let id = cfg.bees[0].id.clone();
                cfg.connections.push(Connection {
                    from: id.clone(),
                    to: id,
                    bidirectional: false,
                });
            })
            .await;
        assert!(result.is_err());
        assert_eq!(registry.get().await.connections.len(), 1);
    }
}
