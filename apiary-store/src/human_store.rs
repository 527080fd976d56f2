//! Single-file mail store for the human endpoint.
//!
//! Unlike agent queues, the human inbox and outbox are each one JSON array
//! rewritten atomically on every append. The array form keeps history: the
//! operator's mail is browsed, not consumed.

use std::path::PathBuf;

use apiary_core::{HiveError, HiveResult, Mail};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Mail store over one JSON-array file.
pub struct HumanStore {
    path: PathBuf,
    // Serializes read-modify-write cycles on the backing file.
    write_lock: Mutex<()>,
}

impl HumanStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub async fn list(&self) -> HiveResult<Vec<Mail>> {
        if !fs::try_exists(&self.path).await? {
            return Ok(Vec::new());
        }
        let bytes = fs::read(&self.path).await?;
        serde_json::from_slice(&bytes).map_err(|e| HiveError::MailCorrupt {
            path: self.path.clone(),
            reason: e.to_string(),
        })
    }

    pub async fn append(&self, mail: Mail) -> HiveResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut mails = self.list().await?;
        mails.push(mail);
        self.rewrite(&mails).await
    }

    pub async fn len(&self) -> HiveResult<usize> {
        Ok(self.list().await?.len())
    }

    pub async fn is_empty(&self) -> HiveResult<bool> {
        Ok(self.len().await? == 0)
    }

    async fn rewrite(&self, mails: &[Mail]) -> HiveResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(mails)
            .map_err(|e| HiveError::Validation(format!("mail serialization failed: {e}")))?;
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
