//! Attachment blob store: `files/<fileId>.<ext>` plus a sidecar meta file.
//!
//! Mail carries [`AttachmentRef`]s only; the bytes live here and are shared
//! across hops by id.

use std::path::{Path, PathBuf};

use apiary_core::{AttachmentRef, HiveError, HiveResult};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobMeta {
    pub id: String,
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
    pub uploaded_at: chrono::DateTime<chrono::Utc>,
}

impl From<&BlobMeta> for AttachmentRef {
    fn from(meta: &BlobMeta) -> Self {
        Self {
            id: meta.id.clone(),
            filename: meta.filename.clone(),
            mime_type: meta.mime_type.clone(),
            size: meta.size,
        }
    }
}

pub struct BlobStore {
    dir: PathBuf,
}

impl BlobStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn extension_of(filename: &str) -> &str {
        Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("bin")
    }

    fn blob_path(&self, id: &str, ext: &str) -> PathBuf {
        self.dir.join(format!("{id}.{ext}"))
    }

    fn meta_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.meta.json"))
    }

    /// Store bytes and return the reference mail will carry.
    pub async fn store(
        &self,
        filename: &str,
        mime_type: &str,
        bytes: &[u8],
    ) -> HiveResult<AttachmentRef> {
        fs::create_dir_all(&self.dir).await?;
        let id = Uuid::new_v4().to_string();
        let ext = Self::extension_of(filename);

        let blob_path = self.blob_path(&id, ext);
        let tmp = blob_path.with_extension(format!("{ext}.tmp"));
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &blob_path).await?;

        let meta = BlobMeta {
            id: id.clone(),
            filename: filename.to_string(),
            mime_type: mime_type.to_string(),
            size: bytes.len() as u64,
            uploaded_at: chrono::Utc::now(),
        };
        let meta_json = serde_json::to_vec_pretty(&meta)
            .map_err(|e| HiveError::Validation(format!("meta serialization failed: {e}")))?;
        fs::write(self.meta_path(&id), meta_json).await?;

        Ok(AttachmentRef::from(&meta))
    }

    pub async fn meta(&self, id: &str) -> HiveResult<BlobMeta> {
        let path = self.meta_path(id);
        if !fs::try_exists(&path).await? {
            return Err(HiveError::NotFound(format!("file {id}")));
        }
        let bytes = fs::read(&path).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| HiveError::Validation(format!("file meta unreadable: {e}")))
    }

    pub async fn fetch(&self, id: &str) -> HiveResult<(BlobMeta, Vec<u8>)> {
        let meta = self.meta(id).await?;
        let ext = Self::extension_of(&meta.filename);
        let bytes = fs::read(self.blob_path(id, ext)).await?;
        Ok((meta, bytes))
    }
}
