use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaCategory {
    Image,
    Video,
}

impl MediaCategory {
    /// Maps a declared MIME type onto a supported category.
    pub fn classify(content_type: &str) -> Option<Self> {
        let content_type = content_type.trim().to_ascii_lowercase();
        if content_type.starts_with("image/") {
            Some(MediaCategory::Image)
        } else if content_type.starts_with("video/") {
            Some(MediaCategory::Video)
        } else {
            None
        }
    }

    pub fn directory(&self) -> &'static str {
        match self {
            MediaCategory::Image => "picture",
            MediaCategory::Video => "video",
        }
    }
}

/// An uploaded file as received from the client.
#[derive(Debug, Clone)]
pub struct Upload {
    pub file_name: Option<String>,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

#[async_trait]
pub trait BlobStorage: Send + Sync {
    /// Stores the upload and returns the path it can be fetched from.
    async fn store(&self, category: MediaCategory, upload: &Upload) -> Result<String>;
}

/// Writes attachments under a local directory served at `url_prefix`.
pub struct LocalBlobStore {
    root: PathBuf,
    url_prefix: String,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>, url_prefix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            url_prefix: url_prefix.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl BlobStorage for LocalBlobStore {
    async fn store(&self, category: MediaCategory, upload: &Upload) -> Result<String> {
        let dir = self.root.join(category.directory());
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        let name = match upload.file_name.as_deref().and_then(extension) {
            Some(ext) => format!("{}.{}", Uuid::new_v4().simple(), ext),
            None => Uuid::new_v4().simple().to_string(),
        };

        let path = dir.join(&name);
        tokio::fs::write(&path, &upload.bytes)
            .await
            .with_context(|| format!("Failed to write attachment {}", path.display()))?;

        info!(path = %path.display(), bytes = upload.bytes.len(), "attachment stored");

        Ok(format!("{}/{}/{}", self.url_prefix, category.directory(), name))
    }
}

/// A short alphanumeric extension, or nothing.
fn extension(file_name: &str) -> Option<String> {
    let (_, ext) = file_name.rsplit_once('.')?;
    if ext.is_empty() || ext.len() > 8 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}
