//! Blob storage for persisted index artifacts.
//!
//! [`ObjectStore`] is the capability the index cache persists through;
//! [`LocalStore`] is the filesystem backend. Every write goes through a
//! temp file in the destination directory followed by an atomic rename,
//! so a reader never observes a half-written artifact.

use async_trait::async_trait;
use std::path::PathBuf;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Key of a tenant's vector blob.
pub fn index_blob_key(tenant_id: &str) -> String {
    format!("indexes/{}/index.bin", tenant_id)
}

/// Key of a tenant's slot→chunk sidecar.
pub fn sidecar_key(tenant_id: &str) -> String {
    format!("indexes/{}/slots.map", tenant_id)
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Atomic write: the object appears under `key` complete or not at all.
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;
}

pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        // Keys are engine-generated, but tenant ids flow into them.
        if key.split('/').any(|part| part.is_empty() || part == "." || part == "..") {
            return Err(Error::Storage(format!("invalid object key: {}", key)));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        let parent = path
            .parent()
            .ok_or_else(|| Error::Storage(format!("key has no parent: {}", key)))?;
        tokio::fs::create_dir_all(parent).await?;

        let tmp = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        tokio::fs::write(&tmp, bytes).await?;
        match tokio::fs::rename(&tmp, &path).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                Err(e.into())
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
