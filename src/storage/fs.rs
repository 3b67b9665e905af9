//! Filesystem object store for single-box deployments

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use super::ObjectStore;
use crate::types::{HelmsmanError, Result};

pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Keys are relative slash paths; anything escaping the root is rejected
    fn resolve(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty()
            || key.starts_with('/')
            || key.split('/').any(|part| part.is_empty() || part == "." || part == "..")
        {
            return Err(HelmsmanError::BadRequest(format!(
                "invalid storage key '{}'",
                key
            )));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn upload(&self, local: &Path, key: &str) -> Result<()> {
        let target = self.resolve(key)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(local, &target).await.map_err(|e| {
            HelmsmanError::Storage(format!("upload {} -> {}: {}", local.display(), key, e))
        })?;
        Ok(())
    }

    async fn download(&self, key: &str, local: &Path) -> Result<()> {
        let source = self.resolve(key)?;
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&source, local).await.map_err(|e| {
            HelmsmanError::Storage(format!("download {} -> {}: {}", key, local.display(), e))
        })?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let target = self.resolve(key)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(HelmsmanError::Storage(format!("remove {}: {}", key, e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_roundtrip_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path().join("store"));

        let src = dir.path().join("archive.tar.gz");
        tokio::fs::write(&src, b"payload").await.unwrap();

        store
            .upload(&src, "latest/bot-1/latest.tar.gz")
            .await
            .unwrap();
        let dst = dir.path().join("restored.tar.gz");
        store
            .download("latest/bot-1/latest.tar.gz", &dst)
            .await
            .unwrap();
        assert_eq!(tokio::fs::read(&dst).await.unwrap(), b"payload");

        store.remove("latest/bot-1/latest.tar.gz").await.unwrap();
        assert!(store
            .download("latest/bot-1/latest.tar.gz", &dst)
            .await
            .is_err());
        // Removing again is fine
        store.remove("latest/bot-1/latest.tar.gz").await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path().to_path_buf());
        let src = dir.path().join("f");
        tokio::fs::write(&src, b"x").await.unwrap();

        for key in ["../escape", "/abs", "a//b", ""] {
            assert!(store.upload(&src, key).await.is_err(), "{}", key);
        }
    }
}
