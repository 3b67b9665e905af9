//! HTTP object store
//!
//! Forwards blobs to a storage service speaking plain PUT/GET/DELETE on
//! `{base}/{key}`. 5xx responses are treated as transient and retried.

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

use super::{with_backoff, ObjectStore, STORAGE_ATTEMPTS, STORAGE_BACKOFF};
use crate::types::{HelmsmanError, Result};

pub struct HttpObjectStore {
    base_url: String,
    client: reqwest::Client,
}

impl HttpObjectStore {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| HelmsmanError::Config(format!("storage client: {}", e)))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key)
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn upload(&self, local: &Path, key: &str) -> Result<()> {
        let body = tokio::fs::read(local).await?;
        let url = self.url(key);
        with_backoff("storage.upload", STORAGE_ATTEMPTS, STORAGE_BACKOFF, || {
            let body = body.clone();
            let url = url.clone();
            async move {
                let resp = self.client.put(&url).body(body).send().await?;
                if resp.status().is_success() {
                    Ok(())
                } else {
                    Err(HelmsmanError::Storage(format!(
                        "upload {} returned {}",
                        url,
                        resp.status()
                    )))
                }
            }
        })
        .await
    }

    async fn download(&self, key: &str, local: &Path) -> Result<()> {
        let url = self.url(key);
        let bytes = with_backoff("storage.download", STORAGE_ATTEMPTS, STORAGE_BACKOFF, || {
            let url = url.clone();
            async move {
                let resp = self.client.get(&url).send().await?;
                if resp.status().is_success() {
                    Ok(resp.bytes().await?)
                } else {
                    Err(HelmsmanError::Storage(format!(
                        "download {} returned {}",
                        url,
                        resp.status()
                    )))
                }
            }
        })
        .await?;
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(local, &bytes).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let url = self.url(key);
        with_backoff("storage.remove", STORAGE_ATTEMPTS, STORAGE_BACKOFF, || {
            let url = url.clone();
            async move {
                let resp = self.client.delete(&url).send().await?;
                // Already gone is fine
                if resp.status().is_success() || resp.status() == reqwest::StatusCode::NOT_FOUND {
                    Ok(())
                } else {
                    Err(HelmsmanError::Storage(format!(
                        "remove {} returned {}",
                        url,
                        resp.status()
                    )))
                }
            }
        })
        .await
    }
}
