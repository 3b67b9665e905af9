//! Object storage
//!
//! The coordinator treats backup archives as opaque blobs behind an
//! `ObjectStore`: a local filesystem store for single-box deployments and an
//! HTTP store that forwards blobs to a storage service. Transient failures
//! are retried with exponential backoff up to a ceiling, then surfaced.

pub mod fs;
pub mod http;

use async_trait::async_trait;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use crate::types::Result;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn upload(&self, local: &Path, key: &str) -> Result<()>;

    async fn download(&self, key: &str, local: &Path) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;
}

pub use fs::FsObjectStore;
pub use http::HttpObjectStore;

/// Retry ceiling for storage operations
pub const STORAGE_ATTEMPTS: u32 = 3;

/// Base delay between retries (doubled per attempt)
pub const STORAGE_BACKOFF: Duration = Duration::from_millis(200);

/// Run an operation with exponential backoff, surfacing the last error
/// after the ceiling.
pub async fn with_backoff<T, F, Fut>(label: &str, attempts: u32, base: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = base;
    let mut last_err = None;
    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt < attempts {
                    warn!(label, attempt, error = %e, "Retrying after backoff");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                last_err = Some(e);
            }
        }
    }
    Err(last_err.expect("at least one attempt"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use crate::types::HelmsmanError;

    #[tokio::test]
    async fn test_backoff_retries_then_succeeds() {
        let calls = AtomicU32::new(0);
        let out = with_backoff("test", 3, Duration::from_millis(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(HelmsmanError::Storage("flaky".to_string()))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_backoff_surfaces_after_ceiling() {
        let calls = AtomicU32::new(0);
        let err = with_backoff("test", 3, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(HelmsmanError::Storage("down".to_string())) }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, HelmsmanError::Storage(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
