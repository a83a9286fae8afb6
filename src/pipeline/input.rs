//! Source-document storage: fetch the bytes a job refers to.
//!
//! Jobs carry a storage path (object key) rather than the bytes themselves.
//! A [`DocumentStore`] turns that path into bytes and reports whether the
//! object still exists, which the lifecycle manager checks before starting
//! a job and before upserting document metadata.

use crate::config::IngestConfig;
use crate::error::IngestError;
use async_trait::async_trait;
use reqwest::StatusCode;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Read access to stored source documents.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch the full contents of the object at `storage_path`.
    async fn download(&self, storage_path: &str) -> Result<Vec<u8>, IngestError>;

    /// Whether the object at `storage_path` still exists.
    ///
    /// `Ok(false)` only when storage reports the object as absent; an
    /// unreachable store is an `Err`.
    async fn file_exists(&self, storage_path: &str) -> Result<bool, IngestError>;
}

/// Documents stored under a local directory.
#[derive(Debug, Clone)]
pub struct FsDocumentStore {
    root: PathBuf,
}

impl FsDocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Join `storage_path` under the root, refusing `..` and absolute paths.
    fn resolve(&self, storage_path: &str) -> Result<PathBuf, IngestError> {
        let rel = Path::new(storage_path.trim_start_matches('/'));
        let escapes = rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(IngestError::DownloadFailed {
                path: storage_path.to_string(),
                reason: "path escapes the storage root".into(),
            });
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl DocumentStore for FsDocumentStore {
    async fn download(&self, storage_path: &str) -> Result<Vec<u8>, IngestError> {
        let path = self.resolve(storage_path)?;
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| IngestError::DownloadFailed {
                path: storage_path.to_string(),
                reason: e.to_string(),
            })?;
        debug!("Read {} bytes from {}", bytes.len(), path.display());
        Ok(bytes)
    }

    async fn file_exists(&self, storage_path: &str) -> Result<bool, IngestError> {
        let Ok(path) = self.resolve(storage_path) else {
            return Ok(false);
        };
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(IngestError::DownloadFailed {
                path: storage_path.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

/// Documents served by an HTTP object store (`GET {base_url}/{path}`).
#[derive(Debug, Clone)]
pub struct HttpDocumentStore {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpDocumentStore {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, IngestError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IngestError::Internal(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        })
    }

    /// Store using the configured download timeout.
    pub fn from_config(base_url: impl Into<String>, config: &IngestConfig) -> Result<Self, IngestError> {
        Self::new(base_url, config.download_timeout)
    }

    pub fn url_for(&self, storage_path: &str) -> String {
        format!("{}/{}", self.base_url, storage_path.trim_start_matches('/'))
    }
}

#[async_trait]
impl DocumentStore for HttpDocumentStore {
    async fn download(&self, storage_path: &str) -> Result<Vec<u8>, IngestError> {
        let url = self.url_for(storage_path);
        info!("Downloading {}", url);

        let failed = |reason: String| IngestError::DownloadFailed {
            path: storage_path.to_string(),
            reason,
        };
        let timed_out = || IngestError::DownloadTimeout {
            path: storage_path.to_string(),
            secs: self.timeout.as_secs(),
        };

        let response = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                timed_out()
            } else {
                failed(e.to_string())
            }
        })?;

        if !response.status().is_success() {
            return Err(failed(format!("HTTP {}", response.status())));
        }

        let bytes = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                timed_out()
            } else {
                failed(e.to_string())
            }
        })?;
        debug!("Downloaded {} bytes", bytes.len());
        Ok(bytes.to_vec())
    }

    async fn file_exists(&self, storage_path: &str) -> Result<bool, IngestError> {
        let response = self
            .client
            .head(self.url_for(storage_path))
            .send()
            .await
            .map_err(|e| {
                debug!("HEAD {} failed: {}", storage_path, e);
                if e.is_timeout() {
                    IngestError::DownloadTimeout {
                        path: storage_path.to_string(),
                        secs: self.timeout.as_secs(),
                    }
                } else {
                    IngestError::DownloadFailed {
                        path: storage_path.to_string(),
                        reason: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(true)
        } else if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            Ok(false)
        } else {
            Err(IngestError::DownloadFailed {
                path: storage_path.to_string(),
                reason: format!("HTTP {status}"),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fs_store_reads_and_checks_existence() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("u1")).await.unwrap();
        tokio::fs::write(dir.path().join("u1/plan.pdf"), b"%PDF-1.7").await.unwrap();

        let store = FsDocumentStore::new(dir.path());
        assert!(store.file_exists("u1/plan.pdf").await.unwrap());
        assert!(store.file_exists("/u1/plan.pdf").await.unwrap());
        assert!(!store.file_exists("u1/missing.pdf").await.unwrap());
        assert!(!store.file_exists("u1").await.unwrap());
        assert_eq!(store.download("u1/plan.pdf").await.unwrap(), b"%PDF-1.7");
    }

    #[tokio::test]
    async fn fs_store_missing_file_is_download_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsDocumentStore::new(dir.path());
        let err = store.download("nope.pdf").await.unwrap_err();
        assert!(matches!(err, IngestError::DownloadFailed { .. }));
    }

    #[tokio::test]
    async fn fs_store_refuses_parent_components() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsDocumentStore::new(dir.path().join("root"));
        assert!(store.download("../secret").await.is_err());
        assert!(!store.file_exists("a/../../secret").await.unwrap());
    }

    #[test]
    fn http_store_joins_urls() {
        let store = HttpDocumentStore::new("https://files.example.com/", Duration::from_secs(5)).unwrap();
        assert_eq!(store.url_for("/a/b.pdf"), "https://files.example.com/a/b.pdf");
        assert_eq!(store.url_for("c.png"), "https://files.example.com/c.png");
    }

    #[test]
    fn http_store_takes_download_timeout_from_config() {
        let config = IngestConfig::builder()
            .download_timeout(Duration::from_secs(7))
            .build()
            .unwrap();
        let store = HttpDocumentStore::from_config("https://files.example.com", &config).unwrap();
        assert_eq!(store.timeout, Duration::from_secs(7));
    }

    #[tokio::test]
    async fn unreachable_http_store_is_an_error_not_a_missing_file() {
        // Port 1 is never listening; the connection is refused.
        let store = HttpDocumentStore::new("http://127.0.0.1:1", Duration::from_secs(2)).unwrap();
        let err = store.file_exists("u1/plan.pdf").await.unwrap_err();
        assert!(matches!(
            err,
            IngestError::DownloadFailed { .. } | IngestError::DownloadTimeout { .. }
        ));
    }
}
