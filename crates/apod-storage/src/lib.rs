//! Atomic file writes, content-addressed blobs and HTTP fetch utilities for the APOD pipeline.

use std::path::{Path, PathBuf};
use std::time::Duration;

use apod_core::{PipelineError, Result};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub mod flatfile;
pub mod snapshot;

pub use flatfile::{FlatFileMerger, KeepPolicy, MergeReport};
pub use snapshot::{DescriptorOutput, SnapshotDescriptor, SnapshotReport, SnapshotStore};

pub const CRATE_NAME: &str = "apod-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Replace `target` with `bytes` via a sibling temp file and rename.
///
/// Readers observe either the previous content or the new content, never a
/// partial write. On any failure the temp file is removed and `target` is untouched.
pub async fn write_atomic(target: &Path, bytes: &[u8]) -> Result<()> {
    let parent = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .map_err(|err| PipelineError::io(&parent, err))?;

    let file_name = target
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("artifact");
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));
    let mut guard = TempFileGuard::new(temp_path.clone());

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(|err| PipelineError::io(&temp_path, err))?;
    file.write_all(bytes)
        .await
        .map_err(|err| PipelineError::io(&temp_path, err))?;
    file.sync_all()
        .await
        .map_err(|err| PipelineError::io(&temp_path, err))?;
    drop(file);

    fs::rename(&temp_path, target)
        .await
        .map_err(|err| PipelineError::io(target, err))?;
    guard.disarm();
    debug!(path = %target.display(), bytes = bytes.len(), "atomic write committed");
    Ok(())
}

#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn blob_relative_path(content_hash: &str) -> PathBuf {
        let (prefix, rest) = content_hash.split_at(content_hash.len().min(2));
        PathBuf::from("sha256").join(prefix).join(rest)
    }

    pub fn blob_path(&self, content_hash: &str) -> PathBuf {
        self.root.join(Self::blob_relative_path(content_hash))
    }

    pub async fn store_bytes(&self, bytes: &[u8]) -> Result<StoredBlob> {
        let content_hash = sha256_hex(bytes);
        let relative_path = Self::blob_relative_path(&content_hash);
        let absolute_path = self.root.join(&relative_path);

        let deduplicated = fs::try_exists(&absolute_path)
            .await
            .map_err(|err| PipelineError::io(&absolute_path, err))?;
        if !deduplicated {
            write_atomic(&absolute_path, bytes).await?;
        }

        Ok(StoredBlob {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated,
        })
    }

    pub async fn read_blob(&self, content_hash: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(content_hash);
        fs::read(&path)
            .await
            .map_err(|err| PipelineError::io(&path, err))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response from {url} is not valid JSON: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl From<FetchError> for PipelineError {
    fn from(err: FetchError) -> Self {
        PipelineError::Fetch(err.to_string())
    }
}

/// Single-attempt JSON fetcher. Retries belong to the stage runner.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder
            .build()
            .map_err(|err| PipelineError::Fetch(format!("building http client: {err}")))?;
        Ok(Self { client })
    }

    pub async fn fetch_json(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> std::result::Result<JsonValue, FetchError> {
        let span = info_span!("http_fetch", url);
        async {
            let resp = self
                .client
                .get(url)
                .query(query)
                .send()
                .await
                .map_err(|err| FetchError::Request(err.without_url()))?;
            let status = resp.status();
            let final_url = redact_query(resp.url());

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp
                .bytes()
                .await
                .map_err(|err| FetchError::Request(err.without_url()))?;
            serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
                url: final_url,
                source,
            })
        }
        .instrument(span)
        .await
    }
}

fn redact_query(url: &reqwest::Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn content_hashing_is_stable() {
        let hash = sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn blob_paths_fan_out_on_hash_prefix() {
        let rel = ContentStore::blob_relative_path("abcdef");
        assert_eq!(rel, PathBuf::from("sha256").join("ab").join("cdef"));
    }

    #[tokio::test]
    async fn blobs_deduplicate_by_hash_path() {
        let dir = tempdir().expect("tempdir");
        let store = ContentStore::new(dir.path());

        let first = store.store_bytes(b"date,title\n").await.expect("first store");
        let second = store.store_bytes(b"date,title\n").await.expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.content_hash, second.content_hash);
        assert_eq!(first.relative_path, second.relative_path);
        assert_eq!(
            store.read_blob(&first.content_hash).await.expect("read"),
            b"date,title\n"
        );
    }

    #[tokio::test]
    async fn atomic_write_replaces_and_leaves_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let target = dir.path().join("nested").join("out.csv");

        write_atomic(&target, b"one").await.expect("first write");
        write_atomic(&target, b"two").await.expect("second write");

        assert_eq!(std::fs::read(&target).expect("read"), b"two");
        let entries = std::fs::read_dir(target.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect::<Vec<_>>();
        assert_eq!(entries, vec!["out.csv".to_string()]);
    }

    #[tokio::test]
    async fn failed_rename_cleans_up_temp_and_keeps_target() {
        let dir = tempdir().expect("tempdir");
        let target = dir.path().join("occupied");
        std::fs::create_dir(&target).unwrap();
        std::fs::write(target.join("keep.txt"), b"keep").unwrap();

        let err = write_atomic(&target, b"payload").await.unwrap_err();
        assert_eq!(err.category(), "io");
        assert_eq!(std::fs::read(target.join("keep.txt")).unwrap(), b"keep");

        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn redaction_drops_api_key() {
        let url = reqwest::Url::parse("https://api.example.test/apod?api_key=SECRET").unwrap();
        assert_eq!(redact_query(&url), "https://api.example.test/apod");
    }
}
