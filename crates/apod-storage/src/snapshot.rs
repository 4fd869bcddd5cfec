//! Content-addressable snapshot store.
//!
//! Layout under the store root:
//!
//! ```text
//! {root}/
//! ├── .snap/
//! │   ├── config              # store marker + hash algorithm
//! │   ├── .gitignore          # keeps the blob cache out of history
//! │   └── cache/sha256/ab/…   # immutable blobs keyed by content hash
//! ├── .snapignore             # exclusion list for the snapshot tooling
//! ├── .gitignore              # keeps raw tracked files out of history
//! ├── apod_data.csv           # working copy of the tracked file
//! └── apod_data.csv.snap      # descriptor: hash + size of the working copy
//! ```

use std::path::{Path, PathBuf};

use apod_core::{InitOutcome, PipelineError, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::info;

use crate::{sha256_hex, write_atomic, ContentStore};

pub const STORE_DIR: &str = ".snap";
pub const DESCRIPTOR_EXTENSION: &str = "snap";
pub const IGNORE_FILE: &str = ".snapignore";
pub const GITIGNORE_FILE: &str = ".gitignore";
const CONFIG_FILE: &str = "config";
const HASH_ALGORITHM: &str = "sha256";

const STORE_CONFIG: &str = "version: 1\nhash: sha256\n";
const STORE_GITIGNORE: &str = "/cache\n/tmp\n";
const IGNORE_FILE_HEADER: &str = "# Paths the snapshot store never tracks\n";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorOutput {
    pub sha256: String,
    pub size: u64,
    pub hash: String,
    pub path: String,
}

/// Persisted hash/size record for one tracked file.
///
/// A pure function of the tracked file's name and bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotDescriptor {
    pub outs: Vec<DescriptorOutput>,
}

impl SnapshotDescriptor {
    pub fn for_bytes(name: &str, bytes: &[u8]) -> Self {
        Self {
            outs: vec![DescriptorOutput {
                sha256: sha256_hex(bytes),
                size: bytes.len() as u64,
                hash: HASH_ALGORITHM.to_string(),
                path: name.to_string(),
            }],
        }
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|err| PipelineError::Versioning(format!("serializing descriptor: {err}")))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text)
            .map_err(|err| PipelineError::Versioning(format!("parsing descriptor: {err}")))
    }

    pub fn primary(&self) -> Option<&DescriptorOutput> {
        self.outs.first()
    }

    pub fn content_hash(&self) -> Option<&str> {
        self.primary().map(|out| out.sha256.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotReport {
    pub name: String,
    pub working_path: PathBuf,
    pub descriptor_path: PathBuf,
    pub descriptor: SnapshotDescriptor,
    /// False when the descriptor on disk already held identical content.
    pub changed: bool,
    pub blob_deduplicated: bool,
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
    blobs: ContentStore,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let blobs = ContentStore::new(root.join(STORE_DIR).join("cache"));
        Self { root, blobs }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn working_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn descriptor_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.{DESCRIPTOR_EXTENSION}"))
    }

    fn config_path(&self) -> PathBuf {
        self.root.join(STORE_DIR).join(CONFIG_FILE)
    }

    pub async fn is_initialized(&self) -> bool {
        fs::try_exists(self.config_path()).await.unwrap_or(false)
    }

    /// Store metadata files worth keeping in history, relative to the root.
    pub fn metadata_paths() -> Vec<PathBuf> {
        vec![
            PathBuf::from(IGNORE_FILE),
            PathBuf::from(GITIGNORE_FILE),
            PathBuf::from(STORE_DIR).join(CONFIG_FILE),
            PathBuf::from(STORE_DIR).join(GITIGNORE_FILE),
        ]
    }

    /// Create the store layout. Re-running on an initialized store only fills in
    /// missing metadata files and reports `AlreadyInitialized`.
    pub async fn init(&self) -> Result<InitOutcome> {
        let already = self.is_initialized().await;
        let store_dir = self.root.join(STORE_DIR);
        fs::create_dir_all(&store_dir)
            .await
            .map_err(|err| versioning("creating store directory", &store_dir, err))?;

        let defaults = [
            (self.config_path(), STORE_CONFIG),
            (store_dir.join(GITIGNORE_FILE), STORE_GITIGNORE),
            (self.root.join(IGNORE_FILE), IGNORE_FILE_HEADER),
        ];
        for (path, content) in defaults {
            let exists = fs::try_exists(&path)
                .await
                .map_err(|err| versioning("probing", &path, err))?;
            if !exists {
                write_atomic(&path, content.as_bytes())
                    .await
                    .map_err(into_versioning)?;
            }
        }

        let outcome = if already {
            InitOutcome::AlreadyInitialized
        } else {
            InitOutcome::Initialized
        };
        info!(root = %self.root.display(), ?outcome, "snapshot store ready");
        Ok(outcome)
    }

    /// Snapshot `tracked`: bring it into the store, cache its bytes by hash and
    /// rewrite its descriptor.
    pub async fn add(&self, tracked: &Path) -> Result<SnapshotReport> {
        if !self.is_initialized().await {
            return Err(PipelineError::Versioning(format!(
                "snapshot store at {} is not initialized",
                self.root.display()
            )));
        }

        let name = tracked
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                PipelineError::Versioning(format!(
                    "tracked path {} has no file name",
                    tracked.display()
                ))
            })?
            .to_string();
        info!(tracked = %tracked.display(), name = %name, root = %self.root.display(), "snapshotting tracked file");

        let bytes = fs::read(tracked)
            .await
            .map_err(|err| versioning("reading tracked file", tracked, err))?;

        let working_path = self.working_path(&name);
        if !self.is_canonical(tracked, &working_path).await {
            write_atomic(&working_path, &bytes)
                .await
                .map_err(into_versioning)?;
            info!(from = %tracked.display(), to = %working_path.display(), "copied tracked file into store");
        }

        let blob = self.blobs.store_bytes(&bytes).await.map_err(into_versioning)?;

        let descriptor = SnapshotDescriptor::for_bytes(&name, &bytes);
        let rendered = descriptor.to_yaml()?;
        let descriptor_path = self.descriptor_path(&name);
        let previous = fs::read(&descriptor_path).await.ok();
        let changed = previous.as_deref() != Some(rendered.as_bytes());
        if changed {
            write_atomic(&descriptor_path, rendered.as_bytes())
                .await
                .map_err(into_versioning)?;
        }

        self.ensure_gitignored(&name).await?;

        let present = fs::try_exists(&descriptor_path)
            .await
            .map_err(|err| versioning("verifying descriptor", &descriptor_path, err))?;
        if !present {
            return Err(PipelineError::Versioning(format!(
                "descriptor {} missing after snapshot",
                descriptor_path.display()
            )));
        }

        info!(
            descriptor = %descriptor_path.display(),
            sha256 = %blob.content_hash,
            size = blob.byte_size,
            changed,
            blob_deduplicated = blob.deduplicated,
            "snapshot descriptor written"
        );
        Ok(SnapshotReport {
            name,
            working_path,
            descriptor_path,
            descriptor,
            changed,
            blob_deduplicated: blob.deduplicated,
        })
    }

    pub async fn read_descriptor(&self, name: &str) -> Result<SnapshotDescriptor> {
        let path = self.descriptor_path(name);
        let text = fs::read_to_string(&path)
            .await
            .map_err(|err| versioning("reading descriptor", &path, err))?;
        SnapshotDescriptor::from_yaml(&text)
    }

    /// Every `*.snap` descriptor directly under the root, relative to the root, sorted.
    pub async fn descriptor_paths(&self) -> Result<Vec<PathBuf>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(versioning("listing", &self.root, err)),
        };

        let mut out = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| versioning("listing", &self.root, err))?
        {
            let path = PathBuf::from(entry.file_name());
            let is_descriptor = path.extension().and_then(|e| e.to_str()) == Some(DESCRIPTOR_EXTENSION);
            let is_file = entry.file_type().await.map(|ft| ft.is_file()).unwrap_or(false);
            if is_descriptor && is_file {
                out.push(path);
            }
        }
        out.sort();
        Ok(out)
    }

    /// Rewrite the working copy of `name` from the blob cache per its descriptor.
    pub async fn restore(&self, name: &str) -> Result<PathBuf> {
        let descriptor = self.read_descriptor(name).await?;
        let expected = descriptor.content_hash().ok_or_else(|| {
            PipelineError::Versioning(format!("descriptor for {name} lists no outputs"))
        })?;

        let bytes = self.blobs.read_blob(expected).await.map_err(into_versioning)?;
        let actual = sha256_hex(&bytes);
        if actual != expected {
            return Err(PipelineError::Versioning(format!(
                "cached blob for {name} is corrupt: expected {expected}, got {actual}"
            )));
        }

        let working_path = self.working_path(name);
        write_atomic(&working_path, &bytes)
            .await
            .map_err(into_versioning)?;
        info!(name, sha256 = expected, path = %working_path.display(), "restored working copy from cache");
        Ok(working_path)
    }

    async fn is_canonical(&self, tracked: &Path, working_path: &Path) -> bool {
        match (
            fs::canonicalize(tracked).await,
            fs::canonicalize(working_path).await,
        ) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }

    async fn ensure_gitignored(&self, name: &str) -> Result<()> {
        let path = self.root.join(GITIGNORE_FILE);
        let entry = format!("/{name}");
        let mut content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => return Err(versioning("reading", &path, err)),
        };

        if content.lines().any(|line| line.trim() == entry) {
            return Ok(());
        }
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(&entry);
        content.push('\n');
        write_atomic(&path, content.as_bytes())
            .await
            .map_err(into_versioning)?;
        info!(path = %path.display(), entry = %entry, "added tracked file to .gitignore");
        Ok(())
    }
}

fn versioning(action: &str, path: &Path, err: std::io::Error) -> PipelineError {
    PipelineError::Versioning(format!("{action} {}: {err}", path.display()))
}

fn into_versioning(err: PipelineError) -> PipelineError {
    match err {
        PipelineError::Versioning(_) => err,
        other => PipelineError::Versioning(other.to_string()),
    }
}
