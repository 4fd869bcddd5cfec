//! Conditional history commits of snapshot descriptors.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use apod_core::{InitOutcome, PipelineError, Result};
use apod_storage::SnapshotStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthorIdentity {
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub id: String,
    pub message: String,
    pub committed_at: DateTime<Utc>,
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CommitOutcome {
    Committed(HistoryEntry),
    NoChanges,
}

/// Narrow seam over the history tool. Paths are relative to [`HistoryBackend::root`].
#[async_trait]
pub trait HistoryBackend: Send + Sync {
    fn root(&self) -> &Path;
    async fn init_store(&self) -> Result<InitOutcome>;
    async fn configure_identity(&self, identity: &AuthorIdentity) -> Result<()>;
    async fn stage_files(&self, paths: &[PathBuf]) -> Result<()>;
    async fn has_pending_changes(&self) -> Result<bool>;
    async fn commit(&self, message: &str) -> Result<HistoryEntry>;
    /// Newest first.
    async fn entries(&self) -> Result<Vec<HistoryEntry>>;
}

#[derive(Debug, Clone)]
pub struct GitCli {
    root: PathBuf,
    program: PathBuf,
}

// Unit/record separators emitted by `%x1f` / `%x1e` in log formats.
const FIELD_SEP: char = '\u{1f}';
const RECORD_SEP: char = '\u{1e}';

impl GitCli {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            program: PathBuf::from("git"),
        }
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output> {
        debug!(root = %self.root.display(), args = ?args, "running git");
        Command::new(&self.program)
            .arg("-c")
            .arg("safe.directory=*")
            .args(args)
            .current_dir(&self.root)
            .env("GIT_TERMINAL_PROMPT", "0")
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| {
                PipelineError::Commit(format!(
                    "spawning {} {}: {err}",
                    self.program.display(),
                    args.join(" ")
                ))
            })
    }

    async fn git(&self, args: &[&str]) -> Result<String> {
        let output = self.run(args).await?;
        if !output.status.success() {
            return Err(PipelineError::Commit(format!(
                "git {} exited with {}: {}",
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn has_head(&self) -> Result<bool> {
        Ok(self
            .run(&["rev-parse", "--verify", "--quiet", "HEAD"])
            .await?
            .status
            .success())
    }

    async fn changed_paths(&self, rev: &str) -> Result<Vec<String>> {
        let out = self
            .git(&["diff-tree", "--no-commit-id", "--name-only", "-r", "--root", rev])
            .await?;
        Ok(out.lines().map(str::to_string).collect())
    }
}

#[async_trait]
impl HistoryBackend for GitCli {
    fn root(&self) -> &Path {
        &self.root
    }

    async fn init_store(&self) -> Result<InitOutcome> {
        fs::create_dir_all(&self.root).await.map_err(|err| {
            PipelineError::Commit(format!("creating {}: {err}", self.root.display()))
        })?;
        if fs::try_exists(self.root.join(".git")).await.unwrap_or(false) {
            return Ok(InitOutcome::AlreadyInitialized);
        }
        self.git(&["init", "--quiet"]).await?;
        Ok(InitOutcome::Initialized)
    }

    async fn configure_identity(&self, identity: &AuthorIdentity) -> Result<()> {
        self.git(&["config", "user.name", &identity.name]).await?;
        self.git(&["config", "user.email", &identity.email]).await?;
        self.git(&["config", "commit.gpgsign", "false"]).await?;
        Ok(())
    }

    async fn stage_files(&self, paths: &[PathBuf]) -> Result<()> {
        let paths = paths
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        if paths.is_empty() {
            return Ok(());
        }
        let mut args = vec!["add", "--"];
        args.extend(paths.iter().map(String::as_str));
        self.git(&args).await?;
        Ok(())
    }

    async fn has_pending_changes(&self) -> Result<bool> {
        let status = self
            .git(&["status", "--porcelain", "--untracked-files=no"])
            .await?;
        Ok(!staged_paths(&status).is_empty())
    }

    async fn commit(&self, message: &str) -> Result<HistoryEntry> {
        self.git(&["commit", "--quiet", "-m", message]).await?;
        let head = self.git(&["rev-parse", "HEAD"]).await?.trim().to_string();
        let paths = self.changed_paths(&head).await?;
        let meta = self
            .git(&["log", "-1", "--format=%cI%x1f%B", &head])
            .await?;
        let (committed_at, message) = meta
            .split_once(FIELD_SEP)
            .map(|(ts, msg)| (parse_git_timestamp(ts), msg.trim_end().to_string()))
            .ok_or_else(|| PipelineError::Commit(format!("unreadable log entry for {head}")))?;
        Ok(HistoryEntry {
            id: head,
            message,
            committed_at: committed_at?,
            paths,
        })
    }

    async fn entries(&self) -> Result<Vec<HistoryEntry>> {
        if !self.has_head().await? {
            return Ok(Vec::new());
        }
        let log = self.git(&["log", "--format=%H%x1f%cI%x1f%B%x1e"]).await?;

        let mut entries = Vec::new();
        for raw in log.split(RECORD_SEP) {
            let raw = raw.trim_start_matches('\n');
            if raw.trim().is_empty() {
                continue;
            }
            let mut fields = raw.splitn(3, FIELD_SEP);
            let (Some(id), Some(ts), Some(message)) = (fields.next(), fields.next(), fields.next())
            else {
                return Err(PipelineError::Commit(format!("unreadable log entry: {raw:?}")));
            };
            entries.push(HistoryEntry {
                id: id.to_string(),
                message: message.trim_end().to_string(),
                committed_at: parse_git_timestamp(ts)?,
                paths: self.changed_paths(id).await?,
            });
        }
        Ok(entries)
    }
}

fn parse_git_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| PipelineError::Commit(format!("bad commit timestamp {raw:?}: {err}")))
}

/// Paths with a staged (index) change in `git status --porcelain` output.
pub fn staged_paths(porcelain: &str) -> Vec<String> {
    porcelain
        .lines()
        .filter(|line| line.len() > 3)
        .filter(|line| {
            let index = line.as_bytes()[0];
            index != b' ' && index != b'?' && index != b'!'
        })
        .map(|line| line[3..].to_string())
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CommitState {
    Uninitialized,
    Initialized,
    Staged,
    Committed,
}

/// Drives one history store through
/// `Uninitialized → Initialized → Staged → Committed`.
pub struct CommitManager {
    backend: Arc<dyn HistoryBackend>,
    identity: AuthorIdentity,
    state: CommitState,
}

impl CommitManager {
    pub fn new(backend: Arc<dyn HistoryBackend>, identity: AuthorIdentity) -> Self {
        Self {
            backend,
            identity,
            state: CommitState::Uninitialized,
        }
    }

    pub fn state(&self) -> CommitState {
        self.state
    }

    pub async fn initialize(&mut self) -> Result<InitOutcome> {
        let outcome = self.backend.init_store().await?;
        self.backend.configure_identity(&self.identity).await?;
        self.state = CommitState::Initialized;
        info!(
            root = %self.backend.root().display(),
            ?outcome,
            author = %self.identity.name,
            "history store ready"
        );
        Ok(outcome)
    }

    pub async fn stage(&mut self, candidates: &[PathBuf]) -> Result<Vec<PathBuf>> {
        if self.state == CommitState::Uninitialized {
            return Err(PipelineError::Commit(
                "cannot stage before the history store is initialized".to_string(),
            ));
        }

        let root = self.backend.root().to_path_buf();
        let mut present = Vec::with_capacity(candidates.len());
        for path in candidates {
            if fs::try_exists(root.join(path)).await.unwrap_or(false) {
                present.push(path.clone());
            } else {
                debug!(path = %path.display(), "skipping absent staging candidate");
            }
        }

        self.backend.stage_files(&present).await?;
        self.state = CommitState::Staged;
        info!(staged = present.len(), skipped = candidates.len() - present.len(), "descriptor artifacts staged");
        Ok(present)
    }

    pub async fn commit_if_changed(&mut self, message: &str) -> Result<CommitOutcome> {
        if self.state != CommitState::Staged {
            return Err(PipelineError::Commit(format!(
                "cannot commit from state {:?}",
                self.state
            )));
        }

        let outcome = if self.backend.has_pending_changes().await? {
            let entry = self.backend.commit(message).await?;
            info!(id = %entry.id, commit_message = message, paths = ?entry.paths, "history entry created");
            CommitOutcome::Committed(entry)
        } else {
            info!("no changes to commit");
            CommitOutcome::NoChanges
        };
        self.state = CommitState::Committed;
        Ok(outcome)
    }

    /// Full cycle for a snapshot store: initialize, stage descriptors and
    /// metadata, commit when anything changed.
    pub async fn record_snapshot(
        &mut self,
        store: &SnapshotStore,
        message: &str,
    ) -> Result<CommitOutcome> {
        let prefix = relative_prefix(self.backend.root(), store.root())?;
        self.initialize().await?;

        let mut candidates = store
            .descriptor_paths()
            .await
            .map_err(|err| PipelineError::Commit(err.to_string()))?;
        candidates.extend(SnapshotStore::metadata_paths());
        let candidates = candidates
            .into_iter()
            .map(|p| prefix.join(p))
            .collect::<Vec<_>>();

        self.stage(&candidates).await?;
        self.commit_if_changed(message).await
    }
}

fn relative_prefix(history_root: &Path, store_root: &Path) -> Result<PathBuf> {
    store_root
        .strip_prefix(history_root)
        .map(Path::to_path_buf)
        .map_err(|_| {
            PipelineError::Commit(format!(
                "snapshot store {} is not inside history root {}",
                store_root.display(),
                history_root.display()
            ))
        })
}
