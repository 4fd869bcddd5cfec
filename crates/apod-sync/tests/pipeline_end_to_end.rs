use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use apod_core::{InitOutcome, PipelineError, Result};
use apod_storage::{sha256_hex, FlatFileMerger};
use apod_sync::{
    AuthorIdentity, CommitOutcome, GitCli, HistoryBackend, HistoryEntry, Pipeline,
    PipelineConfig, StageName, StageReport,
};
use async_trait::async_trait;
use chrono::Utc;
use tempfile::tempdir;

/// Content-comparing history double: commits only when staged bytes differ from head.
struct MemoryHistory {
    root: PathBuf,
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    initialized: bool,
    index: BTreeMap<String, Vec<u8>>,
    head: BTreeMap<String, Vec<u8>>,
    log: Vec<HistoryEntry>,
}

impl MemoryHistory {
    fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            state: Mutex::new(MemoryState::default()),
        }
    }
}

#[async_trait]
impl HistoryBackend for MemoryHistory {
    fn root(&self) -> &Path {
        &self.root
    }

    async fn init_store(&self) -> Result<InitOutcome> {
        let mut state = self.state.lock().unwrap();
        if state.initialized {
            return Ok(InitOutcome::AlreadyInitialized);
        }
        state.initialized = true;
        Ok(InitOutcome::Initialized)
    }

    async fn configure_identity(&self, _identity: &AuthorIdentity) -> Result<()> {
        Ok(())
    }

    async fn stage_files(&self, paths: &[PathBuf]) -> Result<()> {
        let mut staged = Vec::with_capacity(paths.len());
        for path in paths {
            let full = self.root.join(path);
            let bytes = std::fs::read(&full).map_err(|err| PipelineError::io(&full, err))?;
            staged.push((path.display().to_string(), bytes));
        }
        self.state.lock().unwrap().index.extend(staged);
        Ok(())
    }

    async fn has_pending_changes(&self) -> Result<bool> {
        let state = self.state.lock().unwrap();
        Ok(state.index != state.head)
    }

    async fn commit(&self, message: &str) -> Result<HistoryEntry> {
        let mut state = self.state.lock().unwrap();
        state.head = state.index.clone();
        let entry = HistoryEntry {
            id: format!("{:040x}", state.log.len() + 1),
            message: message.to_string(),
            committed_at: Utc::now(),
            paths: state.head.keys().cloned().collect(),
        };
        state.log.push(entry.clone());
        Ok(entry)
    }

    async fn entries(&self) -> Result<Vec<HistoryEntry>> {
        Ok(self.state.lock().unwrap().log.iter().rev().cloned().collect())
    }
}

fn config_for(root: &Path) -> PipelineConfig {
    let root = root.to_path_buf();
    PipelineConfig::from_lookup(move |key| {
        let value = match key {
            "APOD_WORK_DIR" => root.join("work"),
            "APOD_CSV_PATH" => root.join("data").join("apod_data.csv"),
            "APOD_SNAPSHOT_ROOT" => root.join("snapshot_repo"),
            _ => return None,
        };
        Some(value.display().to_string())
    })
}

async fn write_raw_payload(config: &PipelineConfig) {
    let payload = serde_json::json!({
        "date": "2024-06-01",
        "title": "Nebula",
        "url": "http://x/img.jpg",
        "explanation": "...",
        "media_type": "image",
        "service_version": "v1"
    });
    tokio::fs::create_dir_all(&config.work_dir).await.unwrap();
    tokio::fs::write(
        config.raw_payload_path(),
        serde_json::to_vec(&payload).unwrap(),
    )
    .await
    .unwrap();
}

/// Every stage after extraction, in pipeline order.
async fn run_local_stages(pipeline: &Pipeline) -> Vec<StageReport> {
    let mut reports = Vec::new();
    for stage in [
        StageName::LoadDatabase,
        StageName::LoadFlatFile,
        StageName::Version,
        StageName::Commit,
    ] {
        reports.push(pipeline.run_stage(stage).await.unwrap());
    }
    reports
}

#[tokio::test]
async fn transform_normalizes_raw_payload_into_cleaned_record() {
    let dir = tempdir().unwrap();
    let config = config_for(dir.path());
    write_raw_payload(&config).await;
    let pipeline = Pipeline::new(config.clone()).unwrap();

    let report = pipeline.run_stage(StageName::Transform).await.unwrap();
    assert!(matches!(&report, StageReport::Transformed { date, .. } if date == "2024-06-01"));

    let record = apod_sync::read_record(&config.cleaned_record_path()).await.unwrap();
    assert_eq!(record.title.as_deref(), Some("Nebula"));
    assert_eq!(record.hdurl, None);
    assert_eq!(record.copyright, None);
}

#[tokio::test]
async fn rerun_with_same_record_keeps_history_unchanged() {
    let dir = tempdir().unwrap();
    let cwd_before = std::env::current_dir().unwrap();
    let config = config_for(dir.path());
    write_raw_payload(&config).await;

    let history = Arc::new(MemoryHistory::new(&config.snapshot_root));
    let pipeline = Pipeline::new(config.clone())
        .unwrap()
        .with_history_backend(history.clone());
    pipeline.run_stage(StageName::Transform).await.unwrap();

    let first = run_local_stages(&pipeline).await;
    assert!(matches!(first[0], StageReport::DatabaseSkipped));
    assert!(matches!(
        first[3],
        StageReport::Committed(CommitOutcome::Committed(_))
    ));

    let rows = FlatFileMerger::read_records(&config.csv_path)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].natural_key(), "2024-06-01");

    let csv_bytes = tokio::fs::read(&config.csv_path).await.unwrap();
    let descriptor = pipeline.snapshots().read_descriptor("apod_data.csv").await.unwrap();
    assert_eq!(descriptor.content_hash(), Some(sha256_hex(&csv_bytes).as_str()));
    assert_eq!(history.entries().await.unwrap().len(), 1);
    let descriptor_bytes = tokio::fs::read(pipeline.snapshots().descriptor_path("apod_data.csv"))
        .await
        .unwrap();

    let second = run_local_stages(&pipeline).await;
    assert!(matches!(second[1], StageReport::FlatFileMerged(ref r) if r.rows == 1 && r.replaced_existing_key));
    assert!(matches!(second[2], StageReport::Versioned(ref r) if !r.changed));
    assert!(matches!(second[3], StageReport::Committed(CommitOutcome::NoChanges)));

    assert_eq!(tokio::fs::read(&config.csv_path).await.unwrap(), csv_bytes);
    assert_eq!(
        tokio::fs::read(pipeline.snapshots().descriptor_path("apod_data.csv"))
            .await
            .unwrap(),
        descriptor_bytes
    );
    let entries = history.entries().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].message, "Update APOD data for 2024-06-01");
    assert_eq!(std::env::current_dir().unwrap(), cwd_before);
}

#[tokio::test]
async fn git_backed_history_records_one_entry_per_distinct_snapshot() {
    let git_available = std::process::Command::new("git")
        .arg("--version")
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false);
    if !git_available {
        eprintln!("git not installed; skipping");
        return;
    }

    let dir = tempdir().unwrap();
    let cwd_before = std::env::current_dir().unwrap();
    let config = config_for(dir.path());
    write_raw_payload(&config).await;
    let history = Arc::new(GitCli::new(config.snapshot_root.clone()));
    let pipeline = Pipeline::new(config.clone())
        .unwrap()
        .with_history_backend(history.clone());

    pipeline.run_stage(StageName::Transform).await.unwrap();
    run_local_stages(&pipeline).await;
    let second = run_local_stages(&pipeline).await;
    assert!(matches!(second[3], StageReport::Committed(CommitOutcome::NoChanges)));

    let entries = history.entries().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].paths.iter().any(|p| p == "apod_data.csv.snap"));
    assert!(!entries[0].paths.iter().any(|p| p == "apod_data.csv"));

    // A new extraction stamp changes the flat file and therefore the descriptor.
    pipeline.run_stage(StageName::Transform).await.unwrap();
    let third = run_local_stages(&pipeline).await;
    assert!(matches!(third[3], StageReport::Committed(CommitOutcome::Committed(_))));
    assert_eq!(history.entries().await.unwrap().len(), 2);
    assert_eq!(std::env::current_dir().unwrap(), cwd_before);
}
