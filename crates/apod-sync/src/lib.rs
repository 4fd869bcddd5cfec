//! Pipeline orchestration: stages, stage-level retry and the cron scheduler.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use apod_core::{normalize_payload, PipelineError, Record};
use apod_storage::{
    write_atomic, FlatFileMerger, HttpClientConfig, HttpFetcher, KeepPolicy, MergeReport,
    SnapshotReport, SnapshotStore,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod history;
pub mod loader;

pub use history::{
    AuthorIdentity, CommitManager, CommitOutcome, CommitState, GitCli, HistoryBackend,
    HistoryEntry,
};
pub use loader::{RecordTable, UpsertOutcome};

pub const CRATE_NAME: &str = "apod-sync";

const RAW_PAYLOAD_FILE: &str = "apod_raw.json";
const CLEANED_RECORD_FILE: &str = "apod_cleaned.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            delay: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: Option<String>,
    pub api_url: String,
    pub api_key: String,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub work_dir: PathBuf,
    pub csv_path: PathBuf,
    pub table_name: String,
    pub snapshot_root: PathBuf,
    pub commit_message: String,
    pub author: AuthorIdentity,
    pub keep_policy: KeepPolicy,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub retry: RetryPolicy,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let number = |key: &str, default: u64| {
            lookup(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };

        Self {
            database_url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            api_url: var("APOD_API_URL", "https://api.nasa.gov/planetary/apod"),
            api_key: var("APOD_API_KEY", "DEMO_KEY"),
            http_timeout_secs: number("APOD_HTTP_TIMEOUT_SECS", 30),
            user_agent: var("APOD_USER_AGENT", "apod-pipeline/0.1"),
            work_dir: PathBuf::from(var("APOD_WORK_DIR", "./work")),
            csv_path: PathBuf::from(var("APOD_CSV_PATH", "./data/apod_data.csv")),
            table_name: var("APOD_TABLE", "apod_data"),
            snapshot_root: PathBuf::from(var("APOD_SNAPSHOT_ROOT", "./snapshot_repo")),
            commit_message: var("APOD_COMMIT_MESSAGE", "Update APOD data for {date}"),
            author: AuthorIdentity {
                name: var("APOD_AUTHOR_NAME", "APOD Pipeline"),
                email: var("APOD_AUTHOR_EMAIL", "pipeline@apod.local"),
            },
            keep_policy: KeepPolicy::Last,
            scheduler_enabled: lookup("APOD_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: var("APOD_SYNC_CRON", "0 0 6 * * *"),
            retry: RetryPolicy {
                max_retries: number("APOD_STAGE_RETRIES", 1) as usize,
                delay: Duration::from_secs(number("APOD_RETRY_DELAY_SECS", 300)),
            },
        }
    }

    pub fn raw_payload_path(&self) -> PathBuf {
        self.work_dir.join(RAW_PAYLOAD_FILE)
    }

    pub fn cleaned_record_path(&self) -> PathBuf {
        self.work_dir.join(CLEANED_RECORD_FILE)
    }

    pub fn tracked_name(&self) -> Option<String> {
        self.csv_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StageName {
    Extract,
    Transform,
    LoadDatabase,
    LoadFlatFile,
    Version,
    Commit,
}

impl StageName {
    pub const ALL: [StageName; 6] = [
        StageName::Extract,
        StageName::Transform,
        StageName::LoadDatabase,
        StageName::LoadFlatFile,
        StageName::Version,
        StageName::Commit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Extract => "extract",
            StageName::Transform => "transform",
            StageName::LoadDatabase => "load_database",
            StageName::LoadFlatFile => "load_flat_file",
            StageName::Version => "version",
            StageName::Commit => "commit",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub enum StageReport {
    Extracted { path: PathBuf },
    Transformed { path: PathBuf, date: String },
    DatabaseLoaded(UpsertOutcome),
    DatabaseSkipped,
    FlatFileMerged(MergeReport),
    Versioned(SnapshotReport),
    Committed(CommitOutcome),
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stages: Vec<(StageName, StageReport)>,
}

impl RunSummary {
    pub fn committed(&self) -> bool {
        self.stages.iter().any(|(_, report)| {
            matches!(report, StageReport::Committed(CommitOutcome::Committed(_)))
        })
    }
}

pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    stage: StageName,
    mut op: F,
) -> std::result::Result<T, PipelineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, PipelineError>>,
{
    let mut attempt = 0usize;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                attempt += 1;
                warn!(
                    %stage,
                    attempt,
                    max_retries = policy.max_retries,
                    delay_secs = policy.delay.as_secs(),
                    category = err.category(),
                    error = %err,
                    "stage failed; retrying after fixed delay"
                );
                tokio::time::sleep(policy.delay).await;
            }
            Err(err) => {
                error!(%stage, attempt, category = err.category(), error = %err, "stage failed");
                return Err(err);
            }
        }
    }
}

pub fn render_commit_message(template: &str, date: &str) -> String {
    template.replace("{date}", date)
}

pub struct Pipeline {
    config: PipelineConfig,
    http: HttpFetcher,
    merger: FlatFileMerger,
    snapshots: SnapshotStore,
    history: Arc<dyn HistoryBackend>,
    run_lock: Mutex<()>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        let merger = FlatFileMerger::new(config.keep_policy);
        let snapshots = SnapshotStore::new(config.snapshot_root.clone());
        let history: Arc<dyn HistoryBackend> = Arc::new(GitCli::new(config.snapshot_root.clone()));
        Ok(Self {
            config,
            http,
            merger,
            snapshots,
            history,
            run_lock: Mutex::new(()),
        })
    }

    pub fn with_history_backend(mut self, history: Arc<dyn HistoryBackend>) -> Self {
        self.history = history;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub fn history(&self) -> &Arc<dyn HistoryBackend> {
        &self.history
    }

    pub async fn extract(&self) -> std::result::Result<StageReport, PipelineError> {
        let path = self.config.raw_payload_path();
        info!(api_url = %self.config.api_url, output = %path.display(), "extracting upstream payload");

        let payload = self
            .http
            .fetch_json(&self.config.api_url, &[("api_key", self.config.api_key.as_str())])
            .await?;
        let bytes = serde_json::to_vec_pretty(&payload)
            .map_err(|err| PipelineError::Validation(format!("re-encoding payload: {err}")))?;
        write_atomic(&path, &bytes).await?;

        info!(output = %path.display(), bytes = bytes.len(), "raw payload saved");
        Ok(StageReport::Extracted { path })
    }

    pub async fn transform(&self) -> std::result::Result<StageReport, PipelineError> {
        let input = self.config.raw_payload_path();
        let output = self.config.cleaned_record_path();
        info!(input = %input.display(), output = %output.display(), "normalizing payload");

        let raw = fs::read(&input)
            .await
            .map_err(|err| PipelineError::io(&input, err))?;
        let payload: serde_json::Value = serde_json::from_slice(&raw).map_err(|err| {
            PipelineError::Validation(format!("{} is not JSON: {err}", input.display()))
        })?;
        let record = normalize_payload(&payload, Utc::now())?;
        let bytes = serde_json::to_vec_pretty(&record)
            .map_err(|err| PipelineError::Validation(format!("encoding record: {err}")))?;
        write_atomic(&output, &bytes).await?;

        info!(date = %record.natural_key(), title = ?record.title, "record normalized");
        Ok(StageReport::Transformed {
            path: output,
            date: record.natural_key(),
        })
    }

    pub async fn load_database(&self) -> std::result::Result<StageReport, PipelineError> {
        let Some(database_url) = self.config.database_url.as_deref() else {
            info!("DATABASE_URL not set; relational load skipped");
            return Ok(StageReport::DatabaseSkipped);
        };
        let record = self.read_cleaned_record().await?;
        info!(table = %self.config.table_name, date = %record.natural_key(), "loading record into database");

        let table = RecordTable::connect(database_url, &self.config.table_name).await?;
        table.ensure_table().await?;
        let outcome = table.upsert(&record).await?;
        Ok(StageReport::DatabaseLoaded(outcome))
    }

    pub async fn load_flat_file(&self) -> std::result::Result<StageReport, PipelineError> {
        let record = self.read_cleaned_record().await?;
        let report = self.merger.merge(&self.config.csv_path, &record).await?;
        Ok(StageReport::FlatFileMerged(report))
    }

    pub async fn version(&self) -> std::result::Result<StageReport, PipelineError> {
        info!(
            tracked = %self.config.csv_path.display(),
            root = %self.snapshots.root().display(),
            "versioning flat file"
        );
        self.snapshots.init().await?;
        let report = self.snapshots.add(&self.config.csv_path).await?;
        Ok(StageReport::Versioned(report))
    }

    pub async fn commit(&self) -> std::result::Result<StageReport, PipelineError> {
        let record = self.read_cleaned_record().await?;
        let message = render_commit_message(&self.config.commit_message, &record.natural_key());
        info!(root = %self.history.root().display(), commit_message = %message, "committing snapshot descriptors");

        let mut manager = CommitManager::new(Arc::clone(&self.history), self.config.author.clone());
        let outcome = manager.record_snapshot(&self.snapshots, &message).await?;
        Ok(StageReport::Committed(outcome))
    }

    pub async fn run_stage(&self, stage: StageName) -> std::result::Result<StageReport, PipelineError> {
        let span = info_span!("stage", %stage);
        async {
            info!("stage started");
            let report = match stage {
                StageName::Extract => self.extract().await,
                StageName::Transform => self.transform().await,
                StageName::LoadDatabase => self.load_database().await,
                StageName::LoadFlatFile => self.load_flat_file().await,
                StageName::Version => self.version().await,
                StageName::Commit => self.commit().await,
            }?;
            info!("stage finished");
            Ok::<_, PipelineError>(report)
        }
        .instrument(span)
        .await
    }

    /// Run every stage in order, each retried per the configured policy.
    /// Overlapping runs are refused rather than queued.
    pub async fn run_once(&self) -> Result<RunSummary> {
        let _guard = self
            .run_lock
            .try_lock()
            .map_err(|_| anyhow::anyhow!("a pipeline run is already in progress"))?;

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("pipeline_run", %run_id);
        let stages = async {
            info!(stages = StageName::ALL.len(), "pipeline run started");
            let mut stages = Vec::with_capacity(StageName::ALL.len());
            for stage in StageName::ALL {
                let report = run_with_retry(&self.config.retry, stage, || self.run_stage(stage))
                    .await
                    .with_context(|| format!("stage {stage} failed"))?;
                stages.push((stage, report));
            }
            Ok::<_, anyhow::Error>(stages)
        }
        .instrument(span)
        .await?;

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            stages,
        };
        info!(%run_id, committed = summary.committed(), "pipeline run complete");
        Ok(summary)
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let pipeline = Arc::clone(self);
        let cron = self.config.sync_cron.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_once().await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        committed = summary.committed(),
                        "scheduled pipeline run finished"
                    ),
                    Err(err) => {
                        let detail = format!("{err:#}");
                        error!(error = %detail, "scheduled pipeline run failed");
                    }
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        info!(cron = %cron, "pipeline scheduler configured");
        Ok(Some(sched))
    }

    async fn read_cleaned_record(&self) -> std::result::Result<Record, PipelineError> {
        read_record(&self.config.cleaned_record_path()).await
    }
}

pub async fn read_record(path: &Path) -> std::result::Result<Record, PipelineError> {
    let bytes = fs::read(path)
        .await
        .map_err(|err| PipelineError::io(path, err))?;
    serde_json::from_slice(&bytes).map_err(|err| {
        PipelineError::Validation(format!("{} is not a normalized record: {err}", path.display()))
    })
}

pub async fn run_once_from_env() -> Result<RunSummary> {
    let pipeline = Pipeline::new(PipelineConfig::from_env())?;
    pipeline.run_once().await
}
