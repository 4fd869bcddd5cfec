use std::sync::Arc;

use anyhow::{Context, Result};
use apod_sync::{Pipeline, PipelineConfig, StageName, StageReport};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "apod-cli")]
#[command(about = "APOD snapshot pipeline command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every stage once, in order.
    Run,
    /// Run a single stage against the files left by earlier stages.
    Stage {
        #[arg(value_enum)]
        stage: StageArg,
    },
    /// Run on the configured cron schedule until interrupted.
    Schedule,
    /// List history entries of the snapshot store, newest first.
    History,
    /// Rewrite a tracked file's working copy from the blob cache.
    Restore { name: String },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StageArg {
    Extract,
    Transform,
    LoadDb,
    LoadCsv,
    Version,
    Commit,
}

impl From<StageArg> for StageName {
    fn from(arg: StageArg) -> Self {
        match arg {
            StageArg::Extract => StageName::Extract,
            StageArg::Transform => StageName::Transform,
            StageArg::LoadDb => StageName::LoadDatabase,
            StageArg::LoadCsv => StageName::LoadFlatFile,
            StageArg::Version => StageName::Version,
            StageArg::Commit => StageName::Commit,
        }
    }
}

fn init_logging() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("APOD_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .context("initializing json logging")?;
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init()
            .context("initializing logging")?;
    }
    Ok(())
}

fn describe(report: &StageReport) -> String {
    match report {
        StageReport::Extracted { path } => format!("raw payload at {}", path.display()),
        StageReport::Transformed { path, date } => {
            format!("record {date} at {}", path.display())
        }
        StageReport::DatabaseLoaded(outcome) => format!("database: {outcome:?}"),
        StageReport::DatabaseSkipped => "database: skipped (DATABASE_URL unset)".to_string(),
        StageReport::FlatFileMerged(report) => format!(
            "{}: rows={} replaced_existing_key={}",
            report.path.display(),
            report.rows,
            report.replaced_existing_key
        ),
        StageReport::Versioned(report) => format!(
            "{}: changed={} sha256={}",
            report.descriptor_path.display(),
            report.changed,
            report.descriptor.content_hash().unwrap_or("-")
        ),
        StageReport::Committed(outcome) => format!("history: {outcome:?}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;
    let cli = Cli::parse();
    let pipeline = Pipeline::new(PipelineConfig::from_env())?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let summary = pipeline.run_once().await?;
            for (stage, report) in &summary.stages {
                println!("{stage}: {}", describe(report));
            }
            println!(
                "run complete: run_id={} committed={}",
                summary.run_id,
                summary.committed()
            );
        }
        Commands::Stage { stage } => {
            let stage = StageName::from(stage);
            let report = pipeline
                .run_stage(stage)
                .await
                .with_context(|| format!("stage {stage} failed"))?;
            println!("{stage}: {}", describe(&report));
        }
        Commands::Schedule => {
            let pipeline = Arc::new(pipeline);
            let Some(sched) = pipeline.maybe_build_scheduler().await? else {
                anyhow::bail!("scheduler disabled; set APOD_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %pipeline.config().sync_cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            let mut sched = sched;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::History => {
            for entry in pipeline.history().entries().await? {
                println!(
                    "{} {} {}",
                    &entry.id[..entry.id.len().min(12)],
                    entry.committed_at.to_rfc3339(),
                    entry.message
                );
            }
        }
        Commands::Restore { name } => {
            let path = pipeline.snapshots().restore(&name).await?;
            println!("restored {}", path.display());
        }
    }

    Ok(())
}
