use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod catalog;
mod config;
mod db;
mod error;
mod jobs;
mod mastery;
mod models;
mod notify;
mod platform;
mod progress;
mod refresh;
mod report;
mod store;
mod taxonomy;
#[cfg(test)]
mod testing;

use crate::config::SyncArgs;
use crate::db::PgSyncStore;
use crate::jobs::{RefreshJobRegistry, StartRefreshRequest};
use crate::notify::LogNotifier;
use crate::platform::HttpPlatformClient;
use crate::progress::ProgressAggregator;
use crate::refresh::RefreshContext;
use crate::store::SyncStore;

#[derive(Parser)]
#[command(name = "platform-progress-sync")]
#[command(about = "Mirror learning-platform performance and track study plan progress", long_about = None)]
struct Cli {
    #[command(flatten)]
    sync: SyncArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load demo students and performance records
    Seed,
    /// Upsert students from a roster CSV
    ImportRoster {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Mirror missing platform days for active students and wait for the job
    Refresh {
        /// Limit the refresh to these students
        #[arg(long = "student")]
        students: Vec<Uuid>,
        #[arg(long, default_value = "cli")]
        session: String,
    },
    /// Recompute study plan progress from mirrored evidence
    Evaluate {
        #[arg(long)]
        lookback_days: Option<i64>,
    },
    /// Generate a markdown progress report
    Report {
        #[arg(long)]
        student: Option<Uuid>,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
    /// Print the parsed taxonomy for a curriculum title
    ParseTitle { title: String },
}

async fn connect() -> anyhow::Result<PgPool> {
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a production Postgres instance")?;

    PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.sync.into_config();

    match cli.command {
        Commands::ParseTitle { title } => {
            let parsed = taxonomy::parse_title(&title);
            println!("{}", serde_json::to_string_pretty(&parsed)?);
        }
        Commands::InitDb => {
            let pool = connect().await?;
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            let pool = connect().await?;
            db::seed(&pool).await?;
            println!("Seed data inserted.");
        }
        Commands::ImportRoster { csv } => {
            let pool = connect().await?;
            let upserted = db::import_roster(&pool, &csv).await?;
            println!("Upserted {upserted} students from {}.", csv.display());
        }
        Commands::Refresh { students, session } => {
            let platform = HttpPlatformClient::from_config(&config)?;
            let pool = connect().await?;
            let ctx = RefreshContext::new(
                Arc::new(platform),
                Arc::new(PgSyncStore::new(pool)),
                Arc::new(LogNotifier),
                &config,
            );
            let registry = RefreshJobRegistry::new(ctx, config.refresh_concurrency);
            let request = StartRefreshRequest {
                session_id: session.clone(),
                student_ids: (!students.is_empty()).then_some(students),
            };

            let job = registry.start_refresh_job(request).await?;
            println!("Refresh job {} started for {} students.", job.id, job.students.len());

            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                let (snapshot, owner) = registry
                    .get_refresh_job_internal(job.id)
                    .context("refresh job disappeared from the registry")?;
                anyhow::ensure!(owner == session, "refresh job {} belongs to another session", job.id);
                if snapshot.status.is_terminal() {
                    break;
                }
            }
            let snapshot = registry
                .wait(job.id)
                .await
                .context("refresh job disappeared from the registry")?;

            for student in &snapshot.students {
                println!(
                    "- {}: {:?} ({} dates, {} failed calls){}",
                    student.name,
                    student.status,
                    student.counts.dates_processed,
                    student.counts.failed_calls,
                    student
                        .error
                        .as_deref()
                        .map(|e| format!(" {e}"))
                        .unwrap_or_default()
                );
            }
            println!(
                "Job {:?}: {}/{} students succeeded, {} dates processed.",
                snapshot.status,
                snapshot.summary.students_succeeded,
                snapshot.summary.students_total,
                snapshot.summary.dates_processed
            );
            if let Some(error) = snapshot.error {
                anyhow::bail!("refresh job failed: {error}");
            }
        }
        Commands::Evaluate { lookback_days } => {
            let store = PgSyncStore::new(connect().await?);
            let lookback = lookback_days.unwrap_or(config.progress_lookback_days);
            let summary = ProgressAggregator::new(&store, lookback)
                .evaluate_all(Utc::now())
                .await?;
            println!(
                "Evaluated {} students ({} skipped, {} failed), wrote {} progress rows.",
                summary.students_evaluated,
                summary.students_skipped,
                summary.students_failed,
                summary.rows_written
            );
        }
        Commands::Report { student, out } => {
            let store = PgSyncStore::new(connect().await?);
            let rows = store.list_progress_rows(student).await?;
            let students = match student {
                Some(id) => store.get_students(&[id]).await?,
                None => store.list_active_students().await?,
            };
            let scope = student.and_then(|id| students.iter().find(|s| s.id == id));
            let report = report::build_report(
                scope.map(|s| s.name.as_str()),
                config.progress_lookback_days,
                Utc::now(),
                &rows,
                &students,
            );
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}
