use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use rollcall_core::{decode_frame, Enroller, Pipeline, PipelineConfig};
use rollcall_models::spawn_engine;
use rollcall_store::Database;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;

use config::{HostConfig, LivenessKind};

#[derive(Parser)]
#[command(name = "rollcall", about = "Face-verified attendance")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run frames through the verification pipeline, printing one JSON result per frame
    Recognize {
        /// Image files, processed in order
        #[arg(required = true)]
        frames: Vec<PathBuf>,
        /// Class or subject the attendance counts for
        #[arg(short, long)]
        subject: Option<String>,
    },
    /// Enroll reference embeddings for an identity
    Enroll {
        #[arg(short, long)]
        identity: String,
        /// Sample images; each contributes its largest face
        #[arg(required = true)]
        frames: Vec<PathBuf>,
    },
    /// Show enrolled identities, attendance and audit counts
    Status {
        /// Day to list attendance for (default: today)
        #[arg(short, long)]
        day: Option<NaiveDate>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let host = HostConfig::from_env().map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Recognize { frames, subject } => {
            let (pipeline, _) = build_pipeline(&host).await?;
            for path in &frames {
                let bytes = read(path)?;
                let result = pipeline
                    .recognize_bytes(&bytes, subject.as_deref())
                    .await
                    .with_context(|| format!("frame {}", path.display()))?;
                println!("{}", serde_json::to_string(&result)?);
            }
        }
        Commands::Enroll { identity, frames } => {
            let (pipeline, db) = build_pipeline(&host).await?;
            let samples = frames
                .iter()
                .map(|path| {
                    decode_frame(&read(path)?).with_context(|| format!("frame {}", path.display()))
                })
                .collect::<Result<Vec<_>>>()?;

            let report = Enroller::new(pipeline, db).enroll(&identity, &samples).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.accepted == 0 {
                anyhow::bail!("no sample was accepted for {identity}");
            }
        }
        Commands::Status { day } => {
            let db = open_db(&host).await?;
            let day = day.unwrap_or_else(|| chrono::Local::now().date_naive());

            println!("database: {}", host.db_path.display());
            println!("enrolled identities:");
            for (identity, samples) in db.reference_counts().await? {
                println!("  {identity} ({samples} samples)");
            }
            println!("attendance on {day}:");
            for record in db.attendance_on(day).await? {
                println!(
                    "  {} {} {} {:.2} {}",
                    record.marked_at.format("%H:%M:%S"),
                    record.identity_id,
                    record.subject_context.as_deref().unwrap_or("-"),
                    record.confidence,
                    record.status.as_str(),
                );
            }
            println!("audit log:");
            for (reason, count) in db.audit_summary().await? {
                println!("  {reason}: {count}");
            }
        }
    }

    Ok(())
}

async fn open_db(host: &HostConfig) -> Result<Arc<Database>> {
    let db = Database::open(&host.db_path)
        .await
        .with_context(|| format!("open database {}", host.db_path.display()))?;
    Ok(Arc::new(db))
}

/// Load models and stores; any missing piece aborts startup.
async fn build_pipeline(host: &HostConfig) -> Result<(Pipeline, Arc<Database>)> {
    let config = PipelineConfig::load()?;
    let db = open_db(host).await?;
    let models = spawn_engine(&host.model_paths()).context("load ONNX models")?;

    let builder = Pipeline::builder(config)
        .localizer(Arc::new(models.clone()))
        .extractor(Arc::new(models.clone()))
        .reference_store(db.clone())
        .attendance_store(db.clone())
        .audit_store(db.clone());
    let builder = match host.liveness {
        LivenessKind::Model => builder.liveness_model(Arc::new(models)),
        LivenessKind::Heuristic => builder.heuristic_liveness(),
    };

    Ok((builder.build()?, db))
}

fn read(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("read {}", path.display()))
}
