//! CLI entry point for the booking cancellation training pipeline.

use anyhow::{Context, Result};
use booking_pipeline::{ArtifactPaths, PipelineConfig, TrainingPipeline, logging};
use clap::Parser;
use dotenv::dotenv;
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Hotel booking cancellation training pipeline",
    long_about = "Fetches the reservations dataset, preprocesses it, tunes a gradient-boosted \
                  classifier and records the run.\n\n\
                  ENVIRONMENT VARIABLES:\n  \
                  GOOGLE_OAUTH_ACCESS_TOKEN   Bearer token for Cloud Storage\n  \
                  STORAGE_EMULATOR_HOST       Alternative Cloud Storage endpoint\n  \
                  RUST_LOG                    Log filter, overrides --log-level"
)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "config/config.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Directory for daily log files
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,
}

fn main() -> Result<()> {
    dotenv().ok();
    let args = Args::parse();

    let log_path = logging::init(&args.log_dir, &args.log_level)
        .context("Failed to initialize logging")?;
    info!("Writing logs to {}", log_path.display());

    let config = PipelineConfig::from_path(&args.config)?;
    let outcome = TrainingPipeline::new(&config, ArtifactPaths::default())
        .and_then(|pipeline| pipeline.run());

    match outcome {
        Ok(report) => {
            info!(
                "Run {} finished; model at {}",
                report.training.run_id,
                report.training.model_path.display()
            );
            Ok(())
        }
        Err(e) => {
            error!("[{}] {}", e.error_code(), e.chain());
            Err(e.into())
        }
    }
}
