//! Scan one label photo offline and print the outcome as JSON
//! Run with: cargo run --release --features tesseract --bin scan_image -- <image_path>
//!
//! Exit code: 0 when a record was found, 2 when nothing was found, 1 on error.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::info;

use nutrition_scanner::{
    core::Config,
    orchestration::pipeline::ScanPipeline,
    utils::Metrics,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::new().context("Failed to load configuration")?;

    // Logs go to stderr so stdout stays valid JSON
    tracing_subscriber::fmt()
        .with_env_filter(format!(
            "nutrition_scanner={},ort=off",
            config.log_level().as_str().to_lowercase()
        ))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let path = match std::env::args().nth(1) {
        Some(path) => PathBuf::from(path),
        None => {
            eprintln!("Usage: scan_image <image_path>");
            std::process::exit(1);
        }
    };

    if !path.is_file() {
        eprintln!("Image not found: {}", path.display());
        std::process::exit(1);
    }

    #[cfg(not(feature = "tesseract"))]
    tracing::warn!("Built without the `tesseract` feature; text recognition is unavailable and startup will fail");

    let pipeline = ScanPipeline::from_config(&config, Metrics::new())
        .context("Failed to initialize scan pipeline")?;

    info!("Scanning {}", path.display());
    let outcome = pipeline
        .scan_file(path.clone())
        .await
        .with_context(|| format!("Failed to scan {}", path.display()))?;

    println!("{}", serde_json::to_string_pretty(&outcome)?);

    if !outcome.is_found() {
        eprintln!("{}", outcome.message());
        std::process::exit(2);
    }
    Ok(())
}
