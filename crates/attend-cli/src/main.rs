use std::path::PathBuf;

use anyhow::{Context, Result};
use attend_core::quality::crop_face;
use attend_core::{BoundingBox, QualityGate, RecordStore, Usn};
use attend_store::SqliteStore;
use attendd::config::Config;
use clap::{Parser, Subcommand};
use serde::Deserialize;

#[derive(Parser)]
#[command(name = "attend", about = "Face attendance CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Score image files with the sharpness gate (no face detection)
    Sharpness {
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// List an identity's stored gallery
    Gallery {
        usn: String,
    },
    /// Ask the daemon to remove stored embeddings below the sharpness
    /// threshold and trim galleries over capacity
    Cleanup {
        /// Daemon base URL; defaults to the configured bind address
        #[arg(long)]
        url: Option<String>,
    },
    /// Show daemon status
    Status {
        /// Daemon base URL; defaults to the configured bind address
        #[arg(long)]
        url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load().context("failed to load configuration")?;

    match cli.command {
        Commands::Sharpness { images } => sharpness(&config, &images)?,
        Commands::Gallery { usn } => gallery(&config, &usn).await?,
        Commands::Cleanup { url } => cleanup(&config, url).await?,
        Commands::Status { url } => status(&config, url).await?,
    }

    Ok(())
}

fn sharpness(config: &Config, images: &[PathBuf]) -> Result<()> {
    let gate = QualityGate::new(config.sharpness_threshold);
    for path in images {
        let image =
            image::open(path).with_context(|| format!("cannot read {}", path.display()))?;
        let whole = BoundingBox {
            x: 0.0,
            y: 0.0,
            width: image.width() as f32,
            height: image.height() as f32,
            confidence: 1.0,
            landmarks: None,
        };
        let Some(crop) = crop_face(&image, &whole, config.crop_size) else {
            println!("{}: empty image", path.display());
            continue;
        };
        let score = gate.score(&crop);
        let verdict = if gate.accepts(score) { "accept" } else { "reject" };
        println!(
            "{}: sharpness={score:.1} threshold={} {verdict}",
            path.display(),
            gate.threshold()
        );
    }
    Ok(())
}

async fn gallery(config: &Config, raw_usn: &str) -> Result<()> {
    let usn = Usn::parse(raw_usn)?;
    let store = SqliteStore::open(&config.db_path).await?;

    match store.find_identity(&usn).await? {
        Some(identity) => println!("{} ({})", identity.usn, identity.name),
        None => println!("{usn}: no profile"),
    }

    let records = store.gallery(&usn).await?;
    if records.is_empty() {
        println!("  gallery empty");
    }
    for record in records {
        println!(
            "  {}  sharpness={:.1}  source={}  model={}  created={}  {}",
            record.id,
            record.sharpness,
            record.source.as_str(),
            record.embedding.model,
            record.created_at.format("%Y-%m-%d %H:%M"),
            record.image.map(|i| i.url).unwrap_or_else(|| "-".to_string()),
        );
    }
    Ok(())
}

#[derive(Deserialize)]
struct CleanupReport {
    threshold: f64,
    removed: usize,
    trimmed: usize,
    images_deleted: usize,
    failures: Vec<CleanupFailure>,
}

#[derive(Deserialize)]
struct CleanupFailure {
    record_id: String,
    usn: String,
    detail: String,
}

/// Base URL of the daemon: `--url`, else the configured bind address with
/// wildcard hosts mapped to loopback.
fn daemon_url(config: &Config, url: Option<String>) -> String {
    let base = url.unwrap_or_else(|| {
        let host = match config.host.as_str() {
            "0.0.0.0" | "::" => "127.0.0.1",
            other => other,
        };
        format!("http://{host}:{}", config.port)
    });
    base.trim_end_matches('/').to_string()
}

// The sweep runs inside attendd so it takes the same per-identity locks as
// registration and check-in.
async fn cleanup(config: &Config, url: Option<String>) -> Result<()> {
    let base = daemon_url(config, url);
    let response = reqwest::Client::new()
        .post(format!("{base}/cleanup_blurry"))
        .send()
        .await
        .with_context(|| format!("attendd not reachable at {base}"))?;
    let report: CleanupReport = response.error_for_status()?.json().await?;

    println!(
        "removed {} embeddings below sharpness {}, trimmed {} over capacity ({} images deleted)",
        report.removed, report.threshold, report.trimmed, report.images_deleted
    );
    for failure in &report.failures {
        println!("  failed {} ({}): {}", failure.record_id, failure.usn, failure.detail);
    }
    Ok(())
}

async fn status(config: &Config, url: Option<String>) -> Result<()> {
    let base = daemon_url(config, url);
    let response = reqwest::get(format!("{base}/status"))
        .await
        .with_context(|| format!("attendd not reachable at {base}"))?;
    let body: serde_json::Value = response.error_for_status()?.json().await?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}
