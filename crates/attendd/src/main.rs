use std::sync::Arc;

use anyhow::{Context, Result};
use attend_core::Pipeline;
use attend_store::{FsObjectStore, SqliteStore};
use attendd::config::Config;
use attendd::engine::spawn_engine;
use attendd::state::AppState;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "attendd=info,attend_core=info,tower_http=info";

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "attendd starting");

    let config = Config::load().context("failed to load configuration")?;
    let policy = config.policy();
    tracing::info!(
        sharpness_threshold = policy.sharpness_threshold,
        distance_threshold = policy.distance_threshold,
        max_gallery_size = policy.max_gallery_size,
        "policy"
    );

    let records = SqliteStore::open(&config.db_path)
        .await
        .with_context(|| format!("failed to open database {}", config.db_path.display()))?;
    tracing::info!(path = %config.db_path.display(), "record store ready");

    let objects = FsObjectStore::new(&config.image_dir, &config.public_base_url);
    let engine = spawn_engine(&config.model_dir).context("failed to start face engine")?;
    let model = engine.model().to_string();

    let pipeline = Pipeline::new(Arc::new(engine), Arc::new(records), Arc::new(objects), policy);
    let state = AppState {
        pipeline: Arc::new(pipeline),
        config: Arc::new(config.clone()),
        model,
    };
    let app = attendd::build_router(state);

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(addr = %addr, "attendd ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("attendd shutting down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
}
