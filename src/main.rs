//! Face Stream Service
//!
//! Real-time multi-session face recognition over video sources, served as
//! annotated MJPEG streams through a REST API.

use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use facestream::api::rest::{create_rest_router, AppState};
use facestream::config::Config;
use facestream::engine::openvino::OpenVinoEngineFactory;
use facestream::engine::{EnginePool, ImageDirSource};
use facestream::service::StreamManager;
use facestream::storage::InMemoryIdentityStore;

#[tokio::main]
async fn main() -> Result<()> {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    info!("starting face stream service v{}", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(Config::load(Config::default_path()).unwrap_or_else(|err| {
        info!("using default config ({err})");
        Config::default()
    }));

    info!("configuration loaded:");
    info!("  REST port: {}", config.server.rest_port);
    info!("  device: {}", config.inference.device);
    info!("  engine pool capacity: {}", config.inference.pool_capacity);
    info!(
        "  default stream lifetime: {} minute(s)",
        config.stream.default_lifetime_minutes
    );

    // The pool is built eagerly: a partially-loadable model setup aborts
    // startup instead of failing streams later.
    let factory = Arc::new(OpenVinoEngineFactory::new(&config)?);
    let pool = Arc::new(EnginePool::new(config.inference.pool_capacity, factory)?);

    let store = Arc::new(InMemoryIdentityStore::new());
    if store.is_empty() {
        info!("identity store is empty; faces will be labeled Unknown until identities are added");
    }

    let manager = Arc::new(StreamManager::new(
        config.clone(),
        pool.clone(),
        Arc::new(ImageDirSource),
        store,
    ));

    tokio::spawn(manager.clone().run_expiry_sweeper());
    info!("expiry sweeper started");

    let state = Arc::new(AppState {
        manager: manager.clone(),
    });
    let router = create_rest_router(state);

    let addr = format!("0.0.0.0:{}", config.server.rest_port);
    let listener = TcpListener::bind(&addr).await?;
    info!("REST API listening on http://{addr}");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    info!("shutdown signal received, cleaning up");
    manager.shutdown_all().await;
    pool.dispose();
    info!("goodbye");

    Ok(())
}
