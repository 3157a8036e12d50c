//! hazardwatch -- hazard status engine and signed telemetry ingestion for
//! environmental monitoring nodes.
//!
//! Ground stations (radiation, particulates, VOC, weather) and water stations
//! (TDS, pH, turbidity, temperature) upload signed readings. Each reading is
//! scored against its node's own recent history, hard physical limits and an
//! optional offline-trained outlier model, and the result is published as a
//! per-node and deployment-wide status.

pub mod analysis;
pub mod api;
pub mod config;
pub mod detect;
pub mod security;
pub mod storage;
pub mod telemetry;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::api::state::AppState;
use crate::config::AppConfig;
use crate::storage::{MemoryStore, ReadingStore, SqliteStore};

/// Start the API server and run until the listener fails.
///
/// With `in_memory` readings live only for the lifetime of the process.
pub async fn serve(config: AppConfig, in_memory: bool) -> Result<()> {
    let addr: SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", config.server.bind))?;

    let store: Arc<dyn ReadingStore> = if in_memory {
        info!("using in-memory reading store");
        Arc::new(MemoryStore::new())
    } else {
        info!(db_path = %config.server.db_path.display(), "initializing database");
        Arc::new(SqliteStore::open(&config.server.db_path)?)
    };

    let state = AppState::new(config, store);
    let secrets = state.verifier.context().node_count();
    if secrets == 0 {
        warn!("no hmac secrets configured, every ingest request will be rejected");
    } else {
        info!(nodes = secrets, "ingest secrets loaded");
    }

    let app = api::router(state);
    info!(%addr, "hazardwatch listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
