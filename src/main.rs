// =============================================================================
// hedgegrid — Multi-Tenant Grid-Hedging Trading Engine — Main Entry Point
// =============================================================================
//
// The process hosts many independent trading sessions, each driving a hedged
// grid ladder on one perpetual-futures symbol. Sessions are created through
// the REST control API and run their own tick task until stopped.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod candle_cache;
mod config;
mod engine;
mod exchange;
mod indicators;
mod persist;
mod session;
mod snapshot;
mod strategy;
mod types;
mod webhook;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::persist::StateStore;
use crate::session::SessionManager;

/// Default cap on concurrently registered sessions.
const DEFAULT_MAX_SESSIONS: usize = 100;

/// Global deadline for stopping all sessions on shutdown.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(20);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        hedgegrid — Starting Up                           ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let max_sessions = std::env::var("HEDGEGRID_MAX_SESSIONS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_MAX_SESSIONS);

    let state_dir =
        std::env::var("HEDGEGRID_STATE_DIR").unwrap_or_else(|_| "session_state".into());

    // ── 2. Indicator state store ─────────────────────────────────────────
    let store = match StateStore::open(&state_dir) {
        Ok(store) => Some(store),
        Err(e) => {
            warn!(error = %e, state_dir, "indicator persistence disabled");
            None
        }
    };

    // ── 3. Session manager ───────────────────────────────────────────────
    let manager = Arc::new(SessionManager::new(max_sessions, store));
    info!(max_sessions, "session manager ready");

    // ── 4. Start the API server ──────────────────────────────────────────
    let bind_addr =
        std::env::var("HEDGEGRID_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());

    let app = api::rest::router(manager.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "API server listening");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    manager.shutdown(SHUTDOWN_DEADLINE).await;
    server.abort();

    info!("hedgegrid shut down complete.");
    Ok(())
}
