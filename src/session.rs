// =============================================================================
// Session Manager — process-wide registry of trading engines
// =============================================================================
//
// Keyed by user id. All lifecycle operations go through here so that
// concurrent register / start / stop / unregister calls cannot leak a tick
// task or violate the status DAG. The registry lock is the only state shared
// between sessions; engines never see each other.
//
// `unregister` guarantees the engine's tick loop has exited before it
// returns. `shutdown` stops every session in parallel under a global
// deadline; sessions that miss it are force-aborted and marked ERROR.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::SessionSpec;
use crate::engine::TradingEngine;
use crate::exchange::binance::FuturesClient;
use crate::exchange::ExchangeAdapter;
use crate::persist::StateStore;
use crate::snapshot::StatusSnapshot;
use crate::types::SessionStatus;
use crate::webhook::{EventSink, WebhookEmitter};

/// How long a single `stop` waits for the tick loop before giving up.
const STOP_DEADLINE: Duration = Duration::from_secs(30);

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session already registered: {0}")]
    AlreadyRegistered(String),

    #[error("session capacity exhausted ({active}/{max})")]
    ResourceExhausted { active: usize, max: usize },

    #[error("invalid session configuration: {}", .0.join("; "))]
    InvalidConfig(Vec<String>),

    #[error("session {user_id} cannot perform this operation from {status}")]
    InvalidTransition {
        user_id: String,
        status: SessionStatus,
    },

    #[error("session {0} did not stop within the deadline")]
    StopTimeout(String),
}

// =============================================================================
// Handle
// =============================================================================

/// Everything the manager owns for one session.
struct SessionHandle {
    engine: Arc<TradingEngine>,
    emitter: Option<Arc<WebhookEmitter>>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Compact per-session line for the admin listing.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub user_id: String,
    pub symbol: String,
    pub status: SessionStatus,
    pub tick: u64,
}

/// Registry capacity and occupancy.
#[derive(Debug, Clone, Copy, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    pub active_sessions: usize,
    pub max_sessions: usize,
}

// =============================================================================
// Manager
// =============================================================================

pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
    max_sessions: usize,
    store: Option<StateStore>,
}

impl SessionManager {
    pub fn new(max_sessions: usize, store: Option<StateStore>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions,
            store,
        }
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Validate and create a session. The engine starts in IDLE; trading
    /// begins only on an explicit `start`.
    pub fn register(&self, spec: SessionSpec) -> Result<String, SessionError> {
        let adapter: Arc<dyn ExchangeAdapter> = Arc::new(FuturesClient::new(
            spec.credentials.api_key.clone(),
            spec.credentials.api_secret.clone(),
            spec.credentials.demo,
        ));

        let emitter = Arc::new(WebhookEmitter::spawn(
            spec.user_id.clone(),
            spec.webhook_url.clone(),
            spec.webhook_secret.clone(),
        ));

        self.register_with(spec, adapter, emitter.clone(), Some(emitter))
    }

    /// Registration with injected collaborators. Production goes through
    /// [`register`]; tests supply a mock adapter and sink directly.
    pub fn register_with(
        &self,
        spec: SessionSpec,
        adapter: Arc<dyn ExchangeAdapter>,
        sink: Arc<dyn EventSink>,
        emitter: Option<Arc<WebhookEmitter>>,
    ) -> Result<String, SessionError> {
        spec.validate().map_err(SessionError::InvalidConfig)?;

        let engine = Arc::new(TradingEngine::new(
            spec.user_id.clone(),
            spec.user_bot_id.clone(),
            spec.symbol.clone(),
            spec.leverage,
            spec.settings.clone(),
            adapter,
            sink,
            self.store.clone(),
        ));

        let handle = Arc::new(SessionHandle {
            engine,
            emitter,
            task: tokio::sync::Mutex::new(None),
        });

        let mut sessions = self.sessions.write();
        if sessions.contains_key(&spec.user_id) {
            return Err(SessionError::AlreadyRegistered(spec.user_id));
        }
        if sessions.len() >= self.max_sessions {
            return Err(SessionError::ResourceExhausted {
                active: sessions.len(),
                max: self.max_sessions,
            });
        }

        sessions.insert(spec.user_id.clone(), handle);
        info!(user_id = %spec.user_id, symbol = %spec.symbol, "session registered");
        Ok(spec.user_id)
    }

    fn handle(&self, user_id: &str) -> Result<Arc<SessionHandle>, SessionError> {
        self.sessions
            .read()
            .get(user_id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(user_id.to_string()))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Spawn the session's tick loop. Only valid from IDLE.
    pub async fn start(&self, user_id: &str) -> Result<(), SessionError> {
        let handle = self.handle(user_id)?;

        let mut task = handle.task.lock().await;
        let status = handle.engine.status();
        if task.is_some() || status != SessionStatus::Idle {
            return Err(SessionError::InvalidTransition {
                user_id: user_id.to_string(),
                status,
            });
        }

        let engine = handle.engine.clone();
        *task = Some(tokio::spawn(engine.run()));
        info!(user_id, "session started");
        Ok(())
    }

    /// Cooperatively stop the session and wait for its tick loop to exit.
    /// Idempotent: stopping a session that never started, or stopping twice,
    /// both succeed.
    pub async fn stop(&self, user_id: &str) -> Result<(), SessionError> {
        let handle = self.handle(user_id)?;
        handle.engine.request_stop();

        let mut slot = handle.task.lock().await;
        let Some(mut task) = slot.take() else {
            return Ok(());
        };

        match tokio::time::timeout(STOP_DEADLINE, &mut task).await {
            Ok(_) => {
                info!(user_id, "session stopped");
                Ok(())
            }
            Err(_) => {
                warn!(user_id, "session missed the stop deadline — aborting");
                task.abort();
                handle.engine.mark_error();
                Err(SessionError::StopTimeout(user_id.to_string()))
            }
        }
    }

    /// Current status and snapshot for one session.
    pub fn status(&self, user_id: &str) -> Result<(SessionStatus, StatusSnapshot), SessionError> {
        let handle = self.handle(user_id)?;
        Ok((handle.engine.status(), handle.engine.snapshot()))
    }

    /// Stop, drain the webhook queue, and destroy the session. Idempotent:
    /// unknown ids succeed silently.
    pub async fn unregister(&self, user_id: &str) -> Result<(), SessionError> {
        let Ok(handle) = self.handle(user_id) else {
            return Ok(());
        };

        // Best-effort stop; a timeout still proceeds to teardown (stop
        // already aborted the task and marked the engine ERROR).
        if let Err(e) = self.stop(user_id).await {
            warn!(user_id, error = %e, "stop during unregister failed");
        }

        if let Some(emitter) = &handle.emitter {
            emitter.shutdown().await;
        }
        if let Some(store) = &self.store {
            store.remove(user_id);
        }

        self.sessions.write().remove(user_id);
        info!(user_id, "session unregistered");
        Ok(())
    }

    // =========================================================================
    // Admin
    // =========================================================================

    pub fn list_all(&self) -> Vec<SessionSummary> {
        self.sessions
            .read()
            .values()
            .map(|h| SessionSummary {
                user_id: h.engine.user_id().to_string(),
                symbol: h.engine.symbol().to_string(),
                status: h.engine.status(),
                tick: h.engine.tick_count(),
            })
            .collect()
    }

    pub fn usage(&self) -> ResourceUsage {
        ResourceUsage {
            active_sessions: self.sessions.read().len(),
            max_sessions: self.max_sessions,
        }
    }

    /// Close every open position of one session. A running session flattens
    /// on its next tick (keeping tick processing serial); an idle one is
    /// flattened inline.
    pub async fn force_close_positions(&self, user_id: &str) -> Result<(), SessionError> {
        let handle = self.handle(user_id)?;

        if handle.engine.status() == SessionStatus::Running {
            handle.engine.request_force_close();
            return Ok(());
        }

        // No tick task is running, so touching the book here cannot race.
        if let Err(e) = handle.engine.flatten().await {
            warn!(user_id, error = %e, "force close failed");
        }
        Ok(())
    }

    /// Stop all sessions in parallel under one global deadline. Sessions past
    /// the deadline are aborted and marked ERROR.
    pub async fn shutdown(&self, deadline: Duration) {
        let handles: Vec<Arc<SessionHandle>> = self.sessions.read().values().cloned().collect();
        info!(count = handles.len(), "session manager shutting down");

        for handle in &handles {
            handle.engine.request_stop();
        }

        // Poll each task in place (without taking it) so that a deadline
        // miss still leaves the handle available for the abort pass below.
        let waiters = handles.iter().map(|handle| {
            let handle = handle.clone();
            async move {
                let mut slot = handle.task.lock().await;
                if let Some(task) = slot.as_mut() {
                    let _ = task.await;
                }
                *slot = None;
            }
        });

        if tokio::time::timeout(deadline, futures_util::future::join_all(waiters))
            .await
            .is_err()
        {
            warn!("shutdown deadline exceeded — aborting stragglers");
            for handle in &handles {
                if let Some(task) = handle.task.lock().await.take() {
                    task.abort();
                    handle.engine.mark_error();
                }
            }
        }

        for handle in &handles {
            if let Some(emitter) = &handle.emitter {
                emitter.shutdown().await;
            }
        }

        info!("session manager shut down");
    }
}
