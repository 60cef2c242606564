// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// Thin dispatch onto the session manager: no trading logic lives here. All
// endpoints sit under `/api/v1/`. Health is public; session lifecycle is open
// to the upstream platform (which fronts its own auth); admin endpoints
// require the shared-secret header checked by the `AdminToken` extractor.
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::api::auth::AdminToken;
use crate::config::SessionSpec;
use crate::session::{SessionError, SessionManager};

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(manager: Arc<SessionManager>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Session lifecycle ───────────────────────────────────────
        .route("/api/v1/sessions", post(register))
        .route("/api/v1/sessions/:id/start", post(start))
        .route("/api/v1/sessions/:id/stop", post(stop))
        .route("/api/v1/sessions/:id", get(status))
        .route("/api/v1/sessions/:id", delete(unregister))
        // ── Admin (shared-secret gated) ─────────────────────────────
        .route("/api/v1/sessions", get(list_sessions))
        .route("/api/v1/usage", get(usage))
        .route("/api/v1/sessions/:id/close-positions", post(close_positions))
        // ── Middleware & State ──────────────────────────────────────
        .layer(cors)
        .with_state(manager)
}

// =============================================================================
// Error mapping
// =============================================================================

struct ApiError(SessionError);

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SessionError::NotFound(_) => StatusCode::NOT_FOUND,
            SessionError::AlreadyRegistered(_) => StatusCode::CONFLICT,
            SessionError::ResourceExhausted { .. } => StatusCode::TOO_MANY_REQUESTS,
            SessionError::InvalidConfig(_) => StatusCode::UNPROCESSABLE_ENTITY,
            SessionError::InvalidTransition { .. } => StatusCode::CONFLICT,
            SessionError::StopTimeout(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = match &self.0 {
            SessionError::InvalidConfig(problems) => serde_json::json!({
                "error": "invalid session configuration",
                "problems": problems,
            }),
            other => serde_json::json!({ "error": other.to_string() }),
        };

        (status, Json(body)).into_response()
    }
}

// =============================================================================
// Public
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    server_time: i64,
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// Session lifecycle
// =============================================================================

async fn register(
    State(manager): State<Arc<SessionManager>>,
    Json(spec): Json<SessionSpec>,
) -> Result<impl IntoResponse, ApiError> {
    let session_id = manager.register(spec)?;
    info!(session_id, "session registered via API");
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "sessionId": session_id })),
    ))
}

async fn start(
    State(manager): State<Arc<SessionManager>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    manager.start(&id).await?;
    Ok(Json(serde_json::json!({ "sessionId": id, "status": "STARTING" })))
}

async fn stop(
    State(manager): State<Arc<SessionManager>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    manager.stop(&id).await?;
    Ok(Json(serde_json::json!({ "sessionId": id, "status": "STOPPED" })))
}

async fn status(
    State(manager): State<Arc<SessionManager>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let (status, snapshot) = manager.status(&id)?;
    Ok(Json(serde_json::json!({
        "sessionId": id,
        "status": status,
        "snapshot": snapshot,
    })))
}

async fn unregister(
    State(manager): State<Arc<SessionManager>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    manager.unregister(&id).await?;
    Ok(Json(serde_json::json!({ "sessionId": id, "removed": true })))
}

// =============================================================================
// Admin
// =============================================================================

async fn list_sessions(
    _admin: AdminToken,
    State(manager): State<Arc<SessionManager>>,
) -> impl IntoResponse {
    Json(manager.list_all())
}

async fn usage(_admin: AdminToken, State(manager): State<Arc<SessionManager>>) -> impl IntoResponse {
    Json(manager.usage())
}

async fn close_positions(
    _admin: AdminToken,
    State(manager): State<Arc<SessionManager>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    manager.force_close_positions(&id).await?;
    Ok(Json(serde_json::json!({ "sessionId": id, "closing": true })))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn app() -> Router {
        router(Arc::new(SessionManager::new(4, None)))
    }

    fn valid_spec_json(user_id: &str) -> String {
        serde_json::json!({
            "user_id": user_id,
            "user_bot_id": "bot-1",
            "credentials": { "api_key": "k", "api_secret": "s", "demo": true },
            "symbol": "BTCUSDT",
            "leverage": 2,
            "settings": {},
            "webhook_url": "http://localhost/hook",
            "webhook_secret": "secret"
        })
        .to_string()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_is_public() {
        let response = app()
            .oneshot(Request::get("/api/v1/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn register_returns_created() {
        let response = app()
            .oneshot(
                Request::post("/api/v1/sessions")
                    .header("Content-Type", "application/json")
                    .body(Body::from(valid_spec_json("u1")))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let json = body_json(response).await;
        assert_eq!(json["sessionId"], "u1");
    }

    #[tokio::test]
    async fn register_invalid_config_is_unprocessable() {
        let mut spec: serde_json::Value =
            serde_json::from_str(&valid_spec_json("u1")).unwrap();
        spec["settings"] = serde_json::json!({
            "levels": [
                { "percent": 1.0, "max_orders": 5, "lot_size": 0.001 },
                { "percent": 0.5, "max_orders": 5, "lot_size": 0.001 },
                { "percent": 2.0, "max_orders": 5, "lot_size": 0.001 },
                { "percent": 3.0, "max_orders": 5, "lot_size": 0.001 }
            ]
        });

        let response = app()
            .oneshot(
                Request::post("/api/v1/sessions")
                    .header("Content-Type", "application/json")
                    .body(Body::from(spec.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let json = body_json(response).await;
        assert!(json["problems"].as_array().is_some());
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let response = app()
            .oneshot(
                Request::get("/api/v1/sessions/ghost")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unregister_unknown_session_is_ok() {
        let response = app()
            .oneshot(
                Request::delete("/api/v1/sessions/ghost")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn capacity_exhaustion_maps_to_429() {
        let app = router(Arc::new(SessionManager::new(1, None)));

        let first = app
            .clone()
            .oneshot(
                Request::post("/api/v1/sessions")
                    .header("Content-Type", "application/json")
                    .body(Body::from(valid_spec_json("u1")))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::CREATED);

        let second = app
            .oneshot(
                Request::post("/api/v1/sessions")
                    .header("Content-Type", "application/json")
                    .body(Body::from(valid_spec_json("u2")))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn admin_endpoints_require_the_shared_secret() {
        std::env::set_var(crate::api::auth::ADMIN_TOKEN_ENV, "topsecret");
        let app = app();

        let denied = app
            .clone()
            .oneshot(Request::get("/api/v1/usage").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::FORBIDDEN);

        let wrong = app
            .clone()
            .oneshot(
                Request::get("/api/v1/usage")
                    .header(crate::api::auth::ADMIN_TOKEN_HEADER, "nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(wrong.status(), StatusCode::FORBIDDEN);

        let allowed = app
            .oneshot(
                Request::get("/api/v1/usage")
                    .header(crate::api::auth::ADMIN_TOKEN_HEADER, "topsecret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(allowed.status(), StatusCode::OK);
        let json = body_json(allowed).await;
        assert_eq!(json["maxSessions"], 4);
    }
}
