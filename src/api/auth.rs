// =============================================================================
// Admin Shared-Secret Authentication — Axum extractor
// =============================================================================
//
// Admin endpoints (session listing, resource usage, force close) require the
// `X-Admin-Token` header to match the `HEDGEGRID_ADMIN_TOKEN` environment
// variable. Comparison is performed in constant time to prevent timing
// side-channels.
//
// Usage as an Axum extractor:
//
//   async fn handler(_admin: AdminToken, ...) { ... }
//
// A missing or invalid token short-circuits the request with 403 Forbidden
// before the handler body executes.
// =============================================================================

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

/// Header carrying the shared admin secret.
pub const ADMIN_TOKEN_HEADER: &str = "X-Admin-Token";

/// Environment variable holding the expected secret.
pub const ADMIN_TOKEN_ENV: &str = "HEDGEGRID_ADMIN_TOKEN";

// =============================================================================
// Constant-time comparison
// =============================================================================

/// Compare two byte slices in constant time. Always examines every byte even
/// after a mismatch so the comparison duration does not reveal the mismatch
/// position.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

// =============================================================================
// Extractor
// =============================================================================

/// Axum extractor validating the admin shared-secret header.
pub struct AdminToken;

pub struct AdminRejection {
    status: StatusCode,
    message: &'static str,
}

impl IntoResponse for AdminRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, axum::Json(body)).into_response()
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for AdminToken
where
    S: Send + Sync,
{
    type Rejection = AdminRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        // Read on every request so the secret can rotate without a restart.
        let expected = std::env::var(ADMIN_TOKEN_ENV).unwrap_or_default();

        if expected.is_empty() {
            warn!("{ADMIN_TOKEN_ENV} is not set — all admin requests will be rejected");
            return Err(AdminRejection {
                status: StatusCode::FORBIDDEN,
                message: "Admin authentication not configured",
            });
        }

        let presented = parts
            .headers
            .get(ADMIN_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        if presented.is_empty() {
            warn!("missing admin token header");
            return Err(AdminRejection {
                status: StatusCode::FORBIDDEN,
                message: "Missing admin token",
            });
        }

        if !constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
            warn!("invalid admin token presented");
            return Err(AdminRejection {
                status: StatusCode::FORBIDDEN,
                message: "Invalid admin token",
            });
        }

        Ok(AdminToken)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_identical() {
        assert!(constant_time_eq(b"hello", b"hello"));
    }

    #[test]
    fn constant_time_eq_different() {
        assert!(!constant_time_eq(b"hello", b"world"));
    }

    #[test]
    fn constant_time_eq_different_lengths() {
        assert!(!constant_time_eq(b"short", b"longer_string"));
    }

    #[test]
    fn constant_time_eq_empty() {
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn constant_time_eq_single_bit_diff() {
        assert!(!constant_time_eq(b"\x00", b"\x01"));
    }
}
