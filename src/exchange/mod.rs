// =============================================================================
// Exchange Adapter — the contract the trading engine consumes
// =============================================================================
//
// Engines never talk HTTP directly: every market-data read and every order
// goes through this trait. The production implementation is a signed REST
// client ([`binance::FuturesClient`]); tests drive the engine through a
// scriptable [`mock::MockExchange`]. Demo mode is an implementation concern —
// at this level demo and live are indistinguishable.

pub mod binance;
pub mod retry;

#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Candle, Side};

// =============================================================================
// Error taxonomy
// =============================================================================

/// Errors surfaced by an exchange adapter, independent of transport.
#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    /// Network-level or 5xx/429 failures. Retried inside the adapter; if they
    /// still escape, the engine logs a warning and continues the tick loop.
    #[error("transient exchange error: {0}")]
    Transient(String),

    /// Bad or expired credentials. Terminal for the session.
    #[error("exchange authentication failed: {0}")]
    Auth(String),

    #[error("symbol not found: {0}")]
    SymbolNotFound(String),

    /// The account cannot cover the requested position.
    #[error("insufficient margin: {0}")]
    InsufficientMargin(String),

    /// Lot outside the symbol's size filters.
    #[error("invalid order size: {0}")]
    SizeInvalid(String),

    /// Closing a position the exchange no longer knows about.
    #[error("position not found: {0}")]
    NotFound(String),

    /// Any other order rejection, with the venue's error code.
    #[error("order rejected ({code}): {message}")]
    Rejected { code: i64, message: String },
}

impl ExchangeError {
    /// Whether the operation may be retried as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Whether the error invalidates the whole session.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

// =============================================================================
// Wire types
// =============================================================================

/// An open position as reported by the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub id: String,
    pub side: Side,
    pub avg_entry: f64,
    pub qty: f64,
}

/// Result of a successful order placement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderFill {
    pub order_id: String,
    pub filled_price: f64,
}

/// Result of closing a position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CloseResult {
    pub realized_pnl: f64,
}

// =============================================================================
// Contract
// =============================================================================

/// The surface the trading engine depends on.
///
/// All calls are bounded by the adapter's internal deadline; none may block a
/// tick indefinitely.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Candles for `symbol`, ascending by open time, at most `limit`.
    async fn get_candles(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError>;

    /// Last traded price. Always > 0 on success.
    async fn get_ticker(&self, symbol: &str) -> Result<f64, ExchangeError>;

    /// Available margin balance for the symbol's quote asset.
    async fn get_balance(&self, symbol: &str) -> Result<f64, ExchangeError>;

    /// All open positions for `symbol`.
    async fn get_positions(&self, symbol: &str) -> Result<Vec<ExchangePosition>, ExchangeError>;

    /// Open a market position of `lot` contracts.
    async fn open_position(
        &self,
        symbol: &str,
        side: Side,
        lot: f64,
        leverage: u32,
    ) -> Result<OrderFill, ExchangeError>;

    /// Close a previously opened position.
    async fn close_position(
        &self,
        symbol: &str,
        position_id: &str,
    ) -> Result<CloseResult, ExchangeError>;
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_is_the_only_retryable_kind() {
        assert!(ExchangeError::Transient("timeout".into()).is_retryable());
        assert!(!ExchangeError::Auth("bad key".into()).is_retryable());
        assert!(!ExchangeError::InsufficientMargin("x".into()).is_retryable());
        assert!(!ExchangeError::NotFound("1".into()).is_retryable());
        assert!(!ExchangeError::Rejected {
            code: -4164,
            message: "notional too small".into()
        }
        .is_retryable());
    }

    #[test]
    fn auth_classification() {
        assert!(ExchangeError::Auth("expired".into()).is_auth());
        assert!(!ExchangeError::Transient("x".into()).is_auth());
    }
}
