// =============================================================================
// Scriptable in-memory exchange for engine and strategy tests
// =============================================================================
//
// Behaves like a miniature venue: opens append to an internal position book,
// closes remove from it and realize PnL against the current mock price.
// Individual operations can be primed to fail once, which is how the tests
// exercise the engine's error handling.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::types::{Candle, Side};

use super::{CloseResult, ExchangeAdapter, ExchangeError, ExchangePosition, OrderFill};

#[derive(Default)]
struct MockBook {
    price: f64,
    candles: Vec<Candle>,
    balance: f64,
    positions: Vec<ExchangePosition>,
    next_order_id: u64,
    opened: Vec<(Side, f64)>,
    closed: Vec<String>,
    fail_once: HashMap<&'static str, ExchangeError>,
}

/// In-memory [`ExchangeAdapter`] with deterministic, scriptable behavior.
pub struct MockExchange {
    book: Mutex<MockBook>,
}

impl MockExchange {
    pub fn new(price: f64, balance: f64) -> Self {
        Self {
            book: Mutex::new(MockBook {
                price,
                balance,
                ..Default::default()
            }),
        }
    }

    // --- Scripting -----------------------------------------------------------

    pub fn set_price(&self, price: f64) {
        self.book.lock().price = price;
    }

    pub fn set_balance(&self, balance: f64) {
        self.book.lock().balance = balance;
    }

    pub fn set_candles(&self, candles: Vec<Candle>) {
        self.book.lock().candles = candles;
    }

    pub fn push_candle(&self, candle: Candle) {
        self.book.lock().candles.push(candle);
    }

    /// Prime `operation` ("get_ticker", "open_position", ...) to fail once.
    pub fn fail_once(&self, operation: &'static str, error: ExchangeError) {
        self.book.lock().fail_once.insert(operation, error);
    }

    /// Seed the venue-side position book directly (simulating positions that
    /// exist before the engine starts, or external fills).
    pub fn seed_position(&self, side: Side, entry: f64, qty: f64) -> String {
        let mut book = self.book.lock();
        book.next_order_id += 1;
        let id = format!("mock-{}", book.next_order_id);
        book.positions.push(ExchangePosition {
            id: id.clone(),
            side,
            avg_entry: entry,
            qty,
        });
        id
    }

    // --- Inspection ----------------------------------------------------------

    pub fn open_positions(&self) -> Vec<ExchangePosition> {
        self.book.lock().positions.clone()
    }

    pub fn opened(&self) -> Vec<(Side, f64)> {
        self.book.lock().opened.clone()
    }

    pub fn closed_ids(&self) -> Vec<String> {
        self.book.lock().closed.clone()
    }

    fn take_failure(&self, operation: &'static str) -> Option<ExchangeError> {
        self.book.lock().fail_once.remove(operation)
    }
}

#[async_trait]
impl ExchangeAdapter for MockExchange {
    async fn get_candles(
        &self,
        _symbol: &str,
        _timeframe: &str,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError> {
        if let Some(e) = self.take_failure("get_candles") {
            return Err(e);
        }
        let book = self.book.lock();
        let start = book.candles.len().saturating_sub(limit as usize);
        Ok(book.candles[start..].to_vec())
    }

    async fn get_ticker(&self, _symbol: &str) -> Result<f64, ExchangeError> {
        if let Some(e) = self.take_failure("get_ticker") {
            return Err(e);
        }
        Ok(self.book.lock().price)
    }

    async fn get_balance(&self, _symbol: &str) -> Result<f64, ExchangeError> {
        if let Some(e) = self.take_failure("get_balance") {
            return Err(e);
        }
        Ok(self.book.lock().balance)
    }

    async fn get_positions(&self, _symbol: &str) -> Result<Vec<ExchangePosition>, ExchangeError> {
        if let Some(e) = self.take_failure("get_positions") {
            return Err(e);
        }
        Ok(self.book.lock().positions.clone())
    }

    async fn open_position(
        &self,
        _symbol: &str,
        side: Side,
        lot: f64,
        _leverage: u32,
    ) -> Result<OrderFill, ExchangeError> {
        if let Some(e) = self.take_failure("open_position") {
            return Err(e);
        }
        let mut book = self.book.lock();
        book.next_order_id += 1;
        let id = format!("mock-{}", book.next_order_id);
        let price = book.price;
        book.positions.push(ExchangePosition {
            id: id.clone(),
            side,
            avg_entry: price,
            qty: lot,
        });
        book.opened.push((side, lot));
        Ok(OrderFill {
            order_id: id,
            filled_price: price,
        })
    }

    async fn close_position(
        &self,
        _symbol: &str,
        position_id: &str,
    ) -> Result<CloseResult, ExchangeError> {
        if let Some(e) = self.take_failure("close_position") {
            return Err(e);
        }
        let mut book = self.book.lock();
        let idx = book
            .positions
            .iter()
            .position(|p| p.id == position_id)
            .ok_or_else(|| ExchangeError::NotFound(position_id.to_string()))?;
        let pos = book.positions.remove(idx);
        let price = book.price;
        let realized_pnl = pos.side.direction() * (price - pos.avg_entry) * pos.qty;
        book.closed.push(position_id.to_string());
        Ok(CloseResult { realized_pnl })
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_then_close_realizes_pnl() {
        let venue = MockExchange::new(100.0, 1_000.0);
        let fill = venue
            .open_position("BTCUSDT", Side::Long, 0.5, 1)
            .await
            .unwrap();
        assert_eq!(fill.filled_price, 100.0);

        venue.set_price(110.0);
        let close = venue
            .close_position("BTCUSDT", &fill.order_id)
            .await
            .unwrap();
        assert!((close.realized_pnl - 5.0).abs() < 1e-9);
        assert!(venue.open_positions().is_empty());
    }

    #[tokio::test]
    async fn short_pnl_inverts() {
        let venue = MockExchange::new(100.0, 1_000.0);
        let fill = venue
            .open_position("BTCUSDT", Side::Short, 1.0, 1)
            .await
            .unwrap();
        venue.set_price(90.0);
        let close = venue
            .close_position("BTCUSDT", &fill.order_id)
            .await
            .unwrap();
        assert!((close.realized_pnl - 10.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn close_unknown_position_is_not_found() {
        let venue = MockExchange::new(100.0, 1_000.0);
        let err = venue.close_position("BTCUSDT", "nope").await.unwrap_err();
        assert!(matches!(err, ExchangeError::NotFound(_)));
    }

    #[tokio::test]
    async fn primed_failure_fires_once() {
        let venue = MockExchange::new(100.0, 1_000.0);
        venue.fail_once("get_ticker", ExchangeError::Transient("hiccup".into()));

        assert!(venue.get_ticker("BTCUSDT").await.is_err());
        assert_eq!(venue.get_ticker("BTCUSDT").await.unwrap(), 100.0);
    }

    #[tokio::test]
    async fn candle_limit_takes_the_tail() {
        let venue = MockExchange::new(100.0, 0.0);
        venue.set_candles(
            (0..10)
                .map(|i| Candle::new(i * 60_000, 1.0, 2.0, 0.5, 1.5, 10.0))
                .collect(),
        );
        let got = venue.get_candles("BTCUSDT", "1m", 3).await.unwrap();
        assert_eq!(got.len(), 3);
        assert_eq!(got[0].open_time, 7 * 60_000);
    }
}
