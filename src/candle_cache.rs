// =============================================================================
// Candle Cache — per-session REST-polled candle window
// =============================================================================
//
// Each session keeps up to 200 candles for its (symbol, timeframe). A fetch
// younger than one second is served from memory; otherwise the cache pulls
// the last few candles and merges them by open time — the in-progress candle
// is replaced in place, newly finalized candles are appended, and the window
// is trimmed from the front.
//
// A failed fetch is tolerated: the stale window is returned with a warning so
// one flaky request never starves the indicators.
// =============================================================================

use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::exchange::ExchangeAdapter;
use crate::types::Candle;

/// Maximum candles retained per session.
pub const MAX_CACHED_CANDLES: usize = 200;

/// Cache entries younger than this are served without a fetch.
const FRESHNESS: Duration = Duration::from_millis(1_000);

/// Candles requested per incremental refresh.
const REFRESH_LIMIT: u32 = 5;

/// Sliding candle window owned by one engine task.
pub struct CandleCache {
    candles: Vec<Candle>,
    fetched_at: Option<Instant>,
}

impl CandleCache {
    pub fn new() -> Self {
        Self {
            candles: Vec::with_capacity(MAX_CACHED_CANDLES),
            fetched_at: None,
        }
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    /// Open time of the newest cached candle, or 0 when empty.
    pub fn last_open_time(&self) -> i64 {
        self.candles.last().map(|c| c.open_time).unwrap_or(0)
    }

    /// Return an up-to-date window, fetching through `adapter` if the cache
    /// has gone stale. Fetch failures fall back to the cached window.
    pub async fn refresh(
        &mut self,
        adapter: &dyn ExchangeAdapter,
        symbol: &str,
        timeframe: &str,
    ) -> &[Candle] {
        if let Some(at) = self.fetched_at {
            if at.elapsed() < FRESHNESS {
                return &self.candles;
            }
        }

        // First fill grabs the whole window; afterwards only the tail moves.
        let limit = if self.candles.is_empty() {
            MAX_CACHED_CANDLES as u32
        } else {
            REFRESH_LIMIT
        };

        match adapter.get_candles(symbol, timeframe, limit).await {
            Ok(fetched) => {
                self.merge(fetched);
                self.fetched_at = Some(Instant::now());
                debug!(symbol, timeframe, cached = self.candles.len(), "candle cache refreshed");
            }
            Err(e) => {
                warn!(
                    symbol,
                    timeframe,
                    cached = self.candles.len(),
                    error = %e,
                    "candle fetch failed — serving stale cache"
                );
            }
        }

        &self.candles
    }

    /// Merge a freshly fetched ascending batch into the window by open time.
    fn merge(&mut self, fetched: Vec<Candle>) {
        for candle in fetched {
            match self.candles.iter().rposition(|c| c.open_time == candle.open_time) {
                // The still-forming candle gets updated in place.
                Some(idx) => self.candles[idx] = candle,
                None => {
                    if candle.open_time > self.last_open_time() {
                        self.candles.push(candle);
                    }
                    // Older-than-window candles are ignored.
                }
            }
        }

        if self.candles.len() > MAX_CACHED_CANDLES {
            let excess = self.candles.len() - MAX_CACHED_CANDLES;
            self.candles.drain(..excess);
        }
    }
}

impl Default for CandleCache {
    fn default() -> Self {
        Self::new()
    }
}
