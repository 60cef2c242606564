// =============================================================================
// Commodity Channel Index (CCI) with level-crossing detection
// =============================================================================
//
// Typical price:  tp = (high + low + close) / 3
//   sma = mean(tp over the last N candles)
//   md  = mean(|tp - sma|)
//   cci = (tp_last - sma) / (0.015 * md)
//
// Zero mean deviation => cci = 0 (flat market, no signal).
//
// `CciState` keeps a short trailing history of computed values so the
// strategy can ask "did the CCI cross a level on this candle" — the crossing
// fires only on the tick where prev/current straddle the level.
// =============================================================================

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::types::Candle;

/// CCI scaling constant (Lambert's original).
const CCI_SCALE: f64 = 0.015;

/// How many trailing CCI values are retained (and persisted).
pub const CCI_HISTORY_CAP: usize = 50;

/// Compute the CCI over the trailing `period` candles.
///
/// # Edge cases
/// - `period == 0` or fewer than `period` candles => 0.0.
/// - Zero mean deviation => 0.0.
pub fn cci(candles: &[Candle], period: usize) -> f64 {
    if period == 0 || candles.len() < period {
        return 0.0;
    }

    let window = &candles[candles.len() - period..];
    let tps: Vec<f64> = window
        .iter()
        .map(|c| (c.high + c.low + c.close) / 3.0)
        .collect();

    let sma: f64 = tps.iter().sum::<f64>() / period as f64;
    let md: f64 = tps.iter().map(|tp| (tp - sma).abs()).sum::<f64>() / period as f64;

    if md == 0.0 {
        return 0.0;
    }

    (tps[period - 1] - sma) / (CCI_SCALE * md)
}

/// Bounded history of CCI values supporting crossing queries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CciState {
    values: VecDeque<f64>,
}

impl CciState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from a persisted tail (oldest first). Only the last
    /// [`CCI_HISTORY_CAP`] values are kept.
    pub fn from_history(history: Vec<f64>) -> Self {
        let mut state = Self::new();
        for v in history {
            state.push(v);
        }
        state
    }

    /// Compute the CCI for the newest candle and append it to the history.
    pub fn update(&mut self, candles: &[Candle], period: usize) -> f64 {
        let value = cci(candles, period);
        self.push(value);
        value
    }

    fn push(&mut self, value: f64) {
        self.values.push_back(value);
        while self.values.len() > CCI_HISTORY_CAP {
            self.values.pop_front();
        }
    }

    pub fn last(&self) -> Option<f64> {
        self.values.back().copied()
    }

    fn prev(&self) -> Option<f64> {
        let n = self.values.len();
        if n >= 2 {
            Some(self.values[n - 2])
        } else {
            None
        }
    }

    /// True when the previous value was below `level` and the current value
    /// reached or exceeded it.
    pub fn crossed_above(&self, level: f64) -> bool {
        match (self.prev(), self.last()) {
            (Some(prev), Some(curr)) => prev < level && curr >= level,
            _ => false,
        }
    }

    /// True when the previous value was above `level` and the current value
    /// reached or fell below it.
    pub fn crossed_below(&self, level: f64) -> bool {
        match (self.prev(), self.last()) {
            (Some(prev), Some(curr)) => prev > level && curr <= level,
            _ => false,
        }
    }

    /// Trailing values, oldest first. Used for persistence.
    pub fn history(&self) -> Vec<f64> {
        self.values.iter().copied().collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candle(close: f64) -> Candle {
        Candle::new(0, close, close + 1.0, close - 1.0, close, 1.0)
    }

    #[test]
    fn empty_input_returns_zero() {
        assert_eq!(cci(&[], 14), 0.0);
    }

    #[test]
    fn insufficient_data_returns_zero() {
        let candles: Vec<Candle> = (0..5).map(|i| candle(100.0 + i as f64)).collect();
        assert_eq!(cci(&candles, 14), 0.0);
    }

    #[test]
    fn flat_market_returns_zero() {
        // Identical candles => md == 0 => defined as 0.
        let candles: Vec<Candle> = (0..20).map(|_| candle(100.0)).collect();
        assert_eq!(cci(&candles, 14), 0.0);
    }

    #[test]
    fn rising_prices_give_positive_cci() {
        let candles: Vec<Candle> = (0..20).map(|i| candle(100.0 + i as f64)).collect();
        assert!(cci(&candles, 14) > 0.0);
    }

    #[test]
    fn falling_prices_give_negative_cci() {
        let candles: Vec<Candle> = (0..20).map(|i| candle(200.0 - i as f64)).collect();
        assert!(cci(&candles, 14) < 0.0);
    }

    #[test]
    fn crossing_fires_only_on_the_crossing_tick() {
        let mut state = CciState::new();
        state.push(50.0);
        state.push(120.0);
        assert!(state.crossed_above(100.0));

        // Next tick stays above the level — no longer a crossing.
        state.push(130.0);
        assert!(!state.crossed_above(100.0));
    }

    #[test]
    fn crossed_below_mirrors_crossed_above() {
        let mut state = CciState::new();
        state.push(-50.0);
        state.push(-120.0);
        assert!(state.crossed_below(-100.0));
        assert!(!state.crossed_above(-100.0));
    }

    #[test]
    fn crossing_needs_two_values() {
        let mut state = CciState::new();
        assert!(!state.crossed_above(0.0));
        state.push(10.0);
        assert!(!state.crossed_above(0.0));
    }

    #[test]
    fn exact_touch_counts_as_crossing() {
        let mut state = CciState::new();
        state.push(90.0);
        state.push(100.0);
        assert!(state.crossed_above(100.0));
    }

    #[test]
    fn history_is_bounded() {
        let mut state = CciState::new();
        for i in 0..200 {
            state.push(i as f64);
        }
        assert_eq!(state.history().len(), CCI_HISTORY_CAP);
        assert_eq!(state.last(), Some(199.0));
    }

    #[test]
    fn from_history_round_trip() {
        let mut state = CciState::new();
        state.push(1.0);
        state.push(2.0);
        state.push(3.0);

        let restored = CciState::from_history(state.history());
        assert_eq!(restored.history(), state.history());
        assert_eq!(restored.last(), Some(3.0));
    }
}
