// =============================================================================
// Parabolic SAR (Stop-and-Reverse) — explicit, persistable state
// =============================================================================
//
// The whole indicator fits in four numbers:
//   trend  +1 (up) / -1 (down)
//   ep     extreme point of the current trend
//   sar    current stop level
//   af     acceleration factor, af_start..af_max
//
// Each closed candle advances the state:
//   sar' = sar + af * (ep - sar)
//   clamp: uptrend   sar' <= min(low[-1], low[-2])
//          downtrend sar' >= max(high[-1], high[-2])
//   reversal when price crosses sar'; otherwise ep/af ratchet when the
//   trend makes a new extreme.
//
// The state serialises to JSON so a session can resume across restarts
// without replaying history.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::types::Candle;

/// Candles required before the SAR can be seeded.
pub const SAR_BOOTSTRAP_CANDLES: usize = 5;

/// Complete Parabolic SAR state. Copyable value type; `step` is pure.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SarState {
    /// +1 for uptrend, -1 for downtrend.
    pub trend: i8,
    /// Extreme point of the current trend.
    pub ep: f64,
    /// Current stop-and-reverse level.
    pub sar: f64,
    /// Acceleration factor.
    pub af: f64,
}

impl SarState {
    /// Seed the state from the last [`SAR_BOOTSTRAP_CANDLES`] candles.
    ///
    /// Trend direction comes from the last two closes; `ep` is the window's
    /// extreme in the trend direction and `sar` the opposite extreme.
    /// Returns `None` with fewer than five candles.
    pub fn bootstrap(candles: &[Candle], af_start: f64) -> Option<Self> {
        if candles.len() < SAR_BOOTSTRAP_CANDLES {
            return None;
        }

        let window = &candles[candles.len() - SAR_BOOTSTRAP_CANDLES..];
        let last = window[SAR_BOOTSTRAP_CANDLES - 1];
        let prev = window[SAR_BOOTSTRAP_CANDLES - 2];

        let max_high = window.iter().map(|c| c.high).fold(f64::MIN, f64::max);
        let min_low = window.iter().map(|c| c.low).fold(f64::MAX, f64::min);

        let state = if last.close > prev.close {
            Self {
                trend: 1,
                ep: max_high,
                sar: min_low,
                af: af_start,
            }
        } else {
            Self {
                trend: -1,
                ep: min_low,
                sar: max_high,
                af: af_start,
            }
        };

        Some(state)
    }

    /// Advance the state by the newest candle in `candles`.
    ///
    /// The slice must end with the candle being processed; the two candles
    /// before it clamp the new SAR so it never enters the recent range.
    pub fn step(self, candles: &[Candle], af_start: f64, af_max: f64) -> Self {
        let n = candles.len();
        if n == 0 {
            return self;
        }

        let current = candles[n - 1];
        let prev1 = if n >= 2 { candles[n - 2] } else { current };
        let prev2 = if n >= 3 { candles[n - 3] } else { prev1 };

        let mut sar = self.sar + self.af * (self.ep - self.sar);

        if self.trend > 0 {
            // The stop may never rise into the prior two candles' lows.
            sar = sar.min(prev1.low).min(prev2.low);

            if current.low < sar {
                // Reversal: flip to downtrend.
                return Self {
                    trend: -1,
                    sar: self.ep,
                    ep: current.low,
                    af: af_start,
                };
            }

            if current.high > self.ep {
                return Self {
                    trend: 1,
                    ep: current.high,
                    sar,
                    af: (self.af + af_start).min(af_max),
                };
            }

            Self { sar, ..self }
        } else {
            sar = sar.max(prev1.high).max(prev2.high);

            if current.high > sar {
                return Self {
                    trend: 1,
                    sar: self.ep,
                    ep: current.high,
                    af: af_start,
                };
            }

            if current.low < self.ep {
                return Self {
                    trend: -1,
                    ep: current.low,
                    sar,
                    af: (self.af + af_start).min(af_max),
                };
            }

            Self { sar, ..self }
        }
    }
}
