// =============================================================================
// Linear Weighted Moving Average (LWMA) over weighted candle prices
// =============================================================================
//
// Weighted price per candle:  wp = (high + low + 2*close) / 4
//
// Linear weights 1..N are applied oldest -> newest, so the oldest candle in
// the window carries weight 1 and the newest carries weight N:
//
//   lwma = sum(wp_i * w_i) / sum(w_i),   w_i = i + 1  (window index i)
//
// `oldest_light = false` reverses the weight direction (newest carries
// weight 1). Both directions are kept because charting platforms disagree on
// which end of the window should dominate.
// =============================================================================

use crate::types::Candle;

/// Weighted price used as the LWMA input.
#[inline]
pub fn weighted_price(candle: &Candle) -> f64 {
    (candle.high + candle.low + 2.0 * candle.close) / 4.0
}

/// Compute the LWMA of the trailing `period` candles.
///
/// # Edge cases
/// - `period == 0` or fewer than `period` candles => 0.0.
pub fn lwma(candles: &[Candle], period: usize, oldest_light: bool) -> f64 {
    if period == 0 || candles.len() < period {
        return 0.0;
    }

    let window = &candles[candles.len() - period..];

    let mut weighted_sum = 0.0;
    let mut weight_total = 0.0;

    for (i, candle) in window.iter().enumerate() {
        let weight = if oldest_light {
            (i + 1) as f64
        } else {
            (period - i) as f64
        };
        weighted_sum += weighted_price(candle) * weight;
        weight_total += weight;
    }

    weighted_sum / weight_total
}
