// =============================================================================
// Session Configuration — per-user grid settings with a validating factory
// =============================================================================
//
// Every tunable knob of a trading session lives here. Settings arrive as JSON
// through the register API; `validate()` collects *all* violations and the
// session manager rejects registration with the full list, never silently
// coercing a bad value into an engine.
//
// All fields carry `#[serde(default)]` so that older clients omitting new
// fields keep working.
// =============================================================================

use serde::{Deserialize, Serialize};

/// Number of grid levels per session. Fixed by the strategy design.
pub const GRID_LEVELS: usize = 4;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_tick_interval_secs() -> f64 {
    1.0
}

fn default_timeframe() -> String {
    "1m".to_string()
}

fn default_levels() -> Vec<GridLevelConfig> {
    vec![
        GridLevelConfig {
            percent: 0.5,
            max_orders: 5,
            lot_size: 0.001,
        },
        GridLevelConfig {
            percent: 1.0,
            max_orders: 5,
            lot_size: 0.002,
        },
        GridLevelConfig {
            percent: 2.0,
            max_orders: 5,
            lot_size: 0.003,
        },
        GridLevelConfig {
            percent: 3.0,
            max_orders: 5,
            lot_size: 0.004,
        },
    ]
}

fn default_base_lot() -> f64 {
    0.001
}

fn default_min_lot() -> f64 {
    0.001
}

fn default_max_lot() -> f64 {
    1.0
}

fn default_sma_period() -> usize {
    25
}

fn default_sar_af() -> f64 {
    0.02
}

fn default_sar_max() -> f64 {
    0.2
}

fn default_cci_max() -> f64 {
    100.0
}

fn default_cci_min() -> f64 {
    -100.0
}

fn default_single_order_profit() -> f64 {
    1.0
}

// =============================================================================
// Grid level
// =============================================================================

/// One rung of the grid ladder. Immutable once the session is registered.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridLevelConfig {
    /// Adverse price distance (percent) that triggers an addition at this level.
    pub percent: f64,
    /// How many orders this level accommodates before the next level takes over.
    pub max_orders: u32,
    /// Fixed lot size used at this level when martingale is disabled.
    pub lot_size: f64,
}

// =============================================================================
// SessionSettings
// =============================================================================

/// Full per-session strategy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    // --- Loop cadence --------------------------------------------------------
    /// Seconds between engine ticks.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: f64,

    /// Candle timeframe, e.g. "1m", "5m".
    #[serde(default = "default_timeframe")]
    pub timeframe: String,

    /// Only evaluate entry signals when a new candle has closed
    /// (grid additions and profit checks still run every tick).
    #[serde(default = "default_true")]
    pub open_on_new_candle: bool,

    // --- Grid ladder ---------------------------------------------------------
    /// Exactly four levels, strictly increasing in `percent`.
    #[serde(default = "default_levels")]
    pub levels: Vec<GridLevelConfig>,

    // --- Lot sizing ----------------------------------------------------------
    /// Martingale multiplier. 0 disables martingale (fixed per-level lots).
    #[serde(default)]
    pub multiplier: f64,

    #[serde(default = "default_base_lot")]
    pub base_lot: f64,

    #[serde(default = "default_min_lot")]
    pub min_lot: f64,

    #[serde(default = "default_max_lot")]
    pub max_lot: f64,

    // --- SMA / SAR signal ----------------------------------------------------
    #[serde(default = "default_true")]
    pub use_sma_sar: bool,

    #[serde(default = "default_sma_period")]
    pub sma_period: usize,

    /// Weight the oldest candle lightest in the LWMA (source-compatible
    /// direction). Disable to reverse the weighting.
    #[serde(default = "default_true")]
    pub lwma_oldest_light: bool,

    #[serde(default = "default_sar_af")]
    pub sar_af: f64,

    #[serde(default = "default_sar_max")]
    pub sar_max: f64,

    /// Negate the SMA/SAR signal direction.
    #[serde(default)]
    pub reverse_order: bool,

    // --- CCI override --------------------------------------------------------
    /// CCI period. 0 disables the CCI override entirely.
    #[serde(default)]
    pub cci_period: usize,

    #[serde(default = "default_cci_max")]
    pub cci_max: f64,

    #[serde(default = "default_cci_min")]
    pub cci_min: f64,

    // --- Profit & loss targets (0 disables each) -----------------------------
    /// Per-position take-profit in percent of entry (leverage-adjusted).
    #[serde(default = "default_single_order_profit")]
    pub single_order_profit: f64,

    /// Aggregate take-profit across both sides, in percent.
    #[serde(default)]
    pub pair_global_profit: f64,

    /// Realized-PnL target (quote currency) that closes everything and stops
    /// the session.
    #[serde(default)]
    pub global_profit: f64,

    /// Realized-loss limit (quote currency, positive number) that closes
    /// everything and stops the session.
    #[serde(default)]
    pub max_loss: f64,

    // --- Behavioural flags ---------------------------------------------------
    /// Close all open positions when the session is stopped.
    #[serde(default)]
    pub close_on_stop: bool,

    // --- Time filter ---------------------------------------------------------
    /// Trading window start, "HH:MM" UTC. Empty disables the filter.
    #[serde(default)]
    pub start_time: String,

    /// Trading window end, "HH:MM" UTC. Empty disables the filter.
    #[serde(default)]
    pub finish_time: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        // Round-trips through serde so the defaults live in one place.
        serde_json::from_str("{}").expect("default settings deserialise")
    }
}

impl SessionSettings {
    /// Sum of `max_orders` across all levels (one side's capacity).
    pub fn max_orders_per_side(&self) -> usize {
        self.levels.iter().map(|l| l.max_orders as usize).sum()
    }

    /// Total position capacity across both sides.
    pub fn total_order_cap(&self) -> usize {
        2 * self.max_orders_per_side()
    }

    /// Validate the settings, collecting every violation.
    ///
    /// Returns `Ok(())` or the full list of problems so the caller can reject
    /// registration with one complete response.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut problems = Vec::new();

        if self.levels.len() != GRID_LEVELS {
            problems.push(format!(
                "expected exactly {} grid levels, got {}",
                GRID_LEVELS,
                self.levels.len()
            ));
        }

        for (i, level) in self.levels.iter().enumerate() {
            if level.percent <= 0.0 {
                problems.push(format!("level {i}: percent must be positive"));
            }
            if level.max_orders == 0 {
                problems.push(format!("level {i}: max_orders must be positive"));
            }
            if level.lot_size <= 0.0 {
                problems.push(format!("level {i}: lot_size must be positive"));
            }
        }

        for pair in self.levels.windows(2) {
            if pair[1].percent <= pair[0].percent {
                problems.push(format!(
                    "grid level percents must be strictly increasing ({} -> {})",
                    pair[0].percent, pair[1].percent
                ));
            }
        }

        if self.multiplier < 0.0 {
            problems.push("multiplier must be zero or positive".to_string());
        }
        if self.min_lot <= 0.0 {
            problems.push("min_lot must be positive".to_string());
        }
        if self.base_lot < self.min_lot || self.base_lot > self.max_lot {
            problems.push(format!(
                "base_lot {} outside [min_lot {}, max_lot {}]",
                self.base_lot, self.min_lot, self.max_lot
            ));
        }
        if self.min_lot > self.max_lot {
            problems.push(format!(
                "min_lot {} exceeds max_lot {}",
                self.min_lot, self.max_lot
            ));
        }

        if self.use_sma_sar && self.sma_period == 0 {
            problems.push("sma_period must be positive when use_sma_sar is set".to_string());
        }
        if self.sar_af <= 0.0 {
            problems.push("sar_af must be positive".to_string());
        }
        if self.sar_af > self.sar_max {
            problems.push(format!(
                "sar_af {} exceeds sar_max {}",
                self.sar_af, self.sar_max
            ));
        }

        if self.cci_period > 0 && self.cci_min >= self.cci_max {
            problems.push(format!(
                "cci_min {} must be below cci_max {}",
                self.cci_min, self.cci_max
            ));
        }

        if self.tick_interval_secs <= 0.0 {
            problems.push("tick_interval_secs must be positive".to_string());
        }

        if self.single_order_profit < 0.0
            || self.pair_global_profit < 0.0
            || self.global_profit < 0.0
            || self.max_loss < 0.0
        {
            problems.push("profit and loss targets must be zero or positive".to_string());
        }

        for (name, value) in [
            ("start_time", &self.start_time),
            ("finish_time", &self.finish_time),
        ] {
            if !value.is_empty() && parse_hh_mm(value).is_none() {
                problems.push(format!("{name} '{value}' is not a valid HH:MM time"));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }

    /// Whether trading is allowed at the given UTC minute-of-day.
    ///
    /// An empty or absent window means always-on. A window that wraps past
    /// midnight (start > finish) is honored.
    pub fn within_trading_window(&self, minute_of_day: u32) -> bool {
        let (start, finish) = match (
            parse_hh_mm(&self.start_time),
            parse_hh_mm(&self.finish_time),
        ) {
            (Some(s), Some(f)) => (s, f),
            _ => return true,
        };

        if start <= finish {
            (start..=finish).contains(&minute_of_day)
        } else {
            // Overnight window, e.g. 22:00 -> 02:00.
            minute_of_day >= start || minute_of_day <= finish
        }
    }
}

/// Parse "HH:MM" into a minute-of-day. Returns `None` on malformed input.
fn parse_hh_mm(s: &str) -> Option<u32> {
    let (hh, mm) = s.split_once(':')?;
    let hh: u32 = hh.parse().ok()?;
    let mm: u32 = mm.parse().ok()?;
    if hh > 23 || mm > 59 {
        return None;
    }
    Some(hh * 60 + mm)
}

// =============================================================================
// Registration payload
// =============================================================================

/// Exchange API credentials supplied at registration. The secret is never
/// logged or serialised back out.
#[derive(Clone, Deserialize)]
pub struct ExchangeCredentials {
    pub api_key: String,
    pub api_secret: String,
    /// Route requests to the demo (testnet) endpoint.
    #[serde(default)]
    pub demo: bool,
}

impl std::fmt::Debug for ExchangeCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeCredentials")
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .field("demo", &self.demo)
            .finish()
    }
}

/// Everything needed to create one trading session.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSpec {
    pub user_id: String,
    pub user_bot_id: String,
    pub credentials: ExchangeCredentials,
    pub symbol: String,
    pub leverage: u32,
    #[serde(default)]
    pub settings: SessionSettings,
    pub webhook_url: String,
    pub webhook_secret: String,
}

impl SessionSpec {
    /// Validate the spec, collecting every violation (settings plus the
    /// registration-level fields).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut problems = match self.settings.validate() {
            Ok(()) => Vec::new(),
            Err(p) => p,
        };

        if self.user_id.is_empty() {
            problems.push("user_id must not be empty".to_string());
        }
        if self.symbol.is_empty() {
            problems.push("symbol must not be empty".to_string());
        }
        if self.leverage == 0 {
            problems.push("leverage must be at least 1".to_string());
        }
        if self.webhook_url.is_empty() {
            problems.push("webhook_url must not be empty".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }
}
