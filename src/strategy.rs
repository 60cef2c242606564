// =============================================================================
// Grid Strategy — per-session hedged ladder state and trading decisions
// =============================================================================
//
// Owns everything one session knows about its market: both position ladders,
// indicator state, balance, last price, and performance counters. Decision
// methods are pure — they return values describing what to do and the engine
// performs the adapter calls — so the whole strategy is testable without I/O.
//
// Pipeline per closed candle:
//   1. update_indicators  (LWMA, Parabolic SAR, CCI)
//   2. evaluate_signal    (SMA/SAR direction, CCI crossing override)
// Pipeline per tick:
//   3. can_add_grid_order (ladder spacing check per side)
//   4. check_profit_targets (single TP -> pair TP -> global profit -> max loss)
// =============================================================================

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::SessionSettings;
use crate::exchange::ExchangePosition;
use crate::indicators::{lwma, CciState, SarState};
use crate::types::{Candle, Side, Signal};

/// Hard ceiling on the martingale factor, regardless of grid depth.
pub const MAX_MARTINGALE_CAP: f64 = 10.0;

// =============================================================================
// Position & performance models
// =============================================================================

/// A single rung of the grid ladder, owned by one session while open.
#[derive(Debug, Clone, Serialize)]
pub struct GridPosition {
    /// Local identifier (UUID v4).
    pub id: String,
    pub side: Side,
    pub entry_price: f64,
    pub lot: f64,
    /// Ladder level this position belongs to, 0-based.
    pub grid_level: usize,
    /// Identifier the exchange knows this position by; used for closes.
    pub exchange_order_id: String,
    pub opened_at: String,
}

/// Session lifetime trading statistics.
#[derive(Debug, Clone, Serialize)]
pub struct Performance {
    pub total_trades: u64,
    pub winning: u64,
    pub losing: u64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub started_at: String,
}

impl Performance {
    fn new() -> Self {
        Self {
            total_trades: 0,
            winning: 0,
            losing: 0,
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
            started_at: Utc::now().to_rfc3339(),
        }
    }
}

/// What `check_profit_targets` decided, in priority order.
#[derive(Debug, Clone, PartialEq)]
pub enum ProfitAction {
    /// Close the listed positions (by exchange order id) individually.
    CloseSingles(Vec<String>),
    /// Aggregate pair target hit: close everything, keep running.
    ClosePair,
    /// Daily profit target hit: close everything, then stop the session.
    GlobalProfit,
    /// Daily loss limit hit: close everything, then stop the session.
    MaxLoss,
}

impl ProfitAction {
    /// Whether the session must stop after executing the closes.
    pub fn stops_session(&self) -> bool {
        matches!(self, Self::GlobalProfit | Self::MaxLoss)
    }
}

// =============================================================================
// GridStrategy
// =============================================================================

/// Per-session trading state machine. One instance per engine, mutated only
/// by that engine's tick task.
pub struct GridStrategy {
    settings: SessionSettings,
    leverage: u32,

    pub buy_positions: Vec<GridPosition>,
    pub sell_positions: Vec<GridPosition>,

    // --- Indicator state -----------------------------------------------------
    pub sar: Option<SarState>,
    pub cci: CciState,
    pub last_sma: f64,
    pub last_cci: f64,
    pub last_signal: Signal,

    // --- Market snapshot -----------------------------------------------------
    pub balance: f64,
    pub last_price: f64,
    /// Open time of the last candle folded into the indicators.
    pub last_candle_ts: i64,

    pub performance: Performance,
}

impl GridStrategy {
    pub fn new(settings: SessionSettings, leverage: u32) -> Self {
        Self {
            settings,
            leverage,
            buy_positions: Vec::new(),
            sell_positions: Vec::new(),
            sar: None,
            cci: CciState::new(),
            last_sma: 0.0,
            last_cci: 0.0,
            last_signal: Signal::None,
            balance: 0.0,
            last_price: 0.0,
            last_candle_ts: 0,
            performance: Performance::new(),
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn leverage(&self) -> u32 {
        self.leverage
    }

    pub fn positions(&self, side: Side) -> &[GridPosition] {
        match side {
            Side::Long => &self.buy_positions,
            Side::Short => &self.sell_positions,
        }
    }

    pub fn total_positions(&self) -> usize {
        self.buy_positions.len() + self.sell_positions.len()
    }

    /// Current SAR level, if the indicator has been seeded.
    pub fn sar_value(&self) -> f64 {
        self.sar.map(|s| s.sar).unwrap_or(0.0)
    }

    // =========================================================================
    // Indicators
    // =========================================================================

    /// Fold the newest closed candle into the indicator set.
    ///
    /// Call once per closed candle — SAR and CCI crossings are
    /// per-candle constructs and stepping them on partial data would skew
    /// both.
    pub fn update_indicators(&mut self, candles: &[Candle]) {
        if candles.is_empty() {
            return;
        }

        let s = &self.settings;
        self.last_sma = lwma(candles, s.sma_period, s.lwma_oldest_light);

        self.sar = match self.sar {
            Some(state) => Some(state.step(candles, s.sar_af, s.sar_max)),
            None => SarState::bootstrap(candles, s.sar_af),
        };

        if s.cci_period > 0 {
            self.last_cci = self.cci.update(candles, s.cci_period);
        }

        self.last_candle_ts = candles[candles.len() - 1].open_time;
        debug!(
            sma = self.last_sma,
            sar = self.sar_value(),
            cci = self.last_cci,
            candle_ts = self.last_candle_ts,
            "indicators updated"
        );
    }

    // =========================================================================
    // Signal evaluation
    // =========================================================================

    /// Combine SMA/SAR direction with the CCI crossing override.
    ///
    /// The override fires only on the candle where the CCI actually crosses
    /// the configured band — afterwards the base signal applies again.
    pub fn evaluate_signal(&mut self, sma: f64, sar: f64) -> Signal {
        let s = &self.settings;
        let mut signal = Signal::None;

        if s.use_sma_sar && sma > 0.0 && sar > 0.0 {
            signal = if sar > sma {
                Signal::Buy
            } else if sar < sma {
                Signal::Sell
            } else {
                Signal::None
            };

            if s.reverse_order {
                signal = match signal {
                    Signal::Buy => Signal::Sell,
                    Signal::Sell => Signal::Buy,
                    Signal::None => Signal::None,
                };
            }
        }

        if s.cci_period > 0 {
            if self.cci.crossed_above(s.cci_max) {
                signal = Signal::Sell;
            } else if self.cci.crossed_below(s.cci_min) {
                signal = Signal::Buy;
            }
        }

        self.last_signal = signal;
        signal
    }

    // =========================================================================
    // Grid geometry
    // =========================================================================

    /// Ladder level for a side currently holding `count` positions: the first
    /// level whose cumulative `max_orders` strictly exceeds `count`, clamped
    /// to the last level.
    pub fn current_grid_level(&self, count: usize) -> usize {
        let mut cumulative = 0usize;
        for (i, level) in self.settings.levels.iter().enumerate() {
            cumulative += level.max_orders as usize;
            if cumulative > count {
                return i;
            }
        }
        self.settings.levels.len().saturating_sub(1)
    }

    /// Lot size for the `n`-th addition on a side (0-based).
    ///
    /// Martingale mode multiplies the base lot by `multiplier^n`, capped at
    /// [`MAX_MARTINGALE_CAP`] and by a tenth of the balance at current
    /// leverage. Fixed mode reads the level's configured lot. Either way the
    /// result lands in `[min_lot, max_lot]`.
    pub fn calc_lot(&self, n: usize) -> f64 {
        let s = &self.settings;

        let lot = if s.multiplier > 0.0 {
            let factor = s.multiplier.powi(n as i32).min(MAX_MARTINGALE_CAP);
            let mut lot = s.base_lot * factor;

            if self.balance > 0.0 && self.last_price > 0.0 {
                let margin_cap = (self.balance * 0.1) / (self.leverage as f64 * self.last_price);
                lot = lot.min(margin_cap);
            }
            lot
        } else {
            let level = self.current_grid_level(n);
            s.levels[level].lot_size
        };

        lot.clamp(s.min_lot, s.max_lot)
    }

    /// Whether a grid order may be added on `side` at `current_price`, and
    /// with what lot.
    ///
    /// The first order on a side is always allowed (entry decision was made
    /// by the signal). Additions require the price to have moved adversely by
    /// the current level's spacing from the side's worst entry, and the total
    /// ladder to be under its cap.
    pub fn can_add_grid_order(&self, side: Side, current_price: f64) -> Option<f64> {
        let positions = self.positions(side);

        if positions.is_empty() {
            return Some(self.calc_lot(0));
        }

        if self.total_positions() >= self.settings.total_order_cap() {
            return None;
        }

        let level = self.current_grid_level(positions.len());
        let spacing = self.settings.levels[level].percent;

        let triggered = match side {
            Side::Long => {
                let worst = positions
                    .iter()
                    .map(|p| p.entry_price)
                    .fold(f64::MAX, f64::min);
                current_price <= worst * (1.0 - spacing / 100.0)
            }
            Side::Short => {
                let worst = positions
                    .iter()
                    .map(|p| p.entry_price)
                    .fold(f64::MIN, f64::max);
                current_price >= worst * (1.0 + spacing / 100.0)
            }
        };

        if triggered {
            Some(self.calc_lot(positions.len()))
        } else {
            None
        }
    }

    // =========================================================================
    // PnL
    // =========================================================================

    /// Margin-relative PnL of one position in percent (leverage-adjusted).
    pub fn position_pnl_percent(&self, position: &GridPosition, price: f64) -> f64 {
        if position.entry_price <= 0.0 {
            return 0.0;
        }
        position.side.direction() * (price - position.entry_price) / position.entry_price
            * 100.0
            * self.leverage as f64
    }

    /// Absolute unrealized PnL of one position in quote currency.
    pub fn position_pnl(&self, position: &GridPosition, price: f64) -> f64 {
        position.side.direction() * (price - position.entry_price) * position.lot
    }

    /// Sum of unrealized PnL for one side.
    pub fn side_pnl(&self, side: Side, price: f64) -> f64 {
        self.positions(side)
            .iter()
            .map(|p| self.position_pnl(p, price))
            .sum()
    }

    /// Recompute the cached unrealized total in the performance block.
    pub fn refresh_unrealized(&mut self, price: f64) {
        self.performance.unrealized_pnl =
            self.side_pnl(Side::Long, price) + self.side_pnl(Side::Short, price);
    }

    // =========================================================================
    // Profit targets
    // =========================================================================

    /// Evaluate the four profit/loss rules in priority order, short-circuit.
    /// Targets configured as 0 are disabled.
    pub fn check_profit_targets(&self, price: f64) -> Option<ProfitAction> {
        let s = &self.settings;

        // --- 1. Single-order take-profit ---------------------------------
        if s.single_order_profit > 0.0 {
            let ids: Vec<String> = self
                .buy_positions
                .iter()
                .chain(self.sell_positions.iter())
                .filter(|p| self.position_pnl_percent(p, price) >= s.single_order_profit)
                .map(|p| p.exchange_order_id.clone())
                .collect();
            if !ids.is_empty() {
                return Some(ProfitAction::CloseSingles(ids));
            }
        }

        // --- 2. Pair global take-profit -----------------------------------
        if s.pair_global_profit > 0.0 && self.total_positions() > 0 {
            let combined: f64 = self
                .buy_positions
                .iter()
                .chain(self.sell_positions.iter())
                .map(|p| self.position_pnl_percent(p, price))
                .sum();
            if combined >= s.pair_global_profit {
                return Some(ProfitAction::ClosePair);
            }
        }

        // --- 3. Global daily profit ---------------------------------------
        if s.global_profit > 0.0 && self.performance.realized_pnl >= s.global_profit {
            return Some(ProfitAction::GlobalProfit);
        }

        // --- 4. Max daily loss --------------------------------------------
        if s.max_loss > 0.0 && self.performance.realized_pnl <= -s.max_loss {
            return Some(ProfitAction::MaxLoss);
        }

        None
    }

    // =========================================================================
    // Position bookkeeping
    // =========================================================================

    /// Record a fill the exchange just accepted. The ladder level is derived
    /// from the side's population at insertion time.
    pub fn apply_open(
        &mut self,
        side: Side,
        lot: f64,
        entry_price: f64,
        exchange_order_id: String,
    ) -> GridPosition {
        let level = self.current_grid_level(self.positions(side).len());
        let position = GridPosition {
            id: Uuid::new_v4().to_string(),
            side,
            entry_price,
            lot,
            grid_level: level,
            exchange_order_id,
            opened_at: Utc::now().to_rfc3339(),
        };

        info!(
            id = %position.id,
            %side,
            entry_price,
            lot,
            grid_level = level,
            "grid position opened"
        );

        match side {
            Side::Long => self.buy_positions.push(position.clone()),
            Side::Short => self.sell_positions.push(position.clone()),
        }
        position
    }

    /// Record a close the exchange confirmed. Returns the removed position.
    pub fn apply_close(&mut self, exchange_order_id: &str, realized_pnl: f64) -> Option<GridPosition> {
        let position = self.remove_by_exchange_id(exchange_order_id)?;

        self.performance.total_trades += 1;
        if realized_pnl >= 0.0 {
            self.performance.winning += 1;
        } else {
            self.performance.losing += 1;
        }
        self.performance.realized_pnl += realized_pnl;

        info!(
            id = %position.id,
            exchange_order_id,
            realized_pnl,
            total_realized = self.performance.realized_pnl,
            "grid position closed"
        );
        Some(position)
    }

    /// Drop a position the exchange no longer knows about (already closed
    /// externally). No trade is recorded; the next sync settles the books.
    pub fn forget_position(&mut self, exchange_order_id: &str) -> Option<GridPosition> {
        self.remove_by_exchange_id(exchange_order_id)
    }

    fn remove_by_exchange_id(&mut self, exchange_order_id: &str) -> Option<GridPosition> {
        for list in [&mut self.buy_positions, &mut self.sell_positions] {
            if let Some(idx) = list.iter().position(|p| p.exchange_order_id == exchange_order_id)
            {
                return Some(list.remove(idx));
            }
        }
        None
    }

    /// All exchange order ids currently held, buys first.
    pub fn all_exchange_ids(&self) -> Vec<String> {
        self.buy_positions
            .iter()
            .chain(self.sell_positions.iter())
            .map(|p| p.exchange_order_id.clone())
            .collect()
    }

    // =========================================================================
    // Exchange reconciliation
    // =========================================================================

    /// Replace both ladders with the exchange's reported set.
    ///
    /// Entries are re-sorted by adversity — longs descending, shorts
    /// ascending — which reconstructs insertion order, and ladder levels are
    /// re-derived from that order. This keeps levels consistent even after a
    /// manual close on the exchange side punched a hole in the ladder.
    pub fn sync_from_exchange(&mut self, reported: &[ExchangePosition]) {
        let now = Utc::now().to_rfc3339();

        let mut longs: Vec<&ExchangePosition> =
            reported.iter().filter(|p| p.side == Side::Long).collect();
        let mut shorts: Vec<&ExchangePosition> =
            reported.iter().filter(|p| p.side == Side::Short).collect();

        // Longs are added as price falls: highest entry first.
        longs.sort_by(|a, b| {
            b.avg_entry
                .partial_cmp(&a.avg_entry)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        // Shorts are added as price rises: lowest entry first.
        shorts.sort_by(|a, b| {
            a.avg_entry
                .partial_cmp(&b.avg_entry)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let rebuild = |side: Side, source: &[&ExchangePosition], strategy: &Self| {
            source
                .iter()
                .enumerate()
                .map(|(i, p)| GridPosition {
                    id: Uuid::new_v4().to_string(),
                    side,
                    entry_price: p.avg_entry,
                    lot: p.qty,
                    grid_level: strategy.current_grid_level(i),
                    exchange_order_id: p.id.clone(),
                    opened_at: now.clone(),
                })
                .collect::<Vec<_>>()
        };

        let buys = rebuild(Side::Long, &longs, self);
        let sells = rebuild(Side::Short, &shorts, self);

        debug!(
            buys = buys.len(),
            sells = sells.len(),
            "positions synchronised from exchange"
        );

        self.buy_positions = buys;
        self.sell_positions = sells;
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionSettings;

    fn strategy() -> GridStrategy {
        GridStrategy::new(SessionSettings::default(), 1)
    }

    fn strategy_with(f: impl FnOnce(&mut SessionSettings)) -> GridStrategy {
        let mut settings = SessionSettings::default();
        f(&mut settings);
        GridStrategy::new(settings, 1)
    }

    fn open_at(strategy: &mut GridStrategy, side: Side, entry: f64, lot: f64) -> String {
        let id = format!("x-{}-{}", side, strategy.total_positions());
        strategy.apply_open(side, lot, entry, id.clone());
        id
    }

    // ---- grid level ------------------------------------------------------

    #[test]
    fn grid_level_walks_cumulative_bounds() {
        let s = strategy(); // 5 orders per level
        assert_eq!(s.current_grid_level(0), 0);
        assert_eq!(s.current_grid_level(4), 0);
        assert_eq!(s.current_grid_level(5), 1);
        assert_eq!(s.current_grid_level(9), 1);
        assert_eq!(s.current_grid_level(10), 2);
        assert_eq!(s.current_grid_level(15), 3);
    }

    #[test]
    fn grid_level_clamps_to_last() {
        let s = strategy();
        assert_eq!(s.current_grid_level(100), 3);
    }

    // ---- lot sizing ------------------------------------------------------

    #[test]
    fn fixed_mode_reads_level_lots() {
        let s = strategy(); // multiplier = 0, level lots 0.001..0.004
        assert_eq!(s.calc_lot(0), 0.001);
        assert_eq!(s.calc_lot(5), 0.002);
        assert_eq!(s.calc_lot(10), 0.003);
        assert_eq!(s.calc_lot(15), 0.004);
    }

    #[test]
    fn martingale_doubles_then_caps_at_ten_times_base() {
        // Mirrors the documented sizing sequence for multiplier = 2.
        let s = strategy_with(|c| {
            c.multiplier = 2.0;
            c.base_lot = 0.001;
        });
        let expected = [0.001, 0.002, 0.004, 0.008, 0.010, 0.010];
        for (n, want) in expected.iter().enumerate() {
            assert!(
                (s.calc_lot(n) - want).abs() < 1e-12,
                "lot {n}: got {} want {want}",
                s.calc_lot(n)
            );
        }
    }

    #[test]
    fn martingale_respects_balance_cap() {
        let mut s = strategy_with(|c| {
            c.multiplier = 2.0;
            c.base_lot = 0.001;
            c.min_lot = 0.0001;
        });
        s.balance = 10.0;
        s.last_price = 100.0;
        // margin cap = (10 * 0.1) / (1 * 100) = 0.01
        assert!(s.calc_lot(5) <= 0.01 + 1e-12);
    }

    #[test]
    fn lots_always_clamped_to_bounds() {
        let s = strategy_with(|c| {
            c.multiplier = 3.0;
            c.base_lot = 0.5;
            c.max_lot = 1.0;
        });
        // 0.5 * 3^4 would be 40.5; clamp to max_lot.
        assert_eq!(s.calc_lot(4), 1.0);
    }

    // ---- grid additions --------------------------------------------------

    #[test]
    fn first_order_on_side_always_allowed() {
        let s = strategy();
        assert_eq!(s.can_add_grid_order(Side::Long, 100.0), Some(0.001));
    }

    #[test]
    fn addition_requires_adverse_move_past_spacing() {
        let mut s = strategy(); // level 0 spacing 0.5%
        open_at(&mut s, Side::Long, 100.0, 0.001);

        assert_eq!(s.can_add_grid_order(Side::Long, 99.8), None); // -0.2%
        assert_eq!(s.can_add_grid_order(Side::Long, 99.5), Some(0.001)); // -0.5%
    }

    #[test]
    fn short_addition_mirrors_long() {
        let mut s = strategy();
        open_at(&mut s, Side::Short, 100.0, 0.001);

        assert_eq!(s.can_add_grid_order(Side::Short, 100.2), None);
        assert_eq!(s.can_add_grid_order(Side::Short, 100.5), Some(0.001));
    }

    #[test]
    fn addition_measures_from_worst_entry() {
        let mut s = strategy();
        open_at(&mut s, Side::Long, 100.0, 0.001);
        open_at(&mut s, Side::Long, 99.5, 0.001);

        // 0.5% below the *lowest* entry (99.5), not the first.
        assert_eq!(s.can_add_grid_order(Side::Long, 99.2), None);
        assert!(s.can_add_grid_order(Side::Long, 99.0025).is_some());
    }

    #[test]
    fn ladder_cap_blocks_additions() {
        let mut s = strategy_with(|c| {
            for level in &mut c.levels {
                level.max_orders = 1;
            }
        });
        // Cap = 2 * 4 = 8 total. Fill both sides to 4 each.
        for i in 0..4 {
            open_at(&mut s, Side::Long, 100.0 - i as f64, 0.001);
            open_at(&mut s, Side::Short, 100.0 + i as f64, 0.001);
        }
        assert_eq!(s.total_positions(), 8);
        assert_eq!(s.can_add_grid_order(Side::Long, 1.0), None);
        assert_eq!(s.can_add_grid_order(Side::Short, 1000.0), None);
    }

    // ---- signals ---------------------------------------------------------

    #[test]
    fn sar_above_sma_is_buy() {
        let mut s = strategy();
        assert_eq!(s.evaluate_signal(100.0, 101.0), Signal::Buy);
        assert_eq!(s.evaluate_signal(100.0, 99.0), Signal::Sell);
        assert_eq!(s.evaluate_signal(100.0, 100.0), Signal::None);
    }

    #[test]
    fn reverse_order_negates_signal() {
        let mut s = strategy_with(|c| c.reverse_order = true);
        assert_eq!(s.evaluate_signal(100.0, 101.0), Signal::Sell);
        assert_eq!(s.evaluate_signal(100.0, 99.0), Signal::Buy);
    }

    #[test]
    fn unseeded_indicators_give_no_signal() {
        let mut s = strategy();
        assert_eq!(s.evaluate_signal(0.0, 0.0), Signal::None);
    }

    #[test]
    fn cci_crossing_overrides_base_signal() {
        let mut s = strategy_with(|c| c.cci_period = 14);
        // History ends on an upper-band crossing.
        s.cci = CciState::from_history(vec![50.0, 120.0]);
        // Base says BUY, override says SELL on the crossing tick.
        assert_eq!(s.evaluate_signal(100.0, 101.0), Signal::Sell);

        // One tick later the CCI sits above the band without crossing: the
        // base signal applies again.
        s.cci = CciState::from_history(vec![50.0, 120.0, 130.0]);
        assert_eq!(s.evaluate_signal(100.0, 101.0), Signal::Buy);
    }

    #[test]
    fn cci_lower_band_crossing_buys() {
        let mut s = strategy_with(|c| c.cci_period = 14);
        s.cci = CciState::from_history(vec![-50.0, -120.0]);
        assert_eq!(s.evaluate_signal(100.0, 99.0), Signal::Buy);
    }

    // ---- pnl -------------------------------------------------------------

    #[test]
    fn pnl_percent_is_leverage_adjusted() {
        let mut settings = SessionSettings::default();
        settings.single_order_profit = 3.0;
        let s = GridStrategy::new(settings, 10);
        let pos = GridPosition {
            id: "p".into(),
            side: Side::Long,
            entry_price: 100.0,
            lot: 0.001,
            grid_level: 0,
            exchange_order_id: "x".into(),
            opened_at: String::new(),
        };
        // +1% price move at 10x leverage = +10% on margin.
        assert!((s.position_pnl_percent(&pos, 101.0) - 10.0).abs() < 1e-9);
    }

    // ---- profit targets --------------------------------------------------

    #[test]
    fn single_order_tp_selects_only_winners() {
        let mut s = strategy_with(|c| c.single_order_profit = 3.0);
        let winner = open_at(&mut s, Side::Long, 100.0, 0.001);
        let _loser = open_at(&mut s, Side::Long, 104.0, 0.001);

        match s.check_profit_targets(103.1) {
            Some(ProfitAction::CloseSingles(ids)) => assert_eq!(ids, vec![winner]),
            other => panic!("expected CloseSingles, got {other:?}"),
        }
    }

    #[test]
    fn pair_global_tp_fires_on_combined_percent() {
        let mut s = strategy_with(|c| {
            c.single_order_profit = 0.0;
            c.pair_global_profit = 1.0;
        });
        open_at(&mut s, Side::Long, 100.0, 0.001);
        open_at(&mut s, Side::Short, 100.0, 0.001);

        // Long +0.6%, short -0.6%: combined 0 -> no action.
        assert_eq!(s.check_profit_targets(100.6), None);

        // Close the short at a profit elsewhere and try again with only the
        // long: +1.1% >= 1.0% -> close everything.
        s.sell_positions.clear();
        assert_eq!(s.check_profit_targets(101.1), Some(ProfitAction::ClosePair));
    }

    #[test]
    fn single_tp_has_priority_over_pair_tp() {
        let mut s = strategy_with(|c| {
            c.single_order_profit = 1.0;
            c.pair_global_profit = 1.0;
        });
        open_at(&mut s, Side::Long, 100.0, 0.001);
        match s.check_profit_targets(102.0) {
            Some(ProfitAction::CloseSingles(_)) => {}
            other => panic!("expected CloseSingles first, got {other:?}"),
        }
    }

    #[test]
    fn global_profit_and_max_loss_stop_session() {
        let mut s = strategy_with(|c| {
            c.single_order_profit = 0.0;
            c.global_profit = 100.0;
            c.max_loss = 50.0;
        });

        s.performance.realized_pnl = 100.0;
        assert_eq!(s.check_profit_targets(1.0), Some(ProfitAction::GlobalProfit));
        assert!(ProfitAction::GlobalProfit.stops_session());

        s.performance.realized_pnl = -50.0;
        assert_eq!(s.check_profit_targets(1.0), Some(ProfitAction::MaxLoss));
        assert!(ProfitAction::MaxLoss.stops_session());
    }

    #[test]
    fn disabled_targets_never_fire() {
        let mut s = strategy_with(|c| {
            c.single_order_profit = 0.0;
            c.pair_global_profit = 0.0;
            c.global_profit = 0.0;
            c.max_loss = 0.0;
        });
        open_at(&mut s, Side::Long, 100.0, 0.001);
        s.performance.realized_pnl = 1_000_000.0;
        assert_eq!(s.check_profit_targets(200.0), None);
    }

    // ---- bookkeeping -----------------------------------------------------

    #[test]
    fn apply_close_updates_performance() {
        let mut s = strategy();
        let id = open_at(&mut s, Side::Long, 100.0, 0.001);

        let closed = s.apply_close(&id, 0.31).unwrap();
        assert_eq!(closed.exchange_order_id, id);
        assert!(s.buy_positions.is_empty());
        assert_eq!(s.performance.total_trades, 1);
        assert_eq!(s.performance.winning, 1);
        assert!((s.performance.realized_pnl - 0.31).abs() < 1e-12);
    }

    #[test]
    fn apply_close_unknown_id_is_none() {
        let mut s = strategy();
        assert!(s.apply_close("ghost", 1.0).is_none());
    }

    #[test]
    fn forget_position_records_no_trade() {
        let mut s = strategy();
        let id = open_at(&mut s, Side::Long, 100.0, 0.001);
        assert!(s.forget_position(&id).is_some());
        assert_eq!(s.performance.total_trades, 0);
        assert_eq!(s.performance.realized_pnl, 0.0);
    }

    #[test]
    fn insertion_assigns_levels_in_ladder_order() {
        let mut s = strategy();
        for i in 0..7 {
            open_at(&mut s, Side::Long, 100.0 - i as f64, 0.001);
        }
        let levels: Vec<usize> = s.buy_positions.iter().map(|p| p.grid_level).collect();
        assert_eq!(levels, vec![0, 0, 0, 0, 0, 1, 1]);
    }

    // ---- sync ------------------------------------------------------------

    fn reported(side: Side, entry: f64, qty: f64, id: &str) -> ExchangePosition {
        ExchangePosition {
            id: id.into(),
            side,
            avg_entry: entry,
            qty,
        }
    }

    #[test]
    fn sync_replaces_local_set_exactly() {
        let mut s = strategy();
        open_at(&mut s, Side::Long, 100.0, 0.001);

        let exchange_set = vec![
            reported(Side::Long, 99.0, 0.002, "e1"),
            reported(Side::Short, 101.0, 0.001, "e2"),
        ];
        s.sync_from_exchange(&exchange_set);

        let mut local: Vec<String> = s.all_exchange_ids();
        local.sort();
        assert_eq!(local, vec!["e1".to_string(), "e2".to_string()]);
        assert_eq!(s.buy_positions.len(), 1);
        assert_eq!(s.sell_positions.len(), 1);
    }

    #[test]
    fn sync_orders_longs_by_descending_entry() {
        let mut s = strategy();
        let exchange_set = vec![
            reported(Side::Long, 98.0, 0.001, "low"),
            reported(Side::Long, 100.0, 0.001, "high"),
            reported(Side::Long, 99.0, 0.001, "mid"),
        ];
        s.sync_from_exchange(&exchange_set);

        let ids: Vec<&str> = s
            .buy_positions
            .iter()
            .map(|p| p.exchange_order_id.as_str())
            .collect();
        assert_eq!(ids, vec!["high", "mid", "low"]);
        // Entries non-increasing down the ladder (invariant on the long side).
        assert!(s
            .buy_positions
            .windows(2)
            .all(|w| w[0].entry_price >= w[1].entry_price));
    }

    #[test]
    fn sync_orders_shorts_by_ascending_entry() {
        let mut s = strategy();
        let exchange_set = vec![
            reported(Side::Short, 103.0, 0.001, "high"),
            reported(Side::Short, 101.0, 0.001, "low"),
        ];
        s.sync_from_exchange(&exchange_set);

        let ids: Vec<&str> = s
            .sell_positions
            .iter()
            .map(|p| p.exchange_order_id.as_str())
            .collect();
        assert_eq!(ids, vec!["low", "high"]);
    }

    #[test]
    fn sync_recomputes_grid_levels_from_order() {
        let mut s = strategy_with(|c| {
            for level in &mut c.levels {
                level.max_orders = 2;
            }
        });
        let exchange_set: Vec<ExchangePosition> = (0..5)
            .map(|i| reported(Side::Long, 100.0 - i as f64, 0.001, &format!("e{i}")))
            .collect();
        s.sync_from_exchange(&exchange_set);

        let levels: Vec<usize> = s.buy_positions.iter().map(|p| p.grid_level).collect();
        assert_eq!(levels, vec![0, 0, 1, 1, 2]);
    }
}
