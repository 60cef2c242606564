// =============================================================================
// Status Snapshot — the `status_update` payload shape the platform expects
// =============================================================================
//
// Field names are camelCase on the wire; this module is the single place
// where that contract lives. The snapshot is assembled from the strategy
// state under its lock and serialised lock-free afterwards.
// =============================================================================

use serde::Serialize;

use crate::strategy::{GridPosition, GridStrategy, Performance};
use crate::types::Side;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionSnapshot {
    pub id: String,
    pub side: Side,
    pub entry_price: f64,
    pub lot: f64,
    pub grid_level: usize,
    pub exchange_order_id: String,
    pub opened_at: String,
    pub pnl: f64,
    pub pnl_percent: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndicatorsSnapshot {
    pub sma: f64,
    pub sar: f64,
    pub cci: f64,
    pub signal: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionsSnapshot {
    pub buy: Vec<PositionSnapshot>,
    pub sell: Vec<PositionSnapshot>,
    pub buy_count: usize,
    pub sell_count: usize,
    pub buy_pnl: f64,
    pub sell_pnl: f64,
    pub total_pnl: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GridSnapshot {
    pub multiplier: f64,
    pub space_percent: f64,
    pub max_buy_orders: usize,
    pub max_sell_orders: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfitSnapshot {
    pub single_order_profit: f64,
    pub pair_global_profit: f64,
    pub global_profit: f64,
    pub max_loss: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSnapshot {
    pub total_trades: u64,
    pub winning: u64,
    pub losing: u64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub started_at: String,
}

impl From<&Performance> for PerformanceSnapshot {
    fn from(p: &Performance) -> Self {
        Self {
            total_trades: p.total_trades,
            winning: p.winning,
            losing: p.losing,
            realized_pnl: p.realized_pnl,
            unrealized_pnl: p.unrealized_pnl,
            started_at: p.started_at.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSnapshot {
    pub tick: u64,
    /// Seconds since the engine started.
    pub uptime: u64,
    pub started_at: String,
    pub last_trade_at: Option<String>,
}

/// Complete `status_update` payload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub user_id: String,
    pub user_bot_id: String,
    pub symbol: String,
    pub current_price: f64,
    pub indicators: IndicatorsSnapshot,
    pub balance: f64,
    pub positions: PositionsSnapshot,
    pub grid: GridSnapshot,
    pub profit: ProfitSnapshot,
    pub performance: PerformanceSnapshot,
    pub runtime: RuntimeSnapshot,
}

fn position_snapshot(strategy: &GridStrategy, position: &GridPosition, price: f64) -> PositionSnapshot {
    PositionSnapshot {
        id: position.id.clone(),
        side: position.side,
        entry_price: position.entry_price,
        lot: position.lot,
        grid_level: position.grid_level,
        exchange_order_id: position.exchange_order_id.clone(),
        opened_at: position.opened_at.clone(),
        pnl: strategy.position_pnl(position, price),
        pnl_percent: strategy.position_pnl_percent(position, price),
    }
}

/// Assemble the full snapshot from strategy state. Callers hold the strategy
/// lock only for the duration of this function.
pub fn build_status_snapshot(
    user_id: &str,
    user_bot_id: &str,
    symbol: &str,
    strategy: &GridStrategy,
    tick: u64,
    uptime_secs: u64,
    last_trade_at: Option<String>,
) -> StatusSnapshot {
    let price = strategy.last_price;
    let settings = strategy.settings();

    let buy: Vec<PositionSnapshot> = strategy
        .buy_positions
        .iter()
        .map(|p| position_snapshot(strategy, p, price))
        .collect();
    let sell: Vec<PositionSnapshot> = strategy
        .sell_positions
        .iter()
        .map(|p| position_snapshot(strategy, p, price))
        .collect();

    let buy_pnl = strategy.side_pnl(Side::Long, price);
    let sell_pnl = strategy.side_pnl(Side::Short, price);

    StatusSnapshot {
        user_id: user_id.to_string(),
        user_bot_id: user_bot_id.to_string(),
        symbol: symbol.to_string(),
        current_price: price,
        indicators: IndicatorsSnapshot {
            sma: strategy.last_sma,
            sar: strategy.sar_value(),
            cci: strategy.last_cci,
            signal: strategy.last_signal.to_string(),
        },
        balance: strategy.balance,
        positions: PositionsSnapshot {
            buy_count: buy.len(),
            sell_count: sell.len(),
            buy,
            sell,
            buy_pnl,
            sell_pnl,
            total_pnl: buy_pnl + sell_pnl,
        },
        grid: GridSnapshot {
            multiplier: settings.multiplier,
            space_percent: settings.levels.first().map(|l| l.percent).unwrap_or(0.0),
            max_buy_orders: settings.max_orders_per_side(),
            max_sell_orders: settings.max_orders_per_side(),
        },
        profit: ProfitSnapshot {
            single_order_profit: settings.single_order_profit,
            pair_global_profit: settings.pair_global_profit,
            global_profit: settings.global_profit,
            max_loss: settings.max_loss,
        },
        performance: (&strategy.performance).into(),
        runtime: RuntimeSnapshot {
            tick,
            uptime: uptime_secs,
            started_at: strategy.performance.started_at.clone(),
            last_trade_at,
        },
    }
}
