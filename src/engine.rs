// =============================================================================
// Trading Engine — per-session tick loop and lifecycle state machine
// =============================================================================
//
// One engine per session, one tick task per engine. A tick is strictly
// serial: market data is pulled through the adapter, the strategy decides,
// the adapter executes, and events are emitted — in that order, so an event
// is only ever enqueued after the exchange accepted the operation it reports.
//
// Error policy per tick step:
//   - transient adapter failures log a warning and the loop continues with
//     the last known data;
//   - auth failures are terminal: the session transitions to ERROR;
//   - order rejections emit balance_warning / error_occurred and continue —
//     a failed open never reserves a ladder slot.
//
// Cancellation is cooperative: `request_stop` raises a flag checked at the
// loop head; an in-flight tick always completes (adapter calls are bounded
// by the client deadline).
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{Timelike, Utc};
use parking_lot::RwLock;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::candle_cache::CandleCache;
use crate::config::SessionSettings;
use crate::exchange::{ExchangeAdapter, ExchangeError};
use crate::persist::{IndicatorSnapshot, StateStore};
use crate::snapshot::{build_status_snapshot, StatusSnapshot};
use crate::strategy::{GridStrategy, ProfitAction};
use crate::types::{SessionStatus, Side, Signal};
use crate::webhook::{EventKind, EventSink, TradeEvent};

/// Balance is refreshed every N ticks.
const BALANCE_UPDATE_INTERVAL: u64 = 5;

/// Positions are reconciled against the exchange every N ticks.
const SYNC_INTERVAL: u64 = 30;

/// A status snapshot is emitted every N ticks.
const STATUS_UPDATE_INTERVAL: u64 = 5;

/// Consecutive balance-fetch failures before a freshness warning is emitted.
const STALE_BALANCE_WARN_AFTER: u32 = 3;

/// Per-session trading engine.
pub struct TradingEngine {
    user_id: String,
    user_bot_id: String,
    symbol: String,
    leverage: u32,
    settings: SessionSettings,

    adapter: Arc<dyn ExchangeAdapter>,
    sink: Arc<dyn EventSink>,
    store: Option<StateStore>,

    strategy: RwLock<GridStrategy>,
    status: RwLock<SessionStatus>,

    should_stop: AtomicBool,
    force_close: AtomicBool,
    tick_count: AtomicU64,
    stale_balance_ticks: AtomicU32,

    started_at: Instant,
    last_trade_at: RwLock<Option<String>>,
}

impl TradingEngine {
    pub fn new(
        user_id: String,
        user_bot_id: String,
        symbol: String,
        leverage: u32,
        settings: SessionSettings,
        adapter: Arc<dyn ExchangeAdapter>,
        sink: Arc<dyn EventSink>,
        store: Option<StateStore>,
    ) -> Self {
        let strategy = GridStrategy::new(settings.clone(), leverage);
        Self {
            user_id,
            user_bot_id,
            symbol,
            leverage,
            settings,
            adapter,
            sink,
            store,
            strategy: RwLock::new(strategy),
            status: RwLock::new(SessionStatus::Idle),
            should_stop: AtomicBool::new(false),
            force_close: AtomicBool::new(false),
            tick_count: AtomicU64::new(0),
            stale_balance_ticks: AtomicU32::new(0),
            started_at: Instant::now(),
            last_trade_at: RwLock::new(None),
        }
    }

    // =========================================================================
    // Public surface (called by the session manager / API layer)
    // =========================================================================

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.read()
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count.load(Ordering::Relaxed)
    }

    /// Raise the cooperative stop flag. The loop observes it at the next
    /// tick boundary.
    pub fn request_stop(&self) {
        self.should_stop.store(true, Ordering::SeqCst);
    }

    /// Ask the tick task to close every open position on its next pass.
    pub fn request_force_close(&self) {
        self.force_close.store(true, Ordering::SeqCst);
    }

    /// Force the session into ERROR. Used by the session manager when a
    /// stop deadline expires and the tick task had to be aborted.
    pub fn mark_error(&self) {
        *self.status.write() = SessionStatus::Error;
    }

    /// Close every open position immediately. Only safe while no tick task
    /// is running (the manager routes the running case through
    /// [`TradingEngine::request_force_close`] instead).
    pub async fn flatten(&self) -> Result<(), ExchangeError> {
        self.close_all().await
    }

    /// Current status snapshot, as served by the control API.
    pub fn snapshot(&self) -> StatusSnapshot {
        let strategy = self.strategy.read();
        build_status_snapshot(
            &self.user_id,
            &self.user_bot_id,
            &self.symbol,
            &strategy,
            self.tick_count(),
            self.started_at.elapsed().as_secs(),
            self.last_trade_at.read().clone(),
        )
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Move to `to` if the lifecycle DAG allows it.
    fn transition(&self, to: SessionStatus) -> bool {
        let mut status = self.status.write();
        if status.can_transition(to) {
            debug!(user_id = %self.user_id, from = %*status, %to, "status transition");
            *status = to;
            true
        } else {
            warn!(user_id = %self.user_id, from = %*status, %to, "illegal status transition ignored");
            false
        }
    }

    /// Terminal failure: record ERROR and tell the platform.
    async fn fail(&self, message: String) {
        error!(user_id = %self.user_id, %message, "session entering ERROR state");
        *self.status.write() = SessionStatus::Error;
        self.save_indicator_state();
        self.emit(EventKind::ErrorOccurred, serde_json::json!({ "message": message }))
            .await;
        self.emit_status_changed().await;
    }

    /// Run the whole session lifecycle. Consumes the task it is spawned on;
    /// returns when the session reaches STOPPED or ERROR.
    pub async fn run(self: Arc<Self>) {
        if !self.transition(SessionStatus::Starting) {
            return;
        }

        if let Err(e) = self.start_up().await {
            self.fail(format!("startup failed: {e}")).await;
            return;
        }

        if !self.transition(SessionStatus::Running) {
            return;
        }
        self.emit_status_changed().await;
        info!(user_id = %self.user_id, symbol = %self.symbol, "session running");

        let mut cache = CandleCache::new();
        let tick_interval = Duration::from_secs_f64(self.settings.tick_interval_secs);

        loop {
            if self.should_stop.load(Ordering::SeqCst) || self.status() != SessionStatus::Running
            {
                break;
            }

            if let Err(e) = self.tick(&mut cache).await {
                self.fail(format!("exchange rejected the session: {e}")).await;
                return;
            }

            self.tick_count.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(tick_interval).await;
        }

        self.shut_down().await;
    }

    /// STARTING phase: recover indicator state, reconcile positions, prime
    /// the balance.
    async fn start_up(&self) -> Result<(), ExchangeError> {
        if let Some(snapshot) = self.store.as_ref().and_then(|s| s.load(&self.user_id)) {
            let mut strategy = self.strategy.write();
            strategy.sar = snapshot.sar;
            strategy.cci = crate::indicators::CciState::from_history(snapshot.cci_history);
            info!(user_id = %self.user_id, "indicator state recovered");
        }

        let positions = self.adapter.get_positions(&self.symbol).await?;
        let balance = self.adapter.get_balance(&self.symbol).await?;
        let price = self.adapter.get_ticker(&self.symbol).await?;

        let mut strategy = self.strategy.write();
        strategy.last_price = price;
        strategy.balance = balance;
        strategy.sync_from_exchange(&positions);
        info!(
            user_id = %self.user_id,
            balance,
            price,
            recovered_positions = positions.len(),
            "session start-up complete"
        );
        Ok(())
    }

    /// STOPPING phase: optionally flatten, persist indicators, finish.
    async fn shut_down(&self) {
        if !self.transition(SessionStatus::Stopping) {
            return;
        }
        self.emit_status_changed().await;

        if self.settings.close_on_stop {
            if let Err(e) = self.close_all().await {
                warn!(user_id = %self.user_id, error = %e, "close-on-stop failed");
            }
        }

        self.save_indicator_state();
        self.transition(SessionStatus::Stopped);
        self.emit_status_changed().await;
        info!(user_id = %self.user_id, "session stopped");
    }

    fn save_indicator_state(&self) {
        let Some(store) = &self.store else { return };
        let snapshot = {
            let strategy = self.strategy.read();
            IndicatorSnapshot {
                sar: strategy.sar,
                cci_history: strategy.cci.history(),
            }
        };
        if let Err(e) = store.save(&self.user_id, &snapshot) {
            warn!(user_id = %self.user_id, error = %e, "failed to persist indicator state");
        }
    }

    // =========================================================================
    // Tick
    // =========================================================================

    /// One pass of the decision loop. Returns `Err` only for auth-class
    /// failures, which end the session.
    async fn tick(&self, cache: &mut CandleCache) -> Result<(), ExchangeError> {
        let tick = self.tick_count.load(Ordering::Relaxed);

        // --- Admin-requested flatten ------------------------------------
        if self.force_close.swap(false, Ordering::SeqCst) {
            info!(user_id = %self.user_id, "force-close requested");
            self.close_all().await?;
        }

        // --- 2. Ticker ---------------------------------------------------
        match self.adapter.get_ticker(&self.symbol).await {
            Ok(price) => self.strategy.write().last_price = price,
            Err(e) if e.is_auth() => return Err(e),
            Err(e) => {
                warn!(user_id = %self.user_id, error = %e, "ticker fetch failed");
                if self.strategy.read().last_price <= 0.0 {
                    // Nothing sensible can happen without a price.
                    return Ok(());
                }
            }
        }

        // --- 3. Balance --------------------------------------------------
        if tick % BALANCE_UPDATE_INTERVAL == 0 {
            match self.adapter.get_balance(&self.symbol).await {
                Ok(balance) => {
                    self.strategy.write().balance = balance;
                    self.stale_balance_ticks.store(0, Ordering::Relaxed);
                }
                Err(e) if e.is_auth() => return Err(e),
                Err(e) => {
                    let stale = self.stale_balance_ticks.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(user_id = %self.user_id, error = %e, stale_intervals = stale, "balance fetch failed — using last known");
                    if stale == STALE_BALANCE_WARN_AFTER {
                        let balance = self.strategy.read().balance;
                        self.emit(
                            EventKind::BalanceWarning,
                            serde_json::json!({
                                "balance": balance,
                                "message": "balance data is stale",
                            }),
                        )
                        .await;
                    }
                }
            }
        }

        // --- 4. Position sync -------------------------------------------
        if tick > 0 && tick % SYNC_INTERVAL == 0 {
            match self.adapter.get_positions(&self.symbol).await {
                Ok(positions) => self.strategy.write().sync_from_exchange(&positions),
                Err(e) if e.is_auth() => return Err(e),
                Err(e) => {
                    warn!(user_id = %self.user_id, error = %e, "position sync failed — retrying next interval");
                }
            }
        }

        // --- 5. Candles & indicators ------------------------------------
        let candles = cache
            .refresh(self.adapter.as_ref(), &self.symbol, &self.settings.timeframe)
            .await
            .to_vec();

        let new_candle = {
            let mut strategy = self.strategy.write();
            let newest = candles.last().map(|c| c.open_time).unwrap_or(0);
            if newest > strategy.last_candle_ts && !candles.is_empty() {
                strategy.update_indicators(&candles);
                true
            } else {
                false
            }
        };

        // --- 6. Entry signal ---------------------------------------------
        self.maybe_open_entries(new_candle).await?;

        // --- 7. Grid additions -------------------------------------------
        self.maybe_add_grid_orders().await?;

        // --- 8. Profit targets -------------------------------------------
        self.apply_profit_targets().await?;

        // --- 9. Status snapshot ------------------------------------------
        if tick % STATUS_UPDATE_INTERVAL == 0 {
            let snapshot = {
                let mut strategy = self.strategy.write();
                let price = strategy.last_price;
                strategy.refresh_unrealized(price);
                build_status_snapshot(
                    &self.user_id,
                    &self.user_bot_id,
                    &self.symbol,
                    &strategy,
                    tick,
                    self.started_at.elapsed().as_secs(),
                    self.last_trade_at.read().clone(),
                )
            };
            self.emit(
                EventKind::StatusUpdate,
                serde_json::to_value(&snapshot).unwrap_or_default(),
            )
            .await;
        }

        Ok(())
    }

    /// Step 6: evaluate the entry signal and open an initial position on an
    /// empty side. Gated by the session's trading window.
    async fn maybe_open_entries(&self, new_candle: bool) -> Result<(), ExchangeError> {
        let (signal, buy_empty, sell_empty, price) = {
            let mut strategy = self.strategy.write();
            let buy_empty = strategy.buy_positions.is_empty();
            let sell_empty = strategy.sell_positions.is_empty();

            let should_evaluate =
                (self.settings.open_on_new_candle && new_candle) || buy_empty || sell_empty;
            if !should_evaluate {
                return Ok(());
            }

            let sma = strategy.last_sma;
            let sar = strategy.sar_value();
            let signal = strategy.evaluate_signal(sma, sar);
            (signal, buy_empty, sell_empty, strategy.last_price)
        };

        if signal == Signal::None || price <= 0.0 {
            return Ok(());
        }

        let now = Utc::now();
        let minute_of_day = now.hour() * 60 + now.minute();
        if !self.settings.within_trading_window(minute_of_day) {
            debug!(user_id = %self.user_id, %signal, "signal outside trading window — skipped");
            return Ok(());
        }

        let side = match signal {
            Signal::Buy if buy_empty => Side::Long,
            Signal::Sell if sell_empty => Side::Short,
            _ => return Ok(()),
        };

        let lot = match self.strategy.read().can_add_grid_order(side, price) {
            Some(lot) => lot,
            None => return Ok(()),
        };

        self.open_position(side, lot).await
    }

    /// Step 7: ladder additions on sides that already hold positions.
    async fn maybe_add_grid_orders(&self) -> Result<(), ExchangeError> {
        for side in [Side::Long, Side::Short] {
            let lot = {
                let strategy = self.strategy.read();
                if strategy.positions(side).is_empty() {
                    continue;
                }
                strategy.can_add_grid_order(side, strategy.last_price)
            };

            if let Some(lot) = lot {
                self.open_position(side, lot).await?;
            }
        }
        Ok(())
    }

    /// Step 8: evaluate and execute the profit/loss rules.
    async fn apply_profit_targets(&self) -> Result<(), ExchangeError> {
        let action = {
            let strategy = self.strategy.read();
            strategy.check_profit_targets(strategy.last_price)
        };

        let Some(action) = action else {
            return Ok(());
        };

        match &action {
            ProfitAction::CloseSingles(ids) => {
                for id in ids {
                    self.close_one(id).await?;
                }
            }
            ProfitAction::ClosePair => {
                info!(user_id = %self.user_id, "pair global take-profit hit — flattening");
                self.close_all().await?;
            }
            ProfitAction::GlobalProfit | ProfitAction::MaxLoss => {
                let kind = if matches!(&action, ProfitAction::GlobalProfit) {
                    "global_profit"
                } else {
                    "max_loss"
                };
                let realized = self.strategy.read().performance.realized_pnl;
                info!(user_id = %self.user_id, kind, realized, "global limit hit — flattening and stopping");

                // Close positions FIRST, then stop. Stopping with the ladder
                // still open would leave live exposure unmanaged.
                self.close_all().await?;

                let realized = self.strategy.read().performance.realized_pnl;
                self.emit(
                    EventKind::GlobalLimitHit,
                    serde_json::json!({ "kind": kind, "realizedPnl": realized }),
                )
                .await;
                self.request_stop();
            }
        }
        Ok(())
    }

    // =========================================================================
    // Order execution
    // =========================================================================

    /// Open one position and record it. A rejection is reported and absorbed;
    /// the ladder slot stays free for the next tick.
    async fn open_position(&self, side: Side, lot: f64) -> Result<(), ExchangeError> {
        let result = self
            .adapter
            .open_position(&self.symbol, side, lot, self.leverage)
            .await;

        match result {
            Ok(fill) => {
                let position = {
                    let mut strategy = self.strategy.write();
                    let entry = if fill.filled_price > 0.0 {
                        fill.filled_price
                    } else {
                        strategy.last_price
                    };
                    strategy.apply_open(side, lot, entry, fill.order_id)
                };
                *self.last_trade_at.write() = Some(position.opened_at.clone());

                self.emit(
                    EventKind::TradeOpened,
                    serde_json::json!({
                        "side": position.side,
                        "lot": position.lot,
                        "entryPrice": position.entry_price,
                        "gridLevel": position.grid_level,
                        "orderId": position.exchange_order_id,
                    }),
                )
                .await;
                Ok(())
            }
            Err(e) if e.is_auth() => Err(e),
            Err(ExchangeError::InsufficientMargin(msg)) => {
                let balance = self.strategy.read().balance;
                warn!(user_id = %self.user_id, %side, lot, %msg, "open rejected: insufficient margin");
                self.emit(
                    EventKind::BalanceWarning,
                    serde_json::json!({ "balance": balance, "message": msg }),
                )
                .await;
                Ok(())
            }
            Err(e @ (ExchangeError::SizeInvalid(_) | ExchangeError::Rejected { .. })) => {
                warn!(user_id = %self.user_id, %side, lot, error = %e, "open rejected");
                self.emit(
                    EventKind::ErrorOccurred,
                    serde_json::json!({ "message": e.to_string() }),
                )
                .await;
                Ok(())
            }
            Err(e) => {
                warn!(user_id = %self.user_id, %side, lot, error = %e, "open failed — will retry on a later tick");
                Ok(())
            }
        }
    }

    /// Close one position by exchange id and record the result.
    async fn close_one(&self, exchange_order_id: &str) -> Result<(), ExchangeError> {
        let result = self
            .adapter
            .close_position(&self.symbol, exchange_order_id)
            .await;

        match result {
            Ok(close) => {
                let (closed, price) = {
                    let mut strategy = self.strategy.write();
                    let closed = strategy.apply_close(exchange_order_id, close.realized_pnl);
                    (closed, strategy.last_price)
                };

                if let Some(position) = closed {
                    let closed_at = Utc::now().to_rfc3339();
                    *self.last_trade_at.write() = Some(closed_at);
                    self.emit(
                        EventKind::TradeClosed,
                        serde_json::json!({
                            "side": position.side,
                            "lot": position.lot,
                            "entryPrice": position.entry_price,
                            "closePrice": price,
                            "realizedPnl": close.realized_pnl,
                            "orderId": position.exchange_order_id,
                        }),
                    )
                    .await;
                }
                Ok(())
            }
            Err(ExchangeError::NotFound(_)) => {
                // Already closed on the venue; drop it locally and let the
                // next sync settle the books.
                warn!(user_id = %self.user_id, exchange_order_id, "close target unknown to exchange — treating as closed");
                self.strategy.write().forget_position(exchange_order_id);
                Ok(())
            }
            Err(e) if e.is_auth() => Err(e),
            Err(e) => {
                warn!(user_id = %self.user_id, exchange_order_id, error = %e, "close failed — will retry");
                Ok(())
            }
        }
    }

    /// Close every open position on both sides.
    async fn close_all(&self) -> Result<(), ExchangeError> {
        let ids = self.strategy.read().all_exchange_ids();
        for id in ids {
            self.close_one(&id).await?;
        }
        Ok(())
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Attach session identity and hand the event to the sink.
    async fn emit(&self, kind: EventKind, mut data: serde_json::Value) {
        if let Some(map) = data.as_object_mut() {
            map.insert("userId".into(), self.user_id.clone().into());
            map.insert("userBotId".into(), self.user_bot_id.clone().into());
            map.insert("symbol".into(), self.symbol.clone().into());
        }
        self.sink.emit(TradeEvent::new(kind, data)).await;
    }

    async fn emit_status_changed(&self) {
        let status = self.status();
        self.emit(
            EventKind::StatusChanged,
            serde_json::json!({ "status": status }),
        )
        .await;
    }
}

impl std::fmt::Debug for TradingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradingEngine")
            .field("user_id", &self.user_id)
            .field("symbol", &self.symbol)
            .field("status", &self.status())
            .field("tick_count", &self.tick_count())
            .finish()
    }
}
