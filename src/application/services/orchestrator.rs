//! Orchestrator
//!
//! Owns the main tick loop: reconnect gating, one event-engine poll per
//! tick, controller fan-out, the end-of-day entry-cancel sweep, the daily
//! performance snapshot, and the keep-alive ping. Shutdown finishes the
//! in-flight tick and leaves open orders with the broker, who owns them
//! across process lifetimes.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::BotConfig;
use crate::domain::entities::order::OrderSide;
use crate::domain::entities::position::Position;
use crate::domain::entities::symbol::WatchSymbol;
use crate::domain::repositories::broker_client::{BrokerClient, OrderSnapshot};
use crate::domain::services::controller::{AccountContext, SymbolController, SymbolSnapshot};
use crate::domain::services::market_calendar::MarketCalendar;
use crate::persistence::repository::Store;
use crate::persistence::DatabaseError;

use super::event_engine::{EngineError, EventEngine};
use super::performance::PerformanceTracker;

/// Open equity entry orders are canceled this many minutes before the bell.
const EOD_CANCEL_MINUTES: i64 = 15;

/// Fatal orchestrator failure. Broker trouble never lands here; only a
/// persistence failure ends the process (exit non-zero, supervisor restarts,
/// reconciliation recovers).
#[derive(Debug, thiserror::Error)]
pub enum BotError {
    #[error("Store failure: {0}")]
    Database(#[from] DatabaseError),
}

/// Main trading bot orchestrator.
pub struct TradingBot {
    config: Arc<BotConfig>,
    broker: Arc<dyn BrokerClient>,
    store: Store,
    calendar: MarketCalendar,
    engine: EventEngine,
    controllers: Vec<SymbolController>,
    performance: PerformanceTracker,
    connected: bool,
    last_keepalive: Option<DateTime<Utc>>,
    last_eod_cancel: Option<NaiveDate>,
    last_snapshot_date: Option<NaiveDate>,
}

impl TradingBot {
    pub fn new(config: Arc<BotConfig>, broker: Arc<dyn BrokerClient>, store: Store) -> Self {
        let calendar = MarketCalendar::new(
            config.hours.allow_pre_market,
            config.hours.allow_after_hours,
        );
        let engine = EventEngine::new(
            broker.clone(),
            store.clone(),
            Duration::seconds(config.polling.orders_seconds as i64),
        );
        let controllers = config
            .symbols()
            .iter()
            .cloned()
            .map(|symbol| {
                SymbolController::new(
                    symbol,
                    config.clone(),
                    broker.clone(),
                    store.clone(),
                    calendar.clone(),
                )
            })
            .collect();

        info!(
            num_symbols = config.symbols().len(),
            mode = ?config.mode,
            "trading bot initialized"
        );

        Self {
            performance: PerformanceTracker::new(store.clone()),
            config,
            broker,
            store,
            calendar,
            engine,
            controllers,
            connected: false,
            last_keepalive: None,
            last_eod_cancel: None,
            last_snapshot_date: None,
        }
    }

    /// Run the tick loop until the shutdown signal flips. The in-flight tick
    /// always completes; open orders are never canceled on the way out.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), BotError> {
        // A shutdown that arrived while a supervised restart was backing off
        // is already latched in the channel.
        if *shutdown.borrow() {
            info!("shutdown already requested, not starting");
            return Ok(());
        }

        self.store
            .record_event(
                "bot_started",
                None,
                Some(serde_json::json!({
                    "mode": format!("{:?}", self.config.mode).to_lowercase(),
                    "watchlist": self.config.watchlist,
                    "crypto_watchlist": self.config.crypto_watchlist,
                })),
            )
            .await?;

        let tick_interval = std::time::Duration::from_secs(self.config.polling.orders_seconds);
        let mut interval = tokio::time::interval(tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!("entering main loop");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick(Utc::now()).await?;
                }
                _ = shutdown.changed() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        self.store.record_event("bot_stopped", None, None).await?;
        info!("trading bot stopped");
        Ok(())
    }

    /// One full tick. Public so tests can drive the loop with a controlled
    /// clock.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Result<(), BotError> {
        if !self.connected && !self.try_connect().await? {
            return Ok(());
        }

        // 1. Account-level context first: if the broker is unhealthy the tick
        //    is skipped before the event engine persists anything, so no
        //    attributed fill can miss its dispatch to a controller.
        let positions = match self.broker.positions().await {
            Ok(positions) => positions,
            Err(e) => {
                warn!(error = %e, "positions fetch failed, skipping tick");
                self.connected = false;
                return Ok(());
            }
        };
        let account = match self.broker.account_snapshot().await {
            Ok(account) => account,
            Err(e) => {
                warn!(error = %e, "account fetch failed, skipping tick");
                self.connected = false;
                return Ok(());
            }
        };

        // 2. Event engine: attribute fills before any controller acts.
        let outcome = match self.engine.poll(now).await {
            Ok(outcome) => outcome,
            Err(EngineError::Broker(e)) => {
                warn!(error = %e, "broker poll failed, treating as disconnected");
                self.connected = false;
                return Ok(());
            }
            Err(EngineError::Database(e)) => return Err(e.into()),
        };

        let exposure_by_symbol: HashMap<String, Decimal> = positions
            .iter()
            .map(|p| (p.symbol.clone(), p.market_value))
            .collect();
        let context = AccountContext {
            account,
            exposure_by_symbol,
        };

        let mut fills_by_symbol = outcome.fills_by_symbol;

        // 3. Controller fan-out, in configured order.
        for controller in &mut self.controllers {
            let symbol = controller.symbol().as_str().to_string();
            let snapshot = SymbolSnapshot {
                open_orders: outcome
                    .open_orders
                    .iter()
                    .filter(|o| o.symbol == symbol)
                    .cloned()
                    .collect(),
                position: positions.iter().find(|p| p.symbol == symbol).cloned(),
                fills: fills_by_symbol.remove(&symbol).unwrap_or_default(),
            };
            controller.tick(now, &snapshot, &context).await?;
        }

        // 4. End-of-day entry cancellations (equities only).
        self.handle_eod_cancellations(now, &outcome.open_orders).await?;

        // 5. Daily performance snapshot on the first tick of a new session
        //    date.
        self.take_daily_snapshot(now, &context, &positions).await?;

        // 6. Keep-alive ping.
        self.keepalive(now).await;

        Ok(())
    }

    async fn try_connect(&mut self) -> Result<bool, BotError> {
        match self.broker.account_snapshot().await {
            Ok(account) => {
                self.connected = true;
                info!(
                    broker = self.broker.name(),
                    equity = %account.equity,
                    "broker connected"
                );
                self.store
                    .record_event(
                        "broker_connected",
                        None,
                        Some(serde_json::json!({ "broker": self.broker.name() })),
                    )
                    .await?;
                Ok(true)
            }
            Err(e) => {
                warn!(error = %e, "broker connection attempt failed");
                Ok(false)
            }
        }
    }

    /// Cancel unfilled equity entry orders inside the last minutes of the
    /// session. Protective orders are never touched. Runs at most once per
    /// session date, and only counts as done once every cancel succeeded.
    async fn handle_eod_cancellations(
        &mut self,
        now: DateTime<Utc>,
        open_orders: &[OrderSnapshot],
    ) -> Result<(), BotError> {
        if !self.config.entries.cancel_at_close {
            return Ok(());
        }
        let session_date = self.calendar.session_date(now);
        if self.last_eod_cancel == Some(session_date) {
            return Ok(());
        }
        let Some(equity) = self.equity_symbols().next() else {
            return Ok(());
        };
        let Some(minutes) = self.calendar.minutes_until_close(&equity, now) else {
            return Ok(());
        };
        if minutes <= 0 || minutes > EOD_CANCEL_MINUTES {
            return Ok(());
        }
        // Only the session we are actually in counts; a weekend lookahead to
        // Monday's close must not trigger the sweep.
        if !self.calendar.is_tradable_now(&equity, now) {
            return Ok(());
        }

        info!(minutes_to_close = minutes, "cancelling unfilled equity entries for end of day");

        let equity_symbols: Vec<String> = self
            .equity_symbols()
            .map(|s| s.as_str().to_string())
            .collect();

        let mut all_ok = true;
        for order in open_orders {
            if order.side != OrderSide::Buy || !order.status.is_open() {
                continue;
            }
            if !equity_symbols.contains(&order.symbol) {
                continue;
            }
            match self.broker.cancel(&order.order_id).await {
                Ok(_) => {
                    self.store
                        .mark_order_canceled(
                            &order.order_id,
                            &order.symbol,
                            "entry_cancelled_eod",
                            serde_json::json!({ "order_id": order.order_id }),
                        )
                        .await?;
                    info!(symbol = %order.symbol, order_id = %order.order_id, "entry cancelled for end of day");
                }
                Err(e) => {
                    warn!(order_id = %order.order_id, error = %e, "eod cancel failed, will retry next tick");
                    all_ok = false;
                }
            }
        }

        if all_ok {
            self.last_eod_cancel = Some(session_date);
            self.store
                .record_event("eod_cancellations_completed", None, None)
                .await?;
        }
        Ok(())
    }

    async fn take_daily_snapshot(
        &mut self,
        now: DateTime<Utc>,
        context: &AccountContext,
        positions: &[Position],
    ) -> Result<(), BotError> {
        let session_date = self.calendar.session_date(now);
        if self.last_snapshot_date == Some(session_date) {
            return Ok(());
        }
        self.performance
            .take_daily_snapshot(now, session_date, &context.account, positions)
            .await?;
        self.last_snapshot_date = Some(session_date);
        Ok(())
    }

    async fn keepalive(&mut self, now: DateTime<Utc>) {
        let interval = Duration::seconds(self.config.polling.keepalive_seconds as i64);
        let due = self
            .last_keepalive
            .map_or(true, |last| now - last >= interval);
        if !due {
            return;
        }
        match self.broker.account_snapshot().await {
            Ok(_) => debug!("keepalive ping ok"),
            Err(e) => warn!(error = %e, "keepalive ping failed"),
        }
        self.last_keepalive = Some(now);
    }

    fn equity_symbols(&self) -> impl Iterator<Item = WatchSymbol> + '_ {
        self.config
            .symbols()
            .iter()
            .filter(|s| !s.is_crypto())
            .cloned()
    }
}
