//! Per-symbol state machine.
//!
//! The controller decides one action per tick from the broker snapshot, the
//! persisted state row, and the configuration. Local ids are advisory: the
//! status is re-derived every tick from positions, open orders, and the
//! persisted cooldown, which is what makes restart recovery work.
//!
//! Broker failures never propagate out of a tick; they become audit events
//! and per-symbol exponential backoff. Store failures do propagate: a
//! persistence problem is fatal to the process by design.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use crate::config::{BotConfig, EntryKind};
use crate::domain::entities::fill::Fill;
use crate::domain::entities::order::{OrderSide, OrderType};
use crate::domain::entities::position::Position;
use crate::domain::entities::symbol::WatchSymbol;
use crate::domain::repositories::broker_client::{
    AccountSnapshot, BrokerClient, BrokerError, EntryRequest, OrderSnapshot, ProtectiveRequest,
};
use crate::domain::services::market_calendar::MarketCalendar;
use crate::domain::services::sizer::PositionSizer;
use crate::persistence::models::SymbolStateRecord;
use crate::persistence::repository::Store;
use crate::persistence::DatabaseError;

/// Quotes older than this are not acted on. The boundary is inclusive: a
/// quote exactly this old is still fresh.
pub const QUOTE_STALENESS_SECONDS: i64 = 30;

/// Grace period after a protective submission during which reconciliation
/// tolerates disagreement with the broker's just-submitted state.
pub const STABILIZATION_WINDOW_SECONDS: i64 = 10;

/// Backoff cap, in multiples of the tick interval.
const MAX_BACKOFF_TICKS: u32 = 5;

/// Symbol trading status, derived fresh every tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolStatus {
    NoPosition,
    EntryPending,
    PositionOpen,
    Cooldown,
}

impl std::fmt::Display for SymbolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SymbolStatus::NoPosition => write!(f, "no_position"),
            SymbolStatus::EntryPending => write!(f, "entry_pending"),
            SymbolStatus::PositionOpen => write!(f, "position_open"),
            SymbolStatus::Cooldown => write!(f, "cooldown"),
        }
    }
}

/// Broker-side view of one symbol for a single tick, assembled by the
/// orchestrator after the event engine has run.
#[derive(Debug, Clone, Default)]
pub struct SymbolSnapshot {
    /// Open orders for this symbol.
    pub open_orders: Vec<OrderSnapshot>,
    /// Position, if any.
    pub position: Option<Position>,
    /// Fills attributed to this symbol by the event engine this tick, in
    /// broker timestamp order.
    pub fills: Vec<Fill>,
}

impl SymbolSnapshot {
    fn position_qty(&self) -> Decimal {
        self.position
            .as_ref()
            .map(|p| p.qty)
            .unwrap_or(Decimal::ZERO)
    }

    fn open_protectives(&self) -> Vec<&OrderSnapshot> {
        self.open_orders
            .iter()
            .filter(|o| o.side == OrderSide::Sell && o.status.is_open())
            .collect()
    }

    fn has_open_entry(&self) -> bool {
        self.open_orders
            .iter()
            .any(|o| o.side == OrderSide::Buy && o.status.is_open())
    }
}

/// Account-level context shared by all controllers within a tick.
#[derive(Debug, Clone)]
pub struct AccountContext {
    pub account: AccountSnapshot,
    /// Market value of open positions, by symbol.
    pub exposure_by_symbol: HashMap<String, Decimal>,
}

/// Derive the status for a symbol. Position beats cooldown beats pending
/// entry; the broker snapshot plus the persisted cooldown are authoritative.
pub fn derive_status(
    state: &SymbolStateRecord,
    snapshot: &SymbolSnapshot,
    now: DateTime<Utc>,
) -> SymbolStatus {
    if snapshot.position_qty() > Decimal::ZERO {
        SymbolStatus::PositionOpen
    } else if state.in_cooldown(now) {
        SymbolStatus::Cooldown
    } else if snapshot.has_open_entry() {
        SymbolStatus::EntryPending
    } else {
        SymbolStatus::NoPosition
    }
}

/// Per-symbol exponential backoff for transient broker failures. Starts at
/// one tick interval, doubles, and caps at five tick intervals.
#[derive(Debug, Clone, Default)]
struct Backoff {
    consecutive_failures: u32,
    next_attempt: Option<DateTime<Utc>>,
}

impl Backoff {
    fn ready(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt.map_or(true, |at| now >= at)
    }

    fn record_failure(&mut self, now: DateTime<Utc>, tick_interval: Duration) {
        self.consecutive_failures += 1;
        let factor = 2u32
            .saturating_pow(self.consecutive_failures.saturating_sub(1))
            .min(MAX_BACKOFF_TICKS);
        self.next_attempt = Some(now + tick_interval * factor as i32);
    }

    fn reset(&mut self) {
        self.consecutive_failures = 0;
        self.next_attempt = None;
    }
}

/// State machine for a single symbol.
pub struct SymbolController {
    symbol: WatchSymbol,
    config: Arc<BotConfig>,
    broker: Arc<dyn BrokerClient>,
    store: Store,
    sizer: PositionSizer,
    calendar: MarketCalendar,
    last_protective_submit: Option<DateTime<Utc>>,
    backoff: Backoff,
}

impl SymbolController {
    pub fn new(
        symbol: WatchSymbol,
        config: Arc<BotConfig>,
        broker: Arc<dyn BrokerClient>,
        store: Store,
        calendar: MarketCalendar,
    ) -> Self {
        Self {
            symbol,
            config,
            broker,
            store,
            sizer: PositionSizer::new(),
            calendar,
            last_protective_submit: None,
            backoff: Backoff::default(),
        }
    }

    pub fn symbol(&self) -> &WatchSymbol {
        &self.symbol
    }

    /// Run one tick for this symbol. Broker errors are absorbed into events
    /// and backoff; only store failures escape.
    pub async fn tick(
        &mut self,
        now: DateTime<Utc>,
        snapshot: &SymbolSnapshot,
        account: &AccountContext,
    ) -> Result<(), DatabaseError> {
        let state = self.store.get_or_create_state(self.symbol.as_str()).await?;

        self.apply_fills(now, snapshot, &state).await?;
        self.recover_missed_stopout(now, snapshot).await?;

        // Re-read: a stop-out fill above may have started a cooldown.
        let state = self.store.get_or_create_state(self.symbol.as_str()).await?;
        let status = derive_status(&state, snapshot, now);
        debug!(symbol = %self.symbol, status = %status, "tick");

        // An elapsed cooldown is cleared as soon as it is observed.
        if !state.in_cooldown(now) && state.cooldown_until.is_some() {
            self.store.clear_cooldown(self.symbol.as_str()).await?;
        }

        // The tracked entry closed without producing a position.
        if status != SymbolStatus::PositionOpen {
            if let Some(parent_id) = state.last_parent_id.as_deref() {
                let still_open = snapshot
                    .open_orders
                    .iter()
                    .any(|o| o.order_id == parent_id);
                if !still_open {
                    self.store.clear_parent(self.symbol.as_str()).await?;
                }
            }
        }

        match status {
            SymbolStatus::PositionOpen => {
                self.reconcile_protective(now, snapshot, &state).await?;
            }
            SymbolStatus::Cooldown => {
                self.cancel_orphan_protectives(now, snapshot, &state).await?;
                if let Some(until) = state.cooldown_until {
                    debug!(
                        symbol = %self.symbol,
                        remaining_seconds = (until - now).num_seconds(),
                        "in cooldown"
                    );
                }
            }
            SymbolStatus::NoPosition => {
                self.cancel_orphan_protectives(now, snapshot, &state).await?;
                self.maybe_place_entry(now, account).await?;
            }
            SymbolStatus::EntryPending => {
                // The entry is a resting order; fills arrive via the event
                // engine. Nothing to do.
            }
        }

        Ok(())
    }

    /// React to fills dispatched by the event engine this tick. A SELL fill
    /// that flattens the position and came from the tracked protective order
    /// starts the loss cooldown; any other flattening SELL just drops the
    /// protective pointer.
    async fn apply_fills(
        &mut self,
        _now: DateTime<Utc>,
        snapshot: &SymbolSnapshot,
        state: &SymbolStateRecord,
    ) -> Result<(), DatabaseError> {
        let mut cooldown_started = false;
        for fill in &snapshot.fills {
            if fill.side != OrderSide::Sell {
                continue;
            }
            if snapshot.position_qty() > Decimal::ZERO {
                // Partial exit; reconciliation re-sizes the protective.
                continue;
            }
            if cooldown_started || state.in_cooldown(fill.ts) {
                continue;
            }

            if self.fill_is_protective(fill, state).await? {
                let minutes = self.config.cooldowns.after_stopout_minutes;
                let until = fill.ts + Duration::minutes(minutes);
                self.store
                    .start_cooldown(
                        self.symbol.as_str(),
                        until,
                        serde_json::json!({
                            "exec_id": fill.exec_id,
                            "exit_price": fill.price.to_string(),
                            "cooldown_minutes": minutes,
                            "cooldown_until": until.to_rfc3339(),
                        }),
                    )
                    .await?;
                cooldown_started = true;
                info!(
                    symbol = %self.symbol,
                    exit_price = %fill.price,
                    cooldown_minutes = minutes,
                    "stopout cooldown started"
                );
            } else if state.last_trail_id.is_some() {
                // Position closed by something we did not place. No cooldown.
                self.store.clear_trail(self.symbol.as_str()).await?;
            }
        }
        Ok(())
    }

    /// The fill row for a protective exit is written before it is handed to
    /// this controller; if the process dies (or the tick aborts) between the
    /// two, the engine's dedupe means it is never re-dispatched. Catch up
    /// from the order row: a tracked protective that shows filled while we
    /// are flat and not cooling down still starts the cooldown.
    async fn recover_missed_stopout(
        &mut self,
        now: DateTime<Utc>,
        snapshot: &SymbolSnapshot,
    ) -> Result<(), DatabaseError> {
        if !snapshot.fills.is_empty() || snapshot.position_qty() > Decimal::ZERO {
            return Ok(());
        }
        let state = self.store.get_or_create_state(self.symbol.as_str()).await?;
        if state.in_cooldown(now) {
            return Ok(());
        }
        let Some(trail_id) = state.last_trail_id.as_deref() else {
            return Ok(());
        };
        let Some(record) = self.store.get_order(trail_id).await? else {
            return Ok(());
        };
        match record.status()? {
            crate::domain::entities::order::OrderStatus::Filled => {
                let minutes = self.config.cooldowns.after_stopout_minutes;
                let until = record.updated_at + Duration::minutes(minutes);
                if until <= now {
                    // The window already elapsed during the outage.
                    self.store.clear_trail(self.symbol.as_str()).await?;
                    return Ok(());
                }
                warn!(
                    symbol = %self.symbol,
                    order_id = trail_id,
                    "protective filled while unobserved, starting cooldown"
                );
                self.store
                    .start_cooldown(
                        self.symbol.as_str(),
                        until,
                        serde_json::json!({
                            "order_id": trail_id,
                            "cooldown_minutes": minutes,
                            "cooldown_until": until.to_rfc3339(),
                            "recovered": true,
                        }),
                    )
                    .await?;
            }
            status if status.is_terminal() => {
                self.store.clear_trail(self.symbol.as_str()).await?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Whether a SELL fill belongs to the protective order this controller
    /// placed. The tracked id is authoritative; the order-type fallback
    /// covers protectives placed by a previous process.
    async fn fill_is_protective(
        &self,
        fill: &Fill,
        state: &SymbolStateRecord,
    ) -> Result<bool, DatabaseError> {
        if state.last_trail_id.as_deref() == Some(fill.order_id.as_str()) {
            return Ok(true);
        }
        match self.store.get_order(&fill.order_id).await? {
            Some(record) => {
                let order_type = record
                    .order_type()
                    .unwrap_or(OrderType::Market);
                Ok(order_type == OrderType::TrailingStop
                    || (self.symbol.is_crypto() && order_type == OrderType::Limit))
            }
            None => Ok(false),
        }
    }

    /// POSITION_OPEN reconciliation: exactly one open protective SELL whose
    /// quantity matches the position. Repairs run outside the stabilization
    /// window only.
    async fn reconcile_protective(
        &mut self,
        now: DateTime<Utc>,
        snapshot: &SymbolSnapshot,
        state: &SymbolStateRecord,
    ) -> Result<(), DatabaseError> {
        let position = match snapshot.position.as_ref() {
            Some(p) if !p.is_flat() => p.clone(),
            _ => return Ok(()),
        };

        let protectives = snapshot.open_protectives();
        if self.in_stabilization_window(now, &protectives) {
            debug!(symbol = %self.symbol, "inside stabilization window, skipping reconciliation");
            return Ok(());
        }

        let had_buy_fill = snapshot
            .fills
            .iter()
            .any(|f| f.side == OrderSide::Buy);

        match protectives.len() {
            0 => {
                let event_type = if had_buy_fill {
                    "trailing_stop_placed_after_entry"
                } else {
                    warn!(symbol = %self.symbol, "protective order missing, recreating");
                    "protective_recreated"
                };
                self.place_protective(now, &position, event_type, None).await?;
            }
            1 => {
                let existing = protectives[0];
                if existing.remaining_qty() != position.qty {
                    warn!(
                        symbol = %self.symbol,
                        stop_qty = %existing.remaining_qty(),
                        position_qty = %position.qty,
                        "protective quantity mismatch, replacing"
                    );
                    if self.cancel_order_for_replace(now, existing).await? {
                        self.place_protective(
                            now,
                            &position,
                            "protective_requantified",
                            Some(existing),
                        )
                        .await?;
                    }
                }
            }
            _ => {
                self.cancel_duplicate_protectives(now, &position, &protectives)
                    .await?;
            }
        }

        Ok(())
    }

    fn in_stabilization_window(&self, now: DateTime<Utc>, protectives: &[&OrderSnapshot]) -> bool {
        let window = Duration::seconds(STABILIZATION_WINDOW_SECONDS);
        if let Some(submitted) = self.last_protective_submit {
            if now - submitted < window {
                return true;
            }
        }
        // Covers a restart inside the window: the order row carries the
        // broker's submission time.
        protectives.iter().any(|o| now - o.created_at < window)
    }

    /// Keep the oldest protective whose quantity matches the position (or
    /// just the oldest), cancel the rest.
    async fn cancel_duplicate_protectives(
        &mut self,
        now: DateTime<Utc>,
        position: &Position,
        protectives: &[&OrderSnapshot],
    ) -> Result<(), DatabaseError> {
        warn!(
            symbol = %self.symbol,
            count = protectives.len(),
            "duplicate protective orders"
        );

        let mut ordered: Vec<&OrderSnapshot> = protectives.to_vec();
        ordered.sort_by_key(|o| o.created_at);
        let keeper = ordered
            .iter()
            .find(|o| o.remaining_qty() == position.qty)
            .copied()
            .or_else(|| ordered.first().copied());
        let keeper_id = keeper.map(|o| o.order_id.clone()).unwrap_or_default();

        for order in ordered {
            if order.order_id == keeper_id {
                continue;
            }
            match self.broker.cancel(&order.order_id).await {
                Ok(_) => {
                    self.store
                        .mark_order_canceled(
                            &order.order_id,
                            self.symbol.as_str(),
                            "duplicate_stop_cancelled",
                            serde_json::json!({ "order_id": order.order_id }),
                        )
                        .await?;
                    self.backoff.reset();
                }
                Err(e) => self.handle_broker_error("cancel_duplicate", e, now, false).await?,
            }
        }
        Ok(())
    }

    /// Cancel an existing protective ahead of a replacement. Returns whether
    /// the replacement should proceed.
    async fn cancel_order_for_replace(
        &mut self,
        now: DateTime<Utc>,
        order: &OrderSnapshot,
    ) -> Result<bool, DatabaseError> {
        match self.broker.cancel(&order.order_id).await {
            Ok(_) => Ok(true),
            Err(BrokerError::NotFound(_)) => Ok(true),
            Err(e) => {
                self.handle_broker_error("cancel_protective", e, now, true).await?;
                Ok(false)
            }
        }
    }

    async fn place_protective(
        &mut self,
        now: DateTime<Utc>,
        position: &Position,
        event_type: &str,
        replaced: Option<&OrderSnapshot>,
    ) -> Result<(), DatabaseError> {
        if !self.backoff.ready(now) {
            return Ok(());
        }

        let request = ProtectiveRequest {
            symbol: self.symbol.clone(),
            qty: position.qty,
            trail_pct: self.config.stops.trailing_stop_pct,
            reference_price: position.avg_entry_price,
            tif: self.config.stops.tif,
        };

        match self.broker.submit_protective(&request).await {
            Ok(ack) => {
                let mut payload = serde_json::json!({
                    "order_id": ack.order_id,
                    "qty": position.qty.to_string(),
                    "trail_pct": request.trail_pct.to_string(),
                });
                if let Some(old) = replaced {
                    payload["old_order_id"] = serde_json::json!(old.order_id);
                    payload["old_qty"] = serde_json::json!(old.remaining_qty().to_string());
                }
                self.store
                    .record_protective_placed(&ack, event_type, payload)
                    .await?;
                self.last_protective_submit = Some(now);
                self.backoff.reset();
                info!(
                    symbol = %self.symbol,
                    order_id = %ack.order_id,
                    qty = %position.qty,
                    event = event_type,
                    "protective order placed"
                );
            }
            Err(e) => self.handle_broker_error("submit_protective", e, now, true).await?,
        }
        Ok(())
    }

    /// While flat, no SELL order should rest at the broker. Left-over
    /// protectives (external closes, downward drift to zero) are canceled.
    async fn cancel_orphan_protectives(
        &mut self,
        now: DateTime<Utc>,
        snapshot: &SymbolSnapshot,
        state: &SymbolStateRecord,
    ) -> Result<(), DatabaseError> {
        for order in snapshot.open_protectives() {
            match self.broker.cancel(&order.order_id).await {
                Ok(_) => {
                    self.store
                        .mark_order_canceled(
                            &order.order_id,
                            self.symbol.as_str(),
                            "orphan_protective_cancelled",
                            serde_json::json!({ "order_id": order.order_id }),
                        )
                        .await?;
                    if state.last_trail_id.as_deref() == Some(order.order_id.as_str()) {
                        self.store.clear_trail(self.symbol.as_str()).await?;
                    }
                }
                Err(BrokerError::NotFound(_)) => {}
                Err(e) => self.handle_broker_error("cancel_orphan", e, now, false).await?,
            }
        }
        Ok(())
    }

    /// NO_POSITION: place a breakout entry when every gate passes.
    async fn maybe_place_entry(
        &mut self,
        now: DateTime<Utc>,
        account: &AccountContext,
    ) -> Result<(), DatabaseError> {
        if !self.backoff.ready(now) {
            return Ok(());
        }
        if !self.calendar.is_tradable_now(&self.symbol, now) {
            debug!(symbol = %self.symbol, "outside trading hours");
            return Ok(());
        }

        let quote = match self.broker.last_price(&self.symbol).await {
            Ok(q) => q,
            Err(e) => {
                self.handle_broker_error("last_price", e, now, false).await?;
                return Ok(());
            }
        };

        let age = (now - quote.ts).num_seconds();
        if age > QUOTE_STALENESS_SECONDS {
            debug!(symbol = %self.symbol, age_seconds = age, "stale quote, skipping entry");
            return Ok(());
        }

        let qty = match self.sizer.quantity_for(
            &self.symbol,
            quote.price,
            &self.config,
            &account.account,
            &account.exposure_by_symbol,
        ) {
            Ok(qty) => qty,
            Err(rejection) => {
                info!(
                    symbol = %self.symbol,
                    reason = rejection.reason(),
                    "entry admission rejected"
                );
                self.store
                    .record_event(
                        "admission_rejected",
                        Some(self.symbol.as_str()),
                        Some(serde_json::json!({
                            "reason": rejection.reason(),
                            "last_price": quote.price.to_string(),
                        })),
                    )
                    .await?;
                return Ok(());
            }
        };

        let entry_pct = self.config.entries.buy_stop_pct_above_last;
        let trigger = quote.price * (Decimal::ONE + entry_pct / Decimal::ONE_HUNDRED);
        let limit_offset_pct = match self.config.entries.kind {
            EntryKind::BuyStop => None,
            EntryKind::BuyStopLimit => Some(self.config.entries.stop_limit_max_slip_pct),
        };

        let request = EntryRequest {
            symbol: self.symbol.clone(),
            qty,
            stop_trigger: trigger,
            limit_offset_pct,
            tif: self.config.entries.tif,
        };

        match self.broker.submit_entry(&request).await {
            Ok(ack) => {
                self.store
                    .record_entry_placed(
                        &ack,
                        serde_json::json!({
                            "order_id": ack.order_id,
                            "qty": qty.to_string(),
                            "stop_trigger": trigger.to_string(),
                            "last_price": quote.price.to_string(),
                        }),
                    )
                    .await?;
                self.backoff.reset();
                info!(
                    symbol = %self.symbol,
                    order_id = %ack.order_id,
                    qty = %qty,
                    trigger = %trigger,
                    "entry order placed"
                );
            }
            Err(e) => self.handle_broker_error("submit_entry", e, now, false).await?,
        }

        Ok(())
    }

    /// Convert a broker failure into an audit event and, for transport
    /// failures, per-symbol backoff. `position_exposed` raises the severity
    /// for failures that leave an unprotected position.
    async fn handle_broker_error(
        &mut self,
        operation: &str,
        err: BrokerError,
        now: DateTime<Utc>,
        position_exposed: bool,
    ) -> Result<(), DatabaseError> {
        let tick = Duration::seconds(self.config.polling.orders_seconds as i64);
        let (event_type, severity) = match &err {
            BrokerError::Transport(_) => {
                self.backoff.record_failure(now, tick);
                warn!(
                    symbol = %self.symbol,
                    operation,
                    error = %err,
                    failures = self.backoff.consecutive_failures,
                    "transient broker error, backing off"
                );
                ("broker_transport_error", "warning")
            }
            BrokerError::Validation(_) | BrokerError::InsufficientFunds(_) => {
                if position_exposed {
                    error!(
                        symbol = %self.symbol,
                        operation,
                        error = %err,
                        "protective submission rejected, position exposed"
                    );
                    ("protective_submit_rejected", "high")
                } else {
                    warn!(symbol = %self.symbol, operation, error = %err, "order rejected");
                    ("order_rejected", "warning")
                }
            }
            BrokerError::NotSupported(_) => {
                // The adapter should have translated the order type away.
                error!(
                    symbol = %self.symbol,
                    operation,
                    error = %err,
                    "order type not supported; adapter translation bug"
                );
                ("broker_order_type_unsupported", "fatal")
            }
            BrokerError::NotFound(_) => {
                warn!(symbol = %self.symbol, operation, error = %err, "broker object not found");
                ("broker_not_found", "warning")
            }
        };

        self.store
            .record_event(
                event_type,
                Some(self.symbol.as_str()),
                Some(serde_json::json!({
                    "operation": operation,
                    "error": err.to_string(),
                    "severity": severity,
                })),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::order::OrderStatus;
    use rust_decimal_macros::dec;

    fn state(cooldown_until: Option<DateTime<Utc>>) -> SymbolStateRecord {
        SymbolStateRecord {
            symbol: "TSLA".to_string(),
            cooldown_until,
            last_parent_id: None,
            last_trail_id: None,
            updated_at: Utc::now(),
        }
    }

    fn open_order(side: OrderSide) -> OrderSnapshot {
        OrderSnapshot {
            order_id: "O1".to_string(),
            symbol: "TSLA".to_string(),
            side,
            order_type: OrderType::Stop,
            status: OrderStatus::Open,
            qty: dec!(4),
            filled_qty: Decimal::ZERO,
            filled_avg_price: None,
            stop_price: None,
            limit_price: None,
            trailing_pct: None,
            parent_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn position(qty: Decimal) -> Position {
        Position {
            symbol: "TSLA".to_string(),
            qty,
            avg_entry_price: dec!(262.50),
            market_value: qty * dec!(262.50),
        }
    }

    #[test]
    fn test_derive_position_open_wins() {
        let now = Utc::now();
        let snapshot = SymbolSnapshot {
            open_orders: vec![open_order(OrderSide::Buy)],
            position: Some(position(dec!(4))),
            fills: vec![],
        };
        // Even with a cooldown set, an open position derives POSITION_OPEN.
        let s = state(Some(now + Duration::minutes(5)));
        assert_eq!(derive_status(&s, &snapshot, now), SymbolStatus::PositionOpen);
    }

    #[test]
    fn test_derive_cooldown_beats_entry_pending() {
        let now = Utc::now();
        let snapshot = SymbolSnapshot {
            open_orders: vec![open_order(OrderSide::Buy)],
            position: None,
            fills: vec![],
        };
        let s = state(Some(now + Duration::minutes(5)));
        assert_eq!(derive_status(&s, &snapshot, now), SymbolStatus::Cooldown);
    }

    #[test]
    fn test_derive_entry_pending() {
        let now = Utc::now();
        let snapshot = SymbolSnapshot {
            open_orders: vec![open_order(OrderSide::Buy)],
            position: None,
            fills: vec![],
        };
        assert_eq!(
            derive_status(&state(None), &snapshot, now),
            SymbolStatus::EntryPending
        );
    }

    #[test]
    fn test_derive_no_position_when_cooldown_elapsed() {
        let now = Utc::now();
        let s = state(Some(now));
        // Exactly at cooldown_until the symbol is free.
        assert_eq!(
            derive_status(&s, &SymbolSnapshot::default(), now),
            SymbolStatus::NoPosition
        );
    }

    #[test]
    fn test_derive_sell_order_is_not_entry() {
        let now = Utc::now();
        let snapshot = SymbolSnapshot {
            open_orders: vec![open_order(OrderSide::Sell)],
            position: None,
            fills: vec![],
        };
        assert_eq!(
            derive_status(&state(None), &snapshot, now),
            SymbolStatus::NoPosition
        );
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let now = Utc::now();
        let tick = Duration::seconds(15);
        let mut backoff = Backoff::default();
        assert!(backoff.ready(now));

        backoff.record_failure(now, tick);
        assert_eq!(backoff.next_attempt, Some(now + tick));

        backoff.record_failure(now, tick);
        assert_eq!(backoff.next_attempt, Some(now + tick * 2));

        backoff.record_failure(now, tick);
        assert_eq!(backoff.next_attempt, Some(now + tick * 4));

        // Capped at five tick intervals.
        backoff.record_failure(now, tick);
        assert_eq!(backoff.next_attempt, Some(now + tick * 5));

        backoff.reset();
        assert!(backoff.ready(now));
    }
}
