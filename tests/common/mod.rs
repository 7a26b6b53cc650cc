#![allow(dead_code)]

//! Shared test fixtures: an in-memory mock broker and config/store builders.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::America::New_York;
use rust_decimal::Decimal;

use trailbot::config::BotConfig;
use trailbot::domain::entities::order::{OrderSide, OrderStatus, OrderType};
use trailbot::domain::entities::position::Position;
use trailbot::domain::entities::symbol::WatchSymbol;
use trailbot::domain::repositories::broker_client::{
    AccountSnapshot, BrokerClient, BrokerError, BrokerResult, CancelOutcome, EntryRequest,
    OrderSnapshot, ProtectiveRequest, Quote,
};
use trailbot::persistence::{init_database, repository::Store};

/// UTC instant for a wall-clock time in New York.
pub fn eastern(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
    New_York
        .with_ymd_and_hms(y, mo, d, h, mi, s)
        .single()
        .expect("unambiguous local time")
        .with_timezone(&Utc)
}

pub async fn memory_store() -> Store {
    Store::new(init_database("sqlite::memory:").await.expect("in-memory db"))
}

pub fn equity_config(yaml_extra: &str) -> Arc<BotConfig> {
    let yaml = format!(
        "watchlist: [TSLA]\nallocation:\n  per_symbol_usd: 1000\n{}",
        yaml_extra
    );
    Arc::new(BotConfig::from_yaml_str(&yaml).expect("valid test config"))
}

#[derive(Default)]
struct MockState {
    now: Option<DateTime<Utc>>,
    quotes: HashMap<String, Quote>,
    account: Option<AccountSnapshot>,
    positions: Vec<Position>,
    orders: Vec<OrderSnapshot>,
    canceled: Vec<String>,
    transport_down: bool,
}

/// Scriptable broker double. Tests mutate its state between ticks; every
/// submission is recorded as a real order snapshot so the engine and the
/// controllers see a coherent remote book.
pub struct MockBroker {
    state: Mutex<MockState>,
    submissions: AtomicUsize,
}

impl MockBroker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            submissions: AtomicUsize::new(0),
        }
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("mock state lock")
    }

    pub fn set_now(&self, now: DateTime<Utc>) {
        self.locked().now = Some(now);
    }

    pub fn set_quote(&self, symbol: &str, price: Decimal, ts: DateTime<Utc>) {
        self.locked()
            .quotes
            .insert(symbol.to_string(), Quote { price, ts });
    }

    pub fn set_account(&self, equity: Decimal, cash: Decimal) {
        self.locked().account = Some(AccountSnapshot {
            equity,
            cash,
            buying_power: cash,
            position_value: equity - cash,
        });
    }

    pub fn set_positions(&self, positions: Vec<Position>) {
        self.locked().positions = positions;
    }

    pub fn set_transport_down(&self, down: bool) {
        self.locked().transport_down = down;
    }

    /// Install an order that exists at the broker (e.g. placed by a previous
    /// process or by hand).
    pub fn install_order(&self, order: OrderSnapshot) {
        self.locked().orders.push(order);
    }

    /// Fill an open order (fully or partially) at `price`.
    pub fn fill_order(&self, order_id: &str, qty: Decimal, price: Decimal, ts: DateTime<Utc>) {
        let mut state = self.locked();
        let order = state
            .orders
            .iter_mut()
            .find(|o| o.order_id == order_id)
            .expect("order to fill");
        order.filled_qty += qty;
        order.filled_avg_price = Some(price);
        order.status = if order.filled_qty >= order.qty {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        order.updated_at = ts;
    }

    pub fn expire_order(&self, order_id: &str, status: OrderStatus, ts: DateTime<Utc>) {
        let mut state = self.locked();
        let order = state
            .orders
            .iter_mut()
            .find(|o| o.order_id == order_id)
            .expect("order to close");
        order.status = status;
        order.updated_at = ts;
    }

    pub fn open_order_ids(&self) -> Vec<String> {
        self.locked()
            .orders
            .iter()
            .filter(|o| o.status.is_open())
            .map(|o| o.order_id.clone())
            .collect()
    }

    pub fn order(&self, order_id: &str) -> Option<OrderSnapshot> {
        self.locked()
            .orders
            .iter()
            .find(|o| o.order_id == order_id)
            .cloned()
    }

    pub fn canceled_ids(&self) -> Vec<String> {
        self.locked().canceled.clone()
    }

    pub fn submission_count(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }

    fn record_order(
        &self,
        symbol: &str,
        side: OrderSide,
        order_type: OrderType,
        qty: Decimal,
        stop_price: Option<Decimal>,
        limit_price: Option<Decimal>,
        trailing_pct: Option<Decimal>,
    ) -> OrderSnapshot {
        let n = self.submissions.fetch_add(1, Ordering::SeqCst) + 1;
        let mut state = self.locked();
        let now = state.now.unwrap_or_else(Utc::now);
        let order = OrderSnapshot {
            order_id: format!("M{}", n),
            symbol: symbol.to_string(),
            side,
            order_type,
            status: OrderStatus::Open,
            qty,
            filled_qty: Decimal::ZERO,
            filled_avg_price: None,
            stop_price,
            limit_price,
            trailing_pct,
            parent_id: None,
            created_at: now,
            updated_at: now,
        };
        state.orders.push(order.clone());
        order
    }

    fn check_transport(&self) -> BrokerResult<()> {
        if self.locked().transport_down {
            Err(BrokerError::Transport("mock transport down".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BrokerClient for MockBroker {
    fn name(&self) -> &str {
        "mock"
    }

    async fn last_price(&self, symbol: &WatchSymbol) -> BrokerResult<Quote> {
        self.check_transport()?;
        self.locked()
            .quotes
            .get(symbol.as_str())
            .copied()
            .ok_or_else(|| BrokerError::NotFound(format!("no quote for {}", symbol)))
    }

    async fn account_snapshot(&self) -> BrokerResult<AccountSnapshot> {
        self.check_transport()?;
        self.locked()
            .account
            .clone()
            .ok_or_else(|| BrokerError::Transport("no account configured".to_string()))
    }

    async fn open_orders(&self) -> BrokerResult<Vec<OrderSnapshot>> {
        self.check_transport()?;
        Ok(self
            .locked()
            .orders
            .iter()
            .filter(|o| o.status.is_open())
            .cloned()
            .collect())
    }

    async fn closed_orders(&self, since: DateTime<Utc>) -> BrokerResult<Vec<OrderSnapshot>> {
        self.check_transport()?;
        Ok(self
            .locked()
            .orders
            .iter()
            .filter(|o| o.status.is_terminal() && o.updated_at >= since)
            .cloned()
            .collect())
    }

    async fn positions(&self) -> BrokerResult<Vec<Position>> {
        self.check_transport()?;
        Ok(self.locked().positions.clone())
    }

    async fn submit_entry(&self, request: &EntryRequest) -> BrokerResult<OrderSnapshot> {
        self.check_transport()?;
        let order = if request.symbol.is_crypto() {
            self.record_order(
                request.symbol.as_str(),
                OrderSide::Buy,
                OrderType::Limit,
                request.qty,
                None,
                Some(request.stop_trigger),
                None,
            )
        } else {
            match request.limit_offset_pct {
                None => self.record_order(
                    request.symbol.as_str(),
                    OrderSide::Buy,
                    OrderType::Stop,
                    request.qty,
                    Some(request.stop_trigger),
                    None,
                    None,
                ),
                Some(slip) => {
                    let limit =
                        request.stop_trigger * (Decimal::ONE + slip / Decimal::ONE_HUNDRED);
                    self.record_order(
                        request.symbol.as_str(),
                        OrderSide::Buy,
                        OrderType::StopLimit,
                        request.qty,
                        Some(request.stop_trigger),
                        Some(limit),
                        None,
                    )
                }
            }
        };
        Ok(order)
    }

    async fn submit_protective(&self, request: &ProtectiveRequest) -> BrokerResult<OrderSnapshot> {
        self.check_transport()?;
        let order = if request.symbol.is_crypto() {
            let stop = request.reference_price
                * (Decimal::ONE - request.trail_pct / Decimal::ONE_HUNDRED);
            self.record_order(
                request.symbol.as_str(),
                OrderSide::Sell,
                OrderType::Limit,
                request.qty,
                None,
                Some(stop),
                None,
            )
        } else {
            self.record_order(
                request.symbol.as_str(),
                OrderSide::Sell,
                OrderType::TrailingStop,
                request.qty,
                None,
                None,
                Some(request.trail_pct),
            )
        };
        Ok(order)
    }

    async fn cancel(&self, order_id: &str) -> BrokerResult<CancelOutcome> {
        self.check_transport()?;
        let mut state = self.locked();
        let now = state.now.unwrap_or_else(Utc::now);
        let Some(order) = state.orders.iter_mut().find(|o| o.order_id == order_id) else {
            return Err(BrokerError::NotFound(format!("order {}", order_id)));
        };
        if order.status.is_terminal() {
            return Ok(CancelOutcome::AlreadyDone);
        }
        order.status = OrderStatus::Canceled;
        order.updated_at = now;
        state.canceled.push(order_id.to_string());
        Ok(CancelOutcome::Canceled)
    }
}
