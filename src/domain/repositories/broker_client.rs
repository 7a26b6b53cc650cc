//! Broker Client Trait
//!
//! This module defines the `BrokerClient` trait, the narrow capability
//! interface the controller core depends on. Any REST broker that supports
//! market/limit/stop/trailing orders can implement it.
//!
//! ## Benefits
//! - Decouples the state machine from broker-specific code
//! - Enables easy mocking for testing
//! - Keeps asset-class order-type translation inside the adapter
//!
//! The error set is closed on purpose: controllers pattern-match on the kind
//! to decide between retry-with-backoff and event-only handling.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::entities::order::{OrderSide, OrderStatus, OrderType, TimeInForce};
use crate::domain::entities::position::Position;
use crate::domain::entities::symbol::WatchSymbol;

/// Common result type for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Errors that can occur during broker operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    /// Network or RPC failure. Retry next tick with backoff.
    #[error("Broker transport error: {0}")]
    Transport(String),

    /// The broker rejected the request parameters. Do not retry until the
    /// inputs change.
    #[error("Broker rejected request: {0}")]
    Validation(String),

    /// The broker does not support the requested order type. The adapter is
    /// supposed to translate these away; seeing one here is a bug.
    #[error("Order type not supported by broker: {0}")]
    NotSupported(String),

    /// The referenced order or symbol does not exist at the broker.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Not enough buying power for the submission.
    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),
}

impl BrokerError {
    /// Whether the caller should retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BrokerError::Transport(_))
    }
}

/// A last-trade quote with its observation timestamp. Callers are responsible
/// for staleness checks; the adapter reports what the broker gave it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub price: Decimal,
    pub ts: DateTime<Utc>,
}

/// Point-in-time account figures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub equity: Decimal,
    pub cash: Decimal,
    pub buying_power: Decimal,
    pub position_value: Decimal,
}

/// One order as reported by the broker. `filled_qty` is cumulative; the
/// event engine derives per-execution fills from successive snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSnapshot {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub qty: Decimal,
    pub filled_qty: Decimal,
    pub filled_avg_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub limit_price: Option<Decimal>,
    pub trailing_pct: Option<Decimal>,
    pub parent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrderSnapshot {
    /// Quantity still working at the broker.
    pub fn remaining_qty(&self) -> Decimal {
        self.qty - self.filled_qty
    }
}

/// Breakout entry submission. The adapter translates per asset class:
/// equities become STOP (or STOP_LIMIT when `limit_offset_pct` is set) DAY
/// orders; crypto becomes a LIMIT order at the trigger price, GTC.
#[derive(Debug, Clone)]
pub struct EntryRequest {
    pub symbol: WatchSymbol,
    pub qty: Decimal,
    /// Price at which the breakout entry should trigger.
    pub stop_trigger: Decimal,
    /// Maximum slippage above the trigger for stop-limit entries, percent.
    pub limit_offset_pct: Option<Decimal>,
    pub tif: TimeInForce,
}

/// Protective exit submission. Equities become TRAILING_STOP orders with a
/// percent trail; crypto becomes a fixed SELL LIMIT at
/// `reference_price x (1 - trail_pct/100)` because the venue rejects stop and
/// trailing orders. Crypto protection therefore does not trail.
#[derive(Debug, Clone)]
pub struct ProtectiveRequest {
    pub symbol: WatchSymbol,
    pub qty: Decimal,
    /// Trail distance, percent below the reference (or high-water) price.
    pub trail_pct: Decimal,
    /// Entry fill price used to anchor fixed crypto stops.
    pub reference_price: Decimal,
    pub tif: TimeInForce,
}

/// Outcome of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Canceled,
    /// The order had already reached a terminal state at the broker.
    AlreadyDone,
}

/// Broker client trait providing the capability interface for the core.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Name of this broker, for logging.
    fn name(&self) -> &str;

    /// Last traded (or mid) price for a symbol, with quote timestamp.
    async fn last_price(&self, symbol: &WatchSymbol) -> BrokerResult<Quote>;

    /// Current account figures. Also used as the keep-alive ping.
    async fn account_snapshot(&self) -> BrokerResult<AccountSnapshot>;

    /// All orders currently working at the broker.
    async fn open_orders(&self) -> BrokerResult<Vec<OrderSnapshot>>;

    /// Orders that reached a terminal state after `since`.
    async fn closed_orders(&self, since: DateTime<Utc>) -> BrokerResult<Vec<OrderSnapshot>>;

    /// All open positions.
    async fn positions(&self) -> BrokerResult<Vec<Position>>;

    /// Submit a breakout entry order. Returns the broker's acknowledgement.
    async fn submit_entry(&self, request: &EntryRequest) -> BrokerResult<OrderSnapshot>;

    /// Submit a protective exit order. Returns the broker's acknowledgement.
    async fn submit_protective(&self, request: &ProtectiveRequest) -> BrokerResult<OrderSnapshot>;

    /// Cancel an order by broker id.
    async fn cancel(&self, order_id: &str) -> BrokerResult<CancelOutcome>;
}
