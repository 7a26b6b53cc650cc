//! A single attributed execution.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::entities::order::OrderSide;

/// One execution derived by the event engine. `exec_id` is the idempotence
/// key: a fill is persisted and dispatched at most once per exec id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub exec_id: String,
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: Decimal,
    pub price: Decimal,
    pub ts: DateTime<Utc>,
}
