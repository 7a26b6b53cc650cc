//! Database record types.
//!
//! Decimal columns are TEXT in SQLite; the accessors parse them back into
//! `Decimal` and surface corruption as `DatabaseError::InvalidValue` instead
//! of silently rounding through floats.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::FromRow;

use super::DatabaseError;
use crate::domain::entities::fill::Fill;
use crate::domain::entities::order::{OrderSide, OrderStatus, OrderType};

pub(crate) fn parse_decimal(field: &str, raw: &str) -> Result<Decimal, DatabaseError> {
    Decimal::from_str(raw)
        .map_err(|e| DatabaseError::InvalidValue(format!("{}: {} ({})", field, raw, e)))
}

fn parse_opt_decimal(field: &str, raw: &Option<String>) -> Result<Option<Decimal>, DatabaseError> {
    raw.as_deref()
        .map(|s| parse_decimal(field, s))
        .transpose()
}

/// Per-symbol controller state.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct SymbolStateRecord {
    pub symbol: String,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_parent_id: Option<String>,
    pub last_trail_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl SymbolStateRecord {
    /// Whether the cooldown gate is closed at `now`. The boundary is
    /// inclusive-out: at exactly `cooldown_until` the symbol is free again.
    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        matches!(self.cooldown_until, Some(until) if now < until)
    }
}

/// One broker order as last observed. Rows persist after the order closes.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct OrderRecord {
    pub order_id: String,
    pub symbol: String,
    pub side: String,
    pub order_type: String,
    pub status: String,
    pub qty: String,
    pub filled_qty: String,
    pub filled_avg_price: Option<String>,
    pub stop_price: Option<String>,
    pub limit_price: Option<String>,
    pub trailing_pct: Option<String>,
    pub parent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrderRecord {
    pub fn side(&self) -> Result<OrderSide, DatabaseError> {
        OrderSide::parse(&self.side).map_err(DatabaseError::InvalidValue)
    }

    pub fn order_type(&self) -> Result<OrderType, DatabaseError> {
        OrderType::parse(&self.order_type).map_err(DatabaseError::InvalidValue)
    }

    pub fn status(&self) -> Result<OrderStatus, DatabaseError> {
        OrderStatus::parse(&self.status).map_err(DatabaseError::InvalidValue)
    }

    pub fn qty(&self) -> Result<Decimal, DatabaseError> {
        parse_decimal("orders.qty", &self.qty)
    }

    pub fn filled_qty(&self) -> Result<Decimal, DatabaseError> {
        parse_decimal("orders.filled_qty", &self.filled_qty)
    }

    pub fn stop_price(&self) -> Result<Option<Decimal>, DatabaseError> {
        parse_opt_decimal("orders.stop_price", &self.stop_price)
    }

    pub fn limit_price(&self) -> Result<Option<Decimal>, DatabaseError> {
        parse_opt_decimal("orders.limit_price", &self.limit_price)
    }
}

/// One execution. Immutable once written.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct FillRecord {
    pub exec_id: String,
    pub order_id: String,
    pub symbol: String,
    pub side: String,
    pub qty: String,
    pub price: String,
    pub ts: DateTime<Utc>,
}

impl FillRecord {
    pub fn to_fill(&self) -> Result<Fill, DatabaseError> {
        Ok(Fill {
            exec_id: self.exec_id.clone(),
            order_id: self.order_id.clone(),
            symbol: self.symbol.clone(),
            side: OrderSide::parse(&self.side).map_err(DatabaseError::InvalidValue)?,
            qty: parse_decimal("fills.qty", &self.qty)?,
            price: parse_decimal("fills.price", &self.price)?,
            ts: self.ts,
        })
    }
}

/// Audit log entry.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct EventRecord {
    pub id: i64,
    pub event_type: String,
    pub symbol: Option<String>,
    pub payload_json: Option<String>,
    pub ts: DateTime<Utc>,
}

impl EventRecord {
    pub fn payload(&self) -> Option<serde_json::Value> {
        self.payload_json
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
    }
}

/// Daily account snapshot.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PerformanceSnapshotRecord {
    pub id: i64,
    pub date: DateTime<Utc>,
    pub account_value: Option<String>,
    pub cash_value: Option<String>,
    pub position_value: Option<String>,
    pub unrealized_pnl: Option<String>,
    pub realized_pnl: Option<String>,
    pub daily_pnl: Option<String>,
    pub num_positions: i64,
    pub num_trades: i64,
    pub created_at: DateTime<Utc>,
}

/// Fields for a new performance snapshot row.
#[derive(Debug, Clone, Default)]
pub struct NewPerformanceSnapshot {
    pub account_value: Option<Decimal>,
    pub cash_value: Option<Decimal>,
    pub position_value: Option<Decimal>,
    pub unrealized_pnl: Option<Decimal>,
    pub realized_pnl: Option<Decimal>,
    pub daily_pnl: Option<Decimal>,
    pub num_positions: i64,
    pub num_trades: i64,
}
