//! Store
//!
//! Data access layer for symbol state, orders, fills, events, and
//! performance snapshots. Fill inserts are idempotent on `exec_id`, order
//! writes are upserts on `order_id`, and every mutation commits atomically
//! with its audit-event append.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{Row, Sqlite, Transaction};
use tracing::debug;

use super::models::*;
use super::{DatabaseError, DbPool};
use crate::domain::entities::fill::Fill;
use crate::domain::entities::order::OrderStatus;
use crate::domain::repositories::broker_client::OrderSnapshot;

/// Handle to the durable store. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Store {
    pool: DbPool,
}

impl Store {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    // ---- symbol state ----

    /// Get state for a symbol, if a row exists.
    pub async fn get_state(&self, symbol: &str) -> Result<Option<SymbolStateRecord>, DatabaseError> {
        let record = sqlx::query_as::<_, SymbolStateRecord>(
            "SELECT * FROM state WHERE symbol = ?1",
        )
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| DatabaseError::QueryError(format!("Failed to get state: {}", e)))?;
        Ok(record)
    }

    /// Get state for a symbol, creating the row lazily on first use.
    pub async fn get_or_create_state(
        &self,
        symbol: &str,
    ) -> Result<SymbolStateRecord, DatabaseError> {
        sqlx::query("INSERT OR IGNORE INTO state (symbol, updated_at) VALUES (?1, ?2)")
            .bind(symbol)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(|e| DatabaseError::QueryError(format!("Failed to create state: {}", e)))?;

        self.get_state(symbol).await?.ok_or_else(|| {
            DatabaseError::QueryError(format!("State row missing after insert: {}", symbol))
        })
    }

    /// All symbol states, for the monitoring surface.
    pub async fn all_states(&self) -> Result<Vec<SymbolStateRecord>, DatabaseError> {
        sqlx::query_as::<_, SymbolStateRecord>("SELECT * FROM state ORDER BY symbol")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DatabaseError::QueryError(format!("Failed to list states: {}", e)))
    }

    /// Persist a freshly acknowledged entry order: order row, state pointer,
    /// and the `entry_order_placed` event, in one transaction.
    pub async fn record_entry_placed(
        &self,
        order: &OrderSnapshot,
        payload: serde_json::Value,
    ) -> Result<(), DatabaseError> {
        let mut tx = self.begin().await?;
        upsert_order(&mut tx, order).await?;
        sqlx::query("UPDATE state SET last_parent_id = ?1, updated_at = ?2 WHERE symbol = ?3")
            .bind(&order.order_id)
            .bind(Utc::now())
            .bind(&order.symbol)
            .execute(&mut *tx)
            .await
            .map_err(|e| DatabaseError::QueryError(format!("Failed to update state: {}", e)))?;
        append_event(&mut tx, "entry_order_placed", Some(&order.symbol), Some(&payload)).await?;
        self.commit(tx).await
    }

    /// Persist a freshly acknowledged protective order under the given event
    /// type (`trailing_stop_placed_after_entry`, `protective_recreated`, or
    /// `protective_requantified`).
    pub async fn record_protective_placed(
        &self,
        order: &OrderSnapshot,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<(), DatabaseError> {
        let mut tx = self.begin().await?;
        upsert_order(&mut tx, order).await?;
        sqlx::query("UPDATE state SET last_trail_id = ?1, updated_at = ?2 WHERE symbol = ?3")
            .bind(&order.order_id)
            .bind(Utc::now())
            .bind(&order.symbol)
            .execute(&mut *tx)
            .await
            .map_err(|e| DatabaseError::QueryError(format!("Failed to update state: {}", e)))?;
        append_event(&mut tx, event_type, Some(&order.symbol), Some(&payload)).await?;
        self.commit(tx).await
    }

    /// Start a loss cooldown: set `cooldown_until`, drop the protective
    /// pointer, and append `stopout_cooldown_started`.
    pub async fn start_cooldown(
        &self,
        symbol: &str,
        until: DateTime<Utc>,
        payload: serde_json::Value,
    ) -> Result<(), DatabaseError> {
        let mut tx = self.begin().await?;
        sqlx::query(
            "UPDATE state SET cooldown_until = ?1, last_trail_id = NULL, updated_at = ?2 \
             WHERE symbol = ?3",
        )
        .bind(until)
        .bind(Utc::now())
        .bind(symbol)
        .execute(&mut *tx)
        .await
        .map_err(|e| DatabaseError::QueryError(format!("Failed to start cooldown: {}", e)))?;
        append_event(&mut tx, "stopout_cooldown_started", Some(symbol), Some(&payload)).await?;
        self.commit(tx).await
    }

    /// Clear an elapsed cooldown. No event; the next entry emits its own.
    pub async fn clear_cooldown(&self, symbol: &str) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE state SET cooldown_until = NULL, updated_at = ?1 WHERE symbol = ?2")
            .bind(Utc::now())
            .bind(symbol)
            .execute(&self.pool)
            .await
            .map_err(|e| DatabaseError::QueryError(format!("Failed to clear cooldown: {}", e)))?;
        Ok(())
    }

    /// Forget the tracked entry order id after it closed without a position.
    pub async fn clear_parent(&self, symbol: &str) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE state SET last_parent_id = NULL, updated_at = ?1 WHERE symbol = ?2")
            .bind(Utc::now())
            .bind(symbol)
            .execute(&self.pool)
            .await
            .map_err(|e| DatabaseError::QueryError(format!("Failed to clear parent id: {}", e)))?;
        Ok(())
    }

    /// Forget the tracked protective order id.
    pub async fn clear_trail(&self, symbol: &str) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE state SET last_trail_id = NULL, updated_at = ?1 WHERE symbol = ?2")
            .bind(Utc::now())
            .bind(symbol)
            .execute(&self.pool)
            .await
            .map_err(|e| DatabaseError::QueryError(format!("Failed to clear trail id: {}", e)))?;
        Ok(())
    }

    // ---- orders ----

    /// Upsert a broker order snapshot. Returns the previously stored status,
    /// if any. A transition into a terminal status appends an
    /// `order_<status>` event in the same transaction.
    pub async fn sync_order(
        &self,
        order: &OrderSnapshot,
    ) -> Result<Option<OrderStatus>, DatabaseError> {
        let mut tx = self.begin().await?;

        let previous: Option<String> =
            sqlx::query("SELECT status FROM orders WHERE order_id = ?1")
                .bind(&order.order_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| DatabaseError::QueryError(format!("Failed to read order: {}", e)))?
                .map(|row| row.get("status"));

        upsert_order(&mut tx, order).await?;

        let previous_status = previous
            .as_deref()
            .map(OrderStatus::parse)
            .transpose()
            .map_err(DatabaseError::InvalidValue)?;

        let changed = previous_status != Some(order.status);
        if changed && order.status.is_terminal() {
            let event_type = format!("order_{}", order.status);
            let payload = serde_json::json!({
                "order_id": order.order_id,
                "status": order.status.to_string(),
            });
            append_event(&mut tx, &event_type, Some(&order.symbol), Some(&payload)).await?;
        }

        self.commit(tx).await?;
        Ok(previous_status)
    }

    /// Mark an order canceled on our own initiative (duplicate protective,
    /// end-of-day sweep) and append the given event.
    pub async fn mark_order_canceled(
        &self,
        order_id: &str,
        symbol: &str,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<(), DatabaseError> {
        let mut tx = self.begin().await?;
        sqlx::query("UPDATE orders SET status = 'canceled', updated_at = ?1 WHERE order_id = ?2")
            .bind(Utc::now())
            .bind(order_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| DatabaseError::QueryError(format!("Failed to cancel order: {}", e)))?;
        append_event(&mut tx, event_type, Some(symbol), Some(&payload)).await?;
        self.commit(tx).await
    }

    pub async fn get_order(&self, order_id: &str) -> Result<Option<OrderRecord>, DatabaseError> {
        sqlx::query_as::<_, OrderRecord>("SELECT * FROM orders WHERE order_id = ?1")
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DatabaseError::QueryError(format!("Failed to get order: {}", e)))
    }

    /// Orders still working at the broker, optionally for one symbol.
    pub async fn active_orders(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<OrderRecord>, DatabaseError> {
        let records = match symbol {
            Some(symbol) => {
                sqlx::query_as::<_, OrderRecord>(
                    "SELECT * FROM orders WHERE status IN ('open', 'partially_filled') \
                     AND symbol = ?1 ORDER BY created_at",
                )
                .bind(symbol)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as::<_, OrderRecord>(
                    "SELECT * FROM orders WHERE status IN ('open', 'partially_filled') \
                     ORDER BY created_at",
                )
                .fetch_all(&self.pool)
                .await
            }
        };
        records.map_err(|e| DatabaseError::QueryError(format!("Failed to list orders: {}", e)))
    }

    // ---- fills ----

    pub async fn fill_exists(&self, exec_id: &str) -> Result<bool, DatabaseError> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM fills WHERE exec_id = ?1")
            .bind(exec_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| DatabaseError::QueryError(format!("Failed to check fill: {}", e)))?;
        let count: i64 = row.get("count");
        Ok(count > 0)
    }

    /// Insert a fill if its exec id is new; append `fill_received` in the
    /// same transaction. Returns whether a row was written.
    pub async fn insert_fill(&self, fill: &Fill) -> Result<bool, DatabaseError> {
        let mut tx = self.begin().await?;
        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO fills (exec_id, order_id, symbol, side, qty, price, ts)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&fill.exec_id)
        .bind(&fill.order_id)
        .bind(&fill.symbol)
        .bind(fill.side.to_string())
        .bind(fill.qty.to_string())
        .bind(fill.price.to_string())
        .bind(fill.ts)
        .execute(&mut *tx)
        .await
        .map_err(|e| DatabaseError::QueryError(format!("Failed to insert fill: {}", e)))?
        .rows_affected()
            > 0;

        if inserted {
            let payload = serde_json::json!({
                "exec_id": fill.exec_id,
                "order_id": fill.order_id,
                "side": fill.side.to_string(),
                "qty": fill.qty.to_string(),
                "price": fill.price.to_string(),
            });
            append_event(&mut tx, "fill_received", Some(&fill.symbol), Some(&payload)).await?;
            debug!(symbol = %fill.symbol, exec_id = %fill.exec_id, "fill recorded");
        }

        self.commit(tx).await?;
        Ok(inserted)
    }

    /// Total quantity already attributed to an order across its fills.
    pub async fn filled_qty_for_order(&self, order_id: &str) -> Result<Decimal, DatabaseError> {
        let rows = sqlx::query("SELECT qty FROM fills WHERE order_id = ?1")
            .bind(order_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DatabaseError::QueryError(format!("Failed to sum fills: {}", e)))?;

        let mut total = Decimal::ZERO;
        for row in rows {
            let raw: String = row.get("qty");
            total += parse_decimal("fills.qty", &raw)?;
        }
        Ok(total)
    }

    pub async fn recent_fills(&self, limit: i64) -> Result<Vec<FillRecord>, DatabaseError> {
        sqlx::query_as::<_, FillRecord>("SELECT * FROM fills ORDER BY ts DESC LIMIT ?1")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DatabaseError::QueryError(format!("Failed to list fills: {}", e)))
    }

    /// All fills in execution order, for closed-trade accounting.
    pub async fn all_fills_ordered(&self) -> Result<Vec<FillRecord>, DatabaseError> {
        sqlx::query_as::<_, FillRecord>("SELECT * FROM fills ORDER BY ts, exec_id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DatabaseError::QueryError(format!("Failed to list fills: {}", e)))
    }

    pub async fn fills_count_since(&self, since: DateTime<Utc>) -> Result<i64, DatabaseError> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM fills WHERE ts >= ?1")
            .bind(since)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| DatabaseError::QueryError(format!("Failed to count fills: {}", e)))?;
        Ok(row.get("count"))
    }

    // ---- events ----

    /// Append a standalone audit event.
    pub async fn record_event(
        &self,
        event_type: &str,
        symbol: Option<&str>,
        payload: Option<serde_json::Value>,
    ) -> Result<(), DatabaseError> {
        let mut tx = self.begin().await?;
        append_event(&mut tx, event_type, symbol, payload.as_ref()).await?;
        self.commit(tx).await
    }

    pub async fn recent_events(&self, limit: i64) -> Result<Vec<EventRecord>, DatabaseError> {
        sqlx::query_as::<_, EventRecord>("SELECT * FROM events ORDER BY id DESC LIMIT ?1")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DatabaseError::QueryError(format!("Failed to list events: {}", e)))
    }

    // ---- performance snapshots ----

    pub async fn add_snapshot(
        &self,
        date: DateTime<Utc>,
        snapshot: NewPerformanceSnapshot,
    ) -> Result<(), DatabaseError> {
        let mut tx = self.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO performance_snapshots (
                date, account_value, cash_value, position_value,
                unrealized_pnl, realized_pnl, daily_pnl,
                num_positions, num_trades, created_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(date)
        .bind(snapshot.account_value.map(|d| d.to_string()))
        .bind(snapshot.cash_value.map(|d| d.to_string()))
        .bind(snapshot.position_value.map(|d| d.to_string()))
        .bind(snapshot.unrealized_pnl.map(|d| d.to_string()))
        .bind(snapshot.realized_pnl.map(|d| d.to_string()))
        .bind(snapshot.daily_pnl.map(|d| d.to_string()))
        .bind(snapshot.num_positions)
        .bind(snapshot.num_trades)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(|e| DatabaseError::QueryError(format!("Failed to insert snapshot: {}", e)))?;
        let payload = serde_json::json!({ "date": date.to_rfc3339() });
        append_event(&mut tx, "daily_snapshot_saved", None, Some(&payload)).await?;
        self.commit(tx).await
    }

    pub async fn recent_snapshots(
        &self,
        limit: i64,
    ) -> Result<Vec<PerformanceSnapshotRecord>, DatabaseError> {
        sqlx::query_as::<_, PerformanceSnapshotRecord>(
            "SELECT * FROM performance_snapshots ORDER BY date DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DatabaseError::QueryError(format!("Failed to list snapshots: {}", e)))
    }

    pub async fn latest_snapshot(
        &self,
    ) -> Result<Option<PerformanceSnapshotRecord>, DatabaseError> {
        sqlx::query_as::<_, PerformanceSnapshotRecord>(
            "SELECT * FROM performance_snapshots ORDER BY date DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| DatabaseError::QueryError(format!("Failed to get snapshot: {}", e)))
    }

    // ---- helpers ----

    async fn begin(&self) -> Result<Transaction<'static, Sqlite>, DatabaseError> {
        self.pool
            .begin()
            .await
            .map_err(|e| DatabaseError::QueryError(format!("Failed to begin transaction: {}", e)))
    }

    async fn commit(&self, tx: Transaction<'static, Sqlite>) -> Result<(), DatabaseError> {
        tx.commit()
            .await
            .map_err(|e| DatabaseError::QueryError(format!("Failed to commit: {}", e)))
    }
}

async fn upsert_order(
    tx: &mut Transaction<'_, Sqlite>,
    order: &OrderSnapshot,
) -> Result<(), DatabaseError> {
    sqlx::query(
        r#"
        INSERT INTO orders (
            order_id, symbol, side, order_type, status, qty, filled_qty,
            filled_avg_price, stop_price, limit_price, trailing_pct,
            parent_id, created_at, updated_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
        ON CONFLICT(order_id) DO UPDATE SET
            status = excluded.status,
            qty = excluded.qty,
            filled_qty = excluded.filled_qty,
            filled_avg_price = excluded.filled_avg_price,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&order.order_id)
    .bind(&order.symbol)
    .bind(order.side.to_string())
    .bind(order.order_type.to_string())
    .bind(order.status.to_string())
    .bind(order.qty.to_string())
    .bind(order.filled_qty.to_string())
    .bind(order.filled_avg_price.map(|d| d.to_string()))
    .bind(order.stop_price.map(|d| d.to_string()))
    .bind(order.limit_price.map(|d| d.to_string()))
    .bind(order.trailing_pct.map(|d| d.to_string()))
    .bind(order.parent_id.as_deref())
    .bind(order.created_at)
    .bind(order.updated_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| DatabaseError::QueryError(format!("Failed to upsert order: {}", e)))?;
    Ok(())
}

async fn append_event(
    tx: &mut Transaction<'_, Sqlite>,
    event_type: &str,
    symbol: Option<&str>,
    payload: Option<&serde_json::Value>,
) -> Result<(), DatabaseError> {
    sqlx::query("INSERT INTO events (event_type, symbol, payload_json, ts) VALUES (?1, ?2, ?3, ?4)")
        .bind(event_type)
        .bind(symbol)
        .bind(payload.map(|p| p.to_string()))
        .bind(Utc::now())
        .execute(&mut **tx)
        .await
        .map_err(|e| DatabaseError::QueryError(format!("Failed to append event: {}", e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::order::{OrderSide, OrderType};
    use crate::persistence::init_database;
    use rust_decimal_macros::dec;

    async fn store() -> Store {
        Store::new(init_database("sqlite::memory:").await.unwrap())
    }

    fn order(order_id: &str, status: OrderStatus, filled: Decimal) -> OrderSnapshot {
        OrderSnapshot {
            order_id: order_id.to_string(),
            symbol: "TSLA".to_string(),
            side: OrderSide::Buy,
            order_type: OrderType::Stop,
            status,
            qty: dec!(4),
            filled_qty: filled,
            filled_avg_price: None,
            stop_price: Some(dec!(262.50)),
            limit_price: None,
            trailing_pct: None,
            parent_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn fill(exec_id: &str) -> Fill {
        Fill {
            exec_id: exec_id.to_string(),
            order_id: "O1".to_string(),
            symbol: "TSLA".to_string(),
            side: OrderSide::Buy,
            qty: dec!(4),
            price: dec!(262.50),
            ts: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_state_created_lazily() {
        let store = store().await;
        assert!(store.get_state("TSLA").await.unwrap().is_none());
        let state = store.get_or_create_state("TSLA").await.unwrap();
        assert_eq!(state.symbol, "TSLA");
        assert!(state.cooldown_until.is_none());
    }

    #[tokio::test]
    async fn test_fill_insert_is_idempotent() {
        let store = store().await;
        assert!(store.insert_fill(&fill("E1")).await.unwrap());
        assert!(!store.insert_fill(&fill("E1")).await.unwrap());
        assert!(store.fill_exists("E1").await.unwrap());

        // Exactly one fill_received event was appended.
        let events = store.recent_events(10).await.unwrap();
        let fill_events: Vec<_> = events
            .iter()
            .filter(|e| e.event_type == "fill_received")
            .collect();
        assert_eq!(fill_events.len(), 1);
    }

    #[tokio::test]
    async fn test_sync_order_reports_previous_status() {
        let store = store().await;
        let prev = store
            .sync_order(&order("O1", OrderStatus::Open, Decimal::ZERO))
            .await
            .unwrap();
        assert_eq!(prev, None);

        let prev = store
            .sync_order(&order("O1", OrderStatus::Filled, dec!(4)))
            .await
            .unwrap();
        assert_eq!(prev, Some(OrderStatus::Open));

        // Terminal transition appended an order_filled event.
        let events = store.recent_events(10).await.unwrap();
        assert!(events.iter().any(|e| e.event_type == "order_filled"));

        // Re-syncing the same terminal state does not duplicate the event.
        store
            .sync_order(&order("O1", OrderStatus::Filled, dec!(4)))
            .await
            .unwrap();
        let events = store.recent_events(10).await.unwrap();
        let filled: Vec<_> = events
            .iter()
            .filter(|e| e.event_type == "order_filled")
            .collect();
        assert_eq!(filled.len(), 1);
    }

    #[tokio::test]
    async fn test_closed_orders_persist() {
        let store = store().await;
        store
            .sync_order(&order("O1", OrderStatus::Filled, dec!(4)))
            .await
            .unwrap();
        let record = store.get_order("O1").await.unwrap().unwrap();
        assert_eq!(record.status().unwrap(), OrderStatus::Filled);
        assert_eq!(record.qty().unwrap(), dec!(4));
        // Not listed as active.
        assert!(store.active_orders(Some("TSLA")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cooldown_round_trip() {
        let store = store().await;
        store.get_or_create_state("TSLA").await.unwrap();
        let until = Utc::now() + chrono::Duration::minutes(20);
        store
            .start_cooldown("TSLA", until, serde_json::json!({"cooldown_minutes": 20}))
            .await
            .unwrap();

        let state = store.get_state("TSLA").await.unwrap().unwrap();
        assert!(state.in_cooldown(Utc::now()));
        assert!(state.last_trail_id.is_none());

        store.clear_cooldown("TSLA").await.unwrap();
        let state = store.get_state("TSLA").await.unwrap().unwrap();
        assert!(state.cooldown_until.is_none());
    }

    #[tokio::test]
    async fn test_filled_qty_sums_partials() {
        let store = store().await;
        let mut first = fill("E1");
        first.qty = dec!(2);
        let mut second = fill("E2");
        second.qty = dec!(2);
        store.insert_fill(&first).await.unwrap();
        store.insert_fill(&second).await.unwrap();
        assert_eq!(store.filled_qty_for_order("O1").await.unwrap(), dec!(4));
    }

    #[tokio::test]
    async fn test_entry_placed_updates_state_and_audit() {
        let store = store().await;
        store.get_or_create_state("TSLA").await.unwrap();
        store
            .record_entry_placed(
                &order("P1", OrderStatus::Open, Decimal::ZERO),
                serde_json::json!({"qty": "4"}),
            )
            .await
            .unwrap();
        let state = store.get_state("TSLA").await.unwrap().unwrap();
        assert_eq!(state.last_parent_id.as_deref(), Some("P1"));
        let events = store.recent_events(10).await.unwrap();
        assert!(events.iter().any(|e| e.event_type == "entry_order_placed"));
    }
}
