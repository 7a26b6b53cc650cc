//! Event Engine
//!
//! Pull-based fill attribution: each run polls the broker's open orders and
//! recently closed orders, upserts every order row, and derives fills from
//! the growth of each order's cumulative filled quantity. Exec ids are
//! synthesized as `order_id:cumulative_qty`, so re-polling overlapping
//! windows, restarts, and partial fills all resolve to exactly one `Fill`
//! row per execution.
//!
//! The engine never assumes a fill is foreign just because the order was
//! placed by a previous process: anything the closed-orders query returns is
//! attributed the same way.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::domain::entities::fill::Fill;
use crate::domain::repositories::broker_client::{BrokerClient, BrokerError, OrderSnapshot};
use crate::persistence::repository::Store;
use crate::persistence::DatabaseError;

/// How far back the first poll after a cold start looks for unprocessed
/// fills.
const COLD_START_LOOKBACK_HOURS: i64 = 24;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The broker was unreachable; the orchestrator treats this as a
    /// connection loss and skips the tick.
    #[error("Broker poll failed: {0}")]
    Broker(#[from] BrokerError),

    /// Persistence failed; fatal to the process.
    #[error("Store write failed: {0}")]
    Database(#[from] DatabaseError),
}

/// Result of one poll: the broker's open orders (reused by the controllers
/// this tick) and the newly attributed fills, per symbol in timestamp order.
#[derive(Debug, Default)]
pub struct PollOutcome {
    pub open_orders: Vec<OrderSnapshot>,
    pub fills_by_symbol: HashMap<String, Vec<Fill>>,
}

pub struct EventEngine {
    broker: Arc<dyn BrokerClient>,
    store: Store,
    /// Overlap subtracted from the closed-orders watermark to tolerate
    /// clock skew between us and the broker.
    overlap: Duration,
    last_poll: Option<DateTime<Utc>>,
}

impl EventEngine {
    pub fn new(broker: Arc<dyn BrokerClient>, store: Store, poll_interval: Duration) -> Self {
        Self {
            broker,
            store,
            overlap: poll_interval * 2,
            last_poll: None,
        }
    }

    /// Poll the broker once and attribute any new executions. Running twice
    /// against an unchanged broker snapshot writes nothing the second time.
    pub async fn poll(&mut self, now: DateTime<Utc>) -> Result<PollOutcome, EngineError> {
        let since = match self.last_poll {
            Some(t) => t - self.overlap,
            None => now - Duration::hours(COLD_START_LOOKBACK_HOURS),
        };

        let open_orders = self.broker.open_orders().await?;
        let closed_orders = self.broker.closed_orders(since).await?;

        let mut fills_by_symbol: HashMap<String, Vec<Fill>> = HashMap::new();

        for order in open_orders.iter().chain(closed_orders.iter()) {
            self.store.sync_order(order).await?;

            let recorded = self.store.filled_qty_for_order(&order.order_id).await?;
            if order.filled_qty <= recorded {
                continue;
            }

            let exec_id = exec_id_for(order);
            if self.store.fill_exists(&exec_id).await? {
                continue;
            }

            let price = match order.filled_avg_price {
                Some(p) => p,
                None => {
                    warn!(
                        order_id = %order.order_id,
                        "filled order without average price, recording zero"
                    );
                    Decimal::ZERO
                }
            };

            let fill = Fill {
                exec_id,
                order_id: order.order_id.clone(),
                symbol: order.symbol.clone(),
                side: order.side,
                qty: order.filled_qty - recorded,
                price,
                ts: order.updated_at,
            };

            if self.store.insert_fill(&fill).await? {
                debug!(
                    symbol = %fill.symbol,
                    exec_id = %fill.exec_id,
                    qty = %fill.qty,
                    price = %fill.price,
                    "fill attributed"
                );
                fills_by_symbol
                    .entry(fill.symbol.clone())
                    .or_default()
                    .push(fill);
            }
        }

        // The state machine must not observe a SELL before the BUY that
        // opened the position: dispatch per symbol in broker timestamp order.
        for fills in fills_by_symbol.values_mut() {
            fills.sort_by(|a, b| a.ts.cmp(&b.ts).then_with(|| a.exec_id.cmp(&b.exec_id)));
        }

        self.last_poll = Some(now);

        Ok(PollOutcome {
            open_orders,
            fills_by_symbol,
        })
    }
}

/// Idempotence key for the execution that brought `order` to its current
/// cumulative filled quantity.
fn exec_id_for(order: &OrderSnapshot) -> String {
    format!("{}:{}", order.order_id, order.filled_qty.normalize())
}
