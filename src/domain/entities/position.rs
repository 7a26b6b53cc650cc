//! Broker-reported position.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A long position as reported by the broker snapshot. The broker is
/// authoritative; this is never reconstructed from local fills.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub qty: Decimal,
    pub avg_entry_price: Decimal,
    /// Current market value of the position in USD, used for exposure checks.
    pub market_value: Decimal,
}

impl Position {
    pub fn is_flat(&self) -> bool {
        self.qty <= Decimal::ZERO
    }
}
