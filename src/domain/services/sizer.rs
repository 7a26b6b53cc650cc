//! Position sizing service: converts a dollar allocation into an order
//! quantity, or rejects the entry outright.
//!
//! Every check is a hard gate. A rejection is not an error; the controller
//! records it and simply places no order this tick.

use std::collections::HashMap;

use rust_decimal::{Decimal, RoundingStrategy};
use tracing::debug;

use crate::config::BotConfig;
use crate::domain::entities::symbol::WatchSymbol;
use crate::domain::repositories::broker_client::AccountSnapshot;

/// Why the sizer refused to produce a quantity.
#[derive(Debug, Clone, PartialEq)]
pub enum SizingRejection {
    QuantityTooSmall {
        raw_qty: Decimal,
        min_qty: Decimal,
    },
    SymbolExposureExceeded {
        would_be: Decimal,
        limit: Decimal,
    },
    TotalExposureExceeded {
        would_be: Decimal,
        limit: Decimal,
    },
    CashReserveViolated {
        cash_after: Decimal,
        required_reserve: Decimal,
    },
}

impl SizingRejection {
    /// Stable reason code used in audit events.
    pub fn reason(&self) -> &'static str {
        match self {
            SizingRejection::QuantityTooSmall { .. } => "quantity_too_small",
            SizingRejection::SymbolExposureExceeded { .. } => "symbol_exposure_exceeded",
            SizingRejection::TotalExposureExceeded { .. } => "total_exposure_exceeded",
            SizingRejection::CashReserveViolated { .. } => "cash_reserve_violated",
        }
    }
}

/// Calculates order quantities from dollar allocations and exposure limits.
#[derive(Debug, Clone)]
pub struct PositionSizer;

impl PositionSizer {
    pub fn new() -> Self {
        Self
    }

    /// Size an entry for `symbol` at `last_price`.
    ///
    /// Gates, in order: broker minimum quantity, per-symbol exposure cap,
    /// total exposure cap, cash reserve. The quantity is computed from the
    /// last price, not the breakout trigger.
    pub fn quantity_for(
        &self,
        symbol: &WatchSymbol,
        last_price: Decimal,
        config: &BotConfig,
        account: &AccountSnapshot,
        exposure_by_symbol: &HashMap<String, Decimal>,
    ) -> Result<Decimal, SizingRejection> {
        let budget = config.symbol_allocation(symbol.as_str());
        let class = symbol.asset_class();

        let raw = budget / last_price;
        let qty = if config.allocation.allow_fractional {
            raw.round_dp_with_strategy(class.qty_decimals(), RoundingStrategy::ToZero)
        } else {
            raw.floor()
        };

        if qty < class.min_qty() {
            return Err(SizingRejection::QuantityTooSmall {
                raw_qty: qty,
                min_qty: class.min_qty(),
            });
        }

        let order_value = qty * last_price;

        let symbol_exposure = exposure_by_symbol
            .get(symbol.as_str())
            .copied()
            .unwrap_or(Decimal::ZERO);
        let symbol_after = symbol_exposure + order_value;
        if symbol_after > config.risk.max_symbol_exposure_usd {
            return Err(SizingRejection::SymbolExposureExceeded {
                would_be: symbol_after,
                limit: config.risk.max_symbol_exposure_usd,
            });
        }

        let total: Decimal = exposure_by_symbol.values().copied().sum();
        let total_after = total + order_value;
        if total_after > config.risk.max_total_exposure_usd {
            return Err(SizingRejection::TotalExposureExceeded {
                would_be: total_after,
                limit: config.risk.max_total_exposure_usd,
            });
        }

        let cash_after = account.cash - order_value;
        let required_reserve =
            account.equity * config.allocation.min_cash_reserve_percent / Decimal::ONE_HUNDRED;
        if cash_after < required_reserve {
            return Err(SizingRejection::CashReserveViolated {
                cash_after,
                required_reserve,
            });
        }

        debug!(
            symbol = %symbol,
            qty = %qty,
            price = %last_price,
            value = %order_value,
            "position sized"
        );

        Ok(qty)
    }
}

impl Default for PositionSizer {
    fn default() -> Self {
        Self::new()
    }
}
