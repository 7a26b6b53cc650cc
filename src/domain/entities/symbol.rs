//! Watchlist symbol with its asset class.
//!
//! The asset class is derived once, when the configuration is loaded. All
//! downstream code (calendar gating, order-type translation, sizing minimums)
//! dispatches on the typed variant instead of re-inspecting the symbol string.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Asset class of a tradable symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetClass {
    /// Exchange-listed equity, gated to regular trading hours.
    Equity,
    /// Crypto pair in `BASE/QUOTE` form, tradable 24/7.
    Crypto,
}

impl AssetClass {
    /// Smallest order quantity the broker accepts for this class.
    pub fn min_qty(&self) -> Decimal {
        match self {
            AssetClass::Equity => Decimal::ONE,
            AssetClass::Crypto => Decimal::new(1, 9),
        }
    }

    /// Number of quantity decimals the broker supports for this class.
    pub fn qty_decimals(&self) -> u32 {
        match self {
            AssetClass::Equity => 0,
            AssetClass::Crypto => 9,
        }
    }
}

/// A configured watchlist entry: symbol plus derived asset class.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WatchSymbol {
    symbol: String,
    asset_class: AssetClass,
}

impl WatchSymbol {
    /// Build an equity entry. The ticker must be bare (no `/`).
    pub fn equity(symbol: &str) -> Result<Self, String> {
        let symbol = symbol.trim().to_uppercase();
        if symbol.is_empty() {
            return Err("Symbol must not be empty".to_string());
        }
        if symbol.contains('/') {
            return Err(format!(
                "Equity symbol must not contain '/': {}",
                symbol
            ));
        }
        Ok(WatchSymbol {
            symbol,
            asset_class: AssetClass::Equity,
        })
    }

    /// Build a crypto entry. The pair must use the `BASE/QUOTE` form.
    pub fn crypto(symbol: &str) -> Result<Self, String> {
        let symbol = symbol.trim().to_uppercase();
        let mut parts = symbol.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(base), Some(quote), None) if !base.is_empty() && !quote.is_empty() => {
                Ok(WatchSymbol {
                    symbol,
                    asset_class: AssetClass::Crypto,
                })
            }
            _ => Err(format!(
                "Crypto symbol must use BASE/QUOTE form: {}",
                symbol
            )),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.symbol
    }

    pub fn asset_class(&self) -> AssetClass {
        self.asset_class
    }

    pub fn is_crypto(&self) -> bool {
        self.asset_class == AssetClass::Crypto
    }
}

impl std::fmt::Display for WatchSymbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.symbol)
    }
}
