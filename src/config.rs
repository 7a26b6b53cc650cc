//! Bot configuration.
//!
//! Loaded from a YAML file into typed groups, one per concern. Watchlist
//! entries are parsed into [`WatchSymbol`]s (equity vs crypto) once, at load
//! time; nothing downstream re-inspects raw symbol strings. Broker
//! credentials are not part of this file, see [`crate::secrets`].

use std::collections::HashMap;
use std::path::Path;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::entities::order::TimeInForce;
use crate::domain::entities::symbol::WatchSymbol;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Paper,
    Live,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Paper
    }
}

/// Position sizing and allocation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocationConfig {
    pub total_usd_cap: Decimal,
    pub per_symbol_usd: Decimal,
    pub per_symbol_override: HashMap<String, Decimal>,
    pub min_cash_reserve_percent: Decimal,
    pub allow_fractional: bool,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            total_usd_cap: Decimal::new(20_000, 0),
            per_symbol_usd: Decimal::new(1_000, 0),
            per_symbol_override: HashMap::new(),
            min_cash_reserve_percent: Decimal::new(10, 0),
            allow_fractional: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    BuyStop,
    BuyStopLimit,
}

/// Entry order configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EntriesConfig {
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub buy_stop_pct_above_last: Decimal,
    pub stop_limit_max_slip_pct: Decimal,
    pub tif: TimeInForce,
    pub cancel_at_close: bool,
    /// Recognized for compatibility; re-arming on the next session is the
    /// only implemented behavior.
    pub rearm_next_session: bool,
}

impl Default for EntriesConfig {
    fn default() -> Self {
        Self {
            kind: EntryKind::BuyStop,
            buy_stop_pct_above_last: Decimal::new(5, 0),
            stop_limit_max_slip_pct: Decimal::new(1, 0),
            tif: TimeInForce::Day,
            cancel_at_close: true,
            rearm_next_session: true,
        }
    }
}

/// Protective (trailing stop) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StopsConfig {
    pub trailing_stop_pct: Decimal,
    pub use_trailing_limit: bool,
    pub trail_limit_offset_pct: Decimal,
    pub tif: TimeInForce,
}

impl Default for StopsConfig {
    fn default() -> Self {
        Self {
            trailing_stop_pct: Decimal::new(10, 0),
            use_trailing_limit: false,
            trail_limit_offset_pct: Decimal::new(2, 1),
            tif: TimeInForce::Gtc,
        }
    }
}

/// Market hours configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HoursConfig {
    pub calendar: String,
    pub allow_pre_market: bool,
    pub allow_after_hours: bool,
}

impl Default for HoursConfig {
    fn default() -> Self {
        Self {
            calendar: "XNYS".to_string(),
            allow_pre_market: false,
            allow_after_hours: false,
        }
    }
}

/// Cooldown periods configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CooldownsConfig {
    pub after_stopout_minutes: i64,
}

impl Default for CooldownsConfig {
    fn default() -> Self {
        Self {
            after_stopout_minutes: 20,
        }
    }
}

/// Polling intervals, seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Recognized for compatibility; quotes are fetched on demand within a
    /// tick rather than on their own cadence.
    pub price_seconds: u64,
    /// Tick interval of the main loop.
    pub orders_seconds: u64,
    pub keepalive_seconds: u64,
    pub event_check_seconds: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            price_seconds: 10,
            orders_seconds: 15,
            keepalive_seconds: 300,
            event_check_seconds: 5,
        }
    }
}

/// Hard exposure caps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub max_total_exposure_usd: Decimal,
    pub max_symbol_exposure_usd: Decimal,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_total_exposure_usd: Decimal::new(20_000, 0),
            max_symbol_exposure_usd: Decimal::new(2_000, 0),
        }
    }
}

/// Database persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub db_url: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            db_url: "sqlite://data/trailbot.db".to_string(),
        }
    }
}

/// Read-only monitoring endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

/// Main bot configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub mode: Mode,
    pub watchlist: Vec<String>,
    pub crypto_watchlist: Vec<String>,
    pub allocation: AllocationConfig,
    pub entries: EntriesConfig,
    pub stops: StopsConfig,
    pub hours: HoursConfig,
    pub cooldowns: CooldownsConfig,
    pub polling: PollingConfig,
    pub risk: RiskConfig,
    pub persistence: PersistenceConfig,
    pub monitor: MonitorConfig,

    #[serde(skip)]
    symbols: Vec<WatchSymbol>,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            watchlist: Vec::new(),
            crypto_watchlist: Vec::new(),
            allocation: AllocationConfig::default(),
            entries: EntriesConfig::default(),
            stops: StopsConfig::default(),
            hours: HoursConfig::default(),
            cooldowns: CooldownsConfig::default(),
            polling: PollingConfig::default(),
            risk: RiskConfig::default(),
            persistence: PersistenceConfig::default(),
            monitor: MonitorConfig::default(),
            symbols: Vec::new(),
        }
    }
}

impl BotConfig {
    /// Load configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let mut config: BotConfig = serde_yaml::from_str(raw)?;
        config.finalize()?;
        Ok(config)
    }

    /// Validate and derive the typed watchlist.
    fn finalize(&mut self) -> Result<(), ConfigError> {
        if self.watchlist.is_empty() && self.crypto_watchlist.is_empty() {
            return Err(ConfigError::Invalid(
                "Watchlist must contain at least one symbol".to_string(),
            ));
        }
        if self.hours.calendar != "XNYS" {
            return Err(ConfigError::Invalid(format!(
                "Unsupported calendar: {} (only XNYS)",
                self.hours.calendar
            )));
        }

        let mut symbols = Vec::with_capacity(self.watchlist.len() + self.crypto_watchlist.len());
        for raw in &self.watchlist {
            symbols.push(WatchSymbol::equity(raw).map_err(ConfigError::Invalid)?);
        }
        for raw in &self.crypto_watchlist {
            symbols.push(WatchSymbol::crypto(raw).map_err(ConfigError::Invalid)?);
        }
        self.symbols = symbols;

        // Override keys are matched against uppercased symbols.
        self.allocation.per_symbol_override = self
            .allocation
            .per_symbol_override
            .drain()
            .map(|(k, v)| (k.to_uppercase(), v))
            .collect();

        Ok(())
    }

    /// All configured symbols, equities first.
    pub fn symbols(&self) -> &[WatchSymbol] {
        &self.symbols
    }

    /// Dollar budget for one entry in `symbol`.
    pub fn symbol_allocation(&self, symbol: &str) -> Decimal {
        self.allocation
            .per_symbol_override
            .get(symbol)
            .copied()
            .unwrap_or(self.allocation.per_symbol_usd)
    }

    /// Minimal valid configuration for tests.
    pub fn for_tests() -> Self {
        let mut config = BotConfig {
            watchlist: vec!["TSLA".to_string()],
            crypto_watchlist: vec!["BTC/USD".to_string()],
            ..BotConfig::default()
        };
        config.finalize().expect("test config is valid");
        config
    }
}
