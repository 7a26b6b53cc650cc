//! Alpaca REST broker adapter.
//!
//! Implements [`BrokerClient`] against the Alpaca trading and market-data
//! APIs. All asset-class order-type translation lives here:
//!
//! - equity entries become STOP (or STOP_LIMIT) DAY orders; crypto entries
//!   become LIMIT orders at the trigger price, GTC, because the crypto venue
//!   rejects stop orders;
//! - equity protectives become TRAILING_STOP orders, GTC; crypto protectives
//!   become a fixed SELL LIMIT at `reference x (1 - trail_pct/100)`, GTC.
//!   Crypto protection does not trail; raising the stop as price climbs
//!   would need a client-side trailer, which this bot does not do.
//!
//! Price rounding to broker-valid ticks is centralized in
//! [`round_to_tick`]. Callers pass raw computed prices.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::Mode;
use crate::domain::entities::order::{OrderSide, OrderStatus, OrderType, TimeInForce};
use crate::domain::entities::position::Position;
use crate::domain::entities::symbol::WatchSymbol;
use crate::domain::repositories::broker_client::{
    AccountSnapshot, BrokerClient, BrokerError, BrokerResult, CancelOutcome, EntryRequest,
    OrderSnapshot, ProtectiveRequest, Quote,
};
use crate::rate_limit::BrokerRateLimiter;
use crate::secrets::BrokerCredentials;

const PAPER_TRADING_URL: &str = "https://paper-api.alpaca.markets";
const LIVE_TRADING_URL: &str = "https://api.alpaca.markets";
const MARKET_DATA_URL: &str = "https://data.alpaca.markets";
const REQUEST_TIMEOUT_SECONDS: u64 = 10;
const ORDERS_PAGE_LIMIT: u32 = 500;

/// Round a price to a tick size the broker accepts, by magnitude: sub-cent
/// prices keep 7 decimals, sub-dollar prices 4, anything else 2. Always
/// rounds toward zero.
pub fn round_to_tick(price: Decimal) -> Decimal {
    let decimals = if price < Decimal::new(1, 2) {
        7
    } else if price < Decimal::ONE {
        4
    } else {
        2
    };
    price.round_dp_with_strategy(decimals, RoundingStrategy::ToZero)
}

/// Alpaca REST client implementing the broker capability interface.
pub struct AlpacaBroker {
    http: reqwest::Client,
    trading_base: Url,
    data_base: Url,
    limiter: BrokerRateLimiter,
    mode: Mode,
}

impl AlpacaBroker {
    pub fn new(
        credentials: &BrokerCredentials,
        mode: Mode,
        limiter: BrokerRateLimiter,
    ) -> Result<Self, BrokerError> {
        let mut headers = reqwest::header::HeaderMap::new();
        let mut key = reqwest::header::HeaderValue::from_str(credentials.key_id())
            .map_err(|_| BrokerError::Validation("API key id is not a valid header".into()))?;
        key.set_sensitive(true);
        let mut secret = reqwest::header::HeaderValue::from_str(credentials.secret_key())
            .map_err(|_| BrokerError::Validation("API secret is not a valid header".into()))?;
        secret.set_sensitive(true);
        headers.insert("APCA-API-KEY-ID", key);
        headers.insert("APCA-API-SECRET-KEY", secret);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECONDS))
            .build()
            .map_err(|e| BrokerError::Transport(e.to_string()))?;

        let trading_base = match mode {
            Mode::Paper => PAPER_TRADING_URL,
            Mode::Live => LIVE_TRADING_URL,
        };

        Ok(Self {
            http,
            trading_base: Url::parse(trading_base)
                .map_err(|e| BrokerError::Validation(e.to_string()))?,
            data_base: Url::parse(MARKET_DATA_URL)
                .map_err(|e| BrokerError::Validation(e.to_string()))?,
            limiter,
            mode,
        })
    }

    fn url(&self, base: &Url, path: &str) -> BrokerResult<Url> {
        base.join(path)
            .map_err(|e| BrokerError::Validation(format!("bad path {}: {}", path, e)))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: Url,
        query: &[(&str, String)],
    ) -> BrokerResult<T> {
        self.limiter.acquire().await;
        let response = self
            .http
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;
        Self::parse_response(response).await
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        url: Url,
        body: &B,
    ) -> BrokerResult<T> {
        self.limiter.acquire().await;
        let response = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;
        Self::parse_response(response).await
    }

    async fn parse_response<T: DeserializeOwned>(response: reqwest::Response) -> BrokerResult<T> {
        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| BrokerError::Transport(format!("decode failed: {}", e)));
        }
        let body = response.text().await.unwrap_or_default();
        Err(map_api_error(status, &body))
    }

    async fn submit_order(&self, request: &api::NewOrderRequest) -> BrokerResult<OrderSnapshot> {
        if self.mode == Mode::Live {
            warn!(symbol = %request.symbol, "submitting LIVE order");
        }
        let url = self.url(&self.trading_base, "/v2/orders")?;
        let order: api::Order = self.post_json(url, request).await?;
        order.to_snapshot()
    }

    async fn list_orders(&self, query: &[(&str, String)]) -> BrokerResult<Vec<OrderSnapshot>> {
        let url = self.url(&self.trading_base, "/v2/orders")?;
        let orders: Vec<api::Order> = self.get_json(url, query).await?;
        orders.iter().map(api::Order::to_snapshot).collect()
    }
}

#[async_trait]
impl BrokerClient for AlpacaBroker {
    fn name(&self) -> &str {
        "alpaca"
    }

    async fn last_price(&self, symbol: &WatchSymbol) -> BrokerResult<Quote> {
        if symbol.is_crypto() {
            let url = self.url(&self.data_base, "/v1beta3/crypto/us/latest/quotes")?;
            let response: api::CryptoQuotesResponse = self
                .get_json(url, &[("symbols", symbol.as_str().to_string())])
                .await?;
            let quote = response
                .quotes
                .get(symbol.as_str())
                .ok_or_else(|| BrokerError::NotFound(format!("no quote for {}", symbol)))?;
            quote.to_quote()
        } else {
            let path = format!("/v2/stocks/{}/quotes/latest", symbol.as_str());
            let url = self.url(&self.data_base, &path)?;
            let response: api::StockQuoteResponse = self.get_json(url, &[]).await?;
            response.quote.to_quote()
        }
    }

    async fn account_snapshot(&self) -> BrokerResult<AccountSnapshot> {
        let url = self.url(&self.trading_base, "/v2/account")?;
        let account: api::Account = self.get_json(url, &[]).await?;
        Ok(AccountSnapshot {
            equity: parse_decimal_field("equity", &account.equity)?,
            cash: parse_decimal_field("cash", &account.cash)?,
            buying_power: parse_decimal_field("buying_power", &account.buying_power)?,
            position_value: parse_decimal_field(
                "long_market_value",
                &account.long_market_value,
            )?,
        })
    }

    async fn open_orders(&self) -> BrokerResult<Vec<OrderSnapshot>> {
        self.list_orders(&[
            ("status", "open".to_string()),
            ("limit", ORDERS_PAGE_LIMIT.to_string()),
        ])
        .await
    }

    async fn closed_orders(&self, since: DateTime<Utc>) -> BrokerResult<Vec<OrderSnapshot>> {
        self.list_orders(&[
            ("status", "closed".to_string()),
            ("after", since.to_rfc3339()),
            ("direction", "asc".to_string()),
            ("limit", ORDERS_PAGE_LIMIT.to_string()),
        ])
        .await
    }

    async fn positions(&self) -> BrokerResult<Vec<Position>> {
        let url = self.url(&self.trading_base, "/v2/positions")?;
        let positions: Vec<api::ApiPosition> = self.get_json(url, &[]).await?;
        positions.iter().map(api::ApiPosition::to_position).collect()
    }

    async fn submit_entry(&self, request: &EntryRequest) -> BrokerResult<OrderSnapshot> {
        let trigger = round_to_tick(request.stop_trigger);
        let body = if request.symbol.is_crypto() {
            // The crypto venue rejects stop orders; a resting limit at the
            // breakout price is the closest available semantic.
            debug!(
                symbol = %request.symbol,
                limit_price = %trigger,
                "translating crypto entry to GTC limit order"
            );
            api::NewOrderRequest {
                symbol: request.symbol.as_str().to_string(),
                qty: request.qty.to_string(),
                side: "buy".to_string(),
                order_type: "limit".to_string(),
                time_in_force: "gtc".to_string(),
                limit_price: Some(trigger.to_string()),
                stop_price: None,
                trail_percent: None,
            }
        } else {
            match request.limit_offset_pct {
                None => api::NewOrderRequest {
                    symbol: request.symbol.as_str().to_string(),
                    qty: request.qty.to_string(),
                    side: "buy".to_string(),
                    order_type: "stop".to_string(),
                    time_in_force: tif_str(request.tif).to_string(),
                    limit_price: None,
                    stop_price: Some(trigger.to_string()),
                    trail_percent: None,
                },
                Some(slip_pct) => {
                    let limit = round_to_tick(
                        trigger * (Decimal::ONE + slip_pct / Decimal::ONE_HUNDRED),
                    );
                    api::NewOrderRequest {
                        symbol: request.symbol.as_str().to_string(),
                        qty: request.qty.to_string(),
                        side: "buy".to_string(),
                        order_type: "stop_limit".to_string(),
                        time_in_force: tif_str(request.tif).to_string(),
                        limit_price: Some(limit.to_string()),
                        stop_price: Some(trigger.to_string()),
                        trail_percent: None,
                    }
                }
            }
        };

        let ack = self.submit_order(&body).await?;
        info!(
            symbol = %request.symbol,
            order_id = %ack.order_id,
            qty = %request.qty,
            trigger = %trigger,
            order_type = %ack.order_type,
            "entry order submitted"
        );
        Ok(ack)
    }

    async fn submit_protective(&self, request: &ProtectiveRequest) -> BrokerResult<OrderSnapshot> {
        let body = if request.symbol.is_crypto() {
            // Fixed stop: trailing orders are unsupported for crypto. The
            // level anchors to the entry fill and is never lifted.
            let stop = round_to_tick(
                request.reference_price
                    * (Decimal::ONE - request.trail_pct / Decimal::ONE_HUNDRED),
            );
            debug!(
                symbol = %request.symbol,
                limit_price = %stop,
                "translating crypto protective to fixed GTC limit"
            );
            api::NewOrderRequest {
                symbol: request.symbol.as_str().to_string(),
                qty: request.qty.to_string(),
                side: "sell".to_string(),
                order_type: "limit".to_string(),
                time_in_force: "gtc".to_string(),
                limit_price: Some(stop.to_string()),
                stop_price: None,
                trail_percent: None,
            }
        } else {
            api::NewOrderRequest {
                symbol: request.symbol.as_str().to_string(),
                qty: request.qty.to_string(),
                side: "sell".to_string(),
                order_type: "trailing_stop".to_string(),
                time_in_force: tif_str(request.tif).to_string(),
                limit_price: None,
                stop_price: None,
                trail_percent: Some(request.trail_pct.to_string()),
            }
        };

        let ack = self.submit_order(&body).await?;
        info!(
            symbol = %request.symbol,
            order_id = %ack.order_id,
            qty = %request.qty,
            order_type = %ack.order_type,
            "protective order submitted"
        );
        Ok(ack)
    }

    async fn cancel(&self, order_id: &str) -> BrokerResult<CancelOutcome> {
        self.limiter.acquire().await;
        let url = self.url(&self.trading_base, &format!("/v2/orders/{}", order_id))?;
        let response = self
            .http
            .delete(url)
            .send()
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;

        match response.status().as_u16() {
            200..=299 => Ok(CancelOutcome::Canceled),
            // Not cancelable: the order already reached a terminal state.
            422 => Ok(CancelOutcome::AlreadyDone),
            404 => Err(BrokerError::NotFound(format!("order {}", order_id))),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(map_api_error(
                    reqwest::StatusCode::from_u16(status)
                        .unwrap_or(reqwest::StatusCode::INTERNAL_SERVER_ERROR),
                    &body,
                ))
            }
        }
    }
}

fn tif_str(tif: TimeInForce) -> &'static str {
    match tif {
        TimeInForce::Day => "day",
        TimeInForce::Gtc => "gtc",
    }
}

fn map_api_error(status: reqwest::StatusCode, body: &str) -> BrokerError {
    match status.as_u16() {
        403 if body.contains("buying power") || body.contains("insufficient") => {
            BrokerError::InsufficientFunds(body.to_string())
        }
        404 => BrokerError::NotFound(body.to_string()),
        422 if body.contains("not supported") => BrokerError::NotSupported(body.to_string()),
        400 | 403 | 422 => BrokerError::Validation(body.to_string()),
        429 => BrokerError::Transport("rate limited".to_string()),
        _ => BrokerError::Transport(format!("HTTP {}: {}", status, body)),
    }
}

fn parse_decimal_field(field: &str, raw: &str) -> BrokerResult<Decimal> {
    Decimal::from_str(raw)
        .map_err(|e| BrokerError::Validation(format!("bad {}: {} ({})", field, raw, e)))
}

/// Crypto position and order symbols sometimes come back without the slash
/// (`BTCUSD`); restore the `BASE/QUOTE` form the rest of the bot uses.
fn restore_crypto_symbol(symbol: &str) -> String {
    if symbol.contains('/') {
        return symbol.to_string();
    }
    for quote in ["USDT", "USDC", "USD", "BTC", "ETH"] {
        if let Some(base) = symbol.strip_suffix(quote) {
            if !base.is_empty() {
                return format!("{}/{}", base, quote);
            }
        }
    }
    symbol.to_string()
}

/// Wire types for the Alpaca REST API. Quantities and prices arrive as
/// strings and are parsed into decimals at the boundary.
mod api {
    use super::*;
    use std::collections::HashMap;

    #[derive(Debug, Serialize)]
    pub struct NewOrderRequest {
        pub symbol: String,
        pub qty: String,
        pub side: String,
        #[serde(rename = "type")]
        pub order_type: String,
        pub time_in_force: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub limit_price: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub stop_price: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub trail_percent: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Order {
        pub id: String,
        pub symbol: String,
        pub side: String,
        #[serde(rename = "type")]
        pub order_type: String,
        pub status: String,
        pub asset_class: Option<String>,
        pub qty: Option<String>,
        pub filled_qty: Option<String>,
        pub filled_avg_price: Option<String>,
        pub stop_price: Option<String>,
        pub limit_price: Option<String>,
        pub trail_percent: Option<String>,
        pub created_at: DateTime<Utc>,
        pub updated_at: Option<DateTime<Utc>>,
    }

    impl Order {
        pub fn to_snapshot(&self) -> BrokerResult<OrderSnapshot> {
            let symbol = if self.asset_class.as_deref() == Some("crypto") {
                restore_crypto_symbol(&self.symbol)
            } else {
                self.symbol.clone()
            };
            Ok(OrderSnapshot {
                order_id: self.id.clone(),
                symbol,
                side: parse_side(&self.side)?,
                order_type: parse_order_type(&self.order_type),
                status: parse_status(&self.status),
                qty: opt_decimal("qty", &self.qty)?.unwrap_or(Decimal::ZERO),
                filled_qty: opt_decimal("filled_qty", &self.filled_qty)?
                    .unwrap_or(Decimal::ZERO),
                filled_avg_price: opt_decimal("filled_avg_price", &self.filled_avg_price)?,
                stop_price: opt_decimal("stop_price", &self.stop_price)?,
                limit_price: opt_decimal("limit_price", &self.limit_price)?,
                trailing_pct: opt_decimal("trail_percent", &self.trail_percent)?,
                parent_id: None,
                created_at: self.created_at,
                updated_at: self.updated_at.unwrap_or(self.created_at),
            })
        }
    }

    #[derive(Debug, Deserialize)]
    pub struct Account {
        pub equity: String,
        pub cash: String,
        pub buying_power: String,
        pub long_market_value: String,
    }

    #[derive(Debug, Deserialize)]
    pub struct ApiPosition {
        pub symbol: String,
        pub asset_class: Option<String>,
        pub qty: String,
        pub avg_entry_price: String,
        pub market_value: Option<String>,
    }

    impl ApiPosition {
        pub fn to_position(&self) -> BrokerResult<Position> {
            let symbol = if self.asset_class.as_deref() == Some("crypto") {
                restore_crypto_symbol(&self.symbol)
            } else {
                self.symbol.clone()
            };
            Ok(Position {
                symbol,
                qty: parse_decimal_field("qty", &self.qty)?,
                avg_entry_price: parse_decimal_field("avg_entry_price", &self.avg_entry_price)?,
                market_value: opt_decimal("market_value", &self.market_value)?
                    .unwrap_or(Decimal::ZERO),
            })
        }
    }

    #[derive(Debug, Deserialize)]
    pub struct StockQuoteResponse {
        pub quote: QuotePayload,
    }

    #[derive(Debug, Deserialize)]
    pub struct CryptoQuotesResponse {
        pub quotes: HashMap<String, QuotePayload>,
    }

    #[derive(Debug, Deserialize)]
    pub struct QuotePayload {
        #[serde(rename = "ap")]
        pub ask_price: Decimal,
        #[serde(rename = "bp")]
        pub bid_price: Decimal,
        #[serde(rename = "t")]
        pub ts: DateTime<Utc>,
    }

    impl QuotePayload {
        /// Mid-point of bid/ask; one-sided books fall back to the live side.
        pub fn to_quote(&self) -> BrokerResult<Quote> {
            let price = if self.bid_price > Decimal::ZERO && self.ask_price > Decimal::ZERO {
                (self.bid_price + self.ask_price) / Decimal::TWO
            } else if self.ask_price > Decimal::ZERO {
                self.ask_price
            } else if self.bid_price > Decimal::ZERO {
                self.bid_price
            } else {
                return Err(BrokerError::NotFound("empty quote".to_string()));
            };
            Ok(Quote { price, ts: self.ts })
        }
    }

    pub fn parse_side(side: &str) -> BrokerResult<OrderSide> {
        match side {
            "buy" => Ok(OrderSide::Buy),
            "sell" => Ok(OrderSide::Sell),
            other => Err(BrokerError::Validation(format!("unknown side: {}", other))),
        }
    }

    pub fn parse_order_type(order_type: &str) -> OrderType {
        match order_type {
            "market" => OrderType::Market,
            "limit" => OrderType::Limit,
            "stop" => OrderType::Stop,
            "stop_limit" => OrderType::StopLimit,
            "trailing_stop" => OrderType::TrailingStop,
            other => {
                warn!(order_type = other, "unknown order type, treating as market");
                OrderType::Market
            }
        }
    }

    pub fn parse_status(status: &str) -> OrderStatus {
        match status {
            "partially_filled" => OrderStatus::PartiallyFilled,
            "filled" => OrderStatus::Filled,
            "canceled" => OrderStatus::Canceled,
            "expired" | "done_for_day" => OrderStatus::Expired,
            "rejected" => OrderStatus::Rejected,
            // new, accepted, pending_new, pending_cancel, held: still working.
            _ => OrderStatus::Open,
        }
    }

    pub fn opt_decimal(
        field: &str,
        raw: &Option<String>,
    ) -> BrokerResult<Option<Decimal>> {
        raw.as_deref()
            .map(|s| parse_decimal_field(field, s))
            .transpose()
    }
}
