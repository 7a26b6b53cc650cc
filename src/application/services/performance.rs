//! Performance tracking and P&L analytics.
//!
//! Closed trades are reconstructed from the fill log by pairing BUY entries
//! with the SELLs that unwind them, per symbol in execution order. The
//! aggregate statistics feed the monitoring surface and the daily snapshot.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use chrono_tz::America::New_York;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info};

use crate::domain::entities::fill::Fill;
use crate::domain::entities::order::OrderSide;
use crate::domain::entities::position::Position;
use crate::domain::repositories::broker_client::AccountSnapshot;
use crate::persistence::models::NewPerformanceSnapshot;
use crate::persistence::repository::Store;
use crate::persistence::DatabaseError;

/// A completed round trip: one entry unwound by one or more exits collapses
/// into per-exit rows sharing the entry price.
#[derive(Debug, Clone, Serialize)]
pub struct ClosedTrade {
    pub symbol: String,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub qty: Decimal,
    pub pnl: Decimal,
    pub pnl_pct: Decimal,
    pub entry_ts: DateTime<Utc>,
    pub exit_ts: DateTime<Utc>,
    pub duration_hours: f64,
}

/// Aggregate trade statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TradeStatistics {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub total_pnl: Decimal,
    pub avg_pnl_per_trade: Decimal,
    pub avg_win: Decimal,
    pub avg_loss: Decimal,
    pub largest_win: Decimal,
    pub largest_loss: Decimal,
    pub gross_profit: Decimal,
    pub gross_loss: Decimal,
    pub profit_factor: Option<f64>,
    pub expectancy: Decimal,
    pub sharpe_ratio: f64,
    pub max_drawdown: Decimal,
    pub avg_trade_duration_hours: f64,
}

/// One day of realized P&L.
#[derive(Debug, Clone, Serialize)]
pub struct DailyPnl {
    pub date: NaiveDate,
    pub pnl: Decimal,
    pub trades: usize,
}

/// Per-symbol performance rollup. Trades that close flat count against the
/// symbol as non-winners.
#[derive(Debug, Clone, Serialize)]
pub struct SymbolPerformance {
    pub trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub win_rate: f64,
    pub total_pnl: Decimal,
    pub avg_pnl: Decimal,
    pub best_trade: Decimal,
    pub worst_trade: Decimal,
}

/// Computes closed-trade analytics over the fill log and writes daily
/// snapshots.
#[derive(Clone)]
pub struct PerformanceTracker {
    store: Store,
}

impl PerformanceTracker {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Pair fills into closed trades, per symbol in execution order. A BUY
    /// into a flat book opens the entry; SELLs realize P&L against that
    /// entry price until the position returns to flat.
    pub fn closed_trades(fills: &[Fill]) -> Vec<ClosedTrade> {
        struct OpenEntry {
            price: Decimal,
            ts: DateTime<Utc>,
        }

        let mut by_symbol: std::collections::BTreeMap<&str, Vec<&Fill>> = Default::default();
        for fill in fills {
            by_symbol.entry(fill.symbol.as_str()).or_default().push(fill);
        }

        let mut trades = Vec::new();

        for (symbol, symbol_fills) in by_symbol {
            let mut position = Decimal::ZERO;
            let mut entry: Option<OpenEntry> = None;

            for fill in symbol_fills {
                match fill.side {
                    OrderSide::Buy => {
                        if position == Decimal::ZERO {
                            entry = Some(OpenEntry {
                                price: fill.price,
                                ts: fill.ts,
                            });
                        }
                        position += fill.qty;
                    }
                    OrderSide::Sell => {
                        let Some(open) = entry.as_ref() else {
                            continue;
                        };
                        if position <= Decimal::ZERO {
                            continue;
                        }
                        let exit_qty = fill.qty.min(position);
                        let pnl = (fill.price - open.price) * exit_qty;
                        let pnl_pct = if open.price > Decimal::ZERO {
                            (fill.price - open.price) / open.price * Decimal::ONE_HUNDRED
                        } else {
                            Decimal::ZERO
                        };
                        let duration_hours =
                            (fill.ts - open.ts).num_seconds() as f64 / 3600.0;

                        trades.push(ClosedTrade {
                            symbol: symbol.to_string(),
                            entry_price: open.price,
                            exit_price: fill.price,
                            qty: exit_qty,
                            pnl,
                            pnl_pct,
                            entry_ts: open.ts,
                            exit_ts: fill.ts,
                            duration_hours,
                        });

                        position -= exit_qty;
                        if position == Decimal::ZERO {
                            entry = None;
                        }
                    }
                }
            }
        }

        debug!(num_trades = trades.len(), "closed trades calculated");
        trades
    }

    /// Aggregate statistics over a set of closed trades.
    pub fn statistics(trades: &[ClosedTrade]) -> TradeStatistics {
        if trades.is_empty() {
            return TradeStatistics::default();
        }

        let total = trades.len();
        let winners: Vec<&ClosedTrade> = trades.iter().filter(|t| t.pnl > Decimal::ZERO).collect();
        let losers: Vec<&ClosedTrade> = trades.iter().filter(|t| t.pnl < Decimal::ZERO).collect();

        let total_pnl: Decimal = trades.iter().map(|t| t.pnl).sum();
        let gross_profit: Decimal = winners.iter().map(|t| t.pnl).sum();
        let gross_loss: Decimal = losers.iter().map(|t| t.pnl).sum::<Decimal>().abs();

        let win_rate = winners.len() as f64 / total as f64 * 100.0;
        let avg_pnl = total_pnl / Decimal::from(total);
        let avg_win = if winners.is_empty() {
            Decimal::ZERO
        } else {
            gross_profit / Decimal::from(winners.len())
        };
        let avg_loss = if losers.is_empty() {
            Decimal::ZERO
        } else {
            -(gross_loss / Decimal::from(losers.len()))
        };

        let largest_win = winners.iter().map(|t| t.pnl).max().unwrap_or(Decimal::ZERO);
        let largest_loss = losers.iter().map(|t| t.pnl).min().unwrap_or(Decimal::ZERO);

        let profit_factor = if gross_loss > Decimal::ZERO {
            Some((gross_profit / gross_loss).to_f64().unwrap_or(0.0))
        } else {
            None
        };

        // Expectancy: average profit per trade weighted by hit rate.
        let p_win = Decimal::from(winners.len()) / Decimal::from(total);
        let p_loss = Decimal::from(losers.len()) / Decimal::from(total);
        let expectancy = p_win * avg_win + p_loss * avg_loss;

        // Simplified Sharpe over per-trade percentage returns.
        let returns: Vec<f64> = trades
            .iter()
            .map(|t| t.pnl_pct.to_f64().unwrap_or(0.0))
            .collect();
        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        let variance =
            returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
        let std_dev = variance.sqrt();
        let sharpe_ratio = if std_dev > 0.0 { mean / std_dev } else { 0.0 };

        // Max drawdown on the cumulative P&L curve.
        let mut peak = Decimal::MIN;
        let mut max_drawdown = Decimal::ZERO;
        let mut running = Decimal::ZERO;
        for trade in trades {
            running += trade.pnl;
            if running > peak {
                peak = running;
            }
            let drawdown = peak - running;
            if drawdown > max_drawdown {
                max_drawdown = drawdown;
            }
        }

        let avg_duration =
            trades.iter().map(|t| t.duration_hours).sum::<f64>() / total as f64;

        TradeStatistics {
            total_trades: total,
            winning_trades: winners.len(),
            losing_trades: losers.len(),
            win_rate,
            total_pnl,
            avg_pnl_per_trade: avg_pnl,
            avg_win,
            avg_loss,
            largest_win,
            largest_loss,
            gross_profit,
            gross_loss,
            profit_factor,
            expectancy,
            sharpe_ratio,
            max_drawdown,
            avg_trade_duration_hours: avg_duration,
        }
    }

    /// Break closed trades out per symbol.
    pub fn performance_by_symbol(
        trades: &[ClosedTrade],
    ) -> std::collections::BTreeMap<String, SymbolPerformance> {
        let mut by_symbol: std::collections::BTreeMap<&str, Vec<&ClosedTrade>> =
            Default::default();
        for trade in trades {
            by_symbol
                .entry(trade.symbol.as_str())
                .or_default()
                .push(trade);
        }

        by_symbol
            .into_iter()
            .map(|(symbol, trades)| {
                let total = trades.len();
                let wins = trades.iter().filter(|t| t.pnl > Decimal::ZERO).count();
                let total_pnl: Decimal = trades.iter().map(|t| t.pnl).sum();
                let avg_pnl = if total > 0 {
                    total_pnl / Decimal::from(total)
                } else {
                    Decimal::ZERO
                };
                let best_trade = trades.iter().map(|t| t.pnl).max().unwrap_or(Decimal::ZERO);
                let worst_trade = trades.iter().map(|t| t.pnl).min().unwrap_or(Decimal::ZERO);
                let win_rate = if total > 0 {
                    wins as f64 / total as f64 * 100.0
                } else {
                    0.0
                };
                (
                    symbol.to_string(),
                    SymbolPerformance {
                        trades: total,
                        wins,
                        losses: total - wins,
                        win_rate,
                        total_pnl,
                        avg_pnl,
                        best_trade,
                        worst_trade,
                    },
                )
            })
            .collect()
    }

    /// Realized P&L per exchange-timezone day, most recent `days` entries.
    pub fn daily_pnl(trades: &[ClosedTrade], days: usize) -> Vec<DailyPnl> {
        let mut by_date: std::collections::BTreeMap<NaiveDate, (Decimal, usize)> =
            Default::default();
        for trade in trades {
            let date = trade.exit_ts.with_timezone(&New_York).date_naive();
            let entry = by_date.entry(date).or_insert((Decimal::ZERO, 0));
            entry.0 += trade.pnl;
            entry.1 += 1;
        }

        let mut daily: Vec<DailyPnl> = by_date
            .into_iter()
            .map(|(date, (pnl, trades))| DailyPnl { date, pnl, trades })
            .collect();
        if daily.len() > days {
            daily.drain(..daily.len() - days);
        }
        daily
    }

    /// Load the fill log and compute statistics.
    pub async fn trade_statistics(&self) -> Result<TradeStatistics, DatabaseError> {
        let trades = Self::closed_trades(&self.load_fills().await?);
        Ok(Self::statistics(&trades))
    }

    /// Load the fill log and compute the daily P&L series.
    pub async fn daily_series(&self, days: usize) -> Result<Vec<DailyPnl>, DatabaseError> {
        let trades = Self::closed_trades(&self.load_fills().await?);
        Ok(Self::daily_pnl(&trades, days))
    }

    /// Load the fill log and compute the per-symbol breakdown.
    pub async fn symbol_breakdown(
        &self,
    ) -> Result<std::collections::BTreeMap<String, SymbolPerformance>, DatabaseError> {
        let trades = Self::closed_trades(&self.load_fills().await?);
        Ok(Self::performance_by_symbol(&trades))
    }

    /// Write the daily performance snapshot for `session_date`.
    pub async fn take_daily_snapshot(
        &self,
        now: DateTime<Utc>,
        session_date: NaiveDate,
        account: &AccountSnapshot,
        positions: &[Position],
    ) -> Result<(), DatabaseError> {
        let fills = self.load_fills().await?;
        let trades = Self::closed_trades(&fills);

        let realized_pnl: Decimal = trades.iter().map(|t| t.pnl).sum();
        let unrealized_pnl: Decimal = positions
            .iter()
            .map(|p| p.market_value - p.qty * p.avg_entry_price)
            .sum();
        let daily_pnl: Decimal = trades
            .iter()
            .filter(|t| t.exit_ts.with_timezone(&New_York).date_naive() == session_date)
            .map(|t| t.pnl)
            .sum();

        let day_start = New_York
            .from_local_datetime(&session_date.and_hms_opt(0, 0, 0).unwrap_or_default())
            .earliest()
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or(now);
        let num_trades = self.store.fills_count_since(day_start).await?;

        self.store
            .add_snapshot(
                now,
                NewPerformanceSnapshot {
                    account_value: Some(account.equity),
                    cash_value: Some(account.cash),
                    position_value: Some(account.position_value),
                    unrealized_pnl: Some(unrealized_pnl),
                    realized_pnl: Some(realized_pnl),
                    daily_pnl: Some(daily_pnl),
                    num_positions: positions.len() as i64,
                    num_trades,
                },
            )
            .await?;

        info!(date = %session_date, "daily snapshot saved");
        Ok(())
    }

    async fn load_fills(&self) -> Result<Vec<Fill>, DatabaseError> {
        let records = self.store.all_fills_ordered().await?;
        records.iter().map(|r| r.to_fill()).collect()
    }
}
