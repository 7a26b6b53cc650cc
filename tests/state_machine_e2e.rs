//! End-to-end state machine scenarios against the mock broker: the full
//! breakout cycle, duplicate-protective cleanup, cooldown gating, end-of-day
//! cancellation, restart recovery, and the crypto fixed-stop path.

mod common;

use std::sync::Arc;

use chrono::Duration;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use common::{eastern, equity_config, memory_store, MockBroker};
use trailbot::application::services::orchestrator::TradingBot;
use trailbot::config::BotConfig;
use trailbot::domain::entities::order::{OrderSide, OrderStatus, OrderType};
use trailbot::domain::entities::position::Position;
use trailbot::domain::repositories::broker_client::OrderSnapshot;
use trailbot::persistence::repository::Store;

fn tsla_position(qty: Decimal, avg: Decimal) -> Position {
    Position {
        symbol: "TSLA".to_string(),
        qty,
        avg_entry_price: avg,
        market_value: qty * avg,
    }
}

async fn event_types(store: &Store) -> Vec<String> {
    store
        .recent_events(100)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect()
}

#[tokio::test]
async fn test_clean_breakout_cycle() {
    let config = equity_config("");
    let broker = Arc::new(MockBroker::new());
    let store = memory_store().await;
    let mut bot = TradingBot::new(config, broker.clone(), store.clone());

    // 10:00 ET on a regular session: entry placed above the last price.
    let t0 = eastern(2026, 8, 5, 10, 0, 0);
    broker.set_now(t0);
    broker.set_account(dec!(100000), dec!(50000));
    broker.set_quote("TSLA", dec!(250), t0);
    bot.tick(t0).await.unwrap();

    let open = broker.open_order_ids();
    assert_eq!(open, vec!["M1".to_string()]);
    let entry = broker.order("M1").unwrap();
    assert_eq!(entry.side, OrderSide::Buy);
    assert_eq!(entry.order_type, OrderType::Stop);
    // qty from the last price (1000 / 250 = 4), trigger 5% above.
    assert_eq!(entry.qty, dec!(4));
    assert_eq!(entry.stop_price, Some(dec!(262.50)));

    let state = store.get_state("TSLA").await.unwrap().unwrap();
    assert_eq!(state.last_parent_id.as_deref(), Some("M1"));
    assert!(event_types(&store).await.contains(&"entry_order_placed".to_string()));

    // Breakout: the entry fills; the protective trailing stop follows.
    let t1 = t0 + Duration::seconds(30);
    broker.set_now(t1);
    broker.fill_order("M1", dec!(4), dec!(262.50), t1);
    broker.set_positions(vec![tsla_position(dec!(4), dec!(262.50))]);
    bot.tick(t1).await.unwrap();

    let protective = broker.order("M2").expect("protective placed after entry fill");
    assert_eq!(protective.side, OrderSide::Sell);
    assert_eq!(protective.order_type, OrderType::TrailingStop);
    assert_eq!(protective.qty, dec!(4));
    assert_eq!(protective.trailing_pct, Some(dec!(10)));

    let state = store.get_state("TSLA").await.unwrap().unwrap();
    assert_eq!(state.last_trail_id.as_deref(), Some("M2"));
    let events = event_types(&store).await;
    assert!(events.contains(&"fill_received".to_string()));
    assert!(events.contains(&"trailing_stop_placed_after_entry".to_string()));

    // Price runs to 300 and retraces; the trail triggers near 270.
    let t2 = t1 + Duration::seconds(120);
    broker.set_now(t2);
    broker.fill_order("M2", dec!(4), dec!(270), t2);
    broker.set_positions(vec![]);
    bot.tick(t2).await.unwrap();

    let state = store.get_state("TSLA").await.unwrap().unwrap();
    assert_eq!(state.cooldown_until, Some(t2 + Duration::minutes(20)));
    assert!(state.last_trail_id.is_none());
    assert!(event_types(&store).await.contains(&"stopout_cooldown_started".to_string()));

    // Cooldown blocks re-entry.
    let t3 = t2 + Duration::seconds(60);
    broker.set_now(t3);
    broker.set_quote("TSLA", dec!(270), t3);
    let submissions_before = broker.submission_count();
    bot.tick(t3).await.unwrap();
    assert_eq!(broker.submission_count(), submissions_before);
    let state = store.get_state("TSLA").await.unwrap().unwrap();
    assert!(state.last_parent_id.is_none());

    // Cooldown elapsed: a fresh cycle begins.
    let t4 = t2 + Duration::minutes(21);
    broker.set_now(t4);
    broker.set_quote("TSLA", dec!(270), t4);
    bot.tick(t4).await.unwrap();

    let state = store.get_state("TSLA").await.unwrap().unwrap();
    assert!(state.cooldown_until.is_none());
    let entry = broker.order("M3").expect("re-armed entry");
    assert_eq!(entry.side, OrderSide::Buy);
    assert_eq!(entry.qty, dec!(3)); // floor(1000 / 270)
}

#[tokio::test]
async fn test_duplicate_protective_cleanup() {
    let config = equity_config("");
    let broker = Arc::new(MockBroker::new());
    let store = memory_store().await;
    let mut bot = TradingBot::new(config, broker.clone(), store.clone());

    let t0 = eastern(2026, 8, 5, 11, 0, 0);
    let placed_at = t0 - Duration::minutes(30);
    broker.set_now(t0);
    broker.set_account(dec!(100000), dec!(50000));
    broker.set_positions(vec![tsla_position(dec!(10), dec!(100))]);

    // The bot's own protective plus one the user placed by hand, later.
    let mk = |id: &str, order_type: OrderType, created_offset: i64| OrderSnapshot {
        order_id: id.to_string(),
        symbol: "TSLA".to_string(),
        side: OrderSide::Sell,
        order_type,
        status: OrderStatus::Open,
        qty: dec!(10),
        filled_qty: Decimal::ZERO,
        filled_avg_price: None,
        stop_price: None,
        limit_price: None,
        trailing_pct: Some(dec!(10)),
        parent_id: None,
        created_at: placed_at + Duration::seconds(created_offset),
        updated_at: placed_at + Duration::seconds(created_offset),
    };
    broker.install_order(mk("P1", OrderType::TrailingStop, 0));
    broker.install_order(mk("P2", OrderType::TrailingStop, 60));

    bot.tick(t0).await.unwrap();

    // The later duplicate is gone, the original survives.
    assert_eq!(broker.canceled_ids(), vec!["P2".to_string()]);
    assert_eq!(broker.open_order_ids(), vec!["P1".to_string()]);

    let events = event_types(&store).await;
    let cancelled: Vec<&String> = events
        .iter()
        .filter(|t| *t == "duplicate_stop_cancelled")
        .collect();
    assert_eq!(cancelled.len(), 1);
}

#[tokio::test]
async fn test_protective_requantified_on_mismatch() {
    let config = equity_config("");
    let broker = Arc::new(MockBroker::new());
    let store = memory_store().await;
    let mut bot = TradingBot::new(config, broker.clone(), store.clone());

    let t0 = eastern(2026, 8, 5, 11, 0, 0);
    broker.set_now(t0);
    broker.set_account(dec!(100000), dec!(50000));
    // Position drifted down to 6 (manual partial sale); stop still covers 10.
    broker.set_positions(vec![tsla_position(dec!(6), dec!(100))]);
    broker.install_order(OrderSnapshot {
        order_id: "P1".to_string(),
        symbol: "TSLA".to_string(),
        side: OrderSide::Sell,
        order_type: OrderType::TrailingStop,
        status: OrderStatus::Open,
        qty: dec!(10),
        filled_qty: Decimal::ZERO,
        filled_avg_price: None,
        stop_price: None,
        limit_price: None,
        trailing_pct: Some(dec!(10)),
        parent_id: None,
        created_at: t0 - Duration::hours(1),
        updated_at: t0 - Duration::hours(1),
    });

    bot.tick(t0).await.unwrap();

    assert_eq!(broker.canceled_ids(), vec!["P1".to_string()]);
    let replacement = broker.order("M1").expect("replacement protective");
    assert_eq!(replacement.qty, dec!(6));
    assert!(event_types(&store).await.contains(&"protective_requantified".to_string()));
}

#[tokio::test]
async fn test_eod_cancels_entries_but_not_protectives() {
    let config = Arc::new(
        BotConfig::from_yaml_str(
            "watchlist: [TSLA, NVDA]\nallocation:\n  per_symbol_usd: 1000\n",
        )
        .unwrap(),
    );
    let broker = Arc::new(MockBroker::new());
    let store = memory_store().await;
    let mut bot = TradingBot::new(config, broker.clone(), store.clone());

    let session_open = eastern(2026, 8, 5, 10, 0, 0);
    broker.set_account(dec!(100000), dec!(50000));
    // TSLA: resting entry. NVDA: open position with healthy protective.
    broker.install_order(OrderSnapshot {
        order_id: "E1".to_string(),
        symbol: "TSLA".to_string(),
        side: OrderSide::Buy,
        order_type: OrderType::Stop,
        status: OrderStatus::Open,
        qty: dec!(4),
        filled_qty: Decimal::ZERO,
        filled_avg_price: None,
        stop_price: Some(dec!(262.50)),
        limit_price: None,
        trailing_pct: None,
        parent_id: None,
        created_at: session_open,
        updated_at: session_open,
    });
    broker.install_order(OrderSnapshot {
        order_id: "S1".to_string(),
        symbol: "NVDA".to_string(),
        side: OrderSide::Sell,
        order_type: OrderType::TrailingStop,
        status: OrderStatus::Open,
        qty: dec!(5),
        filled_qty: Decimal::ZERO,
        filled_avg_price: None,
        stop_price: None,
        limit_price: None,
        trailing_pct: Some(dec!(10)),
        parent_id: None,
        created_at: session_open,
        updated_at: session_open,
    });
    broker.set_positions(vec![Position {
        symbol: "NVDA".to_string(),
        qty: dec!(5),
        avg_entry_price: dec!(120),
        market_value: dec!(600),
    }]);

    // 15:44 ET: sixteen minutes out, nothing is canceled.
    let t_before = eastern(2026, 8, 5, 15, 44, 0);
    broker.set_now(t_before);
    bot.tick(t_before).await.unwrap();
    assert!(broker.canceled_ids().is_empty());

    // 15:45 ET: exactly fifteen minutes before the bell, the sweep runs.
    let t_cancel = eastern(2026, 8, 5, 15, 45, 0);
    broker.set_now(t_cancel);
    bot.tick(t_cancel).await.unwrap();
    assert_eq!(broker.canceled_ids(), vec!["E1".to_string()]);
    assert!(broker.open_order_ids().contains(&"S1".to_string()));

    let events = event_types(&store).await;
    assert!(events.contains(&"entry_cancelled_eod".to_string()));
    assert!(events.contains(&"eod_cancellations_completed".to_string()));

    // Next session: the entry re-arms at the open.
    let next_open = eastern(2026, 8, 6, 9, 31, 0);
    broker.set_now(next_open);
    broker.set_quote("TSLA", dec!(250), next_open);
    broker.set_quote("NVDA", dec!(120), next_open);
    bot.tick(next_open).await.unwrap();

    let fresh_entry = broker.order("M1").expect("re-armed entry next session");
    assert_eq!(fresh_entry.symbol, "TSLA");
    assert_eq!(fresh_entry.side, OrderSide::Buy);
}

#[tokio::test]
async fn test_restart_recovery_converges_without_orders() {
    let config = equity_config("");
    let broker = Arc::new(MockBroker::new());
    let store = memory_store().await;

    let t0 = eastern(2026, 8, 5, 10, 0, 0);
    let placed_at = t0 - Duration::hours(1);

    // Broker truth: position qty 4 protected by P1, plus the already-filled
    // entry P0 whose fill the previous process never recorded.
    let protective = OrderSnapshot {
        order_id: "P1".to_string(),
        symbol: "TSLA".to_string(),
        side: OrderSide::Sell,
        order_type: OrderType::TrailingStop,
        status: OrderStatus::Open,
        qty: dec!(4),
        filled_qty: Decimal::ZERO,
        filled_avg_price: None,
        stop_price: None,
        limit_price: None,
        trailing_pct: Some(dec!(10)),
        parent_id: None,
        created_at: placed_at,
        updated_at: placed_at,
    };
    broker.install_order(protective.clone());
    broker.install_order(OrderSnapshot {
        order_id: "P0".to_string(),
        symbol: "TSLA".to_string(),
        side: OrderSide::Buy,
        order_type: OrderType::Stop,
        status: OrderStatus::Filled,
        qty: dec!(4),
        filled_qty: dec!(4),
        filled_avg_price: Some(dec!(262.50)),
        stop_price: Some(dec!(262.50)),
        limit_price: None,
        trailing_pct: None,
        parent_id: None,
        created_at: placed_at,
        updated_at: t0 - Duration::minutes(30),
    });
    broker.set_positions(vec![tsla_position(dec!(4), dec!(262.50))]);
    broker.set_account(dec!(100000), dec!(50000));
    broker.set_now(t0);

    // Local truth from before the crash.
    store.get_or_create_state("TSLA").await.unwrap();
    store
        .record_protective_placed(&protective, "trailing_stop_placed_after_entry", serde_json::json!({}))
        .await
        .unwrap();

    // Fresh process.
    let mut bot = TradingBot::new(config, broker.clone(), store.clone());
    bot.tick(t0).await.unwrap();

    // The healthy protective is left alone and nothing new is submitted.
    assert_eq!(broker.submission_count(), 0);
    assert!(broker.canceled_ids().is_empty());
    assert!(broker.open_order_ids().contains(&"P1".to_string()));

    // The untracked fill from the downtime gap was attributed exactly once.
    assert!(store.fill_exists("P0:4").await.unwrap());
    let events = event_types(&store).await;
    assert!(!events.contains(&"protective_recreated".to_string()));
}

#[tokio::test]
async fn test_crypto_fixed_stop_cycle() {
    let yaml = r#"
crypto_watchlist: ["BTC/USD"]
allocation:
  per_symbol_usd: 1000
  allow_fractional: true
  min_cash_reserve_percent: 0
entries:
  buy_stop_pct_above_last: 0
stops:
  trailing_stop_pct: 8
risk:
  max_symbol_exposure_usd: 2000
  max_total_exposure_usd: 20000
"#;
    let config = Arc::new(BotConfig::from_yaml_str(yaml).unwrap());
    let broker = Arc::new(MockBroker::new());
    let store = memory_store().await;
    let mut bot = TradingBot::new(config, broker.clone(), store.clone());

    // Saturday 03:00 ET: crypto trades through the weekend.
    let t0 = eastern(2026, 8, 8, 3, 0, 0);
    broker.set_now(t0);
    broker.set_account(dec!(100000), dec!(50000));
    broker.set_quote("BTC/USD", dec!(100000), t0);
    bot.tick(t0).await.unwrap();

    // Crypto entry is a GTC limit at the trigger, not a stop.
    let entry = broker.order("M1").expect("crypto entry");
    assert_eq!(entry.order_type, OrderType::Limit);
    assert_eq!(entry.limit_price, Some(dec!(100000)));
    assert_eq!(entry.qty, dec!(0.01));
    assert!(entry.stop_price.is_none());

    // Entry fills; the protective is a fixed limit 8% below the fill.
    let t1 = t0 + Duration::seconds(30);
    broker.set_now(t1);
    broker.fill_order("M1", dec!(0.01), dec!(100000), t1);
    broker.set_positions(vec![Position {
        symbol: "BTC/USD".to_string(),
        qty: dec!(0.01),
        avg_entry_price: dec!(100000),
        market_value: dec!(1000),
    }]);
    bot.tick(t1).await.unwrap();

    let protective = broker.order("M2").expect("crypto protective");
    assert_eq!(protective.order_type, OrderType::Limit);
    assert_eq!(protective.side, OrderSide::Sell);
    assert_eq!(protective.limit_price, Some(dec!(92000)));
    assert_eq!(protective.qty, dec!(0.01));

    // Price doubles; the fixed stop is not lifted.
    let t2 = t1 + Duration::minutes(5);
    broker.set_now(t2);
    broker.set_quote("BTC/USD", dec!(120000), t2);
    broker.set_positions(vec![Position {
        symbol: "BTC/USD".to_string(),
        qty: dec!(0.01),
        avg_entry_price: dec!(100000),
        market_value: dec!(1200),
    }]);
    let submissions_before = broker.submission_count();
    bot.tick(t2).await.unwrap();
    assert_eq!(broker.submission_count(), submissions_before);
    assert_eq!(
        broker.order("M2").unwrap().limit_price,
        Some(dec!(92000))
    );

    // Retrace to the stop: exit fill starts the cooldown.
    let t3 = t2 + Duration::minutes(5);
    broker.set_now(t3);
    broker.fill_order("M2", dec!(0.01), dec!(92000), t3);
    broker.set_positions(vec![]);
    bot.tick(t3).await.unwrap();

    let state = store.get_state("BTC/USD").await.unwrap().unwrap();
    assert_eq!(state.cooldown_until, Some(t3 + Duration::minutes(20)));
    assert!(event_types(&store).await.contains(&"stopout_cooldown_started".to_string()));
}

#[tokio::test]
async fn test_quote_staleness_boundary() {
    // A quote exactly at the staleness window is accepted.
    let t0 = eastern(2026, 8, 5, 10, 0, 0);
    {
        let config = equity_config("");
        let broker = Arc::new(MockBroker::new());
        let store = memory_store().await;
        let mut bot = TradingBot::new(config, broker.clone(), store.clone());
        broker.set_now(t0);
        broker.set_account(dec!(100000), dec!(50000));
        broker.set_quote("TSLA", dec!(250), t0 - Duration::seconds(30));
        bot.tick(t0).await.unwrap();
        assert_eq!(broker.submission_count(), 1);
    }
    // One second older is rejected.
    {
        let config = equity_config("");
        let broker = Arc::new(MockBroker::new());
        let store = memory_store().await;
        let mut bot = TradingBot::new(config, broker.clone(), store.clone());
        broker.set_now(t0);
        broker.set_account(dec!(100000), dec!(50000));
        broker.set_quote("TSLA", dec!(250), t0 - Duration::seconds(31));
        bot.tick(t0).await.unwrap();
        assert_eq!(broker.submission_count(), 0);
    }
}

#[tokio::test]
async fn test_transport_outage_preserves_state() {
    let config = equity_config("");
    let broker = Arc::new(MockBroker::new());
    let store = memory_store().await;
    let mut bot = TradingBot::new(config, broker.clone(), store.clone());

    let t0 = eastern(2026, 8, 5, 10, 0, 0);
    broker.set_now(t0);
    broker.set_account(dec!(100000), dec!(50000));
    broker.set_quote("TSLA", dec!(250), t0);
    bot.tick(t0).await.unwrap();
    assert_eq!(broker.submission_count(), 1);

    // Cooldown begins, then the broker goes dark.
    let t1 = t0 + Duration::seconds(30);
    broker.set_now(t1);
    broker.fill_order("M1", dec!(4), dec!(262.50), t1);
    broker.set_positions(vec![tsla_position(dec!(4), dec!(262.50))]);
    bot.tick(t1).await.unwrap();

    broker.set_transport_down(true);
    let t2 = t1 + Duration::seconds(30);
    broker.set_now(t2);
    bot.tick(t2).await.unwrap();
    let t3 = t2 + Duration::seconds(30);
    bot.tick(t3).await.unwrap();

    // No state was lost; reconnection resumes where we left off.
    broker.set_transport_down(false);
    let t4 = t3 + Duration::seconds(30);
    broker.set_now(t4);
    bot.tick(t4).await.unwrap();

    let state = store.get_state("TSLA").await.unwrap().unwrap();
    assert_eq!(state.last_trail_id.as_deref(), Some("M2"));
    assert!(broker.open_order_ids().contains(&"M2".to_string()));
    // Still exactly one entry and one protective ever submitted.
    assert_eq!(broker.submission_count(), 2);
}

#[tokio::test]
async fn test_externally_cancelled_protective_is_recreated() {
    let config = equity_config("");
    let broker = Arc::new(MockBroker::new());
    let store = memory_store().await;
    let mut bot = TradingBot::new(config, broker.clone(), store.clone());

    let t0 = eastern(2026, 8, 5, 10, 0, 0);
    broker.set_now(t0);
    broker.set_account(dec!(100000), dec!(50000));
    broker.set_quote("TSLA", dec!(250), t0);
    bot.tick(t0).await.unwrap();

    let t1 = t0 + Duration::seconds(30);
    broker.set_now(t1);
    broker.fill_order("M1", dec!(4), dec!(262.50), t1);
    broker.set_positions(vec![tsla_position(dec!(4), dec!(262.50))]);
    bot.tick(t1).await.unwrap();
    assert!(broker.open_order_ids().contains(&"M2".to_string()));

    // The user cancels the protective by hand.
    let t2 = t1 + Duration::minutes(1);
    broker.set_now(t2);
    broker.expire_order("M2", OrderStatus::Canceled, t2);
    bot.tick(t2).await.unwrap();

    let replacement = broker.order("M3").expect("protective recreated");
    assert_eq!(replacement.side, OrderSide::Sell);
    assert_eq!(replacement.qty, dec!(4));
    assert!(event_types(&store).await.contains(&"protective_recreated".to_string()));
}
