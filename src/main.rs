use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use trailbot::application::api::{self, ApiState};
use trailbot::application::services::orchestrator::TradingBot;
use trailbot::config::BotConfig;
use trailbot::infrastructure::alpaca::AlpacaBroker;
use trailbot::persistence::{self, repository::Store};
use trailbot::rate_limit::BrokerRateLimiter;
use trailbot::secrets;
use trailbot::task_runner::{run_supervised, TaskPolicy};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trailbot=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(code) = run().await {
        std::process::exit(code);
    }
}

async fn run() -> Result<(), i32> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());
    let config = match BotConfig::load(&config_path) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!(path = %config_path, error = %e, "failed to load configuration");
            return Err(1);
        }
    };
    info!(
        path = %config_path,
        symbols = config.symbols().len(),
        mode = ?config.mode,
        "configuration loaded"
    );

    let credentials = match secrets::load_broker_credentials() {
        Ok(credentials) => credentials,
        Err(e) => {
            error!(error = %e, "failed to load broker credentials");
            return Err(1);
        }
    };

    let pool = match persistence::init_database(&config.persistence.db_url).await {
        Ok(pool) => pool,
        Err(e) => {
            error!(error = %e, "failed to initialize database");
            return Err(1);
        }
    };
    let store = Store::new(pool);

    let broker = match AlpacaBroker::new(&credentials, config.mode, BrokerRateLimiter::default()) {
        Ok(broker) => Arc::new(broker),
        Err(e) => {
            error!(error = %e, "failed to build broker client");
            return Err(1);
        }
    };

    // Read-only monitoring surface, supervised so a bind hiccup does not
    // take the bot down.
    let api_state = ApiState::new(store.clone(), config.clone());
    let monitor_addr: SocketAddr = match format!("{}:{}", config.monitor.bind, config.monitor.port)
        .parse()
    {
        Ok(addr) => addr,
        Err(e) => {
            error!(error = %e, "invalid monitor bind address");
            return Err(1);
        }
    };
    tokio::spawn(async move {
        let supervised = run_supervised("monitor-server", TaskPolicy::default(), move || {
            let state = api_state.clone();
            async move {
                let listener = tokio::net::TcpListener::bind(monitor_addr)
                    .await
                    .map_err(|e| format!("bind {}: {}", monitor_addr, e))?;
                info!(addr = %monitor_addr, "monitoring endpoint listening");
                axum::serve(listener, api::router(state))
                    .await
                    .map_err(|e| e.to_string())
            }
        })
        .await;
        if let Err(gave_up) = supervised {
            error!(error = %gave_up, "monitoring endpoint gave up");
        }
    });

    // SIGINT/SIGTERM flip the shutdown flag; the bot finishes its tick,
    // flushes, and leaves open orders with the broker.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to install Ctrl+C handler");
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(e) => error!(error = %e, "failed to install SIGTERM handler"),
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("received Ctrl+C"),
            _ = terminate => info!("received SIGTERM"),
        }
        let _ = shutdown_tx.send(true);
    });

    // The trading loop runs supervised too: a store hiccup gets a few
    // backed-off restarts, each of which rebuilds the bot and re-derives
    // every symbol's status from the broker snapshot. Exhausting the
    // failure budget exits non-zero so an outer supervisor takes over with
    // a fresh reconciliation.
    let supervised = run_supervised("trading-loop", TaskPolicy::default(), move || {
        let config = config.clone();
        let broker = broker.clone();
        let store = store.clone();
        let shutdown = shutdown_rx.clone();
        async move {
            let mut bot = TradingBot::new(config, broker, store);
            bot.run(shutdown).await.map_err(|e| e.to_string())
        }
    })
    .await;

    match supervised {
        Ok(()) => {
            info!("shutdown complete");
            Ok(())
        }
        Err(gave_up) => {
            error!(error = %gave_up, "fatal error");
            Err(1)
        }
    }
}
