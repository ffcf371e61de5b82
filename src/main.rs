use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mirrorbot::config::AppConfig;
use mirrorbot::engine::{run_decision_loop, run_risk_loop, DecisionEngine, DripExecutor};
use mirrorbot::exchange::auth::ApiAuth;
use mirrorbot::exchange::{ExchangePort, LiveExchange, SimulatedExchange};
use mirrorbot::ledger::{LedgerStore, MemoryStore, PgLedgerStore, PositionLedger};
use mirrorbot::models::TradeEvent;
use mirrorbot::signal::{run_signal_poller, ActivityClient};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;
    mirrorbot::metrics::init_metrics(config.metrics_addr);

    if config.wallet_targets.is_empty() {
        tracing::warn!("WALLET_TARGETS is empty — no wallets will be mirrored");
    }

    // --- Ledger ---
    let store: Arc<dyn LedgerStore> = match &config.database_url {
        Some(url) => {
            tracing::info!("Connecting to database...");
            let store = PgLedgerStore::connect(url).await?;
            tracing::info!("Database connected");
            Arc::new(store)
        }
        None => {
            tracing::warn!("DATABASE_URL not set — ledger will not survive restarts");
            Arc::new(MemoryStore::new())
        }
    };
    let ledger = Arc::new(PositionLedger::hydrate(store).await?);

    // --- Exchange port: live or simulated, same interface ---
    let exchange: Arc<dyn ExchangePort> = if config.dry_run {
        tracing::info!(
            balance = %config.sim_balance,
            "Dry-run mode — routing all orders to the simulated exchange"
        );
        Arc::new(SimulatedExchange::with_default_book(config.sim_balance))
    } else if config.has_exchange_auth() {
        let auth = ApiAuth::from_base64(
            config.exchange_api_key.clone().unwrap_or_default(),
            config.exchange_api_secret.as_deref().unwrap_or_default(),
            config.exchange_passphrase.clone().unwrap_or_default(),
        )?;
        Arc::new(LiveExchange::new(
            reqwest::Client::new(),
            auth,
            config.exchange_api_base.clone(),
        ))
    } else {
        anyhow::bail!(
            "live mode requires EXCHANGE_API_KEY, EXCHANGE_API_SECRET and EXCHANGE_PASSPHRASE"
        );
    };

    let halt = Arc::new(AtomicBool::new(false));
    let shutdown = Arc::new(AtomicBool::new(false));

    let executor = Arc::new(DripExecutor::new(
        exchange.clone(),
        ledger.clone(),
        config.execution_config(),
        halt.clone(),
    ));
    let engine = Arc::new(DecisionEngine::new(
        ledger,
        executor,
        config.wallet_targets.clone(),
        config.decision_config(),
        halt,
    ));

    // --- Signal pipeline: poller → channel → decision loop ---
    let (signal_tx, signal_rx) = tokio::sync::mpsc::channel::<TradeEvent>(500);

    let activity_client = ActivityClient::new(reqwest::Client::new(), config.data_api_base.clone());
    tokio::spawn(run_signal_poller(
        activity_client,
        config.wallet_targets.clone(),
        signal_tx,
        Duration::from_secs(config.signal_poll_interval_secs),
        shutdown.clone(),
    ));

    tokio::spawn(run_decision_loop(engine.clone(), signal_rx, shutdown.clone()));

    // --- Protective-exit loop ---
    tokio::spawn(run_risk_loop(
        engine,
        exchange,
        config.risk_loop_config(),
        shutdown.clone(),
    ));

    tracing::info!("mirrorbot running — press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    shutdown.store(true, Ordering::Relaxed);
    tracing::info!("Shutting down");

    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();
}
