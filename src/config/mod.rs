use rust_decimal::Decimal;
use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use crate::engine::{DecisionConfig, ExecutionConfig, RiskLoopConfig};
use crate::models::WalletTarget;

const DEFAULT_EXCHANGE_API_BASE: &str = "https://clob.example-exchange.com";
const DEFAULT_DATA_API_BASE: &str = "https://data-api.example-exchange.com";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: Option<String>,

    // Exchange API endpoints + credentials (required for live trading)
    pub exchange_api_base: String,
    pub data_api_base: String,
    pub exchange_api_key: Option<String>,
    pub exchange_api_secret: Option<String>,
    pub exchange_passphrase: Option<String>,

    // Mirroring
    pub wallet_targets: Vec<WalletTarget>,
    pub global_budget_cap: Decimal,
    pub max_position_budget: Decimal,
    pub stop_loss_pct: Decimal,
    pub take_profit_pct: Decimal,

    // Execution tuning
    pub liquidity_fraction: Decimal,
    pub depth_levels: usize,
    pub chunk_cooldown_ms: u64,
    pub max_illiquid_retries: u32,
    pub max_chunk_attempts: u32,
    pub io_timeout_secs: u64,

    // Scheduling
    pub risk_interval_secs: u64,
    pub signal_poll_interval_secs: u64,

    // Modes
    pub dry_run: bool,
    pub sim_balance: Decimal,
    pub metrics_addr: SocketAddr,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let targets_raw = env::var("WALLET_TARGETS").unwrap_or_default();
        let wallet_targets = parse_wallet_targets(&targets_raw)?;

        Ok(Self {
            database_url: env::var("DATABASE_URL").ok(),

            exchange_api_base: env::var("EXCHANGE_API_BASE")
                .unwrap_or_else(|_| DEFAULT_EXCHANGE_API_BASE.into()),
            data_api_base: env::var("DATA_API_BASE")
                .unwrap_or_else(|_| DEFAULT_DATA_API_BASE.into()),
            exchange_api_key: env::var("EXCHANGE_API_KEY").ok(),
            exchange_api_secret: env::var("EXCHANGE_API_SECRET").ok(),
            exchange_passphrase: env::var("EXCHANGE_PASSPHRASE").ok(),

            wallet_targets,
            global_budget_cap: parse_decimal("GLOBAL_BUDGET_CAP", "1000"),
            max_position_budget: parse_decimal("MAX_POSITION_BUDGET", "250"),
            stop_loss_pct: parse_decimal("STOP_LOSS_PCT", "0.20"),
            take_profit_pct: parse_decimal("TAKE_PROFIT_PCT", "0.90"),

            liquidity_fraction: parse_decimal("LIQUIDITY_FRACTION", "0.25"),
            depth_levels: parse_num("DEPTH_LEVELS", 5),
            chunk_cooldown_ms: parse_num("CHUNK_COOLDOWN_MS", 2_000),
            max_illiquid_retries: parse_num("MAX_ILLIQUID_RETRIES", 6),
            max_chunk_attempts: parse_num("MAX_CHUNK_ATTEMPTS", 4),
            io_timeout_secs: parse_num("IO_TIMEOUT_SECS", 10),

            risk_interval_secs: parse_num("RISK_INTERVAL_SECS", 60),
            signal_poll_interval_secs: parse_num("SIGNAL_POLL_INTERVAL_SECS", 3),

            dry_run: env::var("DRY_RUN")
                .unwrap_or_else(|_| "true".into())
                .parse()
                .unwrap_or(true),
            sim_balance: parse_decimal("SIM_BALANCE", "10000"),
            metrics_addr: env::var("METRICS_ADDR")
                .unwrap_or_else(|_| "127.0.0.1:9464".into())
                .parse()?,
        })
    }

    /// Returns true if all exchange API credentials are configured.
    pub fn has_exchange_auth(&self) -> bool {
        self.exchange_api_key.is_some()
            && self.exchange_api_secret.is_some()
            && self.exchange_passphrase.is_some()
    }

    pub fn decision_config(&self) -> DecisionConfig {
        DecisionConfig {
            global_budget_cap: self.global_budget_cap,
            max_position_budget: self.max_position_budget,
            default_stop_loss_pct: self.stop_loss_pct,
            default_take_profit_pct: self.take_profit_pct,
            ..DecisionConfig::default()
        }
    }

    pub fn execution_config(&self) -> ExecutionConfig {
        ExecutionConfig {
            liquidity_fraction: self.liquidity_fraction,
            depth_levels: self.depth_levels,
            chunk_cooldown: Duration::from_millis(self.chunk_cooldown_ms),
            max_illiquid_retries: self.max_illiquid_retries,
            max_chunk_attempts: self.max_chunk_attempts,
            io_timeout: Duration::from_secs(self.io_timeout_secs),
            ..ExecutionConfig::default()
        }
    }

    pub fn risk_loop_config(&self) -> RiskLoopConfig {
        RiskLoopConfig {
            interval: Duration::from_secs(self.risk_interval_secs),
            io_timeout: Duration::from_secs(self.io_timeout_secs),
        }
    }
}

/// Parse the `addr:ratio[:cap]` list from `WALLET_TARGETS`.
fn parse_wallet_targets(raw: &str) -> anyhow::Result<Vec<WalletTarget>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(WalletTarget::parse)
        .collect()
}

fn parse_decimal(var: &str, default: &str) -> Decimal {
    env::var(var)
        .unwrap_or_else(|_| default.into())
        .parse()
        .unwrap_or_else(|_| default.parse().expect("default must parse"))
}

fn parse_num<T: std::str::FromStr>(var: &str, default: T) -> T {
    env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
