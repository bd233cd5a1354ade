use chrono::{DateTime, TimeZone, Utc};
use dotenvy::dotenv;
use eyre::{eyre, Result};
use std::{env, fmt, str::FromStr, time::Duration};
use tracing::info;

use crate::limiter::LimiterSettings;
use crate::models::TxStatus;
use crate::retry::RetryPolicy;

/// Provider maximum for `getSignaturesForAddress`
pub const MAX_PAGE_SIZE: usize = 1000;

/// How far back a historical scan walks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanHorizon {
    /// Walk to the wallet's first transaction
    Full,
    /// Stop once signatures older than this instant appear
    Since(DateTime<Utc>),
}

impl ScanHorizon {
    /// Whether a signature with this block time lies beyond the horizon
    pub fn excludes(&self, block_time: Option<i64>) -> bool {
        match (self, block_time) {
            (ScanHorizon::Full, _) => false,
            (ScanHorizon::Since(limit), Some(t)) => t < limit.timestamp(),
            (ScanHorizon::Since(_), None) => false,
        }
    }
}

impl FromStr for ScanHorizon {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("full") {
            return Ok(ScanHorizon::Full);
        }
        if let Ok(secs) = s.parse::<i64>() {
            return Utc
                .timestamp_opt(secs, 0)
                .single()
                .map(ScanHorizon::Since)
                .ok_or_else(|| format!("horizon timestamp {} out of range", secs));
        }
        DateTime::parse_from_rfc3339(s)
            .map(|dt| ScanHorizon::Since(dt.with_timezone(&Utc)))
            .map_err(|e| format!("invalid SCAN_HORIZON '{}': {}", s, e))
    }
}

#[derive(Clone)]
pub struct Config {
    pub rpc_http_url: String,
    pub rpc_api_key: Option<String>, // attached to every provider call
    pub wallet_address: String,
    pub db_path: String,
    pub port: u16,
    pub requests_per_second: f64,
    pub error_penalty: Duration,
    pub cooldown_base: Duration,
    pub cooldown_max: Duration,
    pub max_retries: u32,
    pub retry_base: Duration,
    pub retry_max: Duration,
    pub page_size: usize,
    pub time_budget: Duration,
    pub poll_interval: Duration,
    pub unit_scale: u64,
    pub commitment: TxStatus,
    pub horizon: ScanHorizon,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("rpc_http_url", &self.rpc_http_url)
            .field("rpc_api_key", &self.rpc_api_key.as_ref().map(|_| "<redacted>"))
            .field("wallet_address", &self.wallet_address)
            .field("db_path", &self.db_path)
            .field("port", &self.port)
            .field("requests_per_second", &self.requests_per_second)
            .field("page_size", &self.page_size)
            .field("time_budget", &self.time_budget)
            .field("commitment", &self.commitment)
            .field("horizon", &self.horizon)
            .finish_non_exhaustive()
    }
}

impl Config {
    pub fn limiter_settings(&self) -> LimiterSettings {
        LimiterSettings {
            requests_per_second: self.requests_per_second,
            per_error_penalty: self.error_penalty,
            cooldown_base: self.cooldown_base,
            cooldown_max: self.cooldown_max,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: self.retry_base,
            max_delay: self.retry_max,
        }
    }
}

/// Lowest accepted request rate, one call every 1000 seconds
pub const MIN_REQUESTS_PER_SECOND: f64 = 0.001;

/// Upper bound for budgets, cooldowns and poll intervals
pub const MAX_DURATION_SECS: u64 = 86_400;

fn parse_or<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    get(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn secs_or(get: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> Duration {
    Duration::from_secs(parse_or(get, key, default).min(MAX_DURATION_SECS))
}

fn millis_or(get: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> Duration {
    Duration::from_millis(parse_or(get, key, default).min(MAX_DURATION_SECS * 1000))
}

pub fn load() -> Result<Config> {
    dotenv().ok(); // optional .env file

    let cfg = from_lookup(|key| env::var(key).ok())?;
    info!("Loaded config: {:?}", cfg);

    Ok(cfg)
}

/// Build a config from any key lookup, the process environment in `load`
pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Config> {
    let rpc_http_url = get("RPC_HTTP_URL")
        .unwrap_or_else(|| "https://api.mainnet-beta.solana.com".to_string());

    let rpc_api_key = get("RPC_API_KEY").filter(|k| !k.trim().is_empty());

    let wallet_address = get("WALLET_ADDRESS")
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| eyre!("WALLET_ADDRESS must be set"))?;

    // Required, there is no default horizon
    let horizon: ScanHorizon = get("SCAN_HORIZON")
        .ok_or_else(|| eyre!("SCAN_HORIZON must be set to `full` or a timestamp"))?
        .parse()
        .map_err(|e: String| eyre!(e))?;

    let commitment: TxStatus = get("COMMITMENT")
        .unwrap_or_else(|| "confirmed".to_string())
        .parse()
        .map_err(|e: String| eyre!(e))?;

    let requests_per_second: f64 = parse_or(&get, "REQUESTS_PER_SECOND", 2.0);
    if !requests_per_second.is_finite() || requests_per_second < MIN_REQUESTS_PER_SECOND {
        return Err(eyre!(
            "REQUESTS_PER_SECOND must be a number of at least {}",
            MIN_REQUESTS_PER_SECOND
        ));
    }

    Ok(Config {
        rpc_http_url,
        rpc_api_key,
        wallet_address,
        db_path: get("DATABASE_URL").unwrap_or_else(|| "ledger.db".to_string()),
        port: parse_or(&get, "PORT", 8080),
        requests_per_second,
        error_penalty: millis_or(&get, "ERROR_PENALTY_MS", 250),
        cooldown_base: millis_or(&get, "COOLDOWN_BASE_MS", 1000),
        cooldown_max: secs_or(&get, "COOLDOWN_MAX_SECS", 300),
        max_retries: parse_or(&get, "MAX_RETRIES", 3),
        retry_base: millis_or(&get, "RETRY_BASE_MS", 500),
        retry_max: millis_or(&get, "RETRY_MAX_MS", 8000),
        page_size: parse_or(&get, "PAGE_SIZE", 100usize).clamp(1, MAX_PAGE_SIZE),
        time_budget: secs_or(&get, "TIME_BUDGET_SECS", 50),
        poll_interval: secs_or(&get, "POLL_INTERVAL_SECS", 60),
        unit_scale: parse_or(&get, "UNIT_SCALE", 1_000_000_000u64).max(1),
        commitment,
        horizon,
    })
}
