use dotenvy::dotenv;
use eyre::{eyre, Result};
use serde::Deserialize;
use std::{env, str::FromStr, time::Duration};
use tracing::{info, warn};

use crate::cycle::DEFAULT_BATCH_SIZE;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub db_path: String,
    pub provider_url: String,         // provider gateway base url
    pub auth_endpoint: String,        // deep-link target in every notification
    pub balance_interval: Duration,
    pub transaction_interval: Duration,
    pub batch_size: usize,
    pub breaker_abandons_batch: bool,
    pub log_debug: bool,
}

/// Parse `key` from the environment, falling back to `default` when unset
/// or unparsable
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("{} has unparsable value {:?}, using default", key, raw);
            default
        }),
        Err(_) => default,
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|raw| parse_bool(&raw))
        .unwrap_or(default)
}

fn interval(key: &str, default_secs: u64) -> Result<Duration> {
    let secs: u64 = env_or(key, default_secs);
    if secs == 0 {
        return Err(eyre!("{} must be at least 1 second", key));
    }
    Ok(Duration::from_secs(secs))
}

/// Load `.env` and report whether debug logging is wanted; called before
/// the subscriber exists so `load` can log
pub fn log_debug() -> bool {
    dotenv().ok();
    env_flag("LOG_DEBUG", true)
}

pub fn load() -> Result<Config> {
    dotenv().ok(); // load from .env file when present

    let db_path = env::var("DATABASE_URL").unwrap_or_else(|_| "cardbroker.db".to_string());
    let provider_url = env::var("PROVIDER_URL").unwrap_or_else(|_| "http://127.0.0.1:9000".to_string());
    let auth_endpoint = env::var("AUTH_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:8080/_/xfb/auth".to_string());

    let balance_interval = interval("CHECK_BALANCE_INTERVAL", 120)?;
    let transaction_interval = interval("CHECK_TRANSACTION_INTERVAL", 10)?;

    let batch_size = env_or("BATCH_SIZE", DEFAULT_BATCH_SIZE).max(1);

    let cfg = Config {
        db_path,
        provider_url,
        auth_endpoint,
        balance_interval,
        transaction_interval,
        batch_size,
        breaker_abandons_batch: env_flag("BREAKER_ABANDONS_BATCH", true),
        log_debug: env_flag("LOG_DEBUG", true),
    };

    info!("Loaded config: {:?}", cfg);

    Ok(cfg)
}
