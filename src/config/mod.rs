use anyhow::Context;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::market_data::adapters::coingecko::{CoinGeckoSettings, DEFAULT_BASE_URL};
use crate::refresh::scheduler::DEFAULT_REFRESH_INTERVAL;

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub listen_addr: SocketAddr,
    pub provider_url: String,
    pub api_key: Option<String>,
    pub page_size: u32,
    pub refresh_interval: Duration,
    pub fetch_timeout: Duration,
    /// `None` keeps the snapshot in memory only.
    pub snapshot_path: Option<PathBuf>,
    pub cors_allow: Vec<String>,
    pub metrics_addr: Option<SocketAddr>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        // dotenvy loads .env, but doesn't override already-set env vars
        dotenvy::dotenv().ok();

        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key/value source. Unset and blank values
    /// fall back to defaults; present but unparsable values are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string());
        let non_empty = |key: &str| get(key).filter(|v| !v.is_empty());

        let refresh_secs: u64 = parse_or(&non_empty, "REFRESH_INTERVAL_SECS", DEFAULT_REFRESH_INTERVAL.as_secs())?;
        let timeout_secs: u64 = parse_or(&non_empty, "FETCH_TIMEOUT_SECS", 10)?;
        let page_size: u32 = parse_or(&non_empty, "PAGE_SIZE", 100)?;

        anyhow::ensure!(refresh_secs > 0, "REFRESH_INTERVAL_SECS must be positive");
        anyhow::ensure!(timeout_secs > 0, "FETCH_TIMEOUT_SECS must be positive");
        anyhow::ensure!((1..=250).contains(&page_size), "PAGE_SIZE must be between 1 and 250");

        // An explicitly empty SNAPSHOT_PATH disables persistence.
        let snapshot_path = match get("SNAPSHOT_PATH") {
            None => Some(PathBuf::from("data/snapshot.json")),
            Some(p) if p.is_empty() => None,
            Some(p) => Some(PathBuf::from(p)),
        };

        let metrics_addr = non_empty("METRICS_ADDR")
            .map(|v| v.parse::<SocketAddr>().with_context(|| format!("invalid METRICS_ADDR: {v}")))
            .transpose()?;

        Ok(Self {
            log_level: non_empty("RUST_LOG").unwrap_or_else(|| "info".to_string()),
            listen_addr: parse_or(&non_empty, "LISTEN_ADDR", SocketAddr::from(([0, 0, 0, 0], 5000)))?,
            provider_url: non_empty("PROVIDER_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key: non_empty("COINGECKO_API_KEY"),
            page_size,
            refresh_interval: Duration::from_secs(refresh_secs),
            fetch_timeout: Duration::from_secs(timeout_secs),
            snapshot_path,
            cors_allow: non_empty("CORS_ALLOW_ORIGINS")
                .unwrap_or_else(|| "*".to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            metrics_addr,
        })
    }

    pub fn coingecko(&self) -> CoinGeckoSettings {
        CoinGeckoSettings {
            base_url: self.provider_url.clone(),
            api_key: self.api_key.clone(),
            page_size: self.page_size,
            timeout: self.fetch_timeout,
        }
    }
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(key) {
        Some(raw) => raw.parse().with_context(|| format!("invalid {key}: {raw}")),
        None => Ok(default),
    }
}
