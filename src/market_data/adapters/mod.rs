pub mod coingecko;
#[cfg(test)]
pub(crate) mod scripted;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::market_data::types::QuoteRecord;

/// Why a provider call produced no records. Every variant means the whole
/// fetch failed; no partial result is ever returned alongside it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),

    #[error("provider responded with status {0}")]
    Status(u16),

    #[error("malformed provider payload: {0}")]
    Malformed(String),

    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            FetchError::Status(status.as_u16())
        } else if err.is_decode() {
            FetchError::Malformed(err.to_string())
        } else {
            FetchError::Network(err.to_string())
        }
    }
}

/// Source of normalized quotes. Implementations hold no state between calls.
#[async_trait]
pub trait QuoteFetcher: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch(&self) -> Result<Vec<QuoteRecord>, FetchError>;
}
