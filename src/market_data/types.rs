use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::{Duration, SystemTime};
use tracing::warn;

/// One asset's market data at a point in time, in the shape served to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteRecord {
    pub name: String,
    pub symbol: String,
    pub current_price: Decimal,
    /// 24h change as a percentage, passed through from the provider.
    #[serde(rename = "priceChange24h")]
    pub price_change_24h: Decimal,
    pub market_cap: Option<Decimal>,
    pub volume: Option<Decimal>,
    pub circulating_supply: Option<Decimal>,
}

/// Immutable set of quotes produced by one successful refresh cycle.
///
/// Readers hold an `Arc<Snapshot>`, so a commit never mutates what a reader
/// already has; it swaps in a new value.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    generation: u64,
    fetched_at: Option<SystemTime>,
    quotes: Vec<QuoteRecord>,
}

impl Snapshot {
    /// The state before anything has been installed.
    pub fn empty() -> Self {
        Self {
            generation: 0,
            fetched_at: None,
            quotes: Vec::new(),
        }
    }

    /// Builds a snapshot, dropping records whose symbol (case-insensitive)
    /// was already seen. The provider orders by market cap, so the kept
    /// record is the largest asset using that symbol.
    pub fn new(generation: u64, fetched_at: SystemTime, quotes: Vec<QuoteRecord>) -> Self {
        let mut seen = HashSet::with_capacity(quotes.len());
        let quotes = quotes
            .into_iter()
            .filter(|q| {
                let fresh = seen.insert(q.symbol.to_lowercase());
                if !fresh {
                    warn!(symbol = %q.symbol, name = %q.name, "dropping duplicate symbol");
                }
                fresh
            })
            .collect();

        Self {
            generation,
            fetched_at: Some(fetched_at),
            quotes,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// True until the first successful commit.
    pub fn is_cold(&self) -> bool {
        self.generation == 0
    }

    pub fn fetched_at(&self) -> Option<SystemTime> {
        self.fetched_at
    }

    pub fn quotes(&self) -> &[QuoteRecord] {
        &self.quotes
    }

    /// Age relative to `now`; `None` when cold. Clock skew reads as zero.
    pub fn age(&self, now: SystemTime) -> Option<Duration> {
        self.fetched_at
            .map(|t| now.duration_since(t).unwrap_or(Duration::ZERO))
    }

    pub fn find(&self, symbol: &str) -> Option<&QuoteRecord> {
        self.quotes
            .iter()
            .find(|q| q.symbol.eq_ignore_ascii_case(symbol))
    }
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::empty()
    }
}
