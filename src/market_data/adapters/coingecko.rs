use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue};
use reqwest::{Client, ClientBuilder};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::{FetchError, QuoteFetcher};
use crate::market_data::types::QuoteRecord;

pub const DEFAULT_BASE_URL: &str = "https://api.coingecko.com/api/v3";
const MARKETS_PATH: &str = "/coins/markets";
const API_KEY_HEADER: &str = "x-cg-demo-api-key";

#[derive(Debug, Clone)]
pub struct CoinGeckoSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub page_size: u32,
    pub timeout: Duration,
}

impl Default for CoinGeckoSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            page_size: 100,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Query string of `/coins/markets`. Everything but the page size is fixed.
#[derive(Serialize, Debug)]
struct MarketsParams {
    vs_currency: &'static str,
    order: &'static str,
    per_page: u32,
    page: u32,
    sparkline: bool,
}

/// The subset of a `/coins/markets` entry this service consumes.
#[derive(Deserialize, Debug)]
pub struct CoinMarket {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub symbol: String,
    pub current_price: Option<Decimal>,
    pub price_change_percentage_24h: Option<Decimal>,
    pub market_cap: Option<Decimal>,
    pub total_volume: Option<Decimal>,
    pub circulating_supply: Option<Decimal>,
}

pub struct CoinGeckoFetcher {
    reqwest: Client,
    markets_url: String,
    params: MarketsParams,
    timeout: Duration,
}

impl CoinGeckoFetcher {
    pub fn new(settings: CoinGeckoSettings) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        if let Some(key) = settings.api_key.as_deref() {
            headers.insert(
                API_KEY_HEADER,
                HeaderValue::from_str(key).context("invalid CoinGecko API key")?,
            );
        }

        let reqwest = ClientBuilder::new()
            .default_headers(headers)
            .timeout(settings.timeout)
            .build()
            .context("failed to build reqwest client")?;

        Ok(Self {
            reqwest,
            markets_url: format!("{}{}", settings.base_url.trim_end_matches('/'), MARKETS_PATH),
            params: MarketsParams {
                vs_currency: "usd",
                order: "market_cap_desc",
                per_page: settings.page_size,
                page: 1,
                sparkline: false,
            },
            timeout: settings.timeout,
        })
    }

    fn classify(&self, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout(self.timeout)
        } else {
            err.into()
        }
    }
}

#[async_trait]
impl QuoteFetcher for CoinGeckoFetcher {
    fn name(&self) -> &'static str {
        "coingecko"
    }

    async fn fetch(&self) -> Result<Vec<QuoteRecord>, FetchError> {
        let response = self
            .reqwest
            .get(&self.markets_url)
            .query(&self.params)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        // Read the body first so a decode failure is reported as malformed
        // rather than as a transport error.
        let body = response.bytes().await.map_err(|e| self.classify(e))?;
        let coins: Vec<CoinMarket> =
            serde_json::from_slice(&body).map_err(|e| FetchError::Malformed(e.to_string()))?;

        debug!(count = coins.len(), "coingecko markets received");
        normalize(coins)
    }
}

/// Maps provider entries field-for-field. One unusable entry fails the
/// whole batch.
pub fn normalize(coins: Vec<CoinMarket>) -> Result<Vec<QuoteRecord>, FetchError> {
    coins.into_iter().map(normalize_one).collect()
}

fn normalize_one(coin: CoinMarket) -> Result<QuoteRecord, FetchError> {
    let label = if coin.id.is_empty() { coin.symbol.clone() } else { coin.id.clone() };

    if coin.symbol.trim().is_empty() {
        return Err(FetchError::Malformed(format!("{label}: empty symbol")));
    }

    let current_price = coin
        .current_price
        .ok_or_else(|| FetchError::Malformed(format!("{label}: missing current_price")))?;
    let price_change_24h = coin.price_change_percentage_24h.ok_or_else(|| {
        FetchError::Malformed(format!("{label}: missing price_change_percentage_24h"))
    })?;

    non_negative(&label, "current_price", Some(current_price))?;
    non_negative(&label, "market_cap", coin.market_cap)?;
    non_negative(&label, "total_volume", coin.total_volume)?;
    non_negative(&label, "circulating_supply", coin.circulating_supply)?;

    Ok(QuoteRecord {
        name: coin.name,
        symbol: coin.symbol,
        current_price,
        price_change_24h,
        market_cap: coin.market_cap,
        volume: coin.total_volume,
        circulating_supply: coin.circulating_supply,
    })
}

fn non_negative(label: &str, field: &str, value: Option<Decimal>) -> Result<(), FetchError> {
    match value {
        Some(v) if v.is_sign_negative() && !v.is_zero() => Err(FetchError::Malformed(format!(
            "{label}: negative {field} ({v})"
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Query;
    use axum::http::{HeaderMap as AxumHeaders, StatusCode};
    use axum::routing::get;
    use axum::{Json, Router};
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    const PAYLOAD: &str = r#"[
        {
            "id": "bitcoin",
            "symbol": "btc",
            "name": "Bitcoin",
            "current_price": 42000.5,
            "market_cap": 822000000000,
            "total_volume": 18000000000.25,
            "circulating_supply": 19600000.0,
            "price_change_percentage_24h": -3.2,
            "image": "https://example.invalid/btc.png"
        },
        {
            "id": "ethereum",
            "symbol": "eth",
            "name": "Ethereum",
            "current_price": 2250,
            "market_cap": null,
            "total_volume": null,
            "circulating_supply": null,
            "price_change_percentage_24h": 1.05
        }
    ]"#;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn fetcher(base_url: String, timeout: Duration) -> CoinGeckoFetcher {
        CoinGeckoFetcher::new(CoinGeckoSettings {
            base_url,
            api_key: Some("demo-key".to_string()),
            page_size: 2,
            timeout,
        })
        .unwrap()
    }

    #[test]
    fn normalizes_provider_fields() {
        let coins: Vec<CoinMarket> = serde_json::from_str(PAYLOAD).unwrap();
        let quotes = normalize(coins).unwrap();

        assert_eq!(quotes.len(), 2);
        let btc = &quotes[0];
        assert_eq!(btc.name, "Bitcoin");
        assert_eq!(btc.symbol, "btc");
        assert_eq!(btc.current_price, dec!(42000.5));
        assert_eq!(btc.price_change_24h, dec!(-3.2));
        assert_eq!(btc.market_cap, Some(dec!(822000000000)));
        assert_eq!(btc.volume, Some(dec!(18000000000.25)));
        assert_eq!(btc.circulating_supply, Some(dec!(19600000)));

        let eth = &quotes[1];
        assert_eq!(eth.current_price, dec!(2250));
        assert_eq!(eth.market_cap, None);
    }

    #[test]
    fn missing_price_fails_whole_batch() {
        let coins: Vec<CoinMarket> = serde_json::from_str(
            r#"[
                {"id": "a", "symbol": "a", "name": "A", "current_price": 1, "price_change_percentage_24h": 0},
                {"id": "b", "symbol": "b", "name": "B", "current_price": null, "price_change_percentage_24h": 0}
            ]"#,
        )
        .unwrap();

        let err = normalize(coins).unwrap_err();
        assert!(matches!(err, FetchError::Malformed(ref m) if m.contains("current_price")));
    }

    #[test]
    fn negative_market_cap_is_malformed() {
        let coins: Vec<CoinMarket> = serde_json::from_str(
            r#"[{"id": "a", "symbol": "a", "name": "A", "current_price": 1,
                 "price_change_percentage_24h": -50, "market_cap": -10}]"#,
        )
        .unwrap();

        assert!(matches!(normalize(coins), Err(FetchError::Malformed(_))));
    }

    #[tokio::test]
    async fn fetch_sends_fixed_query_and_api_key() {
        let router = Router::new().route(
            "/coins/markets",
            get(
                |Query(params): Query<HashMap<String, String>>, headers: AxumHeaders| async move {
                    let key_ok = headers
                        .get("x-cg-demo-api-key")
                        .is_some_and(|v| v == "demo-key");
                    let query_ok = params.get("vs_currency").map(String::as_str) == Some("usd")
                        && params.get("order").map(String::as_str) == Some("market_cap_desc")
                        && params.get("per_page").map(String::as_str) == Some("2")
                        && params.get("page").map(String::as_str) == Some("1")
                        && params.get("sparkline").map(String::as_str) == Some("false");

                    if key_ok && query_ok {
                        let body: serde_json::Value = serde_json::from_str(PAYLOAD).unwrap();
                        Ok(Json(body))
                    } else {
                        Err(StatusCode::BAD_REQUEST)
                    }
                },
            ),
        );
        let base = serve(router).await;

        let quotes = fetcher(base, Duration::from_secs(5)).fetch().await.unwrap();
        assert_eq!(quotes.len(), 2);
        assert_eq!(quotes[0].current_price, dec!(42000.5));
    }

    #[tokio::test]
    async fn non_success_status_is_reported() {
        let router = Router::new().route(
            "/coins/markets",
            get(|| async { StatusCode::TOO_MANY_REQUESTS }),
        );
        let base = serve(router).await;

        let err = fetcher(base, Duration::from_secs(5)).fetch().await.unwrap_err();
        assert_eq!(err, FetchError::Status(429));
    }

    #[tokio::test]
    async fn undecodable_body_is_malformed() {
        let router = Router::new().route("/coins/markets", get(|| async { "{\"error\":" }));
        let base = serve(router).await;

        let err = fetcher(base, Duration::from_secs(5)).fetch().await.unwrap_err();
        assert!(matches!(err, FetchError::Malformed(_)));
    }

    #[tokio::test]
    async fn slow_provider_times_out() {
        let router = Router::new().route(
            "/coins/markets",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "[]"
            }),
        );
        let base = serve(router).await;

        let timeout = Duration::from_millis(100);
        let err = fetcher(base, timeout).fetch().await.unwrap_err();
        assert_eq!(err, FetchError::Timeout(timeout));
    }
}
