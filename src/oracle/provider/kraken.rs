//! Kraken REST adapter
//!
//! Polls the public Ticker endpoint. Kraken keys its response by internal
//! pair names (e.g. XXBTZUSD), so each pair is requested on its own and the
//! single entry in the result is taken regardless of its key.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::types::{CurrencyPair, ProviderName, TickerPrice};

use super::{Endpoint, Provider, ProviderError, TickerCache};

#[derive(Debug, Deserialize)]
struct TickerResponse {
    #[serde(default)]
    error: Vec<String>,
    #[serde(default)]
    result: HashMap<String, PairTicker>,
}

#[derive(Debug, Deserialize)]
struct PairTicker {
    /// Last trade: [price, lot volume].
    c: Vec<String>,
    /// Volume: [today, last 24 hours].
    v: Vec<String>,
}

pub struct KrakenProvider {
    cache: Arc<TickerCache>,
}

impl KrakenProvider {
    pub fn new(endpoint: Endpoint, pairs: Vec<CurrencyPair>, cancel: CancellationToken) -> Self {
        let cache = Arc::new(TickerCache::new());
        tokio::spawn(run_poller(endpoint, pairs, cache.clone(), cancel));
        Self { cache }
    }
}

#[async_trait]
impl Provider for KrakenProvider {
    fn name(&self) -> ProviderName {
        ProviderName::new("kraken")
    }

    async fn get_ticker_prices(
        &self,
        pairs: &[CurrencyPair],
    ) -> Result<HashMap<String, TickerPrice>, ProviderError> {
        self.cache.snapshot(pairs)
    }
}

async fn run_poller(
    endpoint: Endpoint,
    pairs: Vec<CurrencyPair>,
    cache: Arc<TickerCache>,
    cancel: CancellationToken,
) {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            warn!(provider = "kraken", error = %err, "failed to build http client");
            return;
        }
    };

    let mut interval = tokio::time::interval(endpoint.poll_interval);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = cancel.cancelled() => return,
        }

        for pair in &pairs {
            match poll_pair(&client, &endpoint.urls, pair).await {
                Ok((price, volume)) => {
                    cache.set_ticker(pair.symbol(), price, volume, Utc::now());
                }
                Err(err) => {
                    debug!(provider = "kraken", pair = %pair, error = %err, "poll failed");
                    cache.set_error(err.to_string());
                }
            }
        }
    }
}

async fn poll_pair(
    client: &reqwest::Client,
    urls: &[String],
    pair: &CurrencyPair,
) -> Result<(Decimal, Decimal)> {
    let mut last_error = None;

    for url in urls {
        let request_url = format!(
            "{}/0/public/Ticker?pair={}",
            url.trim_end_matches('/'),
            pair.symbol()
        );
        let response = match client.get(&request_url).send().await {
            Ok(response) => response,
            Err(err) => {
                last_error = Some(anyhow::Error::from(err));
                continue;
            }
        };
        if !response.status().is_success() {
            last_error = Some(anyhow::anyhow!("status {}", response.status()));
            continue;
        }
        let body: TickerResponse = response.json().await.context("bad ticker response")?;
        return parse_ticker(body);
    }

    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("no urls configured")))
}

fn parse_ticker(body: TickerResponse) -> Result<(Decimal, Decimal)> {
    if !body.error.is_empty() {
        bail!("kraken error: {}", body.error.join(", "));
    }
    let ticker = body
        .result
        .into_values()
        .next()
        .context("empty ticker result")?;
    let price = ticker
        .c
        .first()
        .context("missing last trade price")?
        .parse()
        .context("bad price")?;
    let volume = ticker
        .v
        .get(1)
        .context("missing 24h volume")?
        .parse()
        .context("bad volume")?;
    Ok((price, volume))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn ticker_response_parses() {
        let body = r#"{
            "error": [],
            "result": {
                "ATOMUSD": {
                    "a": ["10.26", "120", "120.000"],
                    "b": ["10.24", "5", "5.000"],
                    "c": ["10.25", "0.5"],
                    "v": ["1234.5", "56789.1"],
                    "p": ["10.21", "10.19"],
                    "t": [4100, 9500],
                    "l": ["9.90", "9.85"],
                    "h": ["10.50", "10.55"],
                    "o": "10.00"
                }
            }
        }"#;
        let response: TickerResponse = serde_json::from_str(body).unwrap();
        let (price, volume) = parse_ticker(response).unwrap();
        assert_eq!(price, dec!(10.25));
        assert_eq!(volume, dec!(56789.1));
    }

    #[test]
    fn kraken_error_is_surfaced() {
        let body = r#"{"error": ["EQuery:Unknown asset pair"], "result": {}}"#;
        let response: TickerResponse = serde_json::from_str(body).unwrap();
        assert!(parse_ticker(response).is_err());
    }
}
