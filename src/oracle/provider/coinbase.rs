//! Coinbase Exchange REST adapter
//!
//! Polls the public product ticker endpoint per pair on a fixed interval.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::types::{CurrencyPair, ProviderName, TickerPrice};

use super::{Endpoint, Provider, ProviderError, TickerCache};

#[derive(Debug, Deserialize)]
struct ProductTicker {
    price: String,
    volume: String,
    time: DateTime<Utc>,
}

pub struct CoinbaseProvider {
    cache: Arc<TickerCache>,
}

impl CoinbaseProvider {
    pub fn new(endpoint: Endpoint, pairs: Vec<CurrencyPair>, cancel: CancellationToken) -> Self {
        let cache = Arc::new(TickerCache::new());
        tokio::spawn(run_poller(endpoint, pairs, cache.clone(), cancel));
        Self { cache }
    }
}

#[async_trait]
impl Provider for CoinbaseProvider {
    fn name(&self) -> ProviderName {
        ProviderName::new("coinbase")
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
            warn!(provider = "coinbase", error = %err, "failed to build http client");
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
                Ok((price, volume, time)) => {
                    cache.set_ticker(pair.symbol(), price, volume, time);
                }
                Err(err) => {
                    debug!(provider = "coinbase", pair = %pair, error = %err, "poll failed");
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
) -> Result<(Decimal, Decimal, DateTime<Utc>)> {
    let product = format!("{}-{}", pair.base, pair.quote);
    let mut last_error = None;

    for url in urls {
        let request_url = format!("{}/products/{}/ticker", url.trim_end_matches('/'), product);
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
        let ticker: ProductTicker = response.json().await.context("bad ticker response")?;
        let price = ticker.price.parse().context("bad price")?;
        let volume = ticker.volume.parse().context("bad volume")?;
        return Ok((price, volume, ticker.time));
    }

    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("no urls configured")))
}
