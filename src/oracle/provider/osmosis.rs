//! Osmosis LCD adapter
//!
//! Queries pool state through a chain LCD node and derives the spot price
//! from the weighted pool balances. Pool ids come from the
//! `[contract_addresses.osmosis]` config table, keyed by symbol. Pools do
//! not expose trade volume here, so tickers carry volume 0 and contribute
//! to fusion through the mean fallback only.

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
struct PoolResponse {
    pool: Pool,
}

#[derive(Debug, Deserialize)]
struct Pool {
    pool_assets: Vec<PoolAsset>,
}

#[derive(Debug, Deserialize)]
struct PoolAsset {
    token: PoolToken,
    weight: String,
}

#[derive(Debug, Deserialize)]
struct PoolToken {
    amount: String,
}

pub struct OsmosisProvider {
    cache: Arc<TickerCache>,
}

impl OsmosisProvider {
    pub fn new(endpoint: Endpoint, pairs: Vec<CurrencyPair>, cancel: CancellationToken) -> Self {
        let cache = Arc::new(TickerCache::new());
        tokio::spawn(run_poller(endpoint, pairs, cache.clone(), cancel));
        Self { cache }
    }
}

#[async_trait]
impl Provider for OsmosisProvider {
    fn name(&self) -> ProviderName {
        ProviderName::new("osmosis")
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
            warn!(provider = "osmosis", error = %err, "failed to build http client");
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
            let symbol = pair.symbol();
            let Some(pool_id) = endpoint.contract_addresses.get(&symbol) else {
                warn!(provider = "osmosis", symbol = %symbol, "no pool id configured");
                continue;
            };
            match poll_pool(&client, &endpoint.urls, pool_id).await {
                Ok(price) => {
                    cache.set_ticker(symbol, price, Decimal::ZERO, Utc::now());
                }
                Err(err) => {
                    debug!(provider = "osmosis", symbol = %symbol, error = %err, "poll failed");
                    cache.set_error(err.to_string());
                }
            }
        }
    }
}

async fn poll_pool(
    client: &reqwest::Client,
    urls: &[String],
    pool_id: &str,
) -> Result<Decimal> {
    let mut last_error = None;

    for url in urls {
        let request_url = format!(
            "{}/osmosis/gamm/v1beta1/pools/{}",
            url.trim_end_matches('/'),
            pool_id
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
        let body: PoolResponse = response.json().await.context("bad pool response")?;
        return spot_price(&body.pool);
    }

    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("no urls configured")))
}

/// Spot price of the first pool asset in terms of the second:
/// `(quote_balance / quote_weight) / (base_balance / base_weight)`.
fn spot_price(pool: &Pool) -> Result<Decimal> {
    if pool.pool_assets.len() != 2 {
        bail!("expected a two-asset pool, got {}", pool.pool_assets.len());
    }
    let base = &pool.pool_assets[0];
    let quote = &pool.pool_assets[1];

    let base_balance: Decimal = base.token.amount.parse().context("bad base amount")?;
    let quote_balance: Decimal = quote.token.amount.parse().context("bad quote amount")?;
    let base_weight: Decimal = base.weight.parse().context("bad base weight")?;
    let quote_weight: Decimal = quote.weight.parse().context("bad quote weight")?;

    if base_balance.is_zero() || quote_weight.is_zero() {
        bail!("empty pool");
    }

    Ok((quote_balance / quote_weight) / (base_balance / base_weight))
}
