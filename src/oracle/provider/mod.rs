//! Price provider adapters
//!
//! Every venue driver implements [`Provider`]: hand it pairs, get back the
//! latest ticker per symbol. Streaming and polling adapters keep a
//! [`TickerCache`] warm from a background task they own; the aggregation
//! loop only ever reads the cache, so a slow venue can never stall a tick
//! beyond the orchestrator's deadline.

mod binance;
mod coinbase;
mod kraken;
mod mock;
mod osmosis;
mod zero;

pub use binance::BinanceProvider;
pub use coinbase::CoinbaseProvider;
pub use kraken::KrakenProvider;
pub use mock::MockProvider;
pub use osmosis::OsmosisProvider;
pub use zero::ZeroProvider;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::types::{CurrencyPair, ProviderName, TickerPrice};

/// Registry of provider names a config may reference.
pub const SUPPORTED_PROVIDERS: &[&str] = &[
    "binance", "coinbase", "kraken", "osmosis", "zero", "mock",
];

/// Why an adapter produced no data. Both kinds mean "nothing from this
/// provider this tick"; the distinction only matters for operators reading
/// logs.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Network hiccup, venue-side error, malformed payload.
    #[error("provider api error: {0}")]
    Transient(String),
    /// The adapter cannot work with its configuration at all.
    #[error("provider misconfigured: {0}")]
    Config(String),
}

/// Contract between the aggregation core and a venue driver.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> ProviderName;

    /// Latest ticker per requested symbol. Symbols the venue has no data
    /// for are omitted, never fabricated. Must return promptly; the caller
    /// enforces a hard deadline on top.
    async fn get_ticker_prices(
        &self,
        pairs: &[CurrencyPair],
    ) -> Result<HashMap<String, TickerPrice>, ProviderError>;
}

/// Where and how to reach one provider.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub name: ProviderName,
    pub urls: Vec<String>,
    pub websocket: String,
    pub poll_interval: Duration,
    /// BASEQUOTE -> on-chain contract or pool identifier.
    pub contract_addresses: HashMap<String, String>,
}

impl Endpoint {
    /// Built-in endpoint for a supported provider; config entries override
    /// individual fields.
    pub fn default_for(name: &ProviderName) -> Self {
        let (urls, websocket, poll_interval) = match name.as_str() {
            "binance" => (
                vec![],
                "wss://stream.binance.com:9443/stream".to_string(),
                Duration::from_secs(3),
            ),
            "coinbase" => (
                vec!["https://api.exchange.coinbase.com".to_string()],
                String::new(),
                Duration::from_secs(3),
            ),
            "kraken" => (
                vec!["https://api.kraken.com".to_string()],
                String::new(),
                Duration::from_secs(3),
            ),
            "osmosis" => (
                vec!["https://lcd.osmosis.zone".to_string()],
                String::new(),
                Duration::from_secs(6),
            ),
            _ => (vec![], String::new(), Duration::from_secs(3)),
        };
        Self {
            name: name.clone(),
            urls,
            websocket,
            poll_interval,
            contract_addresses: HashMap::new(),
        }
    }
}

/// Construct the adapter registered under `endpoint.name`.
///
/// Streaming and polling adapters spawn their background task here; `cancel`
/// tears it down on shutdown.
pub fn new_provider(
    endpoint: Endpoint,
    pairs: Vec<CurrencyPair>,
    cancel: CancellationToken,
) -> Result<Arc<dyn Provider>, ProviderError> {
    match endpoint.name.as_str() {
        "binance" => Ok(Arc::new(BinanceProvider::new(endpoint, pairs, cancel))),
        "coinbase" => Ok(Arc::new(CoinbaseProvider::new(endpoint, pairs, cancel))),
        "kraken" => Ok(Arc::new(KrakenProvider::new(endpoint, pairs, cancel))),
        "osmosis" => Ok(Arc::new(OsmosisProvider::new(endpoint, pairs, cancel))),
        "zero" => Ok(Arc::new(ZeroProvider::new(pairs))),
        "mock" => Ok(Arc::new(MockProvider::new(pairs))),
        other => Err(ProviderError::Config(format!("provider {other} not found"))),
    }
}

/// Latest successful ticker per symbol for one provider, plus the last
/// fetch error. Single writer (the adapter's background task), many readers.
pub struct TickerCache {
    tickers: RwLock<HashMap<String, TickerPrice>>,
    last_error: RwLock<Option<String>>,
}

impl TickerCache {
    pub fn new() -> Self {
        Self {
            tickers: RwLock::new(HashMap::new()),
            last_error: RwLock::new(None),
        }
    }

    pub fn set_ticker(
        &self,
        symbol: impl Into<String>,
        price: Decimal,
        volume: Decimal,
        time: DateTime<Utc>,
    ) {
        self.tickers
            .write()
            .insert(symbol.into(), TickerPrice::new(price, volume, time));
        *self.last_error.write() = None;
    }

    pub fn set_error(&self, error: impl Into<String>) {
        *self.last_error.write() = Some(error.into());
    }

    /// Tickers for the requested pairs. An empty cache that has seen an
    /// error reports it instead, so the orchestrator can count the failure.
    pub fn snapshot(
        &self,
        pairs: &[CurrencyPair],
    ) -> Result<HashMap<String, TickerPrice>, ProviderError> {
        let tickers = self.tickers.read();
        let mut snapshot = HashMap::new();
        for pair in pairs {
            let symbol = pair.symbol();
            if let Some(ticker) = tickers.get(&symbol) {
                snapshot.insert(symbol, ticker.clone());
            }
        }
        if snapshot.is_empty() {
            if let Some(error) = self.last_error.read().clone() {
                return Err(ProviderError::Transient(error));
            }
        }
        Ok(snapshot)
    }
}

impl Default for TickerCache {
    fn default() -> Self {
        Self::new()
    }
}
