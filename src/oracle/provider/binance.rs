//! Binance WebSocket adapter
//!
//! Subscribes to the combined miniTicker stream for the configured pairs
//! and keeps the ticker cache warm. Reconnects with exponential backoff.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::types::{CurrencyPair, ProviderName, TickerPrice};

use super::{Endpoint, Provider, ProviderError, TickerCache};

const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct StreamWrapper {
    #[allow(dead_code)]
    stream: String,
    data: MiniTicker,
}

#[derive(Debug, Deserialize)]
struct MiniTicker {
    /// Event time in epoch milliseconds.
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    /// Close (latest) price.
    #[serde(rename = "c")]
    close: String,
    /// 24h base-asset volume.
    #[serde(rename = "v")]
    volume: String,
}

pub struct BinanceProvider {
    cache: Arc<TickerCache>,
}

impl BinanceProvider {
    pub fn new(endpoint: Endpoint, pairs: Vec<CurrencyPair>, cancel: CancellationToken) -> Self {
        let cache = Arc::new(TickerCache::new());
        tokio::spawn(run_stream(endpoint, pairs, cache.clone(), cancel));
        Self { cache }
    }
}

#[async_trait]
impl Provider for BinanceProvider {
    fn name(&self) -> ProviderName {
        ProviderName::new("binance")
    }

    async fn get_ticker_prices(
        &self,
        pairs: &[CurrencyPair],
    ) -> Result<HashMap<String, TickerPrice>, ProviderError> {
        self.cache.snapshot(pairs)
    }
}

fn stream_url(websocket: &str, pairs: &[CurrencyPair]) -> String {
    let streams: Vec<String> = pairs
        .iter()
        .map(|pair| format!("{}@miniTicker", pair.symbol().to_lowercase()))
        .collect();
    format!("{}?streams={}", websocket, streams.join("/"))
}

async fn run_stream(
    endpoint: Endpoint,
    pairs: Vec<CurrencyPair>,
    cache: Arc<TickerCache>,
    cancel: CancellationToken,
) {
    if pairs.is_empty() {
        warn!(provider = "binance", "no pairs configured, stream not started");
        return;
    }
    let url = stream_url(&endpoint.websocket, &pairs);
    let mut reconnect_attempts = 0u32;

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let ws_stream = tokio::select! {
            connected = connect_async(&url) => match connected {
                Ok((stream, _)) => stream,
                Err(err) => {
                    warn!(provider = "binance", error = %err, "connection failed");
                    cache.set_error(err.to_string());
                    reconnect_attempts += 1;
                    let delay = (Duration::from_secs(1) * reconnect_attempts)
                        .min(MAX_RECONNECT_DELAY);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => continue,
                        _ = cancel.cancelled() => break,
                    }
                }
            },
            _ = cancel.cancelled() => break,
        };

        info!(provider = "binance", "connected");
        reconnect_attempts = 0;
        let (mut write, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                message = read.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(err) = handle_message(&text, &cache) {
                            debug!(provider = "binance", error = %err, "unparseable message");
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) => {
                        warn!(provider = "binance", "connection closed by server");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(provider = "binance", error = %err, "websocket error");
                        cache.set_error(err.to_string());
                        break;
                    }
                    None => {
                        warn!(provider = "binance", "stream ended");
                        break;
                    }
                },
                _ = cancel.cancelled() => return,
            }
        }

        reconnect_attempts += 1;
        let delay = (Duration::from_secs(1) * reconnect_attempts).min(MAX_RECONNECT_DELAY);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => break,
        }
    }
}

fn handle_message(text: &str, cache: &TickerCache) -> anyhow::Result<()> {
    let wrapper: StreamWrapper = serde_json::from_str(text)?;
    let ticker = wrapper.data;

    let price: Decimal = ticker.close.parse()?;
    let volume: Decimal = ticker.volume.parse()?;
    let time = Utc
        .timestamp_millis_opt(ticker.event_time)
        .single()
        .unwrap_or_else(Utc::now);

    cache.set_ticker(ticker.symbol.to_uppercase(), price, volume, time);
    Ok(())
}
