//! Derivative price synthesis
//!
//! Pairs configured with `derivative = "twap"` route their raw tickers into
//! the history store; each tick the engine answers with a time-weighted
//! average per origin provider over the trailing window. The synthetic
//! entries flow back into the aggregate under `<origin>_twap` source names
//! and are treated like any live provider from there on.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::debug;

use crate::history::PriceHistory;
use crate::types::{ProviderName, TickerPrice};

/// Minimum share of the window that must be covered by observations before
/// a provider's TWAP is considered representative.
const MIN_WINDOW_COVERAGE: u32 = 4;

/// A synthetic price engine fed from the history store.
pub trait Derivative: Send + Sync {
    /// Synthesized tickers for `symbol`, keyed by origin provider.
    fn get_prices(
        &self,
        symbol: &str,
        now: DateTime<Utc>,
    ) -> Result<BTreeMap<ProviderName, TickerPrice>>;
}

/// Time-weighted average price over a trailing window per symbol.
pub struct TwapDerivative {
    history: Arc<PriceHistory>,
    periods: HashMap<String, Duration>,
}

impl TwapDerivative {
    pub fn new(history: Arc<PriceHistory>, periods: HashMap<String, Duration>) -> Self {
        Self { history, periods }
    }
}

impl Derivative for TwapDerivative {
    fn get_prices(
        &self,
        symbol: &str,
        now: DateTime<Utc>,
    ) -> Result<BTreeMap<ProviderName, TickerPrice>> {
        let Some(period) = self.periods.get(symbol) else {
            bail!("no derivative period configured for {symbol}");
        };
        let window = chrono::Duration::from_std(*period).context("derivative period overflow")?;
        let since = now - window;

        let raw = self.history.get_ticker_prices(symbol, since)?;

        let mut prices = BTreeMap::new();
        for (provider, tickers) in raw {
            match twap(&tickers, now, window) {
                Some(ticker) => {
                    prices.insert(provider, ticker);
                }
                None => {
                    debug!(symbol, provider = %provider, "insufficient history for twap");
                }
            }
        }
        Ok(prices)
    }
}

/// Time-weighted average of `tickers` (oldest first) up to `now`.
///
/// Each observation is weighted by the time until the next one; the last
/// observation extends to `now`. Returns `None` when the observations cover
/// less than a quarter of the window.
fn twap(tickers: &[TickerPrice], now: DateTime<Utc>, window: chrono::Duration) -> Option<TickerPrice> {
    let first = tickers.first()?;
    let last = tickers.last()?;

    let covered = now - first.time;
    if covered < window / MIN_WINDOW_COVERAGE as i32 {
        return None;
    }

    let mut weighted_sum = Decimal::ZERO;
    let mut weight_sum = Decimal::ZERO;
    for (i, ticker) in tickers.iter().enumerate() {
        let end = tickers.get(i + 1).map(|next| next.time).unwrap_or(now);
        let weight_ms = (end - ticker.time).num_milliseconds().max(0);
        let weight = Decimal::from(weight_ms);
        weighted_sum += ticker.price.checked_mul(weight)?;
        weight_sum += weight;
    }
    if weight_sum.is_zero() {
        return None;
    }

    Some(TickerPrice::new(
        weighted_sum / weight_sum,
        last.volume,
        now,
    ))
}
