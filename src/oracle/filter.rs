//! Deviation filtering
//!
//! Drops providers whose price sits outside `mean ± threshold·σ` of the
//! per-symbol population. The threshold is a σ multiplier from the config,
//! defaulting to 1.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::debug;

use crate::telemetry::Telemetry;
use crate::types::ProviderTickers;

use super::stats::standard_deviation;

/// σ multiplier applied when the config has no threshold for a base.
pub const DEFAULT_DEVIATION_THRESHOLD: Decimal = dec!(1.0);

/// Result of a deviation pass.
pub struct FilterOutcome {
    pub tickers: ProviderTickers,
    /// σ could not be computed (exactly two samples); `tickers` are passed
    /// through unfiltered and the caller decides via provider minima.
    pub indeterminate: bool,
}

fn is_between(price: Decimal, mean: Decimal, margin: Decimal) -> bool {
    price >= mean - margin && price <= mean + margin
}

/// Filter `tickers` for `symbol` down to the providers within
/// `mean ± threshold·σ`.
///
/// Fewer than two prices pass through trivially: there is no population to
/// deviate from, and a lone honest quote must still be publishable.
pub fn filter_ticker_deviations(
    symbol: &str,
    tickers: &ProviderTickers,
    threshold: Option<Decimal>,
    telemetry: &dyn Telemetry,
) -> FilterOutcome {
    let threshold = threshold.unwrap_or(DEFAULT_DEVIATION_THRESHOLD);

    if tickers.len() < 2 {
        return FilterOutcome {
            tickers: tickers.clone(),
            indeterminate: false,
        };
    }

    let prices: Vec<Decimal> = tickers.values().map(|ticker| ticker.price).collect();
    let (deviation, mean) = match standard_deviation(&prices) {
        Ok(stats) => stats,
        Err(_) => {
            return FilterOutcome {
                tickers: tickers.clone(),
                indeterminate: true,
            };
        }
    };

    let margin = deviation * threshold;
    let mut filtered = ProviderTickers::new();
    for (provider, ticker) in tickers {
        if is_between(ticker.price, mean, margin) {
            filtered.insert(provider.clone(), ticker.clone());
        } else {
            telemetry.incr_counter(1, &["failure", "provider", "deviation"]);
            debug!(
                symbol,
                provider = %provider,
                price = %ticker.price,
                mean = %mean,
                margin = %margin,
                "deviating price"
            );
        }
    }

    FilterOutcome {
        tickers: filtered,
        indeterminate: false,
    }
}
