//! Cross-rate resolution
//!
//! Many pairs are quoted against intermediaries (USDT, OSMO, ATOM, ...)
//! rather than USD. This module chains quotes until every base has a USD
//! price per provider, then filters and fuses each base down to one rate.

use std::collections::{BTreeMap, HashMap};

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{debug, error, warn};

use crate::telemetry::Telemetry;
use crate::types::{
    AggregatedProviderPrices, CurrencyPair, ProviderName, ProviderTickers, TickerPrice,
};

use super::filter::filter_ticker_deviations;
use super::stats::vwap;

/// Chains longer than this rarely add accuracy and compound error instead.
const MAX_CONVERSIONS: usize = 6;

/// USD rates a quote denom must have collected before it is trusted as a
/// conversion intermediate, absent a configured override.
pub const DEFAULT_MIN_PROVIDERS: usize = 3;

/// Convert every ticker to USD and fuse each base to a single rate.
///
/// Runs up to [`MAX_CONVERSIONS`] passes. Each pass first processes pairs
/// whose base already holds a USD rate so intermediates stabilize before
/// their dependents, then converts whatever the current rate table allows.
/// Pairs whose quote is not yet sufficiently priced are parked for the next
/// pass. Output is deterministic for a given input set: pairs are visited in
/// symbol order and the earliest hop wins on provider collisions.
pub fn convert_tickers_to_usd(
    provider_prices: &AggregatedProviderPrices,
    provider_pairs: &BTreeMap<ProviderName, Vec<CurrencyPair>>,
    deviations: &HashMap<String, Decimal>,
    min_overrides: &HashMap<String, usize>,
    telemetry: &dyn Telemetry,
) -> BTreeMap<String, Decimal> {
    if provider_prices.is_empty() {
        return BTreeMap::new();
    }

    // Regroup ticker prices by symbol.
    let mut prices_by_symbol: BTreeMap<String, ProviderTickers> = BTreeMap::new();
    for (provider, tickers) in provider_prices {
        for (symbol, ticker) in tickers {
            prices_by_symbol
                .entry(symbol.clone())
                .or_default()
                .insert(provider.clone(), ticker.clone());
        }
    }

    // Deduplicate the configured pairs across providers.
    let mut pairs: Vec<CurrencyPair> = Vec::new();
    for currency_pairs in provider_pairs.values() {
        for pair in currency_pairs {
            if !pairs.contains(pair) {
                pairs.push(pair.clone());
            }
        }
    }

    let mut usd_rates: BTreeMap<String, ProviderTickers> = BTreeMap::new();

    for _ in 0..MAX_CONVERSIONS {
        pairs.sort_by_key(CurrencyPair::symbol);

        // Pairs whose base already has a USD rate go first, so intermediates
        // pick up all their prices before dependents convert through them.
        let (known, unknown): (Vec<_>, Vec<_>) = pairs
            .into_iter()
            .partition(|pair| usd_rates.contains_key(&pair.base));
        pairs = known;
        pairs.extend(unknown);

        let mut unresolved: Vec<CurrencyPair> = Vec::new();

        for pair in &pairs {
            let symbol = pair.symbol();
            let tickers = prices_by_symbol.get(&symbol);

            let new_rates: ProviderTickers = if pair.is_usd_quoted() {
                tickers.cloned().unwrap_or_default()
            } else {
                let min_providers = min_overrides
                    .get(&pair.quote)
                    .copied()
                    .unwrap_or(DEFAULT_MIN_PROVIDERS);

                let Some(rates) = usd_rates.get(&pair.quote) else {
                    unresolved.push(pair.clone());
                    continue;
                };
                if rates.len() < min_providers {
                    unresolved.push(pair.clone());
                    continue;
                }

                let outcome = filter_ticker_deviations(
                    &symbol,
                    rates,
                    deviations.get(&pair.quote).copied(),
                    telemetry,
                );
                // Suspect intermediate with enough sources to settle later:
                // wait instead of converting through it now.
                if outcome.indeterminate && rates.len() >= DEFAULT_MIN_PROVIDERS {
                    unresolved.push(pair.clone());
                    continue;
                }

                let rate = match vwap(outcome.tickers.values()) {
                    Ok(rate) => rate,
                    Err(err) => {
                        debug!(symbol = %symbol, %err, "no usable rate for quote, parking pair");
                        unresolved.push(pair.clone());
                        continue;
                    }
                };

                tickers
                    .map(|tickers| {
                        tickers
                            .iter()
                            .filter_map(|(provider, ticker)| {
                                match ticker.price.checked_mul(rate) {
                                    Some(price) => Some((
                                        provider.clone(),
                                        TickerPrice::new(price, ticker.volume, ticker.time),
                                    )),
                                    None => {
                                        warn!(symbol = %symbol, provider = %provider, "conversion overflowed");
                                        None
                                    }
                                }
                            })
                            .collect()
                    })
                    .unwrap_or_default()
            };

            if !new_rates.is_empty() {
                add_rates(&mut usd_rates, &pair.base, &symbol, new_rates);
            }
        }

        // Done once nothing is parked, or parked == pending (no progress).
        if unresolved.is_empty() || unresolved.len() == pairs.len() {
            break;
        }
        pairs = unresolved;
    }

    // Fuse each base's per-provider USD rates into a single price.
    let mut rates = BTreeMap::new();
    for (denom, tickers) in &usd_rates {
        let usd_symbol = format!("{denom}USD");
        for (provider, ticker) in tickers {
            telemetry.set_gauge(
                ticker.price.to_f64().unwrap_or(0.0),
                &["provider", "price", &format!("_{provider}"), &usd_symbol],
            );
        }

        let outcome =
            filter_ticker_deviations(denom, tickers, deviations.get(denom).copied(), telemetry);
        if outcome.indeterminate {
            let minimum = min_overrides
                .get(denom)
                .copied()
                .unwrap_or(DEFAULT_MIN_PROVIDERS);
            if outcome.tickers.len() < minimum {
                warn!(
                    denom = %denom,
                    minimum,
                    available = outcome.tickers.len(),
                    "not enough tickers"
                );
                continue;
            }
        }

        let rate = match vwap(outcome.tickers.values()) {
            Ok(rate) => rate,
            Err(err) => {
                error!(denom = %denom, %err, "failed to compute rate");
                continue;
            }
        };
        if rate.is_zero() {
            error!(denom = %denom, "rate is zero");
            continue;
        }

        rates.insert(denom.clone(), rate);
        telemetry.set_gauge(
            rate.to_f64().unwrap_or(0.0),
            &["provider", "price", "_final", &usd_symbol],
        );
    }

    rates
}

/// Merge freshly converted rates into a base's USD table. An existing
/// (base, provider) entry is never overwritten; the earliest hop wins.
fn add_rates(
    usd_rates: &mut BTreeMap<String, ProviderTickers>,
    base: &str,
    symbol: &str,
    new_rates: ProviderTickers,
) {
    let rates = usd_rates.entry(base.to_string()).or_default();
    for (provider, ticker) in new_rates {
        if rates.contains_key(&provider) {
            debug!(symbol = %symbol, provider = %provider, "rate already set for provider");
            continue;
        }
        rates.insert(provider, ticker);
    }
}
