//! Core types used throughout the feeder
//!
//! Currency pairs, ticker prices, and the provider-keyed maps the
//! aggregation pipeline passes between its stages.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Quote denom every price is ultimately expressed in.
pub const DENOM_USD: &str = "USD";

/// A base/quote currency pair, e.g. ATOM quoted in USDT.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CurrencyPair {
    pub base: String,
    pub quote: String,
}

impl CurrencyPair {
    pub fn new(base: impl Into<String>, quote: impl Into<String>) -> Self {
        Self {
            base: base.into().to_uppercase(),
            quote: quote.into().to_uppercase(),
        }
    }

    /// Concatenated symbol used as the map key everywhere, e.g. "ATOMUSDT".
    pub fn symbol(&self) -> String {
        format!("{}{}", self.base, self.quote)
    }

    pub fn is_usd_quoted(&self) -> bool {
        self.quote == DENOM_USD
    }
}

impl fmt::Display for CurrencyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.base, self.quote)
    }
}

/// Name of a price provider.
///
/// Kept as an open string rather than an enum: synthetic sources (TWAP
/// entries tagged `<origin>_twap`) flow through the same maps as live
/// providers and must be representable here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderName(String);

impl ProviderName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The synthetic source name under which a TWAP of this provider's
    /// history is injected into the aggregate.
    pub fn twap_tag(&self) -> ProviderName {
        ProviderName(format!("{}_twap", self.0))
    }
}

impl fmt::Display for ProviderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProviderName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// One observed price for a symbol at a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickerPrice {
    pub price: Decimal,
    pub volume: Decimal,
    pub time: DateTime<Utc>,
}

impl TickerPrice {
    pub fn new(price: Decimal, volume: Decimal, time: DateTime<Utc>) -> Self {
        Self {
            price,
            volume,
            time,
        }
    }

    /// Tickers with a non-positive price carry no information and are
    /// dropped at the aggregation boundary.
    pub fn is_zero(&self) -> bool {
        self.price <= Decimal::ZERO
    }
}

/// Latest ticker per provider for one symbol.
pub type ProviderTickers = BTreeMap<ProviderName, TickerPrice>;

/// Everything collected in one tick: provider -> symbol -> ticker.
pub type AggregatedProviderPrices = BTreeMap<ProviderName, BTreeMap<String, TickerPrice>>;

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn pair_symbol_is_uppercase_concat() {
        let pair = CurrencyPair::new("atom", "usdt");
        assert_eq!(pair.symbol(), "ATOMUSDT");
        assert_eq!(pair.to_string(), "ATOMUSDT");
        assert!(!pair.is_usd_quoted());
        assert!(CurrencyPair::new("BTC", "usd").is_usd_quoted());
    }

    #[test]
    fn provider_name_twap_tag() {
        let name = ProviderName::new("Binance");
        assert_eq!(name.as_str(), "binance");
        assert_eq!(name.twap_tag().as_str(), "binance_twap");
    }

    #[test]
    fn zero_price_ticker_detected() {
        let ticker = TickerPrice::new(dec!(0), dec!(10), Utc::now());
        assert!(ticker.is_zero());
        let ticker = TickerPrice::new(dec!(0.01), dec!(0), Utc::now());
        assert!(!ticker.is_zero());
    }
}
