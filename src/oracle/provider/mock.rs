//! Mock provider
//!
//! Deterministic fixture prices derived from the symbol, for smoke-testing
//! a configuration without touching any venue.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;

use crate::types::{CurrencyPair, ProviderName, TickerPrice};

use super::{Provider, ProviderError};

pub struct MockProvider {
    pairs: Vec<CurrencyPair>,
}

impl MockProvider {
    pub fn new(pairs: Vec<CurrencyPair>) -> Self {
        Self { pairs }
    }

    /// Stable pseudo-price in (1, 101]: same symbol, same price, every run.
    fn fixture_price(symbol: &str) -> Decimal {
        let seed: u32 = symbol.bytes().map(u32::from).sum();
        Decimal::ONE + Decimal::from(seed % 10_000) / Decimal::from(100)
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> ProviderName {
        ProviderName::new("mock")
    }

    async fn get_ticker_prices(
        &self,
        pairs: &[CurrencyPair],
    ) -> Result<HashMap<String, TickerPrice>, ProviderError> {
        let now = Utc::now();
        Ok(pairs
            .iter()
            .filter(|pair| self.pairs.contains(pair))
            .map(|pair| {
                let symbol = pair.symbol();
                let price = Self::fixture_price(&symbol);
                (symbol, TickerPrice::new(price, Decimal::from(100), now))
            })
            .collect())
    }
}
