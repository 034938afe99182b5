//! Zero provider
//!
//! Reports price 0 with volume 1 for every requested pair. Exists to
//! exercise the zero-price guards of the pipeline end to end against a
//! live-looking source.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;

use crate::types::{CurrencyPair, ProviderName, TickerPrice};

use super::{Provider, ProviderError};

pub struct ZeroProvider {
    pairs: Vec<CurrencyPair>,
}

impl ZeroProvider {
    pub fn new(pairs: Vec<CurrencyPair>) -> Self {
        Self { pairs }
    }
}

#[async_trait]
impl Provider for ZeroProvider {
    fn name(&self) -> ProviderName {
        ProviderName::new("zero")
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
                (
                    pair.symbol(),
                    TickerPrice::new(Decimal::ZERO, Decimal::ONE, now),
                )
            })
            .collect())
    }
}
