//! Price statistics primitives
//!
//! Population standard deviation and volume-weighted averaging over
//! fixed-precision decimals. Binary floats never touch these paths: the
//! canonical rates string and the vote hash must be reproducible bit for bit.

use anyhow::{bail, Context, Result};
use rust_decimal::{Decimal, MathematicalOps};

use crate::types::TickerPrice;

/// Population standard deviation and mean of `prices`.
///
/// Errors below three samples: σ of one or two quotes says nothing about
/// which of them is the outlier.
pub fn standard_deviation(prices: &[Decimal]) -> Result<(Decimal, Decimal)> {
    if prices.len() < 3 {
        bail!("not enough samples to compute deviation: {}", prices.len());
    }

    let count = Decimal::from(prices.len());
    let mut sum = Decimal::ZERO;
    for price in prices {
        sum = sum
            .checked_add(*price)
            .context("price sum overflowed")?;
    }
    let mean = sum / count;

    let mut variance = Decimal::ZERO;
    for price in prices {
        let delta = price - mean;
        variance = variance
            .checked_add(delta.checked_mul(delta).context("variance term overflowed")?)
            .context("variance sum overflowed")?;
    }
    variance /= count;

    let deviation = variance.sqrt().context("variance has no real root")?;
    Ok((deviation, mean))
}

/// Volume-weighted average price over `tickers`.
///
/// Falls back to the arithmetic mean when no ticker carries volume, so
/// venues that do not report volume still contribute. Empty input is an
/// error; a zero result is left to the caller to reject.
pub fn vwap<'a>(tickers: impl IntoIterator<Item = &'a TickerPrice>) -> Result<Decimal> {
    let mut weighted_sum = Decimal::ZERO;
    let mut volume_sum = Decimal::ZERO;
    let mut price_sum = Decimal::ZERO;
    let mut count = 0u32;

    for ticker in tickers {
        weighted_sum = weighted_sum
            .checked_add(
                ticker
                    .price
                    .checked_mul(ticker.volume)
                    .context("vwap term overflowed")?,
            )
            .context("vwap sum overflowed")?;
        volume_sum += ticker.volume;
        price_sum = price_sum
            .checked_add(ticker.price)
            .context("price sum overflowed")?;
        count += 1;
    }

    if count == 0 {
        bail!("no tickers to average");
    }
    if volume_sum.is_zero() {
        return Ok(price_sum / Decimal::from(count));
    }
    Ok(weighted_sum / volume_sum)
}
