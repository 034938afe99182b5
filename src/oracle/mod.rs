//! Oracle core - multi-source price aggregation and commit-reveal voting
//!
//! Each tick fans out to every configured provider under a hard deadline,
//! fuses the surviving tickers into one USD rate per base, and drives the
//! prevote/vote state machine against the configured vote period.

pub mod convert;
pub mod derivative;
pub mod filter;
pub mod provider;
pub mod stats;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use rand::RngCore;
use rust_decimal::{Decimal, RoundingStrategy};
use sha2::{Digest, Sha256};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{parse_duration, AppConfig, DERIVATIVE_TWAP};
use crate::history::PriceHistory;
use crate::publisher::{PrevoteMsg, Publisher, VoteMsg};
use crate::telemetry::Telemetry;
use crate::types::{AggregatedProviderPrices, CurrencyPair, ProviderName};

use derivative::{Derivative, TwapDerivative};
use provider::{Endpoint, Provider};

/// Minimum pause between ticks: enough time to collect rates and land a
/// prevote or vote inside the voting period.
const TICKER_SLEEP: std::time::Duration = std::time::Duration::from_millis(1000);

/// Fractional digits every rate is truncated to in the canonical string.
const CANONICAL_PRECISION: u32 = 18;

/// The vote hash keeps the first 20 bytes of the SHA-256 digest.
const VOTE_HASH_LEN: usize = 20;

/// The prevote submitted last window, kept around for the reveal.
#[derive(Debug, Clone)]
pub struct PreviousPrevote {
    pub salt: String,
    pub exchange_rates: String,
    pub submit_time: DateTime<Utc>,
}

#[derive(Default)]
struct BookInner {
    prices: BTreeMap<String, Decimal>,
    last_sync: Option<DateTime<Utc>>,
}

/// The published price snapshot. The oracle swaps it at the end of each
/// successful tick; the status server only ever reads, so readers never
/// block a tick.
#[derive(Clone, Default)]
pub struct PriceBook {
    inner: Arc<RwLock<BookInner>>,
}

impl PriceBook {
    /// Current prices, sorted by base symbol.
    pub fn prices(&self) -> Vec<(String, Decimal)> {
        let inner = self.inner.read();
        inner
            .prices
            .iter()
            .map(|(denom, price)| (denom.clone(), *price))
            .collect()
    }

    /// When prices were last fetched from the provider set.
    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.inner.read().last_sync
    }

    pub(crate) fn publish(&self, prices: BTreeMap<String, Decimal>, now: DateTime<Utc>) {
        let mut inner = self.inner.write();
        inner.prices = prices;
        inner.last_sync = Some(now);
    }

    fn snapshot(&self) -> BTreeMap<String, Decimal> {
        self.inner.read().prices.clone()
    }
}

struct Healthcheck {
    url: String,
    client: reqwest::Client,
}

/// The oracle process: provider fan-out, cross-rate fusion and the
/// commit-reveal scheduler. Owns all mutable tick state exclusively;
/// readers observe it through the [`PriceBook`].
pub struct Oracle {
    provider_pairs: BTreeMap<ProviderName, Vec<CurrencyPair>>,
    providers: BTreeMap<ProviderName, Arc<dyn Provider>>,
    endpoints: HashMap<ProviderName, Endpoint>,
    contract_addresses: HashMap<String, HashMap<String, String>>,
    provider_timeout: std::time::Duration,
    deviations: HashMap<String, Decimal>,
    provider_min_overrides: HashMap<String, usize>,
    derivatives: HashMap<String, Box<dyn Derivative>>,
    derivative_pairs: HashMap<String, Vec<CurrencyPair>>,
    derivative_symbols: HashSet<String>,
    history: Arc<PriceHistory>,
    publisher: Arc<dyn Publisher>,
    telemetry: Arc<dyn Telemetry>,
    healthchecks: Vec<Healthcheck>,
    feeder: String,
    vote_period: Duration,
    enable_voter: bool,
    book: PriceBook,
    previous_prevote: Option<PreviousPrevote>,
    previous_vote_period: Option<DateTime<Utc>>,
    cancel: CancellationToken,
}

impl Oracle {
    pub fn new(
        cfg: &AppConfig,
        publisher: Arc<dyn Publisher>,
        history: Arc<PriceHistory>,
        telemetry: Arc<dyn Telemetry>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let vote_period = Duration::from_std(cfg.vote_period()?)
            .context("vote period out of range")?;

        let mut endpoints = HashMap::new();
        for endpoint_cfg in &cfg.provider_endpoints {
            let mut endpoint = Endpoint::default_for(&endpoint_cfg.name);
            if !endpoint_cfg.urls.is_empty() {
                endpoint.urls = endpoint_cfg.urls.clone();
            }
            if !endpoint_cfg.websocket.is_empty() {
                endpoint.websocket = endpoint_cfg.websocket.clone();
            }
            if !endpoint_cfg.poll_interval.is_empty() {
                endpoint.poll_interval = parse_duration(&endpoint_cfg.poll_interval)?;
            }
            endpoints.insert(endpoint_cfg.name.clone(), endpoint);
        }

        let mut healthchecks = Vec::new();
        for healthcheck in &cfg.healthchecks {
            match parse_duration(&healthcheck.timeout) {
                Ok(timeout) => healthchecks.push(Healthcheck {
                    url: healthcheck.url.clone(),
                    client: reqwest::Client::builder()
                        .timeout(timeout)
                        .build()
                        .context("failed to build healthcheck client")?,
                }),
                Err(_) => warn!(
                    timeout = %healthcheck.timeout,
                    "failed to parse healthcheck timeout, skipping configuration"
                ),
            }
        }

        let derivative_periods = cfg.derivative_periods()?;
        let derivative_symbols: HashSet<String> = derivative_periods.keys().cloned().collect();
        let mut derivatives: HashMap<String, Box<dyn Derivative>> = HashMap::new();
        if !derivative_periods.is_empty() {
            derivatives.insert(
                DERIVATIVE_TWAP.to_string(),
                Box::new(TwapDerivative::new(history.clone(), derivative_periods)),
            );
        }

        Ok(Self {
            provider_pairs: cfg.provider_pairs(),
            providers: BTreeMap::new(),
            endpoints,
            contract_addresses: cfg.contract_addresses.clone(),
            provider_timeout: cfg.provider_timeout()?,
            deviations: cfg.deviation_map()?,
            provider_min_overrides: cfg.provider_min_map(),
            derivatives,
            derivative_pairs: cfg.derivative_pairs(),
            derivative_symbols,
            history,
            publisher,
            telemetry,
            healthchecks,
            feeder: cfg.account.operator_id.clone(),
            vote_period,
            enable_voter: cfg.enable_voter,
            book: PriceBook::default(),
            previous_prevote: None,
            previous_vote_period: None,
            cancel,
        })
    }

    /// Handle for readers (the status server) to observe published prices.
    pub fn price_book(&self) -> PriceBook {
        self.book.clone()
    }

    /// Pre-register an adapter under `name`, bypassing lazy construction.
    /// The adapter contributes from the first tick.
    pub fn set_provider(&mut self, name: ProviderName, provider: Arc<dyn Provider>) {
        self.providers.insert(name, provider);
    }

    /// Drive ticks until cancellation. The tick in flight is allowed to
    /// drain before the loop exits.
    pub async fn run(mut self) {
        loop {
            if self.cancel.is_cancelled() {
                info!("oracle loop stopping");
                break;
            }

            debug!("starting oracle tick");
            let start = Instant::now();

            if let Err(err) = self.tick(Utc::now()).await {
                self.telemetry.incr_counter(1, &["failure", "tick"]);
                error!(%err, "oracle tick failed");
            }

            self.telemetry.measure_since(start, &["runtime", "tick"]);
            self.telemetry.incr_counter(1, &["new", "tick"]);

            tokio::select! {
                _ = tokio::time::sleep(TICKER_SLEEP) => {}
                _ = self.cancel.cancelled() => {}
            }
        }
    }

    /// One scheduler step at `now`: collect prices, then prevote, reveal,
    /// or skip depending on where `now` falls in the voting window.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Result<()> {
        let voting_window_end = self.previous_vote_period.map(|start| start + self.vote_period);

        debug!(
            vote_period = %self.vote_period,
            previous_vote_period = ?self.previous_vote_period,
            current_vote_period_end = ?voting_window_end,
            "executing oracle tick"
        );

        // Inside the prevote window: rates keep flowing, nothing publishes.
        if let Some(window_end) = voting_window_end {
            if window_end > now {
                self.set_prices(now).await?;
                info!(next_period = %window_end, "skipping until next voting period");
                return Ok(());
            }
        }

        self.set_prices(now).await?;

        if !self.enable_voter {
            return Ok(());
        }

        // Past the window we needed to hit: drop the stale prevote, a fresh
        // commit goes out next tick.
        if let Some(window_end) = voting_window_end {
            if window_end + self.vote_period < now {
                info!("missing vote during voting period");
                self.telemetry.incr_counter(1, &["vote", "failure", "missed"]);
                self.previous_vote_period = None;
                self.previous_prevote = None;
                return Ok(());
            }
        }

        match self.previous_prevote.clone() {
            None => {
                let salt = generate_salt(32)?;
                let exchange_rates = canonical_rates_string(&self.book.snapshot());
                let hash = aggregate_vote_hash(&salt, &exchange_rates, &self.feeder);

                let prevote = PrevoteMsg {
                    hash: hash.clone(),
                    feeder: self.feeder.clone(),
                };
                info!(hash = %prevote.hash, feeder = %prevote.feeder, "submitting pre-vote");
                self.publisher
                    .submit(serde_json::to_vec(&prevote)?)
                    .await?;

                self.previous_vote_period = Some(now);
                self.previous_prevote = Some(PreviousPrevote {
                    salt,
                    exchange_rates,
                    submit_time: now,
                });
            }
            Some(prevote) => {
                let vote = VoteMsg {
                    salt: prevote.salt,
                    exchange_rates: prevote.exchange_rates,
                    feeder: self.feeder.clone(),
                };
                info!(
                    exchange_rates = %vote.exchange_rates,
                    feeder = %vote.feeder,
                    "broadcasting vote"
                );
                self.publisher.submit(serde_json::to_vec(&vote)?).await?;

                self.previous_prevote = None;
                self.previous_vote_period = None;
                self.healthchecks_ping().await;
            }
        }

        Ok(())
    }

    /// Collect tickers from every provider in parallel, convert to USD and
    /// swap the published snapshot. Individual provider failures never fail
    /// the tick.
    pub async fn set_prices(&mut self, now: DateTime<Utc>) -> Result<()> {
        let mut required_bases: BTreeSet<String> = BTreeSet::new();
        let mut fetches: JoinSet<
            Option<(ProviderName, Vec<CurrencyPair>, HashMap<String, crate::types::TickerPrice>)>,
        > = JoinSet::new();

        for (name, pairs) in &self.provider_pairs {
            if !self.providers.contains_key(name) {
                // First sighting: construct the adapter and let its cache
                // warm up; it contributes from the next tick onward.
                let mut endpoint = self
                    .endpoints
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| Endpoint::default_for(name));
                if let Some(contracts) = self.contract_addresses_for(name) {
                    endpoint.contract_addresses = contracts;
                }
                let adapter =
                    provider::new_provider(endpoint, pairs.clone(), self.cancel.child_token())?;
                self.providers.insert(name.clone(), adapter);
                continue;
            }

            for pair in pairs {
                required_bases.insert(pair.base.clone());
            }

            let adapter = self.providers[name].clone();
            let name = name.clone();
            let pairs = pairs.clone();
            let timeout = self.provider_timeout;
            let telemetry = self.telemetry.clone();
            fetches.spawn(async move {
                match tokio::time::timeout(timeout, adapter.get_ticker_prices(&pairs)).await {
                    Ok(Ok(prices)) => Some((name, pairs, prices)),
                    Ok(Err(err)) => {
                        telemetry.incr_counter(1, &["failure", "provider", "ticker"]);
                        warn!(provider = %name, %err, "failed to get ticker prices");
                        None
                    }
                    Err(_) => {
                        telemetry.incr_counter(1, &["failure", "provider", "timeout"]);
                        warn!(provider = %name, "provider timed out");
                        None
                    }
                }
            });
        }

        let mut provider_prices = AggregatedProviderPrices::new();
        while let Some(fetched) = fetches.join_next().await {
            let Ok(Some((name, pairs, prices))) = fetched else {
                continue;
            };
            for pair in &pairs {
                let symbol = pair.symbol();
                match prices.get(&symbol) {
                    Some(ticker) if !ticker.is_zero() => {
                        if self.derivative_symbols.contains(&symbol) {
                            if let Err(err) = self.history.add_ticker_price(&symbol, &name, ticker)
                            {
                                error!(
                                    %err,
                                    pair = %pair,
                                    provider = %name,
                                    "failed to add ticker price to history"
                                );
                            }
                        } else {
                            provider_prices
                                .entry(name.clone())
                                .or_default()
                                .insert(symbol, ticker.clone());
                        }
                    }
                    _ => {
                        warn!(pair = %pair, provider = %name, "no ticker price found");
                    }
                }
            }
        }

        self.inject_derivatives(&mut provider_prices, now);

        let computed = convert::convert_tickers_to_usd(
            &provider_prices,
            &self.provider_pairs,
            &self.deviations,
            &self.provider_min_overrides,
            self.telemetry.as_ref(),
        );

        if computed.len() != required_bases.len() {
            let missing: Vec<&str> = required_bases
                .iter()
                .filter(|base| !computed.contains_key(*base))
                .map(String::as_str)
                .collect();
            error!("unable to get prices for: {}", missing.join(", "));
        }

        self.book.publish(computed, now);
        Ok(())
    }

    /// Synthesize derivative tickers from history and inject them under
    /// `<origin>_twap` source names, indistinguishable from live providers
    /// downstream.
    fn inject_derivatives(&self, provider_prices: &mut AggregatedProviderPrices, now: DateTime<Utc>) {
        for (kind, pairs) in &self.derivative_pairs {
            let Some(engine) = self.derivatives.get(kind) else {
                continue;
            };
            for pair in pairs {
                let symbol = pair.symbol();
                let synthesized = match engine.get_prices(&symbol, now) {
                    Ok(prices) => prices,
                    Err(err) => {
                        debug!(%err, symbol = %symbol, "failed to get derivative price");
                        continue;
                    }
                };
                for (origin, ticker) in synthesized {
                    let tag = origin.twap_tag();
                    self.telemetry.set_gauge(
                        rust_decimal::prelude::ToPrimitive::to_f64(&ticker.price).unwrap_or(0.0),
                        &["provider", "price", tag.as_str(), &symbol],
                    );
                    provider_prices
                        .entry(tag)
                        .or_default()
                        .insert(symbol.clone(), ticker);
                }
            }
        }
    }

    fn contract_addresses_for(&self, name: &ProviderName) -> Option<HashMap<String, String>> {
        self.contract_addresses.get(name.as_str()).cloned()
    }

    async fn healthchecks_ping(&self) {
        for healthcheck in &self.healthchecks {
            info!(url = %healthcheck.url, "updating healthcheck status");
            if let Err(err) = healthcheck.client.get(&healthcheck.url).send().await {
                warn!(%err, url = %healthcheck.url, "healthcheck ping failed");
            }
        }
    }
}

/// Generate `length` random bytes as a hex string.
pub fn generate_salt(length: usize) -> Result<String> {
    if length == 0 {
        bail!("failed to generate salt: zero length");
    }
    let mut bytes = vec![0u8; length];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    Ok(hex::encode(bytes))
}

/// Canonical textual encoding of a rate set: entries sorted by base,
/// formatted `<BASE><decimal>` with exactly 18 fractional digits, joined by
/// commas. Equal rate sets encode byte-identically; the commit hash and the
/// reveal both depend on that.
pub fn canonical_rates_string(prices: &BTreeMap<String, Decimal>) -> String {
    prices
        .iter()
        .map(|(denom, price)| format!("{}{}", denom, canonical_decimal(price)))
        .collect::<Vec<_>>()
        .join(",")
}

fn canonical_decimal(price: &Decimal) -> String {
    let truncated =
        price.round_dp_with_strategy(CANONICAL_PRECISION, RoundingStrategy::ToZero);
    format!("{truncated:.18}")
}

/// Hash binding a prevote to its later reveal: the first 20 bytes of
/// SHA-256 over `salt:rates:feeder`, hex-encoded.
pub fn aggregate_vote_hash(salt: &str, exchange_rates: &str, voter: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{salt}:{exchange_rates}:{voter}").as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..VOTE_HASH_LEN])
}
