//! End-to-end pipeline and scheduler tests
//!
//! Drives the oracle through whole ticks with fixture providers and a
//! recording publisher, checking the aggregation scenarios and the
//! commit-reveal state machine against a hand-driven clock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio_util::sync::CancellationToken;

use feeder::config::{
    AccountConfig, AppConfig, CurrencyPairConfig, ProviderMinOverrideConfig, ServerConfig,
    TelemetryConfig,
};
use feeder::history::PriceHistory;
use feeder::oracle::provider::{Provider, ProviderError};
use feeder::oracle::{aggregate_vote_hash, Oracle};
use feeder::publisher::Publisher;
use feeder::telemetry::{MemorySink, Telemetry};
use feeder::types::{CurrencyPair, ProviderName, TickerPrice};

// ────────────────────────────────────────────────────────────────
// Fixtures
// ────────────────────────────────────────────────────────────────

/// Publisher capturing every submitted payload; can be switched to fail.
struct RecordingPublisher {
    payloads: Mutex<Vec<Vec<u8>>>,
    fail: AtomicBool,
}

impl RecordingPublisher {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            payloads: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        })
    }

    fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }

    fn payloads(&self) -> Vec<serde_json::Value> {
        self.payloads
            .lock()
            .unwrap()
            .iter()
            .map(|bytes| serde_json::from_slice(bytes).unwrap())
            .collect()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn submit(&self, payload: Vec<u8>) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("gateway unreachable");
        }
        self.payloads.lock().unwrap().push(payload);
        Ok(())
    }
}

/// Provider answering with a fixed ticker set.
struct FixedProvider {
    name: ProviderName,
    prices: HashMap<String, TickerPrice>,
}

impl FixedProvider {
    fn new(name: &str, prices: &[(&str, Decimal, Decimal)]) -> Arc<Self> {
        Arc::new(Self {
            name: ProviderName::new(name),
            prices: prices
                .iter()
                .map(|(symbol, price, volume)| {
                    (
                        symbol.to_string(),
                        TickerPrice::new(*price, *volume, Utc::now()),
                    )
                })
                .collect(),
        })
    }
}

#[async_trait]
impl Provider for FixedProvider {
    fn name(&self) -> ProviderName {
        self.name.clone()
    }

    async fn get_ticker_prices(
        &self,
        pairs: &[CurrencyPair],
    ) -> Result<HashMap<String, TickerPrice>, ProviderError> {
        Ok(pairs
            .iter()
            .filter_map(|pair| {
                let symbol = pair.symbol();
                self.prices
                    .get(&symbol)
                    .map(|ticker| (symbol, ticker.clone()))
            })
            .collect())
    }
}

/// Provider that never answers within any sane deadline.
struct SlowProvider;

#[async_trait]
impl Provider for SlowProvider {
    fn name(&self) -> ProviderName {
        ProviderName::new("binance")
    }

    async fn get_ticker_prices(
        &self,
        _pairs: &[CurrencyPair],
    ) -> Result<HashMap<String, TickerPrice>, ProviderError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(HashMap::new())
    }
}

fn test_config(pairs: Vec<CurrencyPairConfig>) -> AppConfig {
    AppConfig {
        vote_period: "5s".into(),
        provider_timeout: "100ms".into(),
        history_db: "prices.db".into(),
        enable_server: false,
        enable_voter: true,
        account: AccountConfig {
            network_name: "localnet".into(),
            operator_id: "0.0.4200".into(),
            operator_seed: "ten twenty thirty forty".into(),
            topic_id: "0.0.9100".into(),
        },
        server: ServerConfig {
            listen_addr: "127.0.0.1:0".into(),
            read_timeout: "15s".into(),
            write_timeout: "15s".into(),
            verbose_cors: false,
            allowed_origins: vec![],
        },
        telemetry: TelemetryConfig {
            enabled: true,
            service_name: "feeder-tests".into(),
            global_labels: vec![],
            retention: 60,
        },
        currency_pairs: pairs,
        deviation_thresholds: vec![],
        provider_min_overrides: vec![],
        provider_endpoints: vec![],
        healthchecks: vec![],
        contract_addresses: HashMap::new(),
    }
}

fn pair_cfg(base: &str, quote: &str, providers: &[&str]) -> CurrencyPairConfig {
    CurrencyPairConfig {
        base: base.into(),
        quote: quote.into(),
        providers: providers.iter().map(|name| ProviderName::new(*name)).collect(),
        derivative: String::new(),
        derivative_period: String::new(),
    }
}

struct Harness {
    oracle: Oracle,
    publisher: Arc<RecordingPublisher>,
    telemetry: Arc<MemorySink>,
}

fn harness(cfg: &AppConfig) -> Harness {
    let publisher = RecordingPublisher::new();
    let telemetry = Arc::new(MemorySink::default());
    let history = Arc::new(PriceHistory::in_memory(Duration::from_secs(3600)).unwrap());
    let sink: Arc<dyn Telemetry> = telemetry.clone();
    let oracle = Oracle::new(cfg, publisher.clone(), history, sink, CancellationToken::new())
        .unwrap();
    Harness {
        oracle,
        publisher,
        telemetry,
    }
}

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

fn price_of(oracle: &Oracle, denom: &str) -> Option<Decimal> {
    oracle
        .price_book()
        .prices()
        .into_iter()
        .find(|(base, _)| base == denom)
        .map(|(_, price)| price)
}

// ────────────────────────────────────────────────────────────────
// Aggregation scenarios
// ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn direct_usd_pair_without_filtering() {
    let cfg = test_config(vec![pair_cfg(
        "BTC",
        "USD",
        &["binance", "coinbase", "kraken"],
    )]);
    let mut h = harness(&cfg);
    h.oracle.set_provider(
        ProviderName::new("binance"),
        FixedProvider::new("binance", &[("BTCUSD", dec!(100), dec!(1))]),
    );
    h.oracle.set_provider(
        ProviderName::new("coinbase"),
        FixedProvider::new("coinbase", &[("BTCUSD", dec!(101), dec!(1))]),
    );
    h.oracle.set_provider(
        ProviderName::new("kraken"),
        FixedProvider::new("kraken", &[("BTCUSD", dec!(99), dec!(1))]),
    );

    h.oracle.set_prices(at(0)).await.unwrap();

    assert_eq!(price_of(&h.oracle, "BTC"), Some(dec!(100)));
    assert_eq!(h.oracle.price_book().last_sync(), Some(at(0)));
}

#[tokio::test]
async fn outlier_provider_is_excluded() {
    let cfg = test_config(vec![pair_cfg(
        "ATOM",
        "USD",
        &["binance", "coinbase", "kraken", "osmosis", "mock"],
    )]);
    let mut h = harness(&cfg);
    for (name, price) in [
        ("binance", dec!(10)),
        ("coinbase", dec!(10.1)),
        ("kraken", dec!(9.9)),
        ("osmosis", dec!(10.05)),
        ("mock", dec!(50)),
    ] {
        h.oracle.set_provider(
            ProviderName::new(name),
            FixedProvider::new(name, &[("ATOMUSD", price, dec!(1))]),
        );
    }

    h.oracle.set_prices(at(0)).await.unwrap();

    let price = price_of(&h.oracle, "ATOM").unwrap();
    // The outlier at 50 is gone; the mean of the four survivors remains.
    assert_eq!(price, dec!(10.0125));
    assert_eq!(
        h.telemetry.counter(&["failure", "provider", "deviation"]),
        1
    );
}

#[tokio::test]
async fn two_hop_conversion_through_usdt() {
    let mut cfg = test_config(vec![
        pair_cfg("ATOM", "USDT", &["binance", "coinbase", "kraken"]),
        pair_cfg("USDT", "USD", &["kraken", "osmosis", "mock"]),
    ]);
    cfg.provider_min_overrides = vec![];
    let mut h = harness(&cfg);
    for name in ["binance", "coinbase"] {
        h.oracle.set_provider(
            ProviderName::new(name),
            FixedProvider::new(name, &[("ATOMUSDT", dec!(10), dec!(2))]),
        );
    }
    // Kraken quotes both pairs; its fixture carries both symbols.
    h.oracle.set_provider(
        ProviderName::new("kraken"),
        FixedProvider::new(
            "kraken",
            &[("ATOMUSDT", dec!(10), dec!(2)), ("USDTUSD", dec!(1), dec!(5))],
        ),
    );
    for name in ["osmosis", "mock"] {
        h.oracle.set_provider(
            ProviderName::new(name),
            FixedProvider::new(name, &[("USDTUSD", dec!(1), dec!(5))]),
        );
    }

    h.oracle.set_prices(at(0)).await.unwrap();

    assert_eq!(price_of(&h.oracle, "ATOM"), Some(dec!(10)));
    assert_eq!(price_of(&h.oracle, "USDT"), Some(dec!(1)));
}

#[tokio::test]
async fn starved_intermediate_blocks_dependent_base() {
    let cfg = test_config(vec![
        pair_cfg("ATOM", "USDT", &["binance", "coinbase", "kraken"]),
        pair_cfg("USDT", "USD", &["mock"]),
    ]);
    let mut h = harness(&cfg);
    for name in ["binance", "coinbase", "kraken"] {
        h.oracle.set_provider(
            ProviderName::new(name),
            FixedProvider::new(name, &[("ATOMUSDT", dec!(10), dec!(1))]),
        );
    }
    h.oracle.set_provider(
        ProviderName::new("mock"),
        FixedProvider::new("mock", &[("USDTUSD", dec!(1), dec!(1))]),
    );

    h.oracle.set_prices(at(0)).await.unwrap();

    // One USDT source is below the minimum of three: ATOM cannot convert,
    // USDT itself still publishes through the trivial filter pass.
    assert_eq!(price_of(&h.oracle, "ATOM"), None);
    assert_eq!(price_of(&h.oracle, "USDT"), Some(dec!(1)));
}

#[tokio::test]
async fn min_override_admits_thin_intermediate() {
    let mut cfg = test_config(vec![
        pair_cfg("ATOM", "USDT", &["binance", "coinbase", "kraken"]),
        pair_cfg("USDT", "USD", &["mock"]),
    ]);
    cfg.provider_min_overrides = vec![ProviderMinOverrideConfig {
        denoms: vec!["USDT".into()],
        providers: 1,
    }];
    let mut h = harness(&cfg);
    for name in ["binance", "coinbase", "kraken"] {
        h.oracle.set_provider(
            ProviderName::new(name),
            FixedProvider::new(name, &[("ATOMUSDT", dec!(10), dec!(1))]),
        );
    }
    h.oracle.set_provider(
        ProviderName::new("mock"),
        FixedProvider::new("mock", &[("USDTUSD", dec!(1), dec!(1))]),
    );

    h.oracle.set_prices(at(0)).await.unwrap();

    assert_eq!(price_of(&h.oracle, "ATOM"), Some(dec!(10)));
}

#[tokio::test]
async fn timed_out_provider_does_not_block_the_tick() {
    let cfg = test_config(vec![pair_cfg("BTC", "USD", &["binance", "coinbase"])]);
    let mut h = harness(&cfg);
    h.oracle
        .set_provider(ProviderName::new("binance"), Arc::new(SlowProvider));
    h.oracle.set_provider(
        ProviderName::new("coinbase"),
        FixedProvider::new("coinbase", &[("BTCUSD", dec!(100), dec!(1))]),
    );

    h.oracle.set_prices(at(0)).await.unwrap();

    // The slow venue is abandoned at the deadline and counted; the covered
    // subset still publishes.
    assert_eq!(price_of(&h.oracle, "BTC"), Some(dec!(100)));
    assert_eq!(h.telemetry.counter(&["failure", "provider", "timeout"]), 1);
}

#[tokio::test]
async fn zero_tickers_are_dropped_at_the_boundary() {
    let cfg = test_config(vec![pair_cfg("BTC", "USD", &["binance", "zero"])]);
    let mut h = harness(&cfg);
    h.oracle.set_provider(
        ProviderName::new("binance"),
        FixedProvider::new("binance", &[("BTCUSD", dec!(100), dec!(1))]),
    );
    h.oracle.set_provider(
        ProviderName::new("zero"),
        FixedProvider::new("zero", &[("BTCUSD", dec!(0), dec!(1))]),
    );

    h.oracle.set_prices(at(0)).await.unwrap();

    // The zero quote never enters the aggregate, so no deviation dance:
    // the single honest provider prices BTC.
    assert_eq!(price_of(&h.oracle, "BTC"), Some(dec!(100)));
}

// ────────────────────────────────────────────────────────────────
// Commit-reveal scheduler
// ────────────────────────────────────────────────────────────────

fn voting_harness() -> Harness {
    let cfg = test_config(vec![pair_cfg("BTC", "USD", &["binance"])]);
    let mut h = harness(&cfg);
    h.oracle.set_provider(
        ProviderName::new("binance"),
        FixedProvider::new("binance", &[("BTCUSD", dec!(100), dec!(1))]),
    );
    h
}

#[tokio::test]
async fn commit_reveal_cycle_binds_hash_to_reveal() {
    let mut h = voting_harness();

    // t=0: idle scheduler submits a prevote.
    h.oracle.tick(at(0)).await.unwrap();
    let payloads = h.publisher.payloads();
    assert_eq!(payloads.len(), 1);
    let prevote = &payloads[0];
    let hash = prevote["hash"].as_str().unwrap().to_string();
    assert_eq!(prevote["feeder"], "0.0.4200");
    assert_eq!(hash.len(), 40);

    // t=4: inside the window, prices refresh but nothing publishes.
    h.oracle.tick(at(4)).await.unwrap();
    assert_eq!(h.publisher.payloads().len(), 1);

    // t=6: one window boundary crossed, the reveal goes out.
    h.oracle.tick(at(6)).await.unwrap();
    let payloads = h.publisher.payloads();
    assert_eq!(payloads.len(), 2);
    let vote = &payloads[1];
    let salt = vote["salt"].as_str().unwrap();
    let rates = vote["exchange_rates"].as_str().unwrap();
    assert_eq!(vote["feeder"], "0.0.4200");
    assert_eq!(rates, "BTC100.000000000000000000");

    // The reveal must reproduce the committed hash exactly.
    assert_eq!(aggregate_vote_hash(salt, rates, "0.0.4200"), hash);

    // t=7: back to idle, a fresh prevote starts the next cycle.
    h.oracle.tick(at(7)).await.unwrap();
    let payloads = h.publisher.payloads();
    assert_eq!(payloads.len(), 3);
    assert!(payloads[2].get("hash").is_some());
}

#[tokio::test]
async fn missed_window_discards_stale_prevote() {
    let mut h = voting_harness();

    h.oracle.tick(at(0)).await.unwrap();
    assert_eq!(h.publisher.payloads().len(), 1);

    // The gateway goes dark; the reveal at t=6 fails and the scheduler
    // holds its state for a natural retry.
    h.publisher.set_failing(true);
    assert!(h.oracle.tick(at(6)).await.is_err());
    assert_eq!(h.telemetry.counter(&["vote", "failure", "missed"]), 0);

    // t=12 is past the next window end: the prevote is stale. It is
    // dropped without revealing the salt, and the miss is counted.
    h.publisher.set_failing(false);
    h.oracle.tick(at(12)).await.unwrap();
    assert_eq!(h.telemetry.counter(&["vote", "failure", "missed"]), 1);
    assert_eq!(h.publisher.payloads().len(), 1);

    // The next tick opens a fresh commit cycle.
    h.oracle.tick(at(13)).await.unwrap();
    let payloads = h.publisher.payloads();
    assert_eq!(payloads.len(), 2);
    assert!(payloads[1].get("hash").is_some());
}

#[tokio::test]
async fn failed_prevote_keeps_scheduler_idle() {
    let mut h = voting_harness();
    h.publisher.set_failing(true);

    assert!(h.oracle.tick(at(0)).await.is_err());
    assert!(h.publisher.payloads().is_empty());

    // Next tick retries the prevote from scratch.
    h.publisher.set_failing(false);
    h.oracle.tick(at(1)).await.unwrap();
    let payloads = h.publisher.payloads();
    assert_eq!(payloads.len(), 1);
    assert!(payloads[0].get("hash").is_some());
}

#[tokio::test]
async fn disabled_voter_never_publishes() {
    let mut cfg = test_config(vec![pair_cfg("BTC", "USD", &["binance"])]);
    cfg.enable_voter = false;
    let mut h = harness(&cfg);
    h.oracle.set_provider(
        ProviderName::new("binance"),
        FixedProvider::new("binance", &[("BTCUSD", dec!(100), dec!(1))]),
    );

    for secs in [0, 6, 12] {
        h.oracle.tick(at(secs)).await.unwrap();
    }

    assert!(h.publisher.payloads().is_empty());
    // Prices still flow for the status API.
    assert_eq!(price_of(&h.oracle, "BTC"), Some(dec!(100)));
}

// ────────────────────────────────────────────────────────────────
// Resolver convergence bound
// ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn six_hop_chain_resolves_but_seven_does_not() {
    // A chain of quotes C1 -> C2 -> ... -> C7 -> USD. Six passes resolve
    // C7 down through C2; C1 would need a seventh and stays unpriced.
    let chain = ["C1", "C2", "C3", "C4", "C5", "C6", "C7"];
    let mut pairs = Vec::new();
    let mut overrides = Vec::new();
    for window in chain.windows(2) {
        pairs.push(pair_cfg(window[0], window[1], &["binance"]));
        overrides.push(ProviderMinOverrideConfig {
            denoms: vec![window[1].into()],
            providers: 1,
        });
    }
    pairs.push(pair_cfg("C7", "USD", &["binance"]));

    let mut cfg = test_config(pairs);
    cfg.provider_min_overrides = overrides;
    let mut h = harness(&cfg);

    let symbols: Vec<String> = chain
        .windows(2)
        .map(|window| format!("{}{}", window[0], window[1]))
        .chain(std::iter::once("C7USD".to_string()))
        .collect();
    let fixture: Vec<(&str, Decimal, Decimal)> = symbols
        .iter()
        .map(|symbol| (symbol.as_str(), dec!(2), dec!(1)))
        .collect();
    h.oracle.set_provider(
        ProviderName::new("binance"),
        FixedProvider::new("binance", &fixture),
    );

    h.oracle.set_prices(at(0)).await.unwrap();

    // C7 = 2, C6 = 4, ..., C2 = 2^6 = 64.
    assert_eq!(price_of(&h.oracle, "C7"), Some(dec!(2)));
    assert_eq!(price_of(&h.oracle, "C2"), Some(dec!(64)));
    assert_eq!(price_of(&h.oracle, "C1"), None);
}
