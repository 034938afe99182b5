//! Configuration management for the feeder
//!
//! Loads a TOML document plus `FEEDER__`-prefixed environment overrides via
//! the `config` crate. Every validation failure here is fatal: a feeder with
//! a bad pair list or an unknown provider must not start.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;

use crate::oracle::provider::SUPPORTED_PROVIDERS;
use crate::types::{CurrencyPair, ProviderName};

/// The only derivative kind the history engine can synthesize.
pub const DERIVATIVE_TWAP: &str = "twap";

const DEFAULT_DERIVATIVE_PERIOD: &str = "30m";

/// Ceiling on configured deviation thresholds. Anything wider than 3σ
/// stops filtering in practice.
const MAX_DEVIATION_THRESHOLD: Decimal = dec!(3.0);

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Commit-reveal cadence, e.g. "30s".
    pub vote_period: String,
    /// Hard deadline for a single provider fetch, e.g. "500ms".
    pub provider_timeout: String,
    /// Path of the sqlite ticker history backing TWAP pairs.
    pub history_db: String,
    /// Serve the read-only status API.
    pub enable_server: bool,
    /// Publish prevotes/votes. Off means aggregate-only.
    pub enable_voter: bool,
    pub account: AccountConfig,
    pub server: ServerConfig,
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub currency_pairs: Vec<CurrencyPairConfig>,
    #[serde(default)]
    pub deviation_thresholds: Vec<DeviationConfig>,
    #[serde(default)]
    pub provider_min_overrides: Vec<ProviderMinOverrideConfig>,
    #[serde(default)]
    pub provider_endpoints: Vec<ProviderEndpointConfig>,
    #[serde(default)]
    pub healthchecks: Vec<HealthcheckConfig>,
    /// provider -> BASEQUOTE -> on-chain contract/pool identifier.
    #[serde(default)]
    pub contract_addresses: HashMap<String, HashMap<String, String>>,
}

/// Network, operator identity and the topic votes are published to.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    pub network_name: String,
    pub operator_id: String,
    pub operator_seed: String,
    pub topic_id: String,
}

/// Status API server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub read_timeout: String,
    pub write_timeout: String,
    pub verbose_cors: bool,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub service_name: String,
    /// Label tuples applied to every metric, e.g. [["network", "testnet"]].
    #[serde(default)]
    pub global_labels: Vec<Vec<String>>,
    /// Snapshot retention in seconds for the in-memory sink.
    pub retention: i64,
}

impl TelemetryConfig {
    pub fn labels(&self) -> Vec<(String, String)> {
        self.global_labels
            .iter()
            .filter(|pair| pair.len() == 2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect()
    }
}

/// One configured pair with the providers quoting it.
#[derive(Debug, Clone, Deserialize)]
pub struct CurrencyPairConfig {
    pub base: String,
    pub quote: String,
    pub providers: Vec<ProviderName>,
    #[serde(default)]
    pub derivative: String,
    #[serde(default)]
    pub derivative_period: String,
}

impl CurrencyPairConfig {
    pub fn pair(&self) -> CurrencyPair {
        CurrencyPair::new(&self.base, &self.quote)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviationConfig {
    pub base: String,
    pub threshold: String,
}

/// Minimum number of independent sources before a denom's USD rate may be
/// used, overriding the built-in default of 3.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderMinOverrideConfig {
    pub denoms: Vec<String>,
    pub providers: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEndpointConfig {
    pub name: ProviderName,
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub websocket: String,
    #[serde(default)]
    pub poll_interval: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthcheckConfig {
    pub url: String,
    pub timeout: String,
}

impl AppConfig {
    /// Load configuration from `path` and the environment.
    pub fn load(path: &Path) -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .set_default("provider_timeout", "500ms")?
            .set_default("history_db", "prices.db")?
            .set_default("enable_server", true)?
            .set_default("enable_voter", true)?
            // Server defaults
            .set_default("server.listen_addr", "0.0.0.0:7171")?
            .set_default("server.read_timeout", "15s")?
            .set_default("server.write_timeout", "15s")?
            .set_default("server.verbose_cors", false)?
            // Telemetry defaults
            .set_default("telemetry.enabled", false)?
            .set_default("telemetry.service_name", "feeder")?
            .set_default("telemetry.retention", 60)?
            .add_source(File::from(path))
            // Override with environment variables (FEEDER_*)
            .add_source(Environment::with_prefix("FEEDER").separator("__"))
            .build()
            .context("failed to build configuration")?;

        let mut app_config: AppConfig = config
            .try_deserialize()
            .context("failed to deserialize configuration")?;

        for pair in &mut app_config.currency_pairs {
            if !pair.derivative.is_empty() && pair.derivative_period.is_empty() {
                pair.derivative_period = DEFAULT_DERIVATIVE_PERIOD.to_string();
            }
        }

        app_config.validate()?;
        Ok(app_config)
    }

    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.currency_pairs.is_empty() {
            bail!("at least one currency pair must be configured");
        }

        for field in [
            ("network_name", &self.account.network_name),
            ("operator_id", &self.account.operator_id),
            ("operator_seed", &self.account.operator_seed),
            ("topic_id", &self.account.topic_id),
        ] {
            if field.1.trim().is_empty() {
                bail!("account.{} is required", field.0);
            }
        }

        parse_duration(&self.vote_period).context("invalid vote_period")?;
        parse_duration(&self.provider_timeout).context("invalid provider_timeout")?;
        parse_duration(&self.server.read_timeout).context("invalid server.read_timeout")?;
        parse_duration(&self.server.write_timeout).context("invalid server.write_timeout")?;

        let mut derivative_bases = HashSet::new();
        let mut plain_bases = HashSet::new();
        for pair in &self.currency_pairs {
            if pair.base.trim().is_empty() || pair.quote.trim().is_empty() {
                bail!("currency pair base and quote are required");
            }
            if pair.providers.is_empty() {
                bail!("currency pair {} has no providers", pair.pair());
            }
            for provider in &pair.providers {
                if !SUPPORTED_PROVIDERS.contains(&provider.as_str()) {
                    bail!("unsupported provider: {provider}");
                }
            }
            if pair.derivative.is_empty() {
                plain_bases.insert(pair.pair().base);
            } else {
                if pair.derivative != DERIVATIVE_TWAP {
                    bail!("unsupported derivative: {}", pair.derivative);
                }
                parse_duration(&pair.derivative_period)
                    .with_context(|| format!("invalid derivative_period for {}", pair.pair()))?;
                derivative_bases.insert(pair.pair().base);
            }
        }
        if let Some(base) = derivative_bases.intersection(&plain_bases).next() {
            bail!("cannot combine derivative and non-derivative pairs for {base}");
        }

        for deviation in &self.deviation_thresholds {
            let threshold: Decimal = deviation
                .threshold
                .parse()
                .context("deviation thresholds must be numeric")?;
            if threshold <= Decimal::ZERO {
                bail!("deviation threshold for {} must be positive", deviation.base);
            }
            if threshold > MAX_DEVIATION_THRESHOLD {
                bail!("deviation thresholds must not exceed {MAX_DEVIATION_THRESHOLD}");
            }
        }

        for override_cfg in &self.provider_min_overrides {
            if override_cfg.denoms.is_empty() {
                bail!("provider min override requires at least one denom");
            }
            if override_cfg.providers < 1 {
                bail!("minimum providers must be greater than 0");
            }
        }

        for endpoint in &self.provider_endpoints {
            if !SUPPORTED_PROVIDERS.contains(&endpoint.name.as_str()) {
                bail!("unsupported endpoint provider: {}", endpoint.name);
            }
            if endpoint.urls.is_empty() && endpoint.websocket.is_empty() {
                bail!("endpoint for {} needs urls or a websocket", endpoint.name);
            }
            if !endpoint.poll_interval.is_empty() {
                parse_duration(&endpoint.poll_interval)
                    .with_context(|| format!("invalid poll_interval for {}", endpoint.name))?;
            }
        }

        if self.telemetry.enabled && self.telemetry.service_name.trim().is_empty() {
            bail!("telemetry requires a service_name when enabled");
        }

        Ok(())
    }

    pub fn vote_period(&self) -> Result<Duration> {
        parse_duration(&self.vote_period)
    }

    pub fn provider_timeout(&self) -> Result<Duration> {
        parse_duration(&self.provider_timeout)
    }

    /// Pairs grouped by the provider that quotes them.
    pub fn provider_pairs(&self) -> BTreeMap<ProviderName, Vec<CurrencyPair>> {
        let mut grouped: BTreeMap<ProviderName, Vec<CurrencyPair>> = BTreeMap::new();
        for pair_cfg in &self.currency_pairs {
            for provider in &pair_cfg.providers {
                grouped
                    .entry(provider.clone())
                    .or_default()
                    .push(pair_cfg.pair());
            }
        }
        grouped
    }

    /// Bases the aggregation is expected to price each tick.
    pub fn required_bases(&self) -> HashSet<String> {
        self.currency_pairs
            .iter()
            .map(|pair_cfg| pair_cfg.pair().base)
            .collect()
    }

    pub fn deviation_map(&self) -> Result<HashMap<String, Decimal>> {
        let mut deviations = HashMap::new();
        for deviation in &self.deviation_thresholds {
            let threshold = deviation
                .threshold
                .parse()
                .context("deviation thresholds must be numeric")?;
            deviations.insert(deviation.base.to_uppercase(), threshold);
        }
        Ok(deviations)
    }

    pub fn provider_min_map(&self) -> HashMap<String, usize> {
        let mut minima = HashMap::new();
        for override_cfg in &self.provider_min_overrides {
            for denom in &override_cfg.denoms {
                minima.insert(denom.to_uppercase(), override_cfg.providers);
            }
        }
        minima
    }

    /// Symbols routed into the history store instead of the live aggregate,
    /// with the TWAP window for each.
    pub fn derivative_periods(&self) -> Result<HashMap<String, Duration>> {
        let mut periods = HashMap::new();
        for pair_cfg in &self.currency_pairs {
            if pair_cfg.derivative == DERIVATIVE_TWAP {
                let period = parse_duration(&pair_cfg.derivative_period)?;
                periods.insert(pair_cfg.pair().symbol(), period);
            }
        }
        Ok(periods)
    }

    /// Pairs served by each derivative kind.
    pub fn derivative_pairs(&self) -> HashMap<String, Vec<CurrencyPair>> {
        let mut grouped: HashMap<String, Vec<CurrencyPair>> = HashMap::new();
        for pair_cfg in &self.currency_pairs {
            if !pair_cfg.derivative.is_empty() {
                grouped
                    .entry(pair_cfg.derivative.clone())
                    .or_default()
                    .push(pair_cfg.pair());
            }
        }
        grouped
    }

}

/// Parse a duration string of the form `<integer><unit>` where unit is one
/// of ms, s, m, h. Compound values like "1m30s" are accepted.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let input = input.trim();
    if input.is_empty() {
        bail!("empty duration");
    }

    let mut total = Duration::ZERO;
    let mut digits = String::new();
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        if digits.is_empty() {
            bail!("invalid duration: {input}");
        }
        let value: u64 = digits.parse()?;
        digits.clear();
        let unit = match c {
            'h' => Duration::from_secs(value * 3600),
            's' => Duration::from_secs(value),
            'm' => {
                if chars.peek() == Some(&'s') {
                    chars.next();
                    Duration::from_millis(value)
                } else {
                    Duration::from_secs(value * 60)
                }
            }
            _ => bail!("invalid duration unit in: {input}"),
        };
        total += unit;
    }
    if !digits.is_empty() {
        bail!("duration is missing a unit: {input}");
    }
    Ok(total)
}
