//! Vote publication
//!
//! The scheduler hands this module opaque payload bytes; everything about
//! reaching the ledger topic (gateway selection, request authentication)
//! lives here. Key material never crosses into the oracle core.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;
use tracing::debug;

use crate::config::AccountConfig;

/// Prevote payload: the truncated hash commits to the rates without
/// revealing them. Field order is part of the wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrevoteMsg {
    pub hash: String,
    pub feeder: String,
}

/// Vote payload revealing the salt and rates behind the previous prevote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteMsg {
    pub salt: String,
    pub exchange_rates: String,
    pub feeder: String,
}

/// Submits payload bytes to the ledger topic, at-least-once. A failed
/// submit is simply reported; the scheduler retries on its next tick.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn submit(&self, payload: Vec<u8>) -> Result<()>;
}

/// HTTP client for a topic gateway.
pub struct TopicClient {
    client: Client,
    gateway: String,
    topic_id: String,
    operator_id: String,
    secret: Vec<u8>,
}

impl TopicClient {
    pub fn new(account: &AccountConfig) -> Result<Self> {
        let gateway = resolve_gateway(&account.network_name)?;
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            client,
            gateway,
            topic_id: account.topic_id.clone(),
            operator_id: account.operator_id.clone(),
            secret: account.operator_seed.as_bytes().to_vec(),
        })
    }
}

#[async_trait]
impl Publisher for TopicClient {
    async fn submit(&self, payload: Vec<u8>) -> Result<()> {
        let path = format!("/topics/{}/messages", self.topic_id);
        let body = serde_json::json!({
            "message": general_purpose::STANDARD.encode(&payload),
        })
        .to_string();
        let timestamp = Utc::now().timestamp();
        let signature = request_signature(&self.secret, timestamp, "POST", &path, &body)?;

        let response = self
            .client
            .post(format!("{}{}", self.gateway, path))
            .header("Content-Type", "application/json")
            .header("X-Operator-Id", &self.operator_id)
            .header("X-Timestamp", timestamp)
            .header("X-Signature", signature)
            .body(body)
            .send()
            .await
            .context("topic submission failed")?;

        if !response.status().is_success() {
            bail!("topic gateway returned {}", response.status());
        }

        debug!(topic_id = %self.topic_id, bytes = payload.len(), "submitted message to topic");
        Ok(())
    }
}

fn resolve_gateway(network_name: &str) -> Result<String> {
    let gateway = match network_name {
        "mainnet" => "https://topics.feedernet.io",
        "testnet" => "https://topics.testnet.feedernet.io",
        "localnet" => "http://127.0.0.1:5551",
        custom if custom.starts_with("http://") || custom.starts_with("https://") => custom,
        other => bail!("unknown network: {other}"),
    };
    Ok(gateway.trim_end_matches('/').to_string())
}

/// HMAC-SHA256 over `{timestamp}{METHOD}{path}{body}`, url-safe base64.
fn request_signature(
    secret: &[u8],
    timestamp: i64,
    method: &str,
    path: &str,
    body: &str,
) -> Result<String> {
    type HmacSha256 = Hmac<Sha256>;
    let mut mac = HmacSha256::new_from_slice(secret).context("failed to initialize hmac")?;
    mac.update(format!("{timestamp}{method}{path}{body}").as_bytes());
    Ok(general_purpose::URL_SAFE.encode(mac.finalize().into_bytes()))
}
