//! Read-only status API
//!
//! Small axum server exposing the published price snapshot, a health probe
//! and the telemetry counter snapshot. Nothing here mutates oracle state.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{extract::State, http::HeaderValue, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tracing::info;

use crate::config::{parse_duration, ServerConfig};
use crate::oracle::PriceBook;
use crate::telemetry::Telemetry;

/// Prices older than this flip the health endpoint to "stale".
const STALE_AFTER_SECS: i64 = 60;

#[derive(Clone)]
pub struct ServerState {
    pub book: PriceBook,
    pub telemetry: Arc<dyn Telemetry>,
}

#[derive(Debug, Serialize)]
struct PriceEntry {
    denom: String,
    price: Decimal,
}

#[derive(Debug, Serialize)]
struct PricesResponse {
    prices: Vec<PriceEntry>,
    last_sync: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    last_sync: Option<DateTime<Utc>>,
}

/// Create the API router with all endpoints.
pub fn create_router(state: ServerState, cors: CorsLayer) -> Router {
    Router::new()
        .route("/api/prices", get(get_prices))
        .route("/api/health", get(get_health))
        .route("/api/metrics", get(get_metrics))
        .with_state(state)
        .layer(cors)
}

async fn get_prices(State(state): State<ServerState>) -> Json<PricesResponse> {
    let prices = state
        .book
        .prices()
        .into_iter()
        .map(|(denom, price)| PriceEntry { denom, price })
        .collect();
    Json(PricesResponse {
        prices,
        last_sync: state.book.last_sync(),
    })
}

async fn get_health(State(state): State<ServerState>) -> Json<HealthResponse> {
    let last_sync = state.book.last_sync();
    let status = match last_sync {
        None => "starting",
        Some(at) if (Utc::now() - at).num_seconds() > STALE_AFTER_SECS => "stale",
        Some(_) => "ok",
    };
    Json(HealthResponse { status, last_sync })
}

async fn get_metrics(
    State(state): State<ServerState>,
) -> Json<std::collections::BTreeMap<String, u64>> {
    Json(state.telemetry.counters())
}

fn cors_layer(cfg: &ServerConfig) -> CorsLayer {
    if cfg.allowed_origins.is_empty() {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }
    let origins: Vec<HeaderValue> = cfg
        .allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    if cfg.verbose_cors {
        info!(origins = ?cfg.allowed_origins, "restricting CORS");
    }
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Serve the status API until cancellation.
pub async fn serve(cfg: &ServerConfig, state: ServerState, cancel: CancellationToken) -> Result<()> {
    let write_timeout = parse_duration(&cfg.write_timeout)?;
    let router = create_router(state, cors_layer(cfg)).layer(TimeoutLayer::new(write_timeout));

    let listener = tokio::net::TcpListener::bind(&cfg.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", cfg.listen_addr))?;
    info!(addr = %cfg.listen_addr, "status server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("status server failed")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::MemorySink;
    use rust_decimal_macros::dec;

    fn state_with_sink() -> (ServerState, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::default());
        let state = ServerState {
            book: PriceBook::default(),
            telemetry: sink.clone(),
        };
        (state, sink)
    }

    #[tokio::test]
    async fn empty_book_reports_starting() {
        let (state, _) = state_with_sink();
        let response = get_health(State(state)).await;
        assert_eq!(response.status, "starting");
        assert!(response.last_sync.is_none());
    }

    #[tokio::test]
    async fn prices_endpoint_returns_sorted_entries() {
        let (state, _) = state_with_sink();
        // The book only gets written by the oracle; simulate one tick.
        let prices = std::collections::BTreeMap::from([
            ("OSMO".to_string(), dec!(0.5)),
            ("ATOM".to_string(), dec!(10)),
        ]);
        state.book.publish(prices, Utc::now());

        let response = get_prices(State(state)).await;
        assert_eq!(response.prices.len(), 2);
        assert_eq!(response.prices[0].denom, "ATOM");
        assert_eq!(response.prices[1].denom, "OSMO");
        assert!(response.last_sync.is_some());
    }

    #[tokio::test]
    async fn metrics_endpoint_snapshots_counters() {
        let (state, sink) = state_with_sink();
        sink.incr_counter(2, &["new", "tick"]);
        let response = get_metrics(State(state)).await;
        assert_eq!(response.0.get("new.tick"), Some(&2));
    }
}
