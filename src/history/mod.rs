//! Ticker price history
//!
//! Sqlite-backed store of raw per-provider tickers for derivative pairs.
//! The TWAP engine queries trailing windows out of it; everything else in
//! the pipeline works off in-memory state only.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};

use crate::types::{ProviderName, TickerPrice};

/// Persistent ticker history for derivative (TWAP) pairs.
pub struct PriceHistory {
    conn: Mutex<Connection>,
    retention: Duration,
}

impl PriceHistory {
    /// Open (or create) the history database at `path`. Rows older than
    /// `retention` are pruned opportunistically on insert.
    pub fn open(path: &Path, retention: Duration) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open history db at {}", path.display()))?;
        Self::init(conn, retention)
    }

    /// In-memory store for tests and dry runs.
    pub fn in_memory(retention: Duration) -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory history db")?;
        Self::init(conn, retention)
    }

    fn init(conn: Connection, retention: Duration) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tickers (
                symbol   TEXT    NOT NULL,
                provider TEXT    NOT NULL,
                price    TEXT    NOT NULL,
                volume   TEXT    NOT NULL,
                time_ms  INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tickers_symbol_time
                ON tickers (symbol, time_ms);",
        )
        .context("failed to initialize history schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
            retention,
        })
    }

    /// Record one observed ticker for a derivative symbol.
    pub fn add_ticker_price(
        &self,
        symbol: &str,
        provider: &ProviderName,
        ticker: &TickerPrice,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO tickers (symbol, provider, price, volume, time_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                symbol,
                provider.as_str(),
                ticker.price.to_string(),
                ticker.volume.to_string(),
                ticker.time.timestamp_millis(),
            ],
        )
        .context("failed to insert ticker")?;

        let cutoff = (ticker.time - self.retention).timestamp_millis();
        conn.execute(
            "DELETE FROM tickers WHERE symbol = ?1 AND time_ms < ?2",
            params![symbol, cutoff],
        )
        .context("failed to prune ticker history")?;
        Ok(())
    }

    /// All tickers for `symbol` at or after `since`, per provider, oldest
    /// first.
    pub fn get_ticker_prices(
        &self,
        symbol: &str,
        since: DateTime<Utc>,
    ) -> Result<BTreeMap<ProviderName, Vec<TickerPrice>>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT provider, price, volume, time_ms FROM tickers
                 WHERE symbol = ?1 AND time_ms >= ?2
                 ORDER BY time_ms ASC",
            )
            .context("failed to prepare history query")?;

        let rows = stmt
            .query_map(params![symbol, since.timestamp_millis()], |row| {
                let provider: String = row.get(0)?;
                let price: String = row.get(1)?;
                let volume: String = row.get(2)?;
                let time_ms: i64 = row.get(3)?;
                Ok((provider, price, volume, time_ms))
            })
            .context("failed to query history")?;

        let mut tickers: BTreeMap<ProviderName, Vec<TickerPrice>> = BTreeMap::new();
        for row in rows {
            let (provider, price, volume, time_ms) = row.context("bad history row")?;
            let time = Utc
                .timestamp_millis_opt(time_ms)
                .single()
                .context("bad timestamp in history row")?;
            tickers
                .entry(ProviderName::new(provider))
                .or_default()
                .push(TickerPrice::new(
                    price.parse().context("bad price in history row")?,
                    volume.parse().context("bad volume in history row")?,
                    time,
                ));
        }
        Ok(tickers)
    }
}
