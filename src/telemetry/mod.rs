//! Telemetry sinks
//!
//! Counters and timers are emitted through an injected [`Telemetry`] sink
//! rather than a process-global registry, so tests can observe exactly what
//! the pipeline emitted. The in-memory sink keys metrics by dot-joined name
//! with any configured global labels appended.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::RwLock;

/// Sink for pipeline metrics.
pub trait Telemetry: Send + Sync {
    /// Increment a counter, e.g. `incr_counter(1, &["failure", "provider"])`.
    fn incr_counter(&self, n: u64, keys: &[&str]);

    /// Record elapsed time since `start` under the given key.
    fn measure_since(&self, start: Instant, keys: &[&str]);

    /// Record a point-in-time value, e.g. a per-provider price.
    fn set_gauge(&self, value: f64, keys: &[&str]);

    /// Snapshot of all counters, for the status API and tests.
    fn counters(&self) -> BTreeMap<String, u64> {
        BTreeMap::new()
    }
}

/// Sink that drops everything. Used when telemetry is disabled.
pub struct NoopSink;

impl Telemetry for NoopSink {
    fn incr_counter(&self, _n: u64, _keys: &[&str]) {}
    fn measure_since(&self, _start: Instant, _keys: &[&str]) {}
    fn set_gauge(&self, _value: f64, _keys: &[&str]) {}
}

/// In-memory sink backing the `/api/metrics` endpoint.
pub struct MemorySink {
    labels: Vec<(String, String)>,
    counters: RwLock<BTreeMap<String, AtomicU64>>,
    gauges: RwLock<BTreeMap<String, f64>>,
    timers_ms: RwLock<BTreeMap<String, (u64, f64)>>,
}

impl MemorySink {
    pub fn new(labels: Vec<(String, String)>) -> Self {
        Self {
            labels,
            counters: RwLock::new(BTreeMap::new()),
            gauges: RwLock::new(BTreeMap::new()),
            timers_ms: RwLock::new(BTreeMap::new()),
        }
    }

    fn metric_key(&self, keys: &[&str]) -> String {
        let mut key = keys.join(".");
        for (name, value) in &self.labels {
            key.push_str(&format!(";{}={}", name, value));
        }
        key
    }

    pub fn gauge(&self, keys: &[&str]) -> Option<f64> {
        self.gauges.read().get(&self.metric_key(keys)).copied()
    }

    pub fn counter(&self, keys: &[&str]) -> u64 {
        self.counters
            .read()
            .get(&self.metric_key(keys))
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl Telemetry for MemorySink {
    fn incr_counter(&self, n: u64, keys: &[&str]) {
        let key = self.metric_key(keys);
        {
            let counters = self.counters.read();
            if let Some(counter) = counters.get(&key) {
                counter.fetch_add(n, Ordering::Relaxed);
                return;
            }
        }
        self.counters
            .write()
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(n, Ordering::Relaxed);
    }

    fn measure_since(&self, start: Instant, keys: &[&str]) {
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        let key = self.metric_key(keys);
        let mut timers = self.timers_ms.write();
        let entry = timers.entry(key).or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += elapsed_ms;
    }

    fn set_gauge(&self, value: f64, keys: &[&str]) {
        let key = self.metric_key(keys);
        self.gauges.write().insert(key, value);
    }

    fn counters(&self) -> BTreeMap<String, u64> {
        self.counters
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect()
    }
}
