//! Service counters and the bounded recent-error ring.

use prometheus::{IntCounter, Opts, Registry};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;

/// Most-recent errors kept for the stats endpoint.
const ERROR_RING_CAP: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEntry {
    pub context: String,
    pub message: String,
    pub timestamp: String,
}

/// Counter snapshot returned by [PulseMetrics::snapshot].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub price_updates: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub api_requests: u64,
    pub ws_connections: u64,
    pub events_received: u64,
    pub recent_errors: Vec<ErrorEntry>,
}

/// Fixed-key counter registry plus the error ring.
pub struct PulseMetrics {
    registry: Registry,
    pub price_updates: IntCounter,
    pub cache_hits: IntCounter,
    pub cache_misses: IntCounter,
    pub api_requests: IntCounter,
    pub ws_connections: IntCounter,
    pub events_received: IntCounter,
    recent_errors: Mutex<VecDeque<ErrorEntry>>,
    started_at: Instant,
}

impl PulseMetrics {
    pub fn new() -> Self {
        fn make(registry: &Registry, name: &str, help: &str) -> IntCounter {
            let counter = IntCounter::with_opts(Opts::new(name, help))
                .expect("counter opts are static and valid");
            registry
                .register(Box::new(counter.clone()))
                .expect("counter registered once");
            counter
        }

        let registry = Registry::new();
        Self {
            price_updates: make(&registry, "pulse_price_updates", "Price updates computed"),
            cache_hits: make(&registry, "pulse_cache_hits", "Price cache hits"),
            cache_misses: make(&registry, "pulse_cache_misses", "Price cache misses"),
            api_requests: make(&registry, "pulse_api_requests", "REST-facing operations served"),
            ws_connections: make(&registry, "pulse_ws_connections", "Fan-out sessions accepted"),
            events_received: make(&registry, "pulse_events_received", "Chain events received"),
            recent_errors: Mutex::new(VecDeque::with_capacity(ERROR_RING_CAP)),
            started_at: Instant::now(),
            registry,
        }
    }

    /// Push an error into the ring, evicting the oldest past the cap.
    pub fn record_error(&self, context: &str, message: impl Into<String>) {
        let entry = ErrorEntry {
            context: context.to_string(),
            message: message.into(),
            timestamp: crate::common::iso_timestamp(),
        };
        let mut ring = self.recent_errors.lock().expect("error ring lock");
        if ring.len() == ERROR_RING_CAP {
            ring.pop_front();
        }
        ring.push_back(entry);
    }

    pub fn recent_error_count(&self) -> usize {
        self.recent_errors.lock().expect("error ring lock").len()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.started_at.elapsed().as_secs(),
            price_updates: self.price_updates.get(),
            cache_hits: self.cache_hits.get(),
            cache_misses: self.cache_misses.get(),
            api_requests: self.api_requests.get(),
            ws_connections: self.ws_connections.get(),
            events_received: self.events_received.get(),
            recent_errors: self
                .recent_errors
                .lock()
                .expect("error ring lock")
                .iter()
                .cloned()
                .collect(),
        }
    }

    /// Prometheus registry backing the counters, for an external scrape
    /// endpoint if the embedding process exposes one.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl Default for PulseMetrics {
    fn default() -> Self {
        Self::new()
    }
}
