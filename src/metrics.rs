//! In-process counters for the cache engine
//!
//! Plain atomics, updated on the request path and exposed as a read-only
//! snapshot. Snapshots are eventually consistent; nothing is shipped
//! anywhere.

use crate::error::UpstreamErrorKind;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
struct LatencyRecorder {
    count: AtomicU64,
    total_ms: AtomicU64,
    max_ms: AtomicU64,
}

impl LatencyRecorder {
    fn record(&self, elapsed: Duration) {
        let ms = elapsed.as_millis() as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ms.fetch_add(ms, Ordering::Relaxed);
        self.max_ms.fetch_max(ms, Ordering::Relaxed);
    }

    fn snapshot(&self) -> LatencySnapshot {
        LatencySnapshot {
            count: self.count.load(Ordering::Relaxed),
            total_ms: self.total_ms.load(Ordering::Relaxed),
            max_ms: self.max_ms.load(Ordering::Relaxed),
        }
    }
}

/// Aggregated latency figures for one operation family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencySnapshot {
    pub count: u64,
    pub total_ms: u64,
    pub max_ms: u64,
}

impl LatencySnapshot {
    pub fn mean_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_ms as f64 / self.count as f64
        }
    }
}

/// Metric registry owned by one engine instance.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Bars answered from the store without touching upstream.
    hits: AtomicU64,
    /// Bars that had to be fetched.
    misses: AtomicU64,
    upstream_calls: AtomicU64,
    upstream_rate_limited: AtomicU64,
    upstream_not_found: AtomicU64,
    upstream_network: AtomicU64,
    upstream_schema_changed: AtomicU64,
    upstream_auth: AtomicU64,
    bars_stored: AtomicU64,
    bars_served: AtomicU64,
    /// Requests that observed an identical in-flight computation and
    /// reused its result.
    upstream_inflight_dedup: AtomicU64,
    /// Requests served without trading-day filtering because the calendar
    /// was unavailable.
    degraded: AtomicU64,
    overloaded: AtomicU64,
    negative_coverage_hits: AtomicU64,
    request_latency: LatencyRecorder,
    upstream_latency: LatencyRecorder,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hits(&self, n: u64) {
        self.hits.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_misses(&self, n: u64) {
        self.misses.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_upstream_call(&self, elapsed: Duration) {
        self.upstream_calls.fetch_add(1, Ordering::Relaxed);
        self.upstream_latency.record(elapsed);
    }

    pub fn record_upstream_error(&self, kind: UpstreamErrorKind) {
        let counter = match kind {
            UpstreamErrorKind::RateLimited => &self.upstream_rate_limited,
            UpstreamErrorKind::NotFound => &self.upstream_not_found,
            UpstreamErrorKind::Network => &self.upstream_network,
            UpstreamErrorKind::SchemaChanged => &self.upstream_schema_changed,
            UpstreamErrorKind::Auth => &self.upstream_auth,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bars_stored(&self, n: u64) {
        self.bars_stored.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_bars_served(&self, n: u64) {
        self.bars_served.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_inflight_dedup(&self) {
        self.upstream_inflight_dedup.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_degraded(&self) {
        self.degraded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_overloaded(&self) {
        self.overloaded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_negative_hit(&self, n: u64) {
        self.negative_coverage_hits.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_request(&self, elapsed: Duration) {
        self.request_latency.record(elapsed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            upstream_calls: self.upstream_calls.load(Ordering::Relaxed),
            upstream_errors: UpstreamErrorCounts {
                rate_limited: self.upstream_rate_limited.load(Ordering::Relaxed),
                not_found: self.upstream_not_found.load(Ordering::Relaxed),
                network: self.upstream_network.load(Ordering::Relaxed),
                schema_changed: self.upstream_schema_changed.load(Ordering::Relaxed),
                auth: self.upstream_auth.load(Ordering::Relaxed),
            },
            bars_stored: self.bars_stored.load(Ordering::Relaxed),
            bars_served: self.bars_served.load(Ordering::Relaxed),
            upstream_inflight_dedup: self.upstream_inflight_dedup.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
            overloaded: self.overloaded.load(Ordering::Relaxed),
            negative_coverage_hits: self.negative_coverage_hits.load(Ordering::Relaxed),
            request_latency: self.request_latency.snapshot(),
            upstream_latency: self.upstream_latency.snapshot(),
        }
    }
}

/// Upstream failures by class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamErrorCounts {
    pub rate_limited: u64,
    pub not_found: u64,
    pub network: u64,
    pub schema_changed: u64,
    pub auth: u64,
}

/// Read-only view of the counters at one instant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub upstream_calls: u64,
    pub upstream_errors: UpstreamErrorCounts,
    pub bars_stored: u64,
    pub bars_served: u64,
    pub upstream_inflight_dedup: u64,
    pub degraded: u64,
    pub overloaded: u64,
    pub negative_coverage_hits: u64,
    pub request_latency: LatencySnapshot,
    pub upstream_latency: LatencySnapshot,
}

impl MetricsSnapshot {
    /// Fraction of requested bars served from the store.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = Metrics::new();
        metrics.record_hits(9);
        metrics.record_misses(3);
        metrics.record_upstream_call(Duration::from_millis(120));
        metrics.record_upstream_call(Duration::from_millis(80));
        metrics.record_upstream_error(UpstreamErrorKind::RateLimited);
        metrics.record_bars_stored(3);

        let snap = metrics.snapshot();
        assert_eq!(snap.hits, 9);
        assert_eq!(snap.misses, 3);
        assert_eq!(snap.upstream_calls, 2);
        assert_eq!(snap.upstream_errors.rate_limited, 1);
        assert_eq!(snap.upstream_latency.count, 2);
        assert_eq!(snap.upstream_latency.total_ms, 200);
        assert_eq!(snap.upstream_latency.max_ms, 120);
        assert!((snap.hit_ratio() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = Metrics::new();
        metrics.record_hits(1);
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["hits"], 1);
    }
}
