//! Provisioner metrics
//!
//! The core never registers metrics globally. Every component receives an
//! `Arc<dyn Observer>` and reports through it; the binary wires in
//! [`FleetMetrics`], tests usually use [`NoopObserver`] or their own
//! `FleetMetrics` to assert on counters.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

// =============================================================================
// Metric names
// =============================================================================

pub const DISCOVERED: &str = "discovered";
pub const EVENT_DISCOVERED: &str = "event_discovered";
pub const DISCOVER_CYCLES: &str = "discover_cycles";
pub const DISCOVERY_ERRORS: &str = "discovery_errors";
pub const PROVISION_ERRORS: &str = "provision_errors";
pub const PROVISIONED: &str = "provisioned";
pub const BUSY_WORKERS: &str = "busy_workers";
pub const WORK_QUEUE_ENTRIES: &str = "work_queue_entries";
pub const WAITING_NODES: &str = "waiting_nodes";
pub const RPC_TIME: &str = "rpc_time";
pub const RPC_ERRORS: &str = "rpc_errors";
pub const HELPER_TIME: &str = "helper_time";
pub const HELPER_ERRORS: &str = "helper_errors";
pub const PAUSED: &str = "paused";

/// Sink for counters, gauges and timings
pub trait Observer: Send + Sync {
    /// Increment a counter, optionally labelled (e.g. by action)
    fn incr(&self, name: &str, label: Option<&str>);

    /// Set a gauge to an absolute value
    fn set_gauge(&self, name: &str, value: f64);

    /// Record a duration against a timer
    fn observe(&self, name: &str, label: Option<&str>, elapsed: Duration);
}

/// Observer that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl Observer for NoopObserver {
    fn incr(&self, _name: &str, _label: Option<&str>) {}
    fn set_gauge(&self, _name: &str, _value: f64) {}
    fn observe(&self, _name: &str, _label: Option<&str>, _elapsed: Duration) {}
}

/// Aggregated timings for one timer series
#[derive(Debug, Clone, Default, Serialize)]
pub struct TimingStats {
    pub count: u64,
    pub total_ms: u64,
    pub max_ms: u64,
}

/// Point-in-time copy of all metrics
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub site: String,
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, f64>,
    pub timings: BTreeMap<String, TimingStats>,
}

/// In-memory metrics store labelled by site
pub struct FleetMetrics {
    site: String,
    counters: DashMap<String, u64>,
    gauges: DashMap<String, f64>,
    timings: DashMap<String, TimingStats>,
}

impl FleetMetrics {
    pub fn new(site: impl Into<String>) -> Self {
        Self {
            site: site.into(),
            counters: DashMap::new(),
            gauges: DashMap::new(),
            timings: DashMap::new(),
        }
    }

    fn key(name: &str, label: Option<&str>) -> String {
        match label {
            Some(label) => format!("{}{{{}}}", name, label),
            None => name.to_string(),
        }
    }

    /// Current value of a counter, zero when never incremented
    pub fn counter(&self, name: &str, label: Option<&str>) -> u64 {
        self.counters
            .get(&Self::key(name, label))
            .map(|v| *v)
            .unwrap_or(0)
    }

    /// Current value of a gauge
    pub fn gauge(&self, name: &str) -> Option<f64> {
        self.gauges.get(name).map(|v| *v)
    }

    /// Number of observations recorded for a timer
    pub fn timing_count(&self, name: &str, label: Option<&str>) -> u64 {
        self.timings
            .get(&Self::key(name, label))
            .map(|t| t.count)
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            site: self.site.clone(),
            counters: self
                .counters
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            gauges: self
                .gauges
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            timings: self
                .timings
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
        }
    }
}

impl Observer for FleetMetrics {
    fn incr(&self, name: &str, label: Option<&str>) {
        *self.counters.entry(Self::key(name, label)).or_insert(0) += 1;
    }

    fn set_gauge(&self, name: &str, value: f64) {
        self.gauges.insert(name.to_string(), value);
    }

    fn observe(&self, name: &str, label: Option<&str>, elapsed: Duration) {
        let ms = elapsed.as_millis() as u64;
        let mut stats = self.timings.entry(Self::key(name, label)).or_default();
        stats.count += 1;
        stats.total_ms += ms;
        stats.max_ms = stats.max_ms.max(ms);
    }
}

/// Drop guard that records the elapsed time when it goes out of scope
pub struct Timer<'a> {
    observer: &'a dyn Observer,
    name: &'static str,
    label: Option<String>,
    start: Instant,
}

impl<'a> Timer<'a> {
    pub fn start(observer: &'a dyn Observer, name: &'static str, label: Option<&str>) -> Self {
        Self {
            observer,
            name,
            label: label.map(str::to_string),
            start: Instant::now(),
        }
    }
}

impl Drop for Timer<'_> {
    fn drop(&mut self) {
        self.observer
            .observe(self.name, self.label.as_deref(), self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_labelled() {
        let metrics = FleetMetrics::new("lon");
        metrics.incr(RPC_ERRORS, Some("choria_provision#jwt"));
        metrics.incr(RPC_ERRORS, Some("choria_provision#jwt"));
        metrics.incr(RPC_ERRORS, Some("rpcutil#inventory"));

        assert_eq!(metrics.counter(RPC_ERRORS, Some("choria_provision#jwt")), 2);
        assert_eq!(metrics.counter(RPC_ERRORS, Some("rpcutil#inventory")), 1);
        assert_eq!(metrics.counter(RPC_ERRORS, None), 0);
    }

    #[test]
    fn test_timer_records_on_drop() {
        let metrics = FleetMetrics::new("lon");
        {
            let _timer = Timer::start(&metrics, HELPER_TIME, None);
        }
        assert_eq!(metrics.timing_count(HELPER_TIME, None), 1);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.site, "lon");
        assert!(snapshot.timings.contains_key(HELPER_TIME));
    }
}
