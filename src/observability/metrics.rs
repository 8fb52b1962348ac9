// Channel metrics
//
// Counters for request handling on the collector side and a gauge for the
// number of open sessions. Exported in Prometheus text format on shutdown.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counter metric (monotonically increasing)
#[derive(Debug)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// Gauge metric (can go up and down)
#[derive(Debug)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Default for Gauge {
    fn default() -> Self {
        Self::new()
    }
}

/// Request accounting for one channel
#[derive(Debug, Default)]
pub struct ChannelMetrics {
    pub requests_total: Counter,
    pub requests_rejected: Counter,
    pub requests_unrecognized: Counter,
    pub allocation_failures: Counter,
    pub producer_failures: Counter,
    pub snapshots_captured: Counter,
    pub response_bytes: Counter,
    pub responses_truncated: Counter,
    pub open_sessions: Gauge,
}

impl ChannelMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP kquery_requests_total Channel requests by outcome\n");
        output.push_str("# TYPE kquery_requests_total counter\n");
        output.push_str(&format!(
            "kquery_requests_total{{outcome=\"served\"}} {}\n",
            self.requests_total.get()
        ));
        output.push_str(&format!(
            "kquery_requests_total{{outcome=\"rejected\"}} {}\n",
            self.requests_rejected.get()
        ));
        output.push_str(&format!(
            "kquery_requests_total{{outcome=\"unrecognized\"}} {}\n",
            self.requests_unrecognized.get()
        ));
        output.push_str(&format!(
            "kquery_requests_total{{outcome=\"allocation_failure\"}} {}\n",
            self.allocation_failures.get()
        ));
        output.push_str(&format!(
            "kquery_requests_total{{outcome=\"producer_failure\"}} {}\n",
            self.producer_failures.get()
        ));

        output.push_str("# HELP kquery_snapshots_total Process snapshots captured\n");
        output.push_str("# TYPE kquery_snapshots_total counter\n");
        output.push_str(&format!(
            "kquery_snapshots_total {}\n",
            self.snapshots_captured.get()
        ));

        output.push_str("# HELP kquery_response_bytes_total Response bytes handed to readers\n");
        output.push_str("# TYPE kquery_response_bytes_total counter\n");
        output.push_str(&format!(
            "kquery_response_bytes_total {}\n",
            self.response_bytes.get()
        ));
        output.push_str(&format!(
            "kquery_responses_truncated_total {}\n",
            self.responses_truncated.get()
        ));

        output.push_str("# HELP kquery_open_sessions Currently open channel sessions\n");
        output.push_str("# TYPE kquery_open_sessions gauge\n");
        output.push_str(&format!("kquery_open_sessions {}\n", self.open_sessions.get()));

        output
    }
}
