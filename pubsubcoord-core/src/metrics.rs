//! Prometheus metrics for the coordinator and tree server
//!
//! Metrics are process-wide statics rendered in the Prometheus text format.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

/// Anything that can render itself in the Prometheus text format
pub trait Metric: Send + Sync {
    fn to_prometheus(&self) -> String;
}

fn header(name: &str, help: &str, kind: &str) -> String {
    format!("# HELP {name} {help}\n# TYPE {name} {kind}\n")
}

/// Monotonically increasing counter
pub struct Counter {
    value: AtomicU64,
    name: &'static str,
    help: &'static str,
}

impl Counter {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            value: AtomicU64::new(0),
            name,
            help,
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_by(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Metric for Counter {
    fn to_prometheus(&self) -> String {
        let mut out = header(self.name, self.help, "counter");
        out.push_str(&format!("{} {}\n", self.name, self.get()));
        out
    }
}

/// Gauge that can go up or down
pub struct Gauge {
    value: AtomicI64,
    name: &'static str,
    help: &'static str,
}

impl Gauge {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            value: AtomicI64::new(0),
            name,
            help,
        }
    }

    pub fn set(&self, val: i64) {
        self.value.store(val, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Metric for Gauge {
    fn to_prometheus(&self) -> String {
        let mut out = header(self.name, self.help, "gauge");
        out.push_str(&format!("{} {}\n", self.name, self.get()));
        out
    }
}

/// Cumulative histogram of durations in seconds
pub struct Histogram {
    bounds: &'static [f64],
    buckets: Vec<AtomicU64>,
    /// Sum in microseconds
    sum_micros: AtomicU64,
    count: AtomicU64,
    name: &'static str,
    help: &'static str,
}

/// Barrier waits range from milliseconds to the length of a whole run
pub const WAIT_BUCKETS: &[f64] = &[0.01, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 300.0, 900.0];

impl Histogram {
    pub fn new(name: &'static str, help: &'static str, bounds: &'static [f64]) -> Self {
        Self {
            bounds,
            buckets: bounds.iter().map(|_| AtomicU64::new(0)).collect(),
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
            name,
            help,
        }
    }

    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((value * 1_000_000.0) as u64, Ordering::Relaxed);
        for (bound, bucket) in self.bounds.iter().zip(&self.buckets) {
            if value <= *bound {
                bucket.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn observe_duration(&self, elapsed: Duration) {
        self.observe(elapsed.as_secs_f64());
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Metric for Histogram {
    fn to_prometheus(&self) -> String {
        let mut out = header(self.name, self.help, "histogram");
        for (bound, bucket) in self.bounds.iter().zip(&self.buckets) {
            out.push_str(&format!(
                "{}_bucket{{le=\"{}\"}} {}\n",
                self.name,
                bound,
                bucket.load(Ordering::Relaxed)
            ));
        }
        out.push_str(&format!("{}_bucket{{le=\"+Inf\"}} {}\n", self.name, self.count()));
        let sum = self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        out.push_str(&format!("{}_sum {}\n", self.name, sum));
        out.push_str(&format!("{}_count {}\n", self.name, self.count()));
        out
    }
}

/// Process-wide metrics
pub mod standard {
    use super::*;
    use std::sync::LazyLock;

    pub static WATCH_FIRES: Counter = Counter::new(
        "pubsubcoord_watch_fires_total",
        "Watch notifications handled by the dispatcher",
    );

    pub static DUPLICATE_TRANSITIONS: Counter = Counter::new(
        "pubsubcoord_duplicate_transitions_total",
        "Group transitions ignored because they were already applied",
    );

    pub static BARRIERS_OPENED: Counter = Counter::new(
        "pubsubcoord_barriers_opened_total",
        "Barrier nodes deleted",
    );

    pub static JOINED_CLIENTS: Gauge = Gauge::new(
        "pubsubcoord_joined_clients",
        "Clients whose endpoints have all registered",
    );

    pub static JOINED_REGIONS: Gauge = Gauge::new(
        "pubsubcoord_joined_regions",
        "Regions whose clients have all joined",
    );

    pub static OPEN_SESSIONS: Gauge = Gauge::new(
        "pubsubcoord_open_sessions",
        "Sessions open on the coordination tree",
    );

    pub static BARRIER_WAIT_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
        Histogram::new(
            "pubsubcoord_barrier_wait_duration_seconds",
            "Time spent waiting for a barrier to open",
            WAIT_BUCKETS,
        )
    });
}

/// Render every standard metric
pub fn gather_system_metrics() -> String {
    let metrics: [&dyn Metric; 7] = [
        &standard::WATCH_FIRES,
        &standard::DUPLICATE_TRANSITIONS,
        &standard::BARRIERS_OPENED,
        &standard::JOINED_CLIENTS,
        &standard::JOINED_REGIONS,
        &standard::OPEN_SESSIONS,
        &*standard::BARRIER_WAIT_DURATION,
    ];
    metrics.iter().map(|m| m.to_prometheus()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new("test_counter", "Test counter");
        counter.inc();
        counter.inc_by(5);
        assert_eq!(counter.get(), 6);
        assert!(counter.to_prometheus().contains("test_counter 6"));
    }

    #[test]
    fn test_gauge() {
        let gauge = Gauge::new("test_gauge", "Test gauge");
        gauge.set(10);
        gauge.dec();
        assert_eq!(gauge.get(), 9);
    }

    #[test]
    fn test_histogram_buckets_are_cumulative() {
        let histogram = Histogram::new("test_wait", "Test wait", WAIT_BUCKETS);
        histogram.observe(0.05);
        histogram.observe_duration(Duration::from_secs(2));
        histogram.observe(10_000.0);

        let text = histogram.to_prometheus();
        assert!(text.contains("test_wait_bucket{le=\"0.1\"} 1"));
        assert!(text.contains("test_wait_bucket{le=\"5\"} 2"));
        assert!(text.contains("test_wait_bucket{le=\"+Inf\"} 3"));
        assert!(text.contains("test_wait_count 3"));
    }

    #[test]
    fn test_gather_lists_every_metric() {
        let text = gather_system_metrics();
        assert!(text.contains("pubsubcoord_barriers_opened_total"));
        assert!(text.contains("pubsubcoord_barrier_wait_duration_seconds_count"));
    }
}
