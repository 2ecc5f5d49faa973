//! Observability metrics for rate limiting.
//!
//! A small Prometheus-shaped registry: counter and histogram families with
//! label values, updated with atomics only. Registering a name twice with
//! the same kind and labels hands back the handle registered first, so
//! several limiters built against one registry share their series.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::{Result, TallyError};

/// Prometheus default histogram buckets, in seconds.
pub const DEFAULT_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// A monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Increment by one.
    pub fn inc(&self) {
        self.inc_by(1);
    }

    /// Increment by `n`.
    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Get the current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A histogram with fixed upper bounds.
#[derive(Debug)]
pub struct Histogram {
    bounds: Arc<[f64]>,
    buckets: Vec<AtomicU64>,
    count: AtomicU64,
    sum_bits: AtomicU64,
}

impl Histogram {
    fn new(bounds: Arc<[f64]>) -> Self {
        let buckets = bounds.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            bounds,
            buckets,
            count: AtomicU64::new(0),
            sum_bits: AtomicU64::new(0f64.to_bits()),
        }
    }

    /// Record one observation.
    pub fn observe(&self, value: f64) {
        if let Some(idx) = self.bounds.iter().position(|bound| value <= *bound) {
            self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        }
        self.count.fetch_add(1, Ordering::Relaxed);

        let mut current = self.sum_bits.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + value).to_bits();
            match self.sum_bits.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    /// Get the number of observations.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Get the sum of all observations.
    pub fn sum(&self) -> f64 {
        f64::from_bits(self.sum_bits.load(Ordering::Relaxed))
    }

    /// Cumulative counts per upper bound, ending with the `+Inf` bucket.
    pub fn cumulative_buckets(&self) -> Vec<(f64, u64)> {
        let mut running = 0;
        let mut out: Vec<(f64, u64)> = self
            .bounds
            .iter()
            .zip(&self.buckets)
            .map(|(bound, bucket)| {
                running += bucket.load(Ordering::Relaxed);
                (*bound, running)
            })
            .collect();
        out.push((f64::INFINITY, self.count()));
        out
    }
}

/// A family of counters partitioned by label values.
#[derive(Debug)]
pub struct CounterVec {
    name: String,
    help: String,
    labels: Vec<String>,
    children: DashMap<Vec<String>, Arc<Counter>>,
}

impl CounterVec {
    /// Create an unregistered counter family.
    pub fn new(name: &str, help: &str, labels: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            help: help.to_string(),
            labels: labels.iter().map(|l| l.to_string()).collect(),
            children: DashMap::new(),
        }
    }

    /// Get or create the counter for the given label values.
    pub fn with_label_values(&self, values: &[&str]) -> Arc<Counter> {
        debug_assert_eq!(values.len(), self.labels.len(), "label cardinality mismatch");
        let key: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        self.children.entry(key).or_default().clone()
    }
}

/// A family of histograms partitioned by label values.
#[derive(Debug)]
pub struct HistogramVec {
    name: String,
    help: String,
    labels: Vec<String>,
    bounds: Arc<[f64]>,
    children: DashMap<Vec<String>, Arc<Histogram>>,
}

impl HistogramVec {
    /// Create an unregistered histogram family.
    pub fn new(name: &str, help: &str, labels: &[&str], buckets: &[f64]) -> Self {
        Self {
            name: name.to_string(),
            help: help.to_string(),
            labels: labels.iter().map(|l| l.to_string()).collect(),
            bounds: buckets.into(),
            children: DashMap::new(),
        }
    }

    /// Get or create the histogram for the given label values.
    pub fn with_label_values(&self, values: &[&str]) -> Arc<Histogram> {
        debug_assert_eq!(values.len(), self.labels.len(), "label cardinality mismatch");
        let key: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        self.children
            .entry(key)
            .or_insert_with(|| Arc::new(Histogram::new(self.bounds.clone())))
            .clone()
    }
}

#[derive(Debug, Clone)]
enum Collector {
    Counter(Arc<CounterVec>),
    Histogram(Arc<HistogramVec>),
}

/// Registry of metric families, keyed by name.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    collectors: DashMap<String, Collector>,
}

impl MetricsRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a counter family, or return the one already registered
    /// under `name`.
    pub fn register_counter_vec(
        &self,
        name: &str,
        help: &str,
        labels: &[&str],
    ) -> Result<Arc<CounterVec>> {
        let entry = self
            .collectors
            .entry(name.to_string())
            .or_insert_with(|| Collector::Counter(Arc::new(CounterVec::new(name, help, labels))));

        match entry.value() {
            Collector::Counter(vec) if vec.labels == labels => Ok(vec.clone()),
            Collector::Counter(_) => Err(TallyError::Registry(format!(
                "{} already registered with different labels",
                name
            ))),
            Collector::Histogram(_) => Err(TallyError::Registry(format!(
                "{} already registered as a histogram",
                name
            ))),
        }
    }

    /// Register a histogram family, or return the one already registered
    /// under `name`.
    pub fn register_histogram_vec(
        &self,
        name: &str,
        help: &str,
        labels: &[&str],
        buckets: &[f64],
    ) -> Result<Arc<HistogramVec>> {
        let entry = self.collectors.entry(name.to_string()).or_insert_with(|| {
            Collector::Histogram(Arc::new(HistogramVec::new(name, help, labels, buckets)))
        });

        match entry.value() {
            Collector::Histogram(vec) if vec.labels == labels => Ok(vec.clone()),
            Collector::Histogram(_) => Err(TallyError::Registry(format!(
                "{} already registered with different labels",
                name
            ))),
            Collector::Counter(_) => Err(TallyError::Registry(format!(
                "{} already registered as a counter",
                name
            ))),
        }
    }

    /// Get the number of registered families.
    pub fn len(&self) -> usize {
        self.collectors.len()
    }

    /// Check if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.collectors.is_empty()
    }

    /// Render every family in the Prometheus text exposition format.
    pub fn render_text(&self) -> String {
        let families: BTreeMap<String, Collector> = self
            .collectors
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut out = String::new();
        for collector in families.values() {
            match collector {
                Collector::Counter(vec) => render_counter_vec(&mut out, vec),
                Collector::Histogram(vec) => render_histogram_vec(&mut out, vec),
            }
        }
        out
    }
}

fn render_counter_vec(out: &mut String, vec: &CounterVec) {
    let _ = writeln!(out, "# HELP {} {}", vec.name, vec.help);
    let _ = writeln!(out, "# TYPE {} counter", vec.name);

    let children: BTreeMap<Vec<String>, u64> = vec
        .children
        .iter()
        .map(|entry| (entry.key().clone(), entry.value().get()))
        .collect();
    for (values, count) in children {
        let _ = writeln!(out, "{}{} {}", vec.name, label_set(&vec.labels, &values, None), count);
    }
}

fn render_histogram_vec(out: &mut String, vec: &HistogramVec) {
    let _ = writeln!(out, "# HELP {} {}", vec.name, vec.help);
    let _ = writeln!(out, "# TYPE {} histogram", vec.name);

    let children: BTreeMap<Vec<String>, Arc<Histogram>> = vec
        .children
        .iter()
        .map(|entry| (entry.key().clone(), entry.value().clone()))
        .collect();
    for (values, histogram) in children {
        for (bound, count) in histogram.cumulative_buckets() {
            let le = if bound.is_infinite() {
                "+Inf".to_string()
            } else {
                bound.to_string()
            };
            let _ = writeln!(
                out,
                "{}_bucket{} {}",
                vec.name,
                label_set(&vec.labels, &values, Some(&le)),
                count
            );
        }
        let labels = label_set(&vec.labels, &values, None);
        let _ = writeln!(out, "{}_sum{} {}", vec.name, labels, histogram.sum());
        let _ = writeln!(out, "{}_count{} {}", vec.name, labels, histogram.count());
    }
}

fn label_set(names: &[String], values: &[String], le: Option<&str>) -> String {
    let mut pairs: Vec<String> = names
        .iter()
        .zip(values)
        .map(|(name, value)| format!("{}=\"{}\"", name, escape_label(value)))
        .collect();
    if let Some(le) = le {
        pairs.push(format!("le=\"{}\"", le));
    }

    if pairs.is_empty() {
        String::new()
    } else {
        format!("{{{}}}", pairs.join(","))
    }
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

/// The instruments a limiter records into.
#[derive(Debug, Clone)]
pub struct LimiterMetrics {
    requests_total: Arc<CounterVec>,
    check_duration: Arc<HistogramVec>,
    cache_hits_total: Arc<Counter>,
}

impl LimiterMetrics {
    /// Register the limiter families in `registry`, reusing any already
    /// present.
    pub fn register(registry: &MetricsRegistry) -> Result<Self> {
        let requests_total = registry.register_counter_vec(
            "ratelimit_requests_total",
            "Total number of rate limit checks.",
            &["allowed"],
        )?;
        let check_duration = registry.register_histogram_vec(
            "ratelimit_check_duration_seconds",
            "Duration of rate limit checks in seconds.",
            &["allowed"],
            &DEFAULT_BUCKETS,
        )?;
        let cache_hits_total = registry
            .register_counter_vec(
                "ratelimit_cache_hits_total",
                "Total number of blocked cache hits (store calls avoided).",
                &[],
            )?
            .with_label_values(&[]);

        Ok(Self {
            requests_total,
            check_duration,
            cache_hits_total,
        })
    }

    /// Instruments that are not exposed through any registry.
    pub fn detached() -> Self {
        Self {
            requests_total: Arc::new(CounterVec::new(
                "ratelimit_requests_total",
                "Total number of rate limit checks.",
                &["allowed"],
            )),
            check_duration: Arc::new(HistogramVec::new(
                "ratelimit_check_duration_seconds",
                "Duration of rate limit checks in seconds.",
                &["allowed"],
                &DEFAULT_BUCKETS,
            )),
            cache_hits_total: Arc::new(Counter::default()),
        }
    }

    /// Record the outcome and latency of one check.
    pub fn record_check(&self, allowed: bool, duration: std::time::Duration) {
        let label = if allowed { "true" } else { "false" };
        self.requests_total.with_label_values(&[label]).inc();
        self.check_duration
            .with_label_values(&[label])
            .observe(duration.as_secs_f64());
    }

    /// Record a check answered from the block cache.
    pub fn record_cache_hit(&self) {
        self.cache_hits_total.inc();
    }

    /// Get the number of checks with the given outcome.
    pub fn requests(&self, allowed: bool) -> u64 {
        let label = if allowed { "true" } else { "false" };
        self.requests_total.with_label_values(&[label]).get()
    }

    /// Get the number of block cache hits.
    pub fn cache_hits(&self) -> u64 {
        self.cache_hits_total.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_counter_vec_children_are_shared() {
        let vec = CounterVec::new("hits", "help", &["allowed"]);
        vec.with_label_values(&["true"]).inc();
        vec.with_label_values(&["true"]).inc_by(2);
        vec.with_label_values(&["false"]).inc();

        assert_eq!(vec.with_label_values(&["true"]).get(), 3);
        assert_eq!(vec.with_label_values(&["false"]).get(), 1);
    }

    #[test]
    fn test_histogram_buckets_and_sum() {
        let histogram = Histogram::new(Arc::from(&[0.1, 1.0][..]));
        histogram.observe(0.05);
        histogram.observe(0.5);
        histogram.observe(5.0);

        assert_eq!(histogram.count(), 3);
        assert!((histogram.sum() - 5.55).abs() < 1e-9);
        assert_eq!(
            histogram.cumulative_buckets(),
            vec![(0.1, 1), (1.0, 2), (f64::INFINITY, 3)]
        );
    }

    #[test]
    fn test_first_registration_wins() {
        let registry = MetricsRegistry::new();
        let first = registry.register_counter_vec("c", "first", &["a"]).unwrap();
        let second = registry.register_counter_vec("c", "second", &["a"]).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.help, "first");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_conflicting_registration_is_rejected() {
        let registry = MetricsRegistry::new();
        registry.register_counter_vec("m", "help", &["a"]).unwrap();

        assert!(registry.register_counter_vec("m", "help", &["b"]).is_err());
        assert!(registry
            .register_histogram_vec("m", "help", &["a"], &DEFAULT_BUCKETS)
            .is_err());
    }

    #[test]
    fn test_limiter_metrics_shared_through_registry() {
        let registry = MetricsRegistry::new();
        let a = LimiterMetrics::register(&registry).unwrap();
        let b = LimiterMetrics::register(&registry).unwrap();

        a.record_check(true, Duration::from_millis(2));
        b.record_check(false, Duration::from_millis(3));
        b.record_cache_hit();

        assert_eq!(a.requests(true), 1);
        assert_eq!(a.requests(false), 1);
        assert_eq!(a.cache_hits(), 1);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_render_text() {
        let registry = MetricsRegistry::new();
        let metrics = LimiterMetrics::register(&registry).unwrap();
        metrics.record_check(true, Duration::from_millis(20));
        metrics.record_cache_hit();

        let text = registry.render_text();

        assert!(text.contains("# TYPE ratelimit_requests_total counter"));
        assert!(text.contains("ratelimit_requests_total{allowed=\"true\"} 1"));
        assert!(text.contains("ratelimit_cache_hits_total 1"));
        assert!(text.contains("ratelimit_check_duration_seconds_bucket{allowed=\"true\",le=\"0.025\"} 1"));
        assert!(text.contains("ratelimit_check_duration_seconds_bucket{allowed=\"true\",le=\"+Inf\"} 1"));
        assert!(text.contains("ratelimit_check_duration_seconds_count{allowed=\"true\"} 1"));
    }

    #[test]
    fn test_label_values_are_escaped() {
        assert_eq!(escape_label("a\"b\\c\nd"), "a\\\"b\\\\c\\nd");
    }
}
