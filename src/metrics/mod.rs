//! Process-wide metrics store: counters, bounded latency-sample rings, and
//! gauge callbacks, rendered as a line-oriented text document.
//!
//! Mirrors `app/services/metrics.py::MetricsStore` from the source this
//! pipeline was distilled from: one mutex-guarded state block, nearest-rank
//! percentiles over a sorted copy of the live ring, no index interpolation.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use parking_lot::Mutex;

/// Default capacity of each latency sample ring.
pub const DEFAULT_MAX_SAMPLES: usize = 2000;

type GaugeCallback = Box<dyn Fn() -> f64 + Send + Sync>;

struct Inner {
    max_samples: usize,
    counters: HashMap<String, u64>,
    latencies: HashMap<String, VecDeque<f64>>,
    gauges: HashMap<String, GaugeCallback>,
}

/// Counters, bounded latency-sample reservoirs, and gauge callbacks behind
/// one mutex. Contention is acceptable because every operation is short.
pub struct MetricsStore {
    inner: Mutex<Inner>,
}

impl MetricsStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_SAMPLES)
    }

    #[must_use]
    pub fn with_capacity(max_samples: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                max_samples,
                counters: HashMap::new(),
                latencies: HashMap::new(),
                gauges: HashMap::new(),
            }),
        }
    }

    /// Increment a named counter by `delta` (default 1 via [`Self::inc`]).
    pub fn inc_by(&self, name: &str, delta: u64) {
        let mut inner = self.inner.lock();
        *inner.counters.entry(name.to_string()).or_insert(0) += delta;
    }

    pub fn inc(&self, name: &str) {
        self.inc_by(name, 1);
    }

    /// Record a latency sample in milliseconds, evicting the oldest sample
    /// once the ring is at capacity.
    pub fn observe_ms(&self, name: &str, value_ms: f64) {
        let mut inner = self.inner.lock();
        let max_samples = inner.max_samples;
        let ring = inner
            .latencies
            .entry(name.to_string())
            .or_insert_with(VecDeque::new);
        if ring.len() >= max_samples {
            ring.pop_front();
        }
        ring.push_back(value_ms.max(0.0));
    }

    /// Time a block and record its duration under `name`, returning both
    /// the block's result and the elapsed milliseconds.
    pub fn time_block<T>(&self, name: &str, f: impl FnOnce() -> T) -> (T, f64) {
        let start = Instant::now();
        let result = f();
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        self.observe_ms(name, elapsed_ms);
        (result, elapsed_ms)
    }

    /// Nearest-rank percentile (0-100) over a sorted copy of the live ring.
    #[must_use]
    pub fn percentile_ms(&self, name: &str, percentile: f64) -> f64 {
        let samples = {
            let inner = self.inner.lock();
            inner
                .latencies
                .get(name)
                .map(|ring| ring.iter().copied().collect::<Vec<_>>())
                .unwrap_or_default()
        };
        percentile_from_samples(&samples, percentile)
    }

    #[must_use]
    pub fn counter(&self, name: &str) -> u64 {
        self.inner.lock().counters.get(name).copied().unwrap_or(0)
    }

    /// Register (or replace) a gauge callback, queried only at scrape time.
    pub fn set_gauge_callback(
        &self,
        name: &str,
        callback: impl Fn() -> f64 + Send + Sync + 'static,
    ) {
        self.inner
            .lock()
            .gauges
            .insert(name.to_string(), Box::new(callback));
    }

    /// Render the store as a line-oriented text document: one metric per
    /// line, with `_milliseconds{quantile="..."}` labels for latency rings.
    #[must_use]
    pub fn render(&self) -> String {
        let (counters, latencies, gauge_names): (Vec<_>, Vec<_>, Vec<_>) = {
            let inner = self.inner.lock();
            let mut counters: Vec<(String, u64)> = inner
                .counters
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect();
            counters.sort_by(|a, b| a.0.cmp(&b.0));

            let mut latencies: Vec<(String, Vec<f64>)> = inner
                .latencies
                .iter()
                .map(|(k, v)| (k.clone(), v.iter().copied().collect()))
                .collect();
            latencies.sort_by(|a, b| a.0.cmp(&b.0));

            let mut gauge_names: Vec<String> = inner.gauges.keys().cloned().collect();
            gauge_names.sort();
            (counters, latencies, gauge_names)
        };

        let mut out = String::new();
        for (name, value) in counters {
            let metric = to_metric_name(&name);
            out.push_str(&format!("{metric} {value}\n"));
        }
        for (name, mut samples) in latencies {
            if samples.is_empty() {
                continue;
            }
            let metric = to_metric_name(&name);
            samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let p50 = percentile_from_sorted(&samples, 50.0);
            let p95 = percentile_from_sorted(&samples, 95.0);
            let p99 = percentile_from_sorted(&samples, 99.0);
            out.push_str(&format!(
                "{metric}_milliseconds{{quantile=\"0.50\"}} {p50:.3}\n"
            ));
            out.push_str(&format!(
                "{metric}_milliseconds{{quantile=\"0.95\"}} {p95:.3}\n"
            ));
            out.push_str(&format!(
                "{metric}_milliseconds{{quantile=\"0.99\"}} {p99:.3}\n"
            ));
            out.push_str(&format!(
                "{metric}_milliseconds_count {}\n",
                samples.len()
            ));
        }
        for name in gauge_names {
            let value = {
                let inner = self.inner.lock();
                inner.gauges.get(&name).map(|cb| cb()).unwrap_or(0.0)
            };
            let metric = to_metric_name(&name);
            out.push_str(&format!("{metric} {value:.3}\n"));
        }
        out
    }

    /// Wrap a fallible synchronous call, recording `dependency.<name>.latency`
    /// and `dependency.<name>.failure_count` the way the source's
    /// `record_dependency_call` does.
    pub fn record_dependency_call<T, E>(
        &self,
        dependency: &str,
        call: impl FnOnce() -> std::result::Result<T, E>,
    ) -> std::result::Result<T, E> {
        let start = Instant::now();
        let result = call();
        self.observe_ms(
            &format!("dependency.{dependency}.latency"),
            start.elapsed().as_secs_f64() * 1000.0,
        );
        if result.is_err() {
            self.inc(&format!("dependency.{dependency}.failure_count"));
        }
        result
    }

    /// Async counterpart of [`Self::record_dependency_call`].
    pub async fn record_dependency_call_async<T, E, Fut>(
        &self,
        dependency: &str,
        call: impl FnOnce() -> Fut,
    ) -> std::result::Result<T, E>
    where
        Fut: std::future::Future<Output = std::result::Result<T, E>>,
    {
        let start = Instant::now();
        let result = call().await;
        self.observe_ms(
            &format!("dependency.{dependency}.latency"),
            start.elapsed().as_secs_f64() * 1000.0,
        );
        if result.is_err() {
            self.inc(&format!("dependency.{dependency}.failure_count"));
        }
        result
    }
}

impl Default for MetricsStore {
    fn default() -> Self {
        Self::new()
    }
}

fn percentile_from_samples(samples: &[f64], percentile: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    percentile_from_sorted(&sorted, percentile)
}

fn percentile_from_sorted(sorted: &[f64], percentile: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((percentile / 100.0) * (sorted.len() - 1) as f64).round() as isize;
    let idx = idx.clamp(0, sorted.len() as isize - 1) as usize;
    sorted[idx]
}

/// Map dots, dashes, slashes and spaces to underscores, per spec.md §6.
fn to_metric_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '.' | '-' | '/' | ' ' => '_',
            other => other,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_increments() {
        let store = MetricsStore::new();
        store.inc("unlock_pipeline.request_count");
        store.inc("unlock_pipeline.request_count");
        assert_eq!(store.counter("unlock_pipeline.request_count"), 2);
    }

    #[test]
    fn percentile_nearest_rank() {
        let store = MetricsStore::new();
        for v in [10.0, 20.0, 30.0, 40.0, 50.0] {
            store.observe_ms("stage.fetch", v);
        }
        assert_eq!(store.percentile_ms("stage.fetch", 50.0), 30.0);
        assert_eq!(store.percentile_ms("stage.fetch", 0.0), 10.0);
        assert_eq!(store.percentile_ms("stage.fetch", 100.0), 50.0);
    }

    #[test]
    fn ring_evicts_oldest_sample() {
        let store = MetricsStore::with_capacity(3);
        for v in [1.0, 2.0, 3.0, 4.0] {
            store.observe_ms("x", v);
        }
        // oldest sample (1.0) should have been evicted
        assert_eq!(store.percentile_ms("x", 0.0), 2.0);
    }

    #[test]
    fn render_maps_metric_names() {
        let store = MetricsStore::new();
        store.inc("unlock_pipeline.cache_hit_count");
        let rendered = store.render();
        assert!(rendered.contains("unlock_pipeline_cache_hit_count 1"));
    }

    #[test]
    fn gauge_callback_queried_at_scrape_time() {
        let store = MetricsStore::new();
        store.set_gauge_callback("queue_depth", || 7.0);
        let rendered = store.render();
        assert!(rendered.contains("queue_depth 7.000"));
    }

    #[test]
    fn dependency_call_records_failure() {
        let store = MetricsStore::new();
        let result: std::result::Result<(), &str> =
            store.record_dependency_call("test_dep", || Err("boom"));
        assert!(result.is_err());
        assert_eq!(store.counter("dependency.test_dep.failure_count"), 1);
    }
}
