//! State-free autotuner: reads the metrics store each tick and adjusts the
//! limiter's concurrency cap and the retry loop's effective ceiling.
//! Grounded on spec.md §4.11; no direct Python counterpart (the source
//! hard-codes these as module-level helper functions called from
//! `fetch_and_clean`'s tail), so the constants and arithmetic are carried
//! from spec.md verbatim rather than translated from a specific file.

use crate::config::PipelineConfig;
use crate::metrics::MetricsStore;

/// Latency name under which per-request fetch-stage duration is recorded.
pub const STAGE_FETCH_METRIC: &str = "unlock_pipeline.stage.fetch";
/// Latency name under which limiter queue-wait duration is recorded.
pub const QUEUE_WAIT_METRIC: &str = "unlock_pipeline.stage.queue_wait";

const QUEUE_WAIT_CEILING_MS: f64 = 1500.0;
const NEAR_THRESHOLD_RATIO: f64 = 0.80;
const DECREMENT_FETCH_RATIO: f64 = 1.1;
const DECREMENT_RETRY_RATE: f64 = 0.40;
const INCREMENT_QUEUE_WAIT_MS: f64 = 700.0;
const INCREMENT_RETRY_RATE: f64 = 0.20;
const INCREMENT_BLOCKED_RATIO: f64 = 0.25;

/// Computes the retry ceiling to use for the *next* request's retry loop,
/// consulted at the start of every retry loop per spec.md §4.7.
///
/// Degrades from `configured_max` to `floor+1` to `floor` as p95 fetch
/// latency or p95 queue wait climb toward (and past) the slow-fetch
/// threshold; never below 1.
#[must_use]
pub fn effective_retry_ceiling(metrics: &MetricsStore, config: &PipelineConfig) -> u32 {
    let p95_fetch = metrics.percentile_ms(STAGE_FETCH_METRIC, 95.0);
    let p95_queue = metrics.percentile_ms(QUEUE_WAIT_METRIC, 95.0);
    let configured_max = config.fetch_max_retries;
    let floor = config.dynamic_fetch_retry_floor;

    if p95_fetch >= config.slow_fetch_threshold_ms || p95_queue >= QUEUE_WAIT_CEILING_MS {
        return configured_max.min(floor).max(1);
    }
    if p95_fetch >= config.slow_fetch_threshold_ms * NEAR_THRESHOLD_RATIO {
        return configured_max.min(floor + 1).max(1);
    }
    configured_max.max(1)
}

/// Input snapshot the concurrency adjustment is computed from; callers
/// assemble this from the metrics store and the running request counter.
pub struct AutotuneSnapshot {
    pub requests: u64,
    pub retries: u64,
    pub blocked: u64,
    pub p95_fetch_ms: f64,
    pub p95_queue_wait_ms: f64,
}

/// Concurrency adjustment direction for one autotune tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    Decrement,
    Increment,
    NoChange,
}

/// Decides whether to grow, shrink, or hold the concurrency cap, per
/// spec.md §4.11's thresholds. Does not itself call
/// `limiter.set_max_concurrency` — the caller applies the result so this
/// function stays pure and test-friendly.
#[must_use]
pub fn decide_adjustment(snapshot: &AutotuneSnapshot, config: &PipelineConfig) -> Adjustment {
    if snapshot.requests == 0 {
        return Adjustment::NoChange;
    }
    let retry_rate = snapshot.retries as f64 / snapshot.requests as f64;
    let blocked_ratio = snapshot.blocked as f64 / snapshot.requests as f64;

    if snapshot.p95_fetch_ms > config.slow_fetch_threshold_ms * DECREMENT_FETCH_RATIO
        || retry_rate > DECREMENT_RETRY_RATE
    {
        return Adjustment::Decrement;
    }
    if snapshot.p95_queue_wait_ms > INCREMENT_QUEUE_WAIT_MS
        && retry_rate < INCREMENT_RETRY_RATE
        && blocked_ratio < INCREMENT_BLOCKED_RATIO
    {
        return Adjustment::Increment;
    }
    Adjustment::NoChange
}

/// Applies [`decide_adjustment`]'s verdict to `current`, clamped to
/// `[config.fetch_concurrency_min, config.fetch_concurrency_max]`.
#[must_use]
pub fn next_concurrency(current: usize, snapshot: &AutotuneSnapshot, config: &PipelineConfig) -> usize {
    match decide_adjustment(snapshot, config) {
        Adjustment::Decrement => current.saturating_sub(1).max(config.fetch_concurrency_min),
        Adjustment::Increment => (current + 1).min(config.fetch_concurrency_max),
        Adjustment::NoChange => current,
    }
}

/// Runs an autotune tick when `request_count` is a multiple of the
/// configured interval (and nonzero); returns the new concurrency cap if
/// one should be applied.
#[must_use]
pub fn maybe_autotune(
    request_count: u64,
    current_concurrency: usize,
    snapshot: &AutotuneSnapshot,
    config: &PipelineConfig,
) -> Option<usize> {
    if request_count == 0 || request_count % u64::from(config.fetch_autotune_every_n_requests) != 0 {
        return None;
    }
    let next = next_concurrency(current_concurrency, snapshot, config);
    if next == current_concurrency {
        None
    } else {
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PipelineConfig {
        PipelineConfig::builder()
            .fetch_concurrency_range(2, 32)
            .validate()
            .unwrap()
            .build()
    }

    #[test]
    fn retry_ceiling_degrades_under_slow_fetch() {
        let metrics = MetricsStore::new();
        for _ in 0..10 {
            metrics.observe_ms(STAGE_FETCH_METRIC, 13_000.0);
        }
        let ceiling = effective_retry_ceiling(&metrics, &config());
        assert_eq!(ceiling, config().dynamic_fetch_retry_floor.max(1));
    }

    #[test]
    fn retry_ceiling_is_full_when_fast() {
        let metrics = MetricsStore::new();
        for _ in 0..10 {
            metrics.observe_ms(STAGE_FETCH_METRIC, 50.0);
        }
        assert_eq!(effective_retry_ceiling(&metrics, &config()), config().fetch_max_retries);
    }

    #[test]
    fn high_retry_rate_decrements_concurrency() {
        let snapshot = AutotuneSnapshot {
            requests: 100,
            retries: 50,
            blocked: 0,
            p95_fetch_ms: 100.0,
            p95_queue_wait_ms: 0.0,
        };
        assert_eq!(decide_adjustment(&snapshot, &config()), Adjustment::Decrement);
    }

    #[test]
    fn healthy_queue_wait_increments_concurrency() {
        let snapshot = AutotuneSnapshot {
            requests: 100,
            retries: 5,
            blocked: 1,
            p95_fetch_ms: 100.0,
            p95_queue_wait_ms: 800.0,
        };
        assert_eq!(decide_adjustment(&snapshot, &config()), Adjustment::Increment);
    }

    #[test]
    fn next_concurrency_respects_min_bound() {
        let snapshot = AutotuneSnapshot {
            requests: 100,
            retries: 50,
            blocked: 0,
            p95_fetch_ms: 100.0,
            p95_queue_wait_ms: 0.0,
        };
        assert_eq!(next_concurrency(2, &snapshot, &config()), 2);
    }

    #[test]
    fn maybe_autotune_only_fires_on_interval() {
        let snapshot = AutotuneSnapshot {
            requests: 100,
            retries: 50,
            blocked: 0,
            p95_fetch_ms: 100.0,
            p95_queue_wait_ms: 0.0,
        };
        let cfg = config();
        assert!(maybe_autotune(39, 10, &snapshot, &cfg).is_none());
        assert!(maybe_autotune(40, 10, &snapshot, &cfg).is_some());
    }
}
