//! Ties every component together behind one entry point,
//! [`PipelineOrchestrator::fetch_and_clean`]. Grounded on
//! `app/services/unprotector.py::fetch_and_clean_page`, the 11-step
//! algorithm of spec.md §4.10 translated step-for-step.

use std::sync::Arc;
use std::time::Instant;

use rand::Rng;
use url::Url;

use crate::autotuner::{self, AutotuneSnapshot, QUEUE_WAIT_METRIC, STAGE_FETCH_METRIC};
use crate::cache::{cache_key, Cache};
use crate::classifier::{self, ClassificationResult, Confidence, Provider};
use crate::config::{PipelineConfig, BLOCK_CACHE_TTL_SECONDS, SUCCESS_CACHE_TTL_SECONDS};
use crate::headers::{build_browser_headers, build_referer, random_user_agent, session_default_headers};
use crate::limiter::PriorityLimiter;
use crate::metrics::MetricsStore;
use crate::rewriter::{rewrite_html, sanitize::sanitize_html};
use crate::session_pool::SessionPool;
use crate::ssrf::{is_ssrf_risk, ALLOWED_SCHEMES};
use crate::templates;
use crate::transport::{fetch_baseline, fetch_impersonating, FetchResponse};

const METRIC_REQUEST_COUNT: &str = "unlock_pipeline.request_count";
const METRIC_RETRY_COUNT: &str = "unlock_pipeline.retry_count";
const METRIC_CACHE_HIT_COUNT: &str = "unlock_pipeline.cache_hit_count";
const METRIC_BLOCKED_COUNT: &str = "unlock_pipeline.blocked_count";
const METRIC_PAGE_TOO_LARGE_COUNT: &str = "unlock_pipeline.page_too_large_count";
const METRIC_PARSE_SKIPPED_LARGE_BODY_COUNT: &str = "unlock_pipeline.parse_skipped_large_body_count";
const METRIC_SLOW_FETCH_COUNT: &str = "unlock_pipeline.slow_fetch_count";

const STAGE_SSRF_CHECK: &str = "unlock_pipeline.stage.ssrf_check";
const STAGE_CACHE_GET: &str = "unlock_pipeline.stage.cache_get";
const STAGE_PARSE_CLEAN_REWRITE: &str = "unlock_pipeline.stage.parse_clean_rewrite";
const STAGE_CACHE_SET: &str = "unlock_pipeline.stage.cache_set";

/// Reads this process's resident set size from `/proc/self/status`'s
/// `VmRSS` line (kB), converted to MB. Grounded on
/// `app/main.py::_read_process_rss_megabytes`; returns `0.0` on any read or
/// parse failure rather than propagating, matching the source's
/// swallow-and-zero behavior.
fn read_process_rss_megabytes() -> f64 {
    let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
        return 0.0;
    };
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            if let Some(kb) = rest.split_whitespace().next().and_then(|v| v.parse::<f64>().ok()) {
                return kb / 1024.0;
            }
        }
    }
    0.0
}

/// What a caller asks the pipeline to do with one URL.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub user_ip: Option<String>,
    pub unlock_mode: bool,
    pub priority: i64,
    pub use_impersonating: bool,
}

/// Why [`FetchOutcome::success`] is what it is. Carries the provider for
/// block outcomes rather than stuffing it into a string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutcomeReason {
    Ok,
    SuspectedBlockLowConf,
    InvalidUrl,
    SsrfRefused,
    FetchError,
    PageTooLarge,
    ParseSkippedLargeBody,
    BlockedByProvider(Provider),
    UpgradeRequired,
}

impl OutcomeReason {
    /// Renders the reason the way log lines and test fixtures expect,
    /// e.g. `blocked_by_cloudflare`.
    #[must_use]
    pub fn as_label(&self) -> String {
        match self {
            OutcomeReason::Ok => "ok".to_string(),
            OutcomeReason::SuspectedBlockLowConf => "suspected_block_low_conf".to_string(),
            OutcomeReason::InvalidUrl => "invalid_url".to_string(),
            OutcomeReason::SsrfRefused => "ssrf_refused".to_string(),
            OutcomeReason::FetchError => "fetch_error".to_string(),
            OutcomeReason::PageTooLarge => "page_too_large".to_string(),
            OutcomeReason::ParseSkippedLargeBody => "parse_skipped_large_body".to_string(),
            OutcomeReason::BlockedByProvider(p) => format!("blocked_by_{}", p.as_str()),
            OutcomeReason::UpgradeRequired => "upgrade_required".to_string(),
        }
    }
}

/// Result of [`PipelineOrchestrator::fetch_and_clean`]. Invariant:
/// `success ⇒ confidence != Some(High) ∧ outcome_reason ∈ {Ok,
/// SuspectedBlockLowConf}`.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub success: bool,
    pub html: String,
    pub outcome_reason: OutcomeReason,
    pub status: Option<u16>,
    pub provider: Option<Provider>,
    pub confidence: Option<Confidence>,
    pub ray_id: Option<String>,
    pub final_url: Option<String>,
}

impl FetchOutcome {
    fn placeholder(reason: OutcomeReason, html: &str) -> Self {
        Self {
            success: false,
            html: html.to_string(),
            outcome_reason: reason,
            status: None,
            provider: None,
            confidence: None,
            ray_id: None,
            final_url: None,
        }
    }
}

/// Owns every process-wide singleton (cache, metrics, limiter, session
/// pool, HTTP client, config) and exposes the single pipeline entry point.
/// Construct once at startup; pass as an explicit dependency rather than
/// reaching for module-level globals (spec.md §9's singleton redesign
/// note).
pub struct PipelineOrchestrator {
    cache: Arc<dyn Cache>,
    metrics: Arc<MetricsStore>,
    limiter: Arc<PriorityLimiter>,
    session_pool: Arc<SessionPool>,
    http_client: reqwest::Client,
    config: PipelineConfig,
}

impl PipelineOrchestrator {
    #[must_use]
    pub fn new(cache: Arc<dyn Cache>, config: PipelineConfig) -> Self {
        let metrics = Arc::new(MetricsStore::new());
        let limiter = Arc::new(PriorityLimiter::new(config.fetch_concurrency_max));
        let session_pool = Arc::new(SessionPool::new(
            config.session_pool_capacity,
            session_default_headers,
        ));
        let http_client = reqwest::Client::builder()
            .connect_timeout(config.fetch_connect_timeout())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        let limiter_for_gauge = limiter.clone();
        metrics.set_gauge_callback("unlock_pipeline.queue_depth", move || {
            limiter_for_gauge.queue_depth() as f64
        });
        let limiter_for_gauge2 = limiter.clone();
        metrics.set_gauge_callback("unlock_pipeline.in_flight", move || {
            limiter_for_gauge2.in_flight() as f64
        });
        metrics.set_gauge_callback("process.memory_rss_mb", read_process_rss_megabytes);

        Self {
            cache,
            metrics,
            limiter,
            session_pool,
            http_client,
            config,
        }
    }

    #[must_use]
    pub fn metrics(&self) -> &MetricsStore {
        &self.metrics
    }

    #[must_use]
    pub fn limiter(&self) -> &PriorityLimiter {
        &self.limiter
    }

    /// Runs the full pipeline for one request: validate, cache lookup,
    /// rate limit, fetch-with-retry, classify, rewrite-or-sanitize, cache
    /// write, autotune.
    pub async fn fetch_and_clean(&self, request: &FetchRequest) -> FetchOutcome {
        let outcome = self.fetch_and_clean_inner(request).await;
        self.tick_autotuner();
        outcome
    }

    async fn fetch_and_clean_inner(&self, request: &FetchRequest) -> FetchOutcome {
        self.metrics.inc(METRIC_REQUEST_COUNT);

        let Ok(url) = Url::parse(&request.url) else {
            return FetchOutcome::placeholder(OutcomeReason::InvalidUrl, templates::INVALID_URL_HTML);
        };
        if !ALLOWED_SCHEMES.contains(&url.scheme()) {
            return FetchOutcome::placeholder(OutcomeReason::InvalidUrl, templates::INVALID_URL_HTML);
        }
        let Some(hostname) = url.host_str().map(str::to_string) else {
            return FetchOutcome::placeholder(OutcomeReason::InvalidUrl, templates::INVALID_URL_HTML);
        };

        let ssrf_start = Instant::now();
        let ssrf_risky = is_ssrf_risk(&hostname, url.port_or_known_default().unwrap_or(443)).await;
        self.metrics
            .observe_ms(STAGE_SSRF_CHECK, ssrf_start.elapsed().as_secs_f64() * 1000.0);
        if ssrf_risky {
            return FetchOutcome::placeholder(OutcomeReason::SsrfRefused, templates::SSRF_REFUSED_HTML);
        }

        let key = cache_key(&request.url, request.unlock_mode);
        let cache_start = Instant::now();
        let cached = match self.cache.get(&key).await {
            Ok(value) => value,
            Err(error) => {
                tracing::warn!(url = %request.url, %error, "cache read failed, treating as miss");
                None
            }
        };
        self.metrics
            .observe_ms(STAGE_CACHE_GET, cache_start.elapsed().as_secs_f64() * 1000.0);
        if let Some(html) = cached {
            self.metrics.inc(METRIC_CACHE_HIT_COUNT);
            return FetchOutcome {
                success: true,
                html,
                outcome_reason: OutcomeReason::Ok,
                status: None,
                provider: None,
                confidence: None,
                ray_id: None,
                final_url: Some(request.url.clone()),
            };
        }

        let guard = self.limiter.limit(request.priority).await;
        self.metrics.observe_ms(QUEUE_WAIT_METRIC, guard.wait_ms);

        let ceiling = autotuner::effective_retry_ceiling(&self.metrics, &self.config)
            .min(self.config.fetch_max_retries)
            .max(1);

        let outcome = match self.retry_loop(request, &url, &hostname, ceiling).await {
            Ok((response, classification)) => {
                self.finish_with_response(request, &url, &hostname, &key, response, classification)
                    .await
            }
            Err(()) => FetchOutcome {
                success: false,
                html: templates::fetch_error_html("transport exhausted all retries"),
                outcome_reason: OutcomeReason::FetchError,
                status: None,
                provider: None,
                confidence: None,
                ray_id: None,
                final_url: None,
            },
        };

        drop(guard);
        outcome
    }

    fn request_headers(&self, request: &FetchRequest, url: &Url) -> crate::headers::HeaderBag {
        let user_agent = if request.use_impersonating {
            None
        } else {
            Some(random_user_agent())
        };
        let referer = build_referer(url);
        build_browser_headers(user_agent, referer.as_deref())
    }

    async fn retry_loop(
        &self,
        request: &FetchRequest,
        url: &Url,
        hostname: &str,
        ceiling: u32,
    ) -> std::result::Result<(FetchResponse, ClassificationResult), ()> {
        let headers = self.request_headers(request, url);
        let mut attempt = 1u32;

        loop {
            let fetch_start = Instant::now();
            let dependency_name = if request.use_impersonating {
                "transport_impersonating"
            } else {
                "transport_baseline"
            };
            let result = self
                .metrics
                .record_dependency_call_async(dependency_name, || async {
                    if request.use_impersonating {
                        fetch_impersonating(
                            &self.session_pool,
                            url,
                            &headers,
                            self.config.fetch_timeout_seconds,
                        )
                        .await
                    } else {
                        fetch_baseline(&self.http_client, url, &headers, self.config.fetch_timeout_seconds)
                            .await
                    }
                })
                .await;
            let elapsed_ms = fetch_start.elapsed().as_secs_f64() * 1000.0;
            self.metrics.observe_ms(STAGE_FETCH_METRIC, elapsed_ms);
            if elapsed_ms >= self.config.slow_fetch_threshold_ms {
                self.metrics.inc(METRIC_SLOW_FETCH_COUNT);
            }

            match result {
                Err(error) => {
                    if attempt >= ceiling {
                        tracing::warn!(%hostname, attempt, %error, "transport exhausted all retries");
                        return Err(());
                    }
                    self.metrics.inc(METRIC_RETRY_COUNT);
                    let delay = 0.25 * f64::from(attempt) + rand::rng().random_range(0.0..0.3);
                    tracing::debug!(%hostname, attempt, %error, delay_s = delay, "transport error, retrying");
                    tokio::time::sleep(std::time::Duration::from_secs_f64(delay)).await;
                    attempt += 1;
                    continue;
                }
                Ok(response) => {
                    let classification =
                        classifier::classify(Some(response.status), &response.headers, &response.body, hostname);

                    let high_conf_block_escalatable = classification.is_blocked
                        && matches!(classification.confidence, Confidence::High)
                        && request.use_impersonating
                        && attempt < ceiling;
                    if high_conf_block_escalatable {
                        tracing::info!(
                            %hostname,
                            attempt,
                            provider = classification.provider.as_str(),
                            status = response.status,
                            "high-confidence block detected, evicting session and retrying"
                        );
                        self.session_pool.evict(hostname);
                        self.metrics.inc(METRIC_RETRY_COUNT);
                        let delay = 0.75 * f64::from(attempt) + rand::rng().random_range(0.0..0.35);
                        tokio::time::sleep(std::time::Duration::from_secs_f64(delay)).await;
                        attempt += 1;
                        continue;
                    }

                    let low_conf_retryable = !classification.is_blocked
                        && matches!(classification.confidence, Confidence::Low)
                        && self.config.low_conf_block_retry_enabled
                        && attempt < ceiling;
                    if low_conf_retryable {
                        tracing::debug!(%hostname, attempt, "low-confidence block marker, retrying");
                        self.metrics.inc(METRIC_RETRY_COUNT);
                        let delay = 0.25 * f64::from(attempt) + rand::rng().random_range(0.0..0.3);
                        tokio::time::sleep(std::time::Duration::from_secs_f64(delay)).await;
                        attempt += 1;
                        continue;
                    }

                    if classification.is_blocked {
                        tracing::warn!(
                            %hostname,
                            provider = classification.provider.as_str(),
                            status = response.status,
                            "request blocked, no retries remaining"
                        );
                    }

                    return Ok((response, classification));
                }
            }
        }
    }

    async fn finish_with_response(
        &self,
        request: &FetchRequest,
        url: &Url,
        hostname: &str,
        key: &str,
        response: FetchResponse,
        classification: ClassificationResult,
    ) -> FetchOutcome {
        let oversize =
            response.too_large || response.body.len() > self.config.max_processable_page_bytes;
        if oversize {
            self.metrics.inc(METRIC_PAGE_TOO_LARGE_COUNT);
            return FetchOutcome {
                success: false,
                html: templates::PAGE_TOO_LARGE_HTML.to_string(),
                outcome_reason: OutcomeReason::PageTooLarge,
                status: Some(response.status),
                provider: None,
                confidence: None,
                ray_id: None,
                final_url: Some(response.final_url),
            };
        }

        if classification.is_blocked {
            self.metrics.inc(METRIC_BLOCKED_COUNT);
            let ray_id = classifier::extract_ray_id(&response.headers, &response.body);

            if request.use_impersonating {
                let stored = templates::build_blocked_html(hostname, None);
                self.cache_set_timed(key, &stored, BLOCK_CACHE_TTL_SECONDS).await;
                let returned = templates::build_blocked_html(hostname, ray_id.as_deref());
                return FetchOutcome {
                    success: false,
                    html: returned,
                    outcome_reason: OutcomeReason::BlockedByProvider(classification.provider),
                    status: Some(response.status),
                    provider: Some(classification.provider),
                    confidence: Some(classification.confidence),
                    ray_id,
                    final_url: Some(response.final_url),
                };
            }

            self.cache_set_timed(key, templates::UPGRADE_REQUIRED_HTML, BLOCK_CACHE_TTL_SECONDS)
                .await;
            return FetchOutcome {
                success: false,
                html: templates::UPGRADE_REQUIRED_HTML.to_string(),
                outcome_reason: OutcomeReason::UpgradeRequired,
                status: Some(response.status),
                provider: Some(classification.provider),
                confidence: Some(classification.confidence),
                ray_id,
                final_url: Some(response.final_url),
            };
        }

        let outcome_reason = if matches!(classification.confidence, Confidence::Low) {
            OutcomeReason::SuspectedBlockLowConf
        } else {
            OutcomeReason::Ok
        };

        if !request.unlock_mode {
            let sanitized = self
                .metrics
                .time_block(STAGE_PARSE_CLEAN_REWRITE, || sanitize_html(&response.body, url))
                .0
                .unwrap_or_else(|_| templates::REWRITER_FAILED_HTML.to_string());
            self.cache_set_timed(key, &sanitized, SUCCESS_CACHE_TTL_SECONDS).await;
            return FetchOutcome {
                success: true,
                html: sanitized,
                outcome_reason,
                status: Some(response.status),
                provider: Some(classification.provider),
                confidence: Some(classification.confidence),
                ray_id: None,
                final_url: Some(response.final_url),
            };
        }

        if response.body.len() > self.config.max_parse_page_bytes {
            self.metrics.inc(METRIC_PARSE_SKIPPED_LARGE_BODY_COUNT);
            return FetchOutcome {
                success: false,
                html: templates::PARSE_SKIPPED_LARGE_BODY_HTML.to_string(),
                outcome_reason: OutcomeReason::ParseSkippedLargeBody,
                status: Some(response.status),
                provider: Some(classification.provider),
                confidence: Some(classification.confidence),
                ray_id: None,
                final_url: Some(response.final_url),
            };
        }

        let rewritten = self
            .metrics
            .time_block(STAGE_PARSE_CLEAN_REWRITE, || rewrite_html(&response.body, url))
            .0;
        self.cache_set_timed(key, &rewritten, SUCCESS_CACHE_TTL_SECONDS).await;
        FetchOutcome {
            success: true,
            html: rewritten,
            outcome_reason,
            status: Some(response.status),
            provider: Some(classification.provider),
            confidence: Some(classification.confidence),
            ray_id: None,
            final_url: Some(response.final_url),
        }
    }

    async fn cache_set_timed(&self, key: &str, value: &str, ttl_seconds: u64) {
        let start = Instant::now();
        if let Err(error) = self.cache.set(key, value, ttl_seconds).await {
            tracing::warn!(%error, "cache write failed, result will be recomputed next request");
        }
        self.metrics
            .observe_ms(STAGE_CACHE_SET, start.elapsed().as_secs_f64() * 1000.0);
    }

    fn tick_autotuner(&self) {
        if !self.config.enable_fetch_autotune {
            return;
        }
        let requests = self.metrics.counter(METRIC_REQUEST_COUNT);
        if requests == 0 || requests % u64::from(self.config.fetch_autotune_every_n_requests) != 0 {
            return;
        }
        let snapshot = AutotuneSnapshot {
            requests,
            retries: self.metrics.counter(METRIC_RETRY_COUNT),
            blocked: self.metrics.counter(METRIC_BLOCKED_COUNT),
            p95_fetch_ms: self.metrics.percentile_ms(STAGE_FETCH_METRIC, 95.0),
            p95_queue_wait_ms: self.metrics.percentile_ms(QUEUE_WAIT_METRIC, 95.0),
        };
        let current = self.limiter.max_concurrency();
        if let Some(next) = autotuner::maybe_autotune(requests, current, &snapshot, &self.config) {
            tracing::info!(from = current, to = next, requests, "autotuner adjusted concurrency cap");
            self.limiter.set_max_concurrency(next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;

    fn test_config() -> PipelineConfig {
        PipelineConfig::builder()
            .fetch_max_retries(1)
            .validate()
            .unwrap()
            .build()
    }

    #[test]
    fn all_three_gauges_are_registered_at_construction() {
        let orchestrator = PipelineOrchestrator::new(Arc::new(InMemoryCache::new()), test_config());
        let rendered = orchestrator.metrics().render();
        assert!(rendered.contains("unlock_pipeline_queue_depth"));
        assert!(rendered.contains("unlock_pipeline_in_flight"));
        assert!(rendered.contains("process_memory_rss_mb"));
    }

    #[tokio::test]
    async fn invalid_scheme_is_rejected_without_network() {
        let orchestrator = PipelineOrchestrator::new(Arc::new(InMemoryCache::new()), test_config());
        let request = FetchRequest {
            url: "ftp://example.com/file".to_string(),
            user_ip: None,
            unlock_mode: true,
            priority: 0,
            use_impersonating: false,
        };
        let outcome = orchestrator.fetch_and_clean(&request).await;
        assert!(!outcome.success);
        assert_eq!(outcome.outcome_reason, OutcomeReason::InvalidUrl);
    }

    #[tokio::test]
    async fn ssrf_risky_host_is_refused() {
        let orchestrator = PipelineOrchestrator::new(Arc::new(InMemoryCache::new()), test_config());
        let request = FetchRequest {
            url: "http://127.0.0.1:8080/".to_string(),
            user_ip: None,
            unlock_mode: true,
            priority: 0,
            use_impersonating: false,
        };
        let outcome = orchestrator.fetch_and_clean(&request).await;
        assert!(!outcome.success);
        assert_eq!(outcome.outcome_reason, OutcomeReason::SsrfRefused);
    }

    #[tokio::test]
    async fn disabled_autotune_flag_leaves_concurrency_untouched() {
        let config = PipelineConfig::builder()
            .enable_fetch_autotune(false)
            .fetch_concurrency_range(2, 32)
            .validate()
            .unwrap()
            .build();
        let orchestrator = PipelineOrchestrator::new(Arc::new(InMemoryCache::new()), config);
        for _ in 0..40 {
            orchestrator.metrics().inc(METRIC_REQUEST_COUNT);
        }
        for _ in 0..30 {
            orchestrator.metrics().inc(METRIC_RETRY_COUNT);
        }
        let before = orchestrator.limiter().max_concurrency();
        orchestrator.tick_autotuner();
        assert_eq!(orchestrator.limiter().max_concurrency(), before);
    }

    #[tokio::test]
    async fn cache_hit_short_circuits_the_pipeline() {
        let cache = Arc::new(InMemoryCache::new());
        let key = cache_key("https://example.com/article", true);
        cache
            .set(&key, "<html>cached</html>", 3600)
            .await
            .unwrap();
        let orchestrator = PipelineOrchestrator::new(cache, test_config());
        let request = FetchRequest {
            url: "https://example.com/article".to_string(),
            user_ip: None,
            unlock_mode: true,
            priority: 0,
            use_impersonating: false,
        };
        let outcome = orchestrator.fetch_and_clean(&request).await;
        assert!(outcome.success);
        assert_eq!(outcome.html, "<html>cached</html>");
    }
}
