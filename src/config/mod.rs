//! Process-wide pipeline configuration, built from the environment at
//! startup. Grounded on the teacher's `config/builder.rs` typestate
//! pattern, simplified: every field has a workable default (unlike
//! `CrawlConfig`, nothing here gates construction on caller-supplied
//! values), so the builder has a single "unvalidated -> validated"
//! transition rather than a chain of required-field states.

use std::env;
use std::marker::PhantomData;
use std::time::Duration;

use crate::error::{PipelineError, Result};

/// Cache TTL for a successful fetch. Fixed by design, not env-bound
/// (spec.md §6).
pub const SUCCESS_CACHE_TTL_SECONDS: u64 = 3600;

/// Cache TTL for a blocked-page placeholder. Fixed by design.
pub const BLOCK_CACHE_TTL_SECONDS: u64 = 600;

/// Typestate marker: fields read from the environment, not yet
/// range-checked.
pub struct Unvalidated;
/// Typestate marker: [`PipelineConfigBuilder::validate`] has run.
pub struct Validated;

/// Resolved, immutable pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub fetch_max_retries: u32,
    pub fetch_timeout_seconds: f64,
    pub fetch_connect_timeout_seconds: f64,
    pub max_processable_page_bytes: usize,
    pub max_parse_page_bytes: usize,
    pub slow_fetch_threshold_ms: f64,
    pub enable_fetch_autotune: bool,
    pub fetch_autotune_every_n_requests: u32,
    pub fetch_concurrency_min: usize,
    pub fetch_concurrency_max: usize,
    pub dynamic_fetch_retry_floor: u32,
    pub low_conf_block_retry_enabled: bool,
    pub session_pool_capacity: usize,
}

impl PipelineConfig {
    #[must_use]
    pub fn builder() -> PipelineConfigBuilder<Unvalidated> {
        PipelineConfigBuilder::from_env()
    }

    #[must_use]
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.fetch_timeout_seconds.max(0.1))
    }

    #[must_use]
    pub fn fetch_connect_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.fetch_connect_timeout_seconds.max(0.1))
    }
}

/// Builder over [`PipelineConfig`]'s fields, parameterized by validation
/// state so [`build`](PipelineConfigBuilder::build) is only reachable after
/// [`validate`](PipelineConfigBuilder::validate).
pub struct PipelineConfigBuilder<State> {
    fetch_max_retries: u32,
    fetch_timeout_seconds: f64,
    fetch_connect_timeout_seconds: f64,
    max_processable_page_bytes: usize,
    max_parse_page_bytes: usize,
    slow_fetch_threshold_ms: f64,
    enable_fetch_autotune: bool,
    fetch_autotune_every_n_requests: u32,
    fetch_concurrency_min: usize,
    fetch_concurrency_max: usize,
    dynamic_fetch_retry_floor: u32,
    low_conf_block_retry_enabled: bool,
    session_pool_capacity: usize,
    _phantom: PhantomData<State>,
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

impl PipelineConfigBuilder<Unvalidated> {
    /// Reads every field from its environment variable, falling back to
    /// spec-mandated defaults when absent or unparseable.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            fetch_max_retries: env_parse("FETCH_MAX_RETRIES", 3),
            fetch_timeout_seconds: env_parse("FETCH_TIMEOUT_SECONDS", 15.0),
            fetch_connect_timeout_seconds: env_parse("FETCH_CONNECT_TIMEOUT_SECONDS", 5.0),
            max_processable_page_bytes: env_parse("MAX_PROCESSABLE_PAGE_BYTES", 10_000_000),
            max_parse_page_bytes: env_parse("MAX_PARSE_PAGE_BYTES", 4_000_000),
            slow_fetch_threshold_ms: env_parse("SLOW_FETCH_THRESHOLD_MS", 12_000.0),
            enable_fetch_autotune: env_bool("ENABLE_FETCH_AUTOTUNE", true),
            fetch_autotune_every_n_requests: env_parse("FETCH_AUTOTUNE_EVERY_N_REQUESTS", 40),
            fetch_concurrency_min: env_parse("FETCH_CONCURRENCY_MIN", 2),
            fetch_concurrency_max: env_parse("FETCH_CONCURRENCY_MAX", 32),
            dynamic_fetch_retry_floor: env_parse("DYNAMIC_FETCH_RETRY_FLOOR", 1),
            low_conf_block_retry_enabled: env_bool("LOW_CONF_BLOCK_RETRY_ENABLED", false),
            session_pool_capacity: env_parse("SESSION_POOL_CAPACITY", 32),
            _phantom: PhantomData,
        }
    }

    /// Range-checks the loaded values, returning a builder that can be
    /// built, or an error describing the first violated constraint.
    pub fn validate(self) -> Result<PipelineConfigBuilder<Validated>> {
        if self.fetch_concurrency_min == 0 {
            return Err(PipelineError::Config(
                "FETCH_CONCURRENCY_MIN must be >= 1".to_string(),
            ));
        }
        if self.fetch_concurrency_max < self.fetch_concurrency_min {
            return Err(PipelineError::Config(
                "FETCH_CONCURRENCY_MAX must be >= FETCH_CONCURRENCY_MIN".to_string(),
            ));
        }
        if self.fetch_max_retries == 0 {
            return Err(PipelineError::Config(
                "FETCH_MAX_RETRIES must be >= 1".to_string(),
            ));
        }
        if self.dynamic_fetch_retry_floor > self.fetch_max_retries {
            return Err(PipelineError::Config(
                "DYNAMIC_FETCH_RETRY_FLOOR must be <= FETCH_MAX_RETRIES".to_string(),
            ));
        }
        if self.session_pool_capacity == 0 {
            return Err(PipelineError::Config(
                "SESSION_POOL_CAPACITY must be >= 1".to_string(),
            ));
        }
        Ok(PipelineConfigBuilder {
            fetch_max_retries: self.fetch_max_retries,
            fetch_timeout_seconds: self.fetch_timeout_seconds,
            fetch_connect_timeout_seconds: self.fetch_connect_timeout_seconds,
            max_processable_page_bytes: self.max_processable_page_bytes,
            max_parse_page_bytes: self.max_parse_page_bytes,
            slow_fetch_threshold_ms: self.slow_fetch_threshold_ms,
            enable_fetch_autotune: self.enable_fetch_autotune,
            fetch_autotune_every_n_requests: self.fetch_autotune_every_n_requests,
            fetch_concurrency_min: self.fetch_concurrency_min,
            fetch_concurrency_max: self.fetch_concurrency_max,
            dynamic_fetch_retry_floor: self.dynamic_fetch_retry_floor,
            low_conf_block_retry_enabled: self.low_conf_block_retry_enabled,
            session_pool_capacity: self.session_pool_capacity,
            _phantom: PhantomData,
        })
    }
}

// Setters usable at any state, mainly for tests that want to override a
// single field without round-tripping through the environment.
impl<State> PipelineConfigBuilder<State> {
    #[must_use]
    pub fn fetch_max_retries(mut self, value: u32) -> Self {
        self.fetch_max_retries = value;
        self
    }

    #[must_use]
    pub fn fetch_concurrency_range(mut self, min: usize, max: usize) -> Self {
        self.fetch_concurrency_min = min;
        self.fetch_concurrency_max = max;
        self
    }

    #[must_use]
    pub fn session_pool_capacity(mut self, value: usize) -> Self {
        self.session_pool_capacity = value;
        self
    }

    #[must_use]
    pub fn enable_fetch_autotune(mut self, value: bool) -> Self {
        self.enable_fetch_autotune = value;
        self
    }

    #[must_use]
    pub fn dynamic_fetch_retry_floor(mut self, value: u32) -> Self {
        self.dynamic_fetch_retry_floor = value;
        self
    }
}

impl PipelineConfigBuilder<Validated> {
    #[must_use]
    pub fn build(self) -> PipelineConfig {
        PipelineConfig {
            fetch_max_retries: self.fetch_max_retries,
            fetch_timeout_seconds: self.fetch_timeout_seconds,
            fetch_connect_timeout_seconds: self.fetch_connect_timeout_seconds,
            max_processable_page_bytes: self.max_processable_page_bytes,
            max_parse_page_bytes: self.max_parse_page_bytes,
            slow_fetch_threshold_ms: self.slow_fetch_threshold_ms,
            enable_fetch_autotune: self.enable_fetch_autotune,
            fetch_autotune_every_n_requests: self.fetch_autotune_every_n_requests,
            fetch_concurrency_min: self.fetch_concurrency_min,
            fetch_concurrency_max: self.fetch_concurrency_max,
            dynamic_fetch_retry_floor: self.dynamic_fetch_retry_floor,
            low_conf_block_retry_enabled: self.low_conf_block_retry_enabled,
            session_pool_capacity: self.session_pool_capacity,
        }
    }
}
