//! Error types for the unlock pipeline.
//!
//! Per-request failures (bad scheme, SSRF refusal, transport exhaustion,
//! blocks, oversize, rewriter failure) are *not* represented here — they
//! become a [`crate::orchestrator::FetchOutcome`] with `success: false`.
//! `PipelineError` is reserved for failures that are appropriate to bubble
//! up to the embedding service: configuration problems, a cache backend
//! that cannot be reached, or a programming invariant violation.

use thiserror::Error;

/// Errors surfaced by the pipeline's public API.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A `PipelineConfig` field failed validation (e.g. min > max concurrency).
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The cache backend could not complete an operation.
    #[error("cache adapter error: {0}")]
    CacheAdapter(String),

    /// A transport-level failure (connect, TLS, read, DNS) exhausted retries.
    #[error("transport error: {0}")]
    Transport(String),

    /// A call exceeded its allotted timeout.
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The HTML rewriter could not produce output through either parser.
    #[error("rewriter failed: {0}")]
    Rewriter(String),

    /// A header value could not be constructed or parsed.
    #[error("header synthesis error: {0}")]
    Header(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
