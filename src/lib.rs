//! Fetch, classify, and rewrite pages that sit behind bot-challenge pages,
//! caching results by `(url, unlock_mode)` so repeat requests never refetch.
//!
//! The crate is organized as one module per component from the pipeline's
//! design: a [`cache`] adapter, a [`metrics`] store, a [`retry`] executor,
//! a priority [`limiter`], a [`session_pool`] of impersonating HTTP
//! sessions, a [`headers`] synthesizer, a dual [`transport`] layer, a
//! [`classifier`] for bot-challenge detection, an HTML [`rewriter`], fixed
//! [`templates`], environment-driven [`config`], a state-free [`autotuner`],
//! an SSRF guard in [`ssrf`], and the [`orchestrator`] that drives them all.

pub mod autotuner;
pub mod cache;
pub mod classifier;
pub mod config;
pub mod error;
pub mod headers;
pub mod limiter;
pub mod metrics;
pub mod orchestrator;
pub mod retry;
pub mod rewriter;
pub mod session_pool;
pub mod ssrf;
pub mod templates;
pub mod transport;

pub use cache::{Cache, InMemoryCache};
pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use orchestrator::{FetchOutcome, FetchRequest, OutcomeReason, PipelineOrchestrator};
