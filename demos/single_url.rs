//! Fetches and unlocks one URL against an in-memory cache, printing the
//! resulting outcome. Run with `cargo run --example single_url -- <url>`.

use std::sync::Arc;

use unlock_pipeline::cache::InMemoryCache;
use unlock_pipeline::config::PipelineConfig;
use unlock_pipeline::orchestrator::{FetchRequest, PipelineOrchestrator};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "https://example.com/".to_string());

    let config = PipelineConfig::builder()
        .validate()
        .expect("default configuration is always valid")
        .build();
    let cache = Arc::new(InMemoryCache::new());
    let orchestrator = PipelineOrchestrator::new(cache, config);

    let request = FetchRequest {
        url,
        user_ip: None,
        unlock_mode: true,
        priority: 1,
        use_impersonating: false,
    };

    let outcome = orchestrator.fetch_and_clean(&request).await;
    println!("success: {}", outcome.success);
    println!("reason: {}", outcome.outcome_reason.as_label());
    if let Some(status) = outcome.status {
        println!("status: {status}");
    }
    println!("--- html ---\n{}", outcome.html);
    println!("--- metrics ---\n{}", orchestrator.metrics().render());
}
