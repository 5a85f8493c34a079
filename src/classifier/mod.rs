//! Evidence-weighted block classifier: status/header/body → blocked ×
//! confidence, provider tag, reasons. Grounded on
//! `app/services/unprotector.py::classify_blocked_response` /
//! `_detect_provider` / `extract_ray_id` — marker lists and decision order
//! carried verbatim.

use std::collections::BTreeMap;

use regex::Regex;
use std::sync::LazyLock;

/// WAF/CDN provider inferred from response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    Cloudflare,
    Akamai,
    Perimeterx,
    Litespeed,
    Unknown,
}

impl Provider {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Cloudflare => "cloudflare",
            Provider::Akamai => "akamai",
            Provider::Perimeterx => "perimeterx",
            Provider::Litespeed => "litespeed",
            Provider::Unknown => "unknown",
        }
    }

    fn is_waf(&self) -> bool {
        matches!(
            self,
            Provider::Cloudflare | Provider::Akamai | Provider::Perimeterx
        )
    }
}

/// Classifier verdict confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confidence {
    None,
    Low,
    High,
}

/// Output of [`classify`]. Invariant: `is_blocked ⇒ confidence == High`;
/// `confidence == Low ⇒ !is_blocked`.
#[derive(Debug, Clone)]
pub struct ClassificationResult {
    pub is_blocked: bool,
    pub confidence: Confidence,
    pub reasons: Vec<String>,
    pub provider: Provider,
    pub hostname: String,
}

const STRONG_MARKERS: &[(&str, &str)] = &[
    ("cf_challenge_path", "/cdn-cgi/"),
    ("cf_chl_marker", "cf-chl-"),
    ("cf_turnstile", "cf-turnstile"),
    ("cf_just_a_moment", "just a moment"),
    ("cf_checking_browser", "checking your browser before accessing"),
    ("cf_attention_required", "attention required"),
    ("challenge_platform", "challenge-platform"),
];

const WEAK_MARKERS: &[(&str, &str)] = &[
    ("generic_enable_js", "enable javascript"),
    ("generic_enable_cookies", "enable cookies"),
    ("generic_access_denied", "access denied"),
    ("generic_verify_human", "verify you are human"),
    ("generic_captcha", "captcha"),
];

static RAY_ID_IN_BODY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)ray id[:\s#]*([a-f0-9]{8,})").expect("valid regex"));

fn normalize_headers(headers: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(k, v)| (k.to_lowercase(), v.clone()))
        .collect()
}

fn detect_provider(headers: &BTreeMap<String, String>) -> Provider {
    let server = headers.get("server").map(|s| s.to_lowercase()).unwrap_or_default();
    if server.contains("cloudflare")
        || headers.contains_key("cf-ray")
        || headers.contains_key("cf-cache-status")
    {
        return Provider::Cloudflare;
    }
    if server.contains("litespeed") {
        return Provider::Litespeed;
    }
    if server.contains("akamai")
        || headers
            .get("x-akamai-transformed")
            .map(|v| v.to_lowercase().contains("akamai"))
            .unwrap_or(false)
    {
        return Provider::Akamai;
    }
    if server.contains("perimeterx") || headers.keys().any(|k| k.starts_with("x-px")) {
        return Provider::Perimeterx;
    }
    Provider::Unknown
}

/// Classifies a response per spec.md §4.8's decision table, in order:
/// 1. status ∈ {401,403,429,503} + WAF provider ⇒ high-confidence block.
/// 2. any strong marker in body ⇒ high-confidence block.
/// 3. status == 200 + any weak marker ⇒ low-confidence, not blocked.
/// 4. otherwise ⇒ no confidence, not blocked.
#[must_use]
pub fn classify(
    status: Option<u16>,
    headers: &BTreeMap<String, String>,
    body: &str,
    hostname: &str,
) -> ClassificationResult {
    let normalized = normalize_headers(headers);
    let provider = detect_provider(&normalized);
    let haystack = body.to_lowercase();
    let status_code = status.unwrap_or(0);

    let mut reasons = Vec::new();
    let strong_hits: Vec<&str> = STRONG_MARKERS
        .iter()
        .filter(|(_, marker)| haystack.contains(marker))
        .map(|(name, _)| *name)
        .collect();
    reasons.extend(strong_hits.iter().map(|s| s.to_string()));

    let waf_status = matches!(status_code, 401 | 403 | 429 | 503) && provider.is_waf();
    if waf_status {
        reasons.push(format!("status_{status_code}_{}", provider.as_str()));
        return ClassificationResult {
            is_blocked: true,
            confidence: Confidence::High,
            reasons,
            provider,
            hostname: hostname.to_string(),
        };
    }

    if !strong_hits.is_empty() {
        reasons.push("strong_challenge_marker".to_string());
        return ClassificationResult {
            is_blocked: true,
            confidence: Confidence::High,
            reasons,
            provider,
            hostname: hostname.to_string(),
        };
    }

    let weak_hits: Vec<&str> = WEAK_MARKERS
        .iter()
        .filter(|(_, marker)| haystack.contains(marker))
        .map(|(name, _)| *name)
        .collect();
    if status_code == 200 && !weak_hits.is_empty() {
        let mut reasons: Vec<String> = weak_hits.iter().map(|s| s.to_string()).collect();
        reasons.push("keyword_only_low_conf".to_string());
        return ClassificationResult {
            is_blocked: false,
            confidence: Confidence::Low,
            reasons,
            provider,
            hostname: hostname.to_string(),
        };
    }

    ClassificationResult {
        is_blocked: false,
        confidence: Confidence::None,
        reasons,
        provider,
        hostname: hostname.to_string(),
    }
}

/// Extracts a Cloudflare ray ID, first from the `CF-RAY` header then, on
/// miss, from a body regex match.
#[must_use]
pub fn extract_ray_id(headers: &BTreeMap<String, String>, body: &str) -> Option<String> {
    let normalized = normalize_headers(headers);
    if let Some(ray) = normalized.get("cf-ray") {
        let trimmed = ray.trim();
        if !trimmed.is_empty() {
            return Some(trimmed.to_string());
        }
    }
    RAY_ID_IN_BODY
        .captures(body)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn cloudflare_403_is_high_confidence_regardless_of_body() {
        let h = headers(&[("Server", "cloudflare"), ("CF-RAY", "90f2b2aa1234abcd-DFW")]);
        let result = classify(Some(403), &h, "Sorry, you have been blocked", "example.com");
        assert!(result.is_blocked);
        assert_eq!(result.confidence, Confidence::High);
        assert_eq!(result.provider, Provider::Cloudflare);
    }

    #[test]
    fn litespeed_200_with_weak_marker_is_low_confidence_not_blocked() {
        let h = headers(&[("Server", "LiteSpeed")]);
        let result = classify(Some(200), &h, "Please enable javascript and cookies", "example.com");
        assert!(!result.is_blocked);
        assert_eq!(result.confidence, Confidence::Low);
    }

    #[test]
    fn strong_marker_blocks_even_on_200() {
        let h = headers(&[]);
        let result = classify(Some(200), &h, "Just a moment... checking your browser", "example.com");
        assert!(result.is_blocked);
        assert_eq!(result.confidence, Confidence::High);
    }

    #[test]
    fn plain_200_with_no_markers_is_none() {
        let h = headers(&[]);
        let result = classify(Some(200), &h, "<html>hello</html>", "example.com");
        assert!(!result.is_blocked);
        assert_eq!(result.confidence, Confidence::None);
    }

    #[test]
    fn ray_id_prefers_header_over_body() {
        let h = headers(&[("CF-RAY", "abcdef1234567890-DFW")]);
        let ray = extract_ray_id(&h, "ray id: deadbeef");
        assert_eq!(ray.as_deref(), Some("abcdef1234567890-DFW"));
    }

    #[test]
    fn ray_id_falls_back_to_body_regex() {
        let h = headers(&[]);
        let ray = extract_ray_id(&h, "Something went wrong. Ray ID: deadbeef1234");
        assert_eq!(ray.as_deref(), Some("deadbeef1234"));
    }

    #[test]
    fn adding_strong_marker_never_reduces_confidence() {
        let h = headers(&[]);
        let baseline = classify(Some(200), &h, "nothing interesting here", "example.com");
        assert_eq!(baseline.confidence, Confidence::None);
        let with_marker = classify(
            Some(200),
            &h,
            "nothing interesting here cf-turnstile",
            "example.com",
        );
        assert_eq!(with_marker.confidence, Confidence::High);
        assert!(with_marker.is_blocked);
    }
}
