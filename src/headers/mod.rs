//! Deterministic-ish construction of request headers: UA, `Sec-CH-UA`
//! family, `Accept-Language`. Grounded on `app/services/unprotector.py`'s
//! `build_base_headers` / `build_browser_headers` / `_sec_ch_ua_for_user_agent`
//! / `_platform_from_user_agent` / `_is_mobile_user_agent` — carried with the
//! exact `USER_AGENTS` / `ACCEPT_LANGUAGES` pools per SPEC_FULL.md §C.1.

use std::collections::BTreeMap;

use rand::seq::IndexedRandom;
use regex::Regex;
use std::sync::LazyLock;

/// A case-preserving, insertion-ordered header bag. `BTreeMap` gives
/// deterministic iteration order for rendering/testing; header name lookups
/// are case-sensitive by construction (the synthesizer only ever writes
/// canonical casing).
#[derive(Debug, Clone, Default)]
pub struct HeaderBag(pub BTreeMap<String, String>);

impl HeaderBag {
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    /// Merges `other` on top of `self`, preferring `other`'s values except
    /// it never overwrites an existing `User-Agent` — the session's birth
    /// UA must survive per-request header merges (spec.md §4.7).
    #[must_use]
    pub fn merged_over(mut self, other: &HeaderBag) -> HeaderBag {
        let preserved_ua = self.get("User-Agent").map(str::to_string);
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
        if let Some(ua) = preserved_ua {
            self.0.insert("User-Agent".to_string(), ua);
        }
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

pub const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:122.0) Gecko/20100101 Firefox/122.0",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_2) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_2 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Mobile/15E148 Safari/604.1",
    "Mozilla/5.0 (Linux; Android 14; Pixel 8 Pro) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Mobile Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Edg/122.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 13_6_3) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Linux; Android 13; SM-S918B) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Mobile Safari/537.36",
];

pub const ACCEPT_LANGUAGES: &[&str] = &[
    "en-US,en;q=0.9",
    "en-US,en;q=0.9,fr;q=0.8",
    "en-GB,en;q=0.9",
    "en-US,en;q=0.9,es;q=0.8",
    "en-US,en;q=0.9,de;q=0.8",
];

static CHROMIUM_FAMILY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(chrome|edg|chromium)/(\d+)").expect("valid regex"));

/// Picks a random user agent from the closed pool.
#[must_use]
pub fn random_user_agent() -> &'static str {
    USER_AGENTS
        .choose(&mut rand::rng())
        .copied()
        .unwrap_or(USER_AGENTS[0])
}

/// Derives `scheme://host/` from `url` for use as a `Referer`.
#[must_use]
pub fn build_referer(url: &url::Url) -> Option<String> {
    url.host_str()
        .map(|host| format!("{}://{}/", url.scheme(), host))
}

fn platform_from_user_agent(user_agent: Option<&str>) -> &'static str {
    let Some(ua) = user_agent else {
        return "Windows";
    };
    let ua = ua.to_lowercase();
    if ua.contains("mac os x") {
        "macOS"
    } else if ua.contains("android") {
        "Android"
    } else if ua.contains("iphone") || ua.contains("ipad") {
        "iOS"
    } else if ua.contains("linux") {
        "Linux"
    } else {
        "Windows"
    }
}

fn is_mobile_user_agent(user_agent: Option<&str>) -> bool {
    let Some(ua) = user_agent else {
        return false;
    };
    let ua = ua.to_lowercase();
    ua.contains("mobile") || ua.contains("android") || ua.contains("iphone")
}

/// Builds the `Sec-CH-UA` brand/version triple from a Chromium-family UA
/// string, or `None` for non-Chromium browsers.
#[must_use]
pub fn sec_ch_ua_for_user_agent(user_agent: Option<&str>) -> Option<String> {
    let ua = user_agent?;
    let caps = CHROMIUM_FAMILY.captures(ua)?;
    let brand = caps.get(1)?.as_str().to_lowercase();
    let version = caps.get(2)?.as_str();
    let product = match brand.as_str() {
        "edg" => "Microsoft Edge",
        "chromium" => "Chromium",
        _ => "Google Chrome",
    };
    Some(format!(
        "\"Chromium\";v=\"{version}\", \"Not)A;Brand\";v=\"8\", \"{product}\";v=\"{version}\""
    ))
}

/// Builds the base header set shared by both transports: `Accept`,
/// `Accept-Language` (randomized from the closed pool), `Accept-Encoding`,
/// `Upgrade-Insecure-Requests`, `Cache-Control`, `DNT`.
#[must_use]
pub fn build_base_headers(user_agent: Option<&str>, referer: Option<&str>) -> HeaderBag {
    let mut headers = HeaderBag::default();
    headers.insert(
        "Accept",
        "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
    );
    let lang = ACCEPT_LANGUAGES
        .choose(&mut rand::rng())
        .copied()
        .unwrap_or(ACCEPT_LANGUAGES[0]);
    headers.insert("Accept-Language", lang);
    headers.insert("Accept-Encoding", "gzip, deflate, br");
    headers.insert("Upgrade-Insecure-Requests", "1");
    headers.insert("Cache-Control", "max-age=0");
    headers.insert("DNT", "1");
    if let Some(ua) = user_agent {
        headers.insert("User-Agent", ua);
    }
    if let Some(referer) = referer {
        headers.insert("Referer", referer);
    }
    headers
}

/// Builds the full browser-mode header set: base headers plus `Sec-Fetch-*`
/// and, for Chromium-family user agents, the `Sec-CH-UA` triple.
#[must_use]
pub fn build_browser_headers(user_agent: Option<&str>, referer: Option<&str>) -> HeaderBag {
    let mut headers = build_base_headers(user_agent, referer);
    headers.insert("Sec-Fetch-Dest", "document");
    headers.insert("Sec-Fetch-Mode", "navigate");
    headers.insert("Sec-Fetch-Site", "none");
    headers.insert("Sec-Fetch-User", "?1");

    if let Some(sec_ch_ua) = sec_ch_ua_for_user_agent(user_agent) {
        let platform = platform_from_user_agent(user_agent);
        let mobile_flag = if is_mobile_user_agent(user_agent) {
            "?1"
        } else {
            "?0"
        };
        headers.insert("Sec-CH-UA", sec_ch_ua);
        headers.insert("Sec-CH-UA-Mobile", mobile_flag);
        headers.insert("Sec-CH-UA-Platform", format!("\"{platform}\""));
    }
    headers
}

/// Builds the per-hostname default headers a freshly created session is
/// born with: a random UA, no referer (referer is added per-request).
#[must_use]
pub fn session_default_headers(_hostname: &str) -> HeaderBag {
    build_browser_headers(Some(random_user_agent()), None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chromium_ua_gets_sec_ch_ua() {
        let ua = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36";
        let headers = build_browser_headers(Some(ua), None);
        assert!(headers.get("Sec-CH-UA").unwrap().contains("Chromium"));
        assert_eq!(headers.get("Sec-CH-UA-Mobile"), Some("?0"));
        assert_eq!(headers.get("Sec-CH-UA-Platform"), Some("\"Windows\""));
    }

    #[test]
    fn firefox_ua_gets_no_sec_ch_ua() {
        let ua = "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:122.0) Gecko/20100101 Firefox/122.0";
        let headers = build_browser_headers(Some(ua), None);
        assert!(headers.get("Sec-CH-UA").is_none());
    }

    #[test]
    fn mobile_ua_sets_mobile_flag() {
        let ua = "Mozilla/5.0 (Linux; Android 14; Pixel 8 Pro) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Mobile Safari/537.36";
        let headers = build_browser_headers(Some(ua), None);
        assert_eq!(headers.get("Sec-CH-UA-Mobile"), Some("?1"));
        assert_eq!(headers.get("Sec-CH-UA-Platform"), Some("\"Android\""));
    }

    #[test]
    fn merge_preserves_session_user_agent() {
        let mut session = HeaderBag::default();
        session.insert("User-Agent", "session-ua");
        let mut request = HeaderBag::default();
        request.insert("User-Agent", "request-ua");
        request.insert("Referer", "https://example.com/");
        let merged = session.clone().merged_over(&request);
        assert_eq!(merged.get("User-Agent"), Some("session-ua"));
        assert_eq!(merged.get("Referer"), Some("https://example.com/"));
    }

    #[test]
    fn referer_uses_scheme_and_host_only() {
        let url = url::Url::parse("https://example.com/article?x=1").unwrap();
        assert_eq!(build_referer(&url), Some("https://example.com/".to_string()));
    }
}
