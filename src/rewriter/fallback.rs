//! Text-level fallback rewrite path, invoked when the primary `kuchiki`
//! parse trips [`super::FALLBACK_TRUNCATION_RATIO`] or errors outright.
//!
//! Mirrors the original's bs4-as-fallback-to-selectolax structure, but
//! since this crate has no second full DOM parser to fall back to, it
//! instead reruns the rebase/lazy-image/integrity steps as regexes over the
//! raw text — the same "more tolerant, best-effort" idiom the teacher's own
//! `html_cleaning.rs` uses for HTML surgery it doesn't trust a full parse
//! tree to survive intact.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use url::Url;

use crate::error::Result;
use crate::templates;

use super::safe_urljoin;

static TAG_ATTR_RE: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    let pairs: &[(&str, &str)] = &[
        ("link", "href"),
        ("script", "src"),
        ("img", "src"),
        ("iframe", "src"),
        ("audio", "src"),
        ("video", "src"),
        ("source", "src"),
        ("a", "href"),
        ("form", "action"),
    ];
    pairs
        .iter()
        .map(|(tag, attr)| {
            let pattern = format!(r#"(?is)(<{tag}\b[^>]*?\s{attr}\s*=\s*)"([^"]*)""#);
            (Regex::new(&pattern).expect("valid regex"), *attr)
        })
        .collect()
});

static IMG_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<img\b[^>]*>").expect("valid regex"));

static SRC_ATTR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)\ssrc\s*=\s*"[^"]*""#).expect("valid regex"));

static LAZY_ATTR_RE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    ["data-src", "data-lazy-src", "data-original"]
        .iter()
        .map(|name| Regex::new(&format!(r#"(?i)\s{name}\s*=\s*"([^"]*)""#)).expect("valid regex"))
        .collect()
});

static INTEGRITY_ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\s(integrity|crossorigin|referrerpolicy)\s*=\s*"[^"]*""#)
        .expect("valid regex")
});

/// Step 2 (text-level): rewrites `attr="value"` pairs for the known
/// tag/attribute set, dropping values [`safe_urljoin`] rejects.
fn rebase_resources_text(html: &str, base_url: &Url) -> String {
    let mut text = html.to_string();
    for (re, _attr) in TAG_ATTR_RE.iter() {
        text = re
            .replace_all(&text, |caps: &Captures| {
                let prefix = &caps[1];
                let value = &caps[2];
                match safe_urljoin(base_url, value) {
                    Some(resolved) => format!(r#"{prefix}"{resolved}""#),
                    None => prefix.trim_end().to_string(),
                }
            })
            .into_owned();
    }
    text
}

/// Step 3 (text-level): for each `<img>` tag with no `src=`, promotes the
/// first present lazy-load attribute to `src`.
fn promote_lazy_images_text(html: &str) -> String {
    IMG_TAG_RE
        .replace_all(html, |caps: &Captures| {
            let tag = &caps[0];
            if SRC_ATTR_RE.is_match(tag) {
                return tag.to_string();
            }
            for re in LAZY_ATTR_RE.iter() {
                if let Some(c) = re.captures(tag) {
                    let value = c[1].to_string();
                    return tag.replacen('>', &format!(r#" src="{value}">"#), 1);
                }
            }
            tag.to_string()
        })
        .into_owned()
}

/// Step 4 (text-level): deletes `integrity=`/`crossorigin=`/`referrerpolicy=`
/// attributes wherever they occur.
fn strip_integrity_attributes_text(html: &str) -> String {
    INTEGRITY_ATTR_RE.replace_all(html, "").into_owned()
}

/// Runs steps 2-4 as text transforms and hands the result straight to the
/// template injector, skipping font neutralization and anti-copy script
/// removal — those steps require node identity the fallback path doesn't
/// have, so the traded-off cost is a page that may still carry webfonts or
/// an anti-copy handler rather than one that's silently mangled.
pub fn rewrite_via_fallback(
    swept_html: &str,
    base_url: &Url,
    doctype: &Option<String>,
) -> Result<String> {
    let mut html = rebase_resources_text(swept_html, base_url);
    html = promote_lazy_images_text(&html);
    html = strip_integrity_attributes_text(&html);

    if let Some(dt) = doctype {
        if !html.to_lowercase().trim_start().starts_with("<!doctype") {
            html = format!("{dt}\n{html}");
        }
    }

    if html.trim().is_empty() {
        return Ok(templates::REWRITER_FAILED_HTML.to_string());
    }

    Ok(templates::inject_banner_and_script(&html))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://example.com/article").unwrap()
    }

    #[test]
    fn fallback_rebases_href_and_drops_javascript_scheme() {
        let html = r#"<a href="/x">x</a><a href="javascript:evil()">y</a>"#;
        let out = rewrite_via_fallback(html, &base(), &None).unwrap();
        assert!(out.contains(r#"href="https://example.com/x""#));
        assert!(!out.contains("javascript:"));
    }

    #[test]
    fn fallback_promotes_lazy_image_attr() {
        let html = r#"<img data-src="cat.png" class="lazy">"#;
        let out = rewrite_via_fallback(html, &base(), &None).unwrap();
        assert!(out.contains(r#"src="cat.png""#));
    }

    #[test]
    fn fallback_strips_integrity_attr() {
        let html = r#"<script src="lib.js" integrity="sha384-abc"></script>"#;
        let out = rewrite_via_fallback(html, &base(), &None).unwrap();
        assert!(!out.contains("integrity="));
    }
}
