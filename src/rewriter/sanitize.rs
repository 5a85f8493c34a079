//! Allowlist tag/attribute sanitizer used for `unlock_mode = false`
//! requests (spec.md §4.9's "plain clean" path): strip everything outside a
//! small allowlist rather than run the full rewrite pipeline, then resolve
//! the surviving link/image URLs against the page's base URL so the result
//! is portable outside its original page (spec.md §4.10 step 8's "allowlist
//! tag/attribute filter with relative-URL resolution"). Grounded on
//! `app/services/unprotector.py::sanitize_html`'s `bleach`-style allowlist,
//! reimplemented over `kuchiki` since this crate has no `bleach` analogue;
//! the URL-resolution half is grounded on this crate's own
//! [`super::safe_urljoin`], already used by the full rewrite pipeline for
//! the same purpose.

use std::collections::HashMap;
use std::sync::LazyLock;

use kuchiki::NodeData;
use kuchiki::traits::TendrilSink;
use url::Url;

use super::safe_urljoin;
use crate::error::{PipelineError, Result};

/// Tags preserved verbatim; everything else is unwrapped (children kept,
/// the element itself discarded) except for a small always-dropped set
/// (`script`, `style`, `noscript`, `iframe`) which are removed with their
/// subtree.
const ALLOWED_TAGS: &[&str] = &[
    "a", "abbr", "acronym", "b", "blockquote", "code", "em", "i", "li", "ol", "strong", "ul",
    "p", "br", "img", "video", "source", "span", "div", "h1", "h2", "h3", "h4", "h5", "h6",
];

const ALWAYS_DROPPED_TAGS: &[&str] = &["script", "style", "noscript", "iframe", "object", "embed"];

static ALLOWED_ATTRS: LazyLock<HashMap<&'static str, &'static [&'static str]>> =
    LazyLock::new(|| {
        let mut m: HashMap<&'static str, &'static [&'static str]> = HashMap::new();
        m.insert("a", &["href", "title"]);
        m.insert("abbr", &["title"]);
        m.insert("acronym", &["title"]);
        m.insert("img", &["src", "alt"]);
        m.insert("video", &["src", "controls"]);
        m.insert("source", &["src", "type"]);
        m
    });

/// `(tag, attribute)` pairs resolved against the document base URL once they
/// survive the allowlist filter, so sanitized output stays usable outside
/// its original page.
const URL_ATTRS: &[(&str, &str)] = &[
    ("a", "href"),
    ("img", "src"),
    ("video", "src"),
    ("source", "src"),
];

/// Strips every tag not in [`ALLOWED_TAGS`] (unwrapping, not deleting,
/// unless the tag is in [`ALWAYS_DROPPED_TAGS`]) and every attribute not
/// allowlisted for its tag. Used for non-unlock requests where the caller
/// wants plain readable markup without any of the rewrite pipeline's
/// active-content surgery.
pub fn sanitize_html(html: &str, base_url: &Url) -> Result<String> {
    let document = kuchiki::parse_html().one(html.to_string());

    let always_dropped: Vec<_> = ALWAYS_DROPPED_TAGS
        .iter()
        .flat_map(|tag| document.select(tag).into_iter().flatten())
        .map(|m| m.as_node().clone())
        .collect();
    for node in always_dropped {
        node.detach();
    }

    let candidates: Vec<_> = document.descendants().collect();
    for node in candidates {
        let Some(elem) = node.as_element() else {
            continue;
        };
        let tag_name = elem.name.local.to_string();

        {
            let mut attrs = elem.attributes.borrow_mut();
            let allowed = ALLOWED_ATTRS.get(tag_name.as_str()).copied().unwrap_or(&[]);
            let keys: Vec<String> = attrs
                .map
                .keys()
                .map(|k| k.local.to_string())
                .filter(|name| !allowed.contains(&name.as_str()))
                .collect();
            for key in keys {
                attrs.remove(key.as_str());
            }

            if let Some((_, url_attr)) = URL_ATTRS.iter().find(|(tag, _)| *tag == tag_name) {
                let current = attrs.get(*url_attr).map(str::to_string);
                if let Some(value) = current {
                    match safe_urljoin(base_url, &value) {
                        Some(resolved) => {
                            attrs.insert(*url_attr, resolved);
                        }
                        None => {
                            attrs.remove(*url_attr);
                        }
                    }
                }
            }
        }

        if !ALLOWED_TAGS.contains(&tag_name.as_str()) {
            unwrap_node(&node);
        }
    }

    let mut out = Vec::new();
    document
        .serialize(&mut out)
        .map_err(|e| PipelineError::Rewriter(format!("sanitize serialize failed: {e}")))?;
    String::from_utf8(out).map_err(|e| PipelineError::Rewriter(format!("utf8 error: {e}")))
}

fn unwrap_node(node: &kuchiki::NodeRef) {
    if !matches!(node.data(), NodeData::Element(_)) {
        return;
    }
    for child in node.children().collect::<Vec<_>>() {
        node.insert_before(child);
    }
    node.detach();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://example.com/article").unwrap()
    }

    #[test]
    fn sanitize_drops_script_tags_entirely() {
        let html = "<div><script>alert(1)</script><p>hi</p></div>";
        let out = sanitize_html(html, &base()).unwrap();
        assert!(!out.contains("alert"));
        assert!(out.contains("hi"));
    }

    #[test]
    fn sanitize_unwraps_disallowed_tag_but_keeps_children() {
        let html = "<section><p>keep me</p></section>";
        let out = sanitize_html(html, &base()).unwrap();
        assert!(!out.contains("<section>"));
        assert!(out.contains("keep me"));
    }

    #[test]
    fn sanitize_strips_disallowed_attributes() {
        let html = r#"<a href="/x" onclick="evil()">link</a>"#;
        let out = sanitize_html(html, &base()).unwrap();
        assert!(out.contains(r#"href="https://example.com/x""#));
        assert!(!out.contains("onclick"));
    }

    #[test]
    fn sanitize_resolves_relative_image_src() {
        let html = r#"<img src="../img/a.png" alt="a">"#;
        let out = sanitize_html(html, &base()).unwrap();
        assert!(out.contains(r#"src="https://example.com/img/a.png""#));
    }

    #[test]
    fn sanitize_drops_javascript_href_instead_of_resolving() {
        let html = r#"<a href="javascript:alert(1)">click</a>"#;
        let out = sanitize_html(html, &base()).unwrap();
        assert!(!out.contains("href="));
        assert!(out.contains("click"));
    }
}
