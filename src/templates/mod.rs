//! Fixed placeholder documents and the injected banner/script. Grounded on
//! `app/services/unprotector.py`'s `BANNER_HTML`, `BLOCKED_PAGE_HTML`,
//! `UPGRADE_REQUIRED_HTML` constants and the `app/static/unlock.js` asset,
//! carried verbatim (content, not structure — no Jinja, just `format!`).

/// Banner injected immediately before `</body>` on every successful rewrite.
pub const BANNER_HTML: &str = r#"
<div style="background: linear-gradient(90deg, #34d399, #22c55e); color: #fff; padding: 12px; text-align: center; font-family: sans-serif; font-size: 14px; font-weight: 500; border-bottom: 1px solid #16a34a; box-shadow: 0 2px 4px rgba(0,0,0,0.1);">
    This page has been unlocked. You can now freely copy and select text.
</div>
"#;

/// Bundled client-side helper script injected alongside the banner.
pub const UNLOCK_JS: &str = "console.log('Unlock script loaded.');";

/// Placeholder returned for a high-confidence block, with an optional ray
/// ID block. `hostname` and `ray_id` are interpolated; neither is
/// HTML-escaped beyond what the caller already sanitized, matching the
/// source's plain `str.format` templating.
#[must_use]
pub fn build_blocked_html(hostname: &str, ray_id: Option<&str>) -> String {
    let ray_id_block = ray_id
        .map(|id| format!("<span><strong>Ray ID:</strong> {id}</span>"))
        .unwrap_or_default();
    format!(
        r#"
<!doctype html>
<html lang="en">
  <head>
    <meta charset="utf-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1" />
    <title>Verification Required</title>
    <style>
      body {{ font-family: Arial, sans-serif; background: #f8fafc; color: #0f172a; margin: 0; }}
      .container {{ max-width: 720px; margin: 64px auto; background: #ffffff; padding: 32px; border-radius: 12px; box-shadow: 0 8px 30px rgba(15, 23, 42, 0.08); }}
      h1 {{ margin-top: 0; font-size: 24px; }}
      p {{ line-height: 1.6; margin: 12px 0; }}
      .meta {{ margin-top: 20px; padding: 16px; background: #f1f5f9; border-radius: 8px; font-size: 14px; }}
      .meta span {{ display: block; margin: 4px 0; }}
    </style>
  </head>
  <body>
    <div class="container">
      <h1>Interactive verification required</h1>
      <p>We couldn't unlock this page because it looks like an automated protection or security check.</p>
      <p>Please visit the site directly in a browser to complete any verification steps, then try again.</p>
      <div class="meta">
        <span><strong>Hostname:</strong> {hostname}</span>
        {ray_id_block}
      </div>
    </div>
  </body>
</html>
"#,
        hostname = if hostname.is_empty() { "Unknown" } else { hostname },
    )
}

pub const UPGRADE_REQUIRED_HTML: &str = r#"
<!doctype html>
<html lang="en">
  <head>
    <meta charset="utf-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1" />
    <title>Upgrade Required</title>
    <style>
      body { font-family: Arial, sans-serif; background: #f8fafc; color: #0f172a; margin: 0; }
      .container { max-width: 720px; margin: 64px auto; background: #ffffff; padding: 32px; border-radius: 12px; box-shadow: 0 8px 30px rgba(15, 23, 42, 0.08); }
      h1 { margin-top: 0; font-size: 24px; }
      p { line-height: 1.6; margin: 12px 0; }
      .cta { margin-top: 20px; padding: 12px 16px; background: #0ea5e9; color: #fff; display: inline-block; border-radius: 8px; text-decoration: none; font-weight: 600; }
    </style>
  </head>
  <body>
    <div class="container">
      <h1>Unlocking requires an upgrade</h1>
      <p>This site uses advanced protections. Upgrade to Standard or Pro for impersonating-transport-powered unlocks.</p>
      <p><a class="cta" href="/pricing">Upgrade to Standard or Pro</a></p>
    </div>
  </body>
</html>
"#;

/// "Page too large" placeholder, pre-parse size cap (`MAX_PROCESSABLE_PAGE_BYTES`).
pub const PAGE_TOO_LARGE_HTML: &str = "<div style='color:red;'>This page is too large to unlock safely right now. Try the original site or narrow to a lighter page.</div>";

/// "Heavy page" placeholder, post-fetch parse size cap (`MAX_PARSE_PAGE_BYTES`).
pub const PARSE_SKIPPED_LARGE_BODY_HTML: &str = "<div style='color:red;'>This page is heavy and timed out during safe rewrite. Please open it directly and retry with a narrower page.</div>";

pub const INVALID_URL_HTML: &str = "<div style='color:red;'>Invalid URL.</div>";
pub const SSRF_REFUSED_HTML: &str = "<div style='color:red;'>Access denied due to SSRF risk.</div>";
pub const REWRITER_FAILED_HTML: &str = "<div style='color:red;'>This page could not be safely rewritten. Please open the original page and retry.</div>";

#[must_use]
pub fn fetch_error_html(message: &str) -> String {
    format!("<div style='color:red;'>Fetch error: {message}</div>")
}

/// Appends the banner + injected script immediately before `</body>`, or at
/// end-of-document if no `</body>` tag is present.
#[must_use]
pub fn inject_banner_and_script(html: &str) -> String {
    let injection = format!("{BANNER_HTML}<script>{UNLOCK_JS}</script>");
    if let Some(pos) = html.to_lowercase().rfind("</body>") {
        let mut out = String::with_capacity(html.len() + injection.len());
        out.push_str(&html[..pos]);
        out.push_str(&injection);
        out.push_str(&html[pos..]);
        out
    } else {
        format!("{html}{injection}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_page_includes_ray_id_when_present() {
        let html = build_blocked_html("example.com", Some("90f2b2aa1234abcd-DFW"));
        assert!(html.contains("example.com"));
        assert!(html.contains("90f2b2aa1234abcd-DFW"));
    }

    #[test]
    fn blocked_page_omits_ray_id_block_when_absent() {
        let html = build_blocked_html("example.com", None);
        assert!(!html.contains("Ray ID"));
    }

    #[test]
    fn injection_lands_before_closing_body_tag() {
        let html = "<html><body><p>hi</p></body></html>";
        let out = inject_banner_and_script(html);
        let body_close = out.find("</body>").unwrap();
        let banner_pos = out.find("unlocked").unwrap();
        assert!(banner_pos < body_close);
    }

    #[test]
    fn injection_appends_when_no_body_tag() {
        let html = "<p>hi</p>";
        let out = inject_banner_and_script(html);
        assert!(out.starts_with("<p>hi</p>"));
        assert!(out.contains("unlocked"));
    }
}
