//! Per-recipient campaign rendering
//!
//! Substitutes `{name}`/`{email}` with HTML-escaped values, injects the
//! open-tracking pixel and unsubscribe footer, and rewrites links
//! through the click-tracking redirect.

use base64::{engine::general_purpose::URL_SAFE, Engine};
use regex::Regex;

/// HTML-escape a value for injection into an HTML body. Escaping is
/// idempotent: entities produced by this function (and the standard
/// named set) are left alone on a second pass.
pub fn html_escape(input: &str) -> String {
    const ENTITIES: &[&str] = &["&amp;", "&lt;", "&gt;", "&quot;", "&#39;"];

    let mut out = String::with_capacity(input.len());
    let bytes = input.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            '&' => {
                if ENTITIES.iter().any(|e| input[i..].starts_with(e)) {
                    out.push('&');
                } else {
                    out.push_str("&amp;");
                }
            }
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => {
                let ch_len = input[i..].chars().next().map(char::len_utf8).unwrap_or(1);
                out.push_str(&input[i..i + ch_len]);
                i += ch_len;
                continue;
            }
        }
        i += 1;
    }

    out
}

/// Substitute `{name}` and `{email}` with escaped recipient values.
pub fn substitute(body: &str, name: &str, email: &str) -> String {
    body.replace("{name}", &html_escape(name))
        .replace("{email}", &html_escape(email))
}

/// Append the 1x1 open pixel and the unsubscribe footer. When the body
/// has a closing `</body>` the markup goes right before it.
pub fn inject_tracking(body: &str, base_url: &str, tracking_id: &str) -> String {
    let pixel = format!(
        r#"<img src="{}/api/v1/track/open/{}" width="1" height="1" style="display:none;" />"#,
        base_url, tracking_id
    );
    let unsubscribe_url = format!("{}/api/v1/track/unsubscribe/{}", base_url, tracking_id);
    let footer = format!(
        concat!(
            r#"<br/><br/><hr/><p style="font-size:12px;color:#888;">"#,
            r#"If you do not wish to receive these emails, "#,
            r#"<a href="{}">unsubscribe here</a>.</p>"#
        ),
        unsubscribe_url
    );

    let injected = format!("{}{}", pixel, footer);
    if body.contains("</body>") {
        body.replacen("</body>", &format!("{}</body>", injected), 1)
    } else {
        format!("{}{}", body, injected)
    }
}

/// Rewrite every http(s) anchor through the click redirect, skipping
/// URLs that already point at a tracking endpoint.
pub fn rewrite_links(body: &str, base_url: &str, tracking_id: &str) -> String {
    let re = Regex::new(r#"(?i)<a\s+[^>]*href=["']([^"']+)["'][^>]*>"#).expect("static regex");

    re.replace_all(body, |caps: &regex::Captures| {
        let tag = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
        let original_url = caps.get(1).map(|m| m.as_str()).unwrap_or_default();

        if original_url.contains("/api/v1/track/") || !original_url.starts_with("http") {
            return tag.to_string();
        }

        let encoded = URL_SAFE.encode(original_url.as_bytes());
        let tracking_url = format!(
            "{}/api/v1/track/click/{}?url={}",
            base_url, tracking_id, encoded
        );
        tag.replacen(original_url, &tracking_url, 1)
    })
    .into_owned()
}

/// Full per-recipient pipeline: substitute, inject, rewrite.
pub fn render_recipient_body(
    body: &str,
    name: &str,
    email: &str,
    base_url: &str,
    tracking_id: &str,
) -> String {
    let substituted = substitute(body, name, email);
    let injected = inject_tracking(&substituted, base_url, tracking_id);
    rewrite_links(&injected, base_url, tracking_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_is_idempotent() {
        let dangerous = r#"<script>alert("x & y')</script>"#;
        let once = html_escape(dangerous);
        let twice = html_escape(&once);
        assert_eq!(once, twice);
        assert!(!once.contains('<'));
        assert!(once.contains("&lt;script&gt;"));
    }

    #[test]
    fn substitute_escapes_values() {
        let body = "<p>Hi {name} ({email})</p>";
        let out = substitute(body, "<b>Eve</b>", "eve@x.test");
        assert_eq!(out, "<p>Hi &lt;b&gt;Eve&lt;/b&gt; (eve@x.test)</p>");
    }

    #[test]
    fn empty_substitution_leaves_body_unchanged() {
        let body = "<p>No placeholders here</p>";
        assert_eq!(substitute(body, "A", "a@x.test"), body);
    }

    #[test]
    fn injection_lands_before_closing_body() {
        let out = inject_tracking("<html><body>x</body></html>", "http://h:1", "tid");
        let pixel_pos = out.find("/api/v1/track/open/tid").unwrap();
        let close_pos = out.find("</body>").unwrap();
        assert!(pixel_pos < close_pos);
        assert!(out.contains("/api/v1/track/unsubscribe/tid"));
    }

    #[test]
    fn injection_appends_without_body_tag() {
        let out = inject_tracking("<p>x</p>", "http://h:1", "tid");
        assert!(out.starts_with("<p>x</p><img"));
    }

    #[test]
    fn links_are_wrapped_and_round_trip() {
        let body = r#"<a href="http://a.test/page?q=1">here</a>"#;
        let out = rewrite_links(body, "http://h:1", "tid");
        assert!(out.contains("http://h:1/api/v1/track/click/tid?url="));

        let encoded = out
            .split("url=")
            .nth(1)
            .unwrap()
            .split('"')
            .next()
            .unwrap()
            .trim_end_matches('>');
        let decoded = URL_SAFE.decode(encoded).unwrap();
        assert_eq!(decoded, b"http://a.test/page?q=1");
    }

    #[test]
    fn tracking_and_relative_links_are_skipped() {
        let tracking = r#"<a href="http://h:1/api/v1/track/unsubscribe/tid">out</a>"#;
        assert_eq!(rewrite_links(tracking, "http://h:1", "tid"), tracking);

        let relative = r#"<a href="/local/path">in</a>"#;
        assert_eq!(rewrite_links(relative, "http://h:1", "tid"), relative);

        let mailto = r#"<a href="mailto:a@x.test">mail</a>"#;
        assert_eq!(rewrite_links(mailto, "http://h:1", "tid"), mailto);
    }

    #[test]
    fn full_pipeline_keeps_unsubscribe_unwrapped() {
        let body = r#"<p>Hi {name}</p><a href="http://a.test">here</a></body>"#;
        let out = render_recipient_body(body, "Ann", "ann@x.test", "http://h:1", "tid");
        assert!(out.contains("Hi Ann"));
        assert!(out.contains("/api/v1/track/click/tid?url="));
        // The injected unsubscribe link must not be click-wrapped.
        assert!(out.contains(r#"<a href="http://h:1/api/v1/track/unsubscribe/tid">"#));
        assert!(out.contains("/api/v1/track/open/tid"));
    }
}
