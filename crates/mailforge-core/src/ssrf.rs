//! SSRF guard for caller-supplied URLs
//!
//! Any URL the server fetches on behalf of an API caller must resolve to
//! a public address. Parse or resolution failure counts as unsafe.

use std::net::IpAddr;
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

/// Returns true when the URL points at loopback, private, or link-local
/// space (or cannot be resolved at all).
pub async fn is_internal_url(raw_url: &str) -> bool {
    let host = match host_of(raw_url) {
        Some(host) => host,
        None => return true,
    };

    // Literal addresses skip DNS.
    if let Ok(ip) = host.parse::<IpAddr>() {
        return is_internal_ip(ip);
    }

    let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
    match resolver.lookup_ip(host.as_str()).await {
        Ok(lookup) => lookup.iter().any(is_internal_ip),
        Err(_) => true,
    }
}

fn is_internal_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fe80::/10 link-local and fc00::/7 unique-local
                || (v6.segments()[0] & 0xffc0) == 0xfe80
                || (v6.segments()[0] & 0xfe00) == 0xfc00
        }
    }
}

/// Host portion of an http(s) URL, without scheme, userinfo, port, or path.
fn host_of(raw_url: &str) -> Option<String> {
    let rest = raw_url
        .strip_prefix("https://")
        .or_else(|| raw_url.strip_prefix("http://"))?;
    let authority = rest.split(['/', '?', '#']).next()?;
    let authority = authority.rsplit('@').next()?;

    // Bracketed IPv6 literal.
    if let Some(stripped) = authority.strip_prefix('[') {
        return stripped.split(']').next().map(|s| s.to_string());
    }

    let host = authority.split(':').next()?;
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("http://a.test/x"), Some("a.test".to_string()));
        assert_eq!(host_of("https://a.test:8443/x?y=1"), Some("a.test".to_string()));
        assert_eq!(host_of("https://[::1]:443/"), Some("::1".to_string()));
        assert_eq!(host_of("ftp://a.test/"), None);
        assert_eq!(host_of("not a url"), None);
    }

    #[tokio::test]
    async fn literal_internal_addresses_are_blocked() {
        assert!(is_internal_url("http://127.0.0.1/secret").await);
        assert!(is_internal_url("http://10.0.0.8/").await);
        assert!(is_internal_url("http://192.168.1.1/router").await);
        assert!(is_internal_url("http://169.254.169.254/metadata").await);
        assert!(is_internal_url("http://[::1]/").await);
    }

    #[tokio::test]
    async fn malformed_urls_are_blocked() {
        assert!(is_internal_url("garbage").await);
        assert!(is_internal_url("http://").await);
    }
}
