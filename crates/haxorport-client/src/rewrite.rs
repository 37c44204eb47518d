//! Textual URL rewriting for proxied HTML bodies.
//!
//! Rewriting is plain substring substitution, not HTML parsing. It will
//! also rewrite matching substrings inside scripts or JSON embedded in an
//! HTML body; that is accepted behavior.

use haxorport_proto::HeaderMap;

/// Pick the public hostname for URL rewriting: the incoming `Host` header,
/// then `X-Forwarded-Host`, then the registered subdomain under the base
/// domain, then the tunnel id under the base domain.
pub fn external_hostname(
    headers: &HeaderMap,
    subdomain: Option<&str>,
    tunnel_id: &str,
    base_domain: &str,
) -> String {
    if let Some(host) = first_header(headers, "Host") {
        return host;
    }
    if let Some(host) = first_header(headers, "X-Forwarded-Host") {
        return host;
    }
    match subdomain {
        Some(subdomain) if !subdomain.is_empty() => format!("{subdomain}.{base_domain}"),
        _ => format!("{tunnel_id}.{base_domain}"),
    }
}

/// `<scheme>://<hostname>` with the scheme defaulting to plain http.
pub fn external_prefix(scheme: Option<&str>, hostname: &str) -> String {
    let scheme = if scheme == Some("https") { "https" } else { "http" };
    format!("{scheme}://{hostname}")
}

/// Replace loopback URLs with the external prefix and absolutize relative
/// `href`/`src` asset references.
pub fn rewrite_html(body: &str, local_port: u16, external_prefix: &str) -> String {
    let insecure = format!("http://localhost:{local_port}");
    let secure = format!("https://localhost:{local_port}");

    body.replace(&insecure, external_prefix)
        .replace(&secure, external_prefix)
        .replace("href=\"/", &format!("href=\"{external_prefix}/"))
        .replace("src=\"/", &format!("src=\"{external_prefix}/"))
}

fn first_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .and_then(|(_, values)| values.first())
        .filter(|value| !value.is_empty())
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), vec![v.to_string()]))
            .collect()
    }

    #[test]
    fn hostname_prefers_the_host_header() {
        let headers = headers(&[
            ("Host", "app.haxorport.online"),
            ("X-Forwarded-Host", "other.haxorport.online"),
        ]);
        assert_eq!(
            external_hostname(&headers, Some("app"), "t1", "haxorport.online"),
            "app.haxorport.online"
        );
    }

    #[test]
    fn hostname_falls_back_through_the_chain() {
        let forwarded = headers(&[("X-Forwarded-Host", "fwd.haxorport.online")]);
        assert_eq!(
            external_hostname(&forwarded, None, "t1", "haxorport.online"),
            "fwd.haxorport.online"
        );

        let empty = HeaderMap::new();
        assert_eq!(
            external_hostname(&empty, Some("app"), "t1", "haxorport.online"),
            "app.haxorport.online"
        );
        assert_eq!(
            external_hostname(&empty, None, "t1", "haxorport.online"),
            "t1.haxorport.online"
        );
    }

    #[test]
    fn host_header_lookup_is_case_insensitive() {
        let lower = headers(&[("host", "app.haxorport.online")]);
        assert_eq!(
            external_hostname(&lower, None, "t1", "haxorport.online"),
            "app.haxorport.online"
        );
    }

    #[test]
    fn prefix_defaults_to_plain_http() {
        assert_eq!(external_prefix(None, "h"), "http://h");
        assert_eq!(external_prefix(Some("http"), "h"), "http://h");
        assert_eq!(external_prefix(Some("https"), "h"), "https://h");
    }

    #[test]
    fn rewrites_loopback_urls_completely() {
        let body = r#"<a href="http://localhost:8080/next">n</a><img src="https://localhost:8080/i.png">"#;
        let out = rewrite_html(body, 8080, "https://app.haxorport.online");
        assert!(!out.contains("http://localhost:8080"));
        assert!(!out.contains("https://localhost:8080"));
        assert!(out.contains(r#"href="https://app.haxorport.online/next""#));
        assert!(out.contains(r#"src="https://app.haxorport.online/i.png""#));
    }

    #[test]
    fn absolutizes_relative_asset_references() {
        let body = r#"<link href="/style.css"><script src="/app.js"></script>"#;
        let out = rewrite_html(body, 3000, "http://t1.haxorport.online");
        assert_eq!(
            out,
            r#"<link href="http://t1.haxorport.online/style.css"><script src="http://t1.haxorport.online/app.js"></script>"#
        );
    }

    #[test]
    fn other_ports_and_hosts_are_untouched() {
        let body = r#"<a href="http://localhost:9999/x">x</a><a href="https://example.com/y">y</a>"#;
        let out = rewrite_html(body, 8080, "https://app.haxorport.online");
        assert_eq!(out, body);
    }
}
