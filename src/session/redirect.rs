//! Redirect URL resolution and header hygiene across hops.

use std::collections::HashMap;

use url::Url;

/// Resolve a `Location` header value against the current URL.
///
/// Handles absolute URLs, protocol-relative URLs (`//host/path`, inheriting
/// the scheme), and relative paths. An empty resolved path becomes `/`.
pub(crate) fn resolve_redirect(base: &Url, location: &str) -> Result<Url, url::ParseError> {
    let location = location.trim();
    let mut resolved = if let Some(rest) = location.strip_prefix("//") {
        Url::parse(&format!("{}://{}", base.scheme(), rest))?
    } else {
        base.join(location)?
    };
    if resolved.path().is_empty() {
        resolved.set_path("/");
    }
    Ok(resolved)
}

pub(crate) fn is_cross_origin(a: &Url, b: &Url) -> bool {
    a.scheme() != b.scheme()
        || a.host_str() != b.host_str()
        || a.port_or_known_default() != b.port_or_known_default()
}

/// Strip headers that must not leak across a redirect: credentials on any
/// qualifying hop, body headers when the method was rewritten to GET.
pub(crate) fn strip_sensitive_headers(
    extra: &mut HashMap<String, String>,
    method_changed: bool,
) {
    extra.retain(|name, _| {
        let lower = name.to_ascii_lowercase();
        if matches!(lower.as_str(), "authorization" | "cookie") {
            return false;
        }
        if method_changed && matches!(lower.as_str(), "content-type" | "content-length") {
            return false;
        }
        true
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://example.com/a/b?q=1").unwrap()
    }

    #[test]
    fn resolves_absolute_locations() {
        let url = resolve_redirect(&base(), "https://other.com/next").unwrap();
        assert_eq!(url.as_str(), "https://other.com/next");
    }

    #[test]
    fn resolves_protocol_relative_locations() {
        let url = resolve_redirect(&base(), "//cdn.example.com/x").unwrap();
        assert_eq!(url.as_str(), "https://cdn.example.com/x");

        let http_base = Url::parse("http://example.com/").unwrap();
        let url = resolve_redirect(&http_base, "//cdn.example.com/x").unwrap();
        assert_eq!(url.scheme(), "http");
    }

    #[test]
    fn resolves_relative_locations() {
        let url = resolve_redirect(&base(), "/root").unwrap();
        assert_eq!(url.as_str(), "https://example.com/root");

        let url = resolve_redirect(&base(), "sibling").unwrap();
        assert_eq!(url.as_str(), "https://example.com/a/sibling");
    }

    #[test]
    fn empty_path_becomes_slash() {
        let url = resolve_redirect(&base(), "https://example.com").unwrap();
        assert_eq!(url.path(), "/");
    }

    #[test]
    fn cross_origin_detection() {
        let a = Url::parse("https://example.com/x").unwrap();
        assert!(!is_cross_origin(&a, &Url::parse("https://example.com/y").unwrap()));
        // default port is not a new origin
        assert!(!is_cross_origin(&a, &Url::parse("https://example.com:443/y").unwrap()));
        assert!(is_cross_origin(&a, &Url::parse("http://example.com/x").unwrap()));
        assert!(is_cross_origin(&a, &Url::parse("https://other.com/x").unwrap()));
        assert!(is_cross_origin(&a, &Url::parse("https://example.com:8443/x").unwrap()));
    }

    #[test]
    fn strips_credentials_and_body_headers() {
        let mut headers: HashMap<String, String> = [
            ("Authorization", "Bearer tok"),
            ("Cookie", "sid=1"),
            ("Content-Type", "application/json"),
            ("X-Custom", "keep"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let mut on_cross_origin = headers.clone();
        strip_sensitive_headers(&mut on_cross_origin, false);
        assert!(!on_cross_origin.contains_key("Authorization"));
        assert!(!on_cross_origin.contains_key("Cookie"));
        assert!(on_cross_origin.contains_key("Content-Type"));
        assert!(on_cross_origin.contains_key("X-Custom"));

        strip_sensitive_headers(&mut headers, true);
        assert!(!headers.contains_key("Content-Type"));
        assert!(headers.contains_key("X-Custom"));
    }
}
