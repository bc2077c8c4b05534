//! Origin validation for WebSocket upgrades.
//!
//! Same-origin requests (no `Origin` header) are accepted. When the
//! daemon binds to localhost only, localhost origins are accepted. Any
//! other origin must match an allowed entry exactly or via a single
//! `*.domain` wildcard.

pub fn origin_allowed(origin: Option<&str>, allowed: &[String], localhost_bind: bool) -> bool {
    let Some(origin) = origin else {
        // No Origin header: same-origin client (native app, curl).
        return true;
    };

    if localhost_bind && is_localhost_origin(origin) {
        return true;
    }

    let host = origin_host(origin);
    for entry in allowed {
        if entry == origin {
            return true;
        }
        if let Some(domain) = entry.strip_prefix("*.") {
            // Single-level wildcard: "a.example.com" matches
            // "*.example.com"; "a.b.example.com" does not.
            if let Some(prefix) = host.strip_suffix(domain) {
                if let Some(label) = prefix.strip_suffix('.') {
                    if !label.is_empty() && !label.contains('.') {
                        return true;
                    }
                }
            }
        }
    }
    false
}

fn is_localhost_origin(origin: &str) -> bool {
    let host = origin_host(origin);
    matches!(host.as_str(), "localhost" | "127.0.0.1" | "[::1]" | "::1")
}

/// Host part of an origin, without scheme or port.
fn origin_host(origin: &str) -> String {
    let rest = origin
        .strip_prefix("https://")
        .or_else(|| origin.strip_prefix("http://"))
        .unwrap_or(origin);
    if let Some(stripped) = rest.strip_prefix('[') {
        // Bracketed IPv6: keep brackets, drop port.
        if let Some(end) = stripped.find(']') {
            return format!("[{}]", &stripped[..end]);
        }
    }
    rest.split(':').next().unwrap_or(rest).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_origin_is_same_origin() {
        assert!(origin_allowed(None, &[], false));
    }

    #[test]
    fn localhost_bind_accepts_localhost_origins() {
        assert!(origin_allowed(Some("http://localhost:3000"), &[], true));
        assert!(origin_allowed(Some("http://127.0.0.1:5173"), &[], true));
        assert!(!origin_allowed(Some("http://evil.example"), &[], true));
    }

    #[test]
    fn exact_match() {
        let allowed = vec!["https://app.example.com".to_string()];
        assert!(origin_allowed(
            Some("https://app.example.com"),
            &allowed,
            false
        ));
        assert!(!origin_allowed(
            Some("https://other.example.com"),
            &allowed,
            false
        ));
    }

    #[test]
    fn single_level_wildcard() {
        let allowed = vec!["*.example.com".to_string()];
        assert!(origin_allowed(
            Some("https://app.example.com"),
            &allowed,
            false
        ));
        assert!(!origin_allowed(
            Some("https://a.b.example.com"),
            &allowed,
            false
        ));
        assert!(!origin_allowed(Some("https://example.com"), &allowed, false));
        assert!(!origin_allowed(
            Some("https://notexample.com"),
            &allowed,
            false
        ));
    }

    #[test]
    fn bracketed_ipv6_localhost() {
        assert!(origin_allowed(Some("http://[::1]:8787"), &[], true));
    }
}
