use axum::http::{HeaderMap, HeaderName, HeaderValue};
use sha2::{Digest, Sha256};
use std::net::IpAddr;

/// Resolve the client IP for a request.
///
/// Preference order: first entry of X-Forwarded-For, then X-Real-Ip, then the
/// socket peer. The header-supplied values are consulted only when the
/// gateway is configured as running behind a trusted proxy.
pub fn extract_client_ip(
    headers: &HeaderMap,
    peer: Option<IpAddr>,
    trust_proxy_headers: bool,
) -> String {
    if trust_proxy_headers {
        if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            if let Some(first) = forwarded.split(',').next() {
                let candidate = normalize_ip(first.trim());
                if !candidate.is_empty() {
                    return candidate;
                }
            }
        }
        if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
            let candidate = normalize_ip(real_ip.trim());
            if !candidate.is_empty() {
                return candidate;
            }
        }
    }

    peer.map(|ip| ip.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Strip IPv6 brackets so header-sourced and socket-sourced forms compare equal.
pub fn normalize_ip(ip: &str) -> String {
    ip.trim_start_matches('[').trim_end_matches(']').to_string()
}

pub fn is_loopback(ip: &str) -> bool {
    ip.parse::<IpAddr>().map(|a| a.is_loopback()).unwrap_or(false)
}

/// Creates a truncated, salted hash of an identifier for safe logging.
pub fn log_safe_id(id: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(id.as_bytes());
    let hash = hasher.finalize();

    hash[..4].iter().map(|b| format!("{:02x}", b)).collect()
}

/// Headers that must not travel between the client and the upstream.
const HOP_BY_HOP: &[&str] = &[
    "transfer-encoding",
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "upgrade",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    HOP_BY_HOP.contains(&lower.as_str()) || lower.starts_with("proxy-")
}

/// Security headers attached to every gateway response.
pub fn add_security_headers(headers: &mut HeaderMap) {
    headers.insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        HeaderName::from_static("x-frame-options"),
        HeaderValue::from_static("DENY"),
    );
    headers.insert(
        HeaderName::from_static("referrer-policy"),
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
}

/// Validates password complexity for signup.
///
/// Minimum 10 characters with upper, lower, and digit classes; capped at 128
/// to bound the bcrypt input.
pub fn validate_password_strength(password: &str) -> Result<(), String> {
    if password.len() < 10 {
        return Err("Password must be at least 10 characters long".to_string());
    }
    if !password.chars().any(|c| c.is_uppercase()) {
        return Err("Password must contain at least one uppercase letter".to_string());
    }
    if !password.chars().any(|c| c.is_lowercase()) {
        return Err("Password must contain at least one lowercase letter".to_string());
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        return Err("Password must contain at least one digit".to_string());
    }
    if password.len() > 128 {
        return Err("Password must not exceed 128 characters".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn headers_with(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (k, v) in pairs {
            headers.insert(
                HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        headers
    }

    #[test]
    fn forwarded_for_first_entry_wins() {
        let headers = headers_with(&[("x-forwarded-for", "203.0.113.7, 10.0.0.1, 10.0.0.2")]);
        assert_eq!(extract_client_ip(&headers, None, true), "203.0.113.7");
    }

    #[test]
    fn real_ip_when_no_forwarded_chain() {
        let headers = headers_with(&[("x-real-ip", "198.51.100.9")]);
        assert_eq!(extract_client_ip(&headers, None, true), "198.51.100.9");
    }

    #[test]
    fn headers_ignored_when_proxy_untrusted() {
        let headers = headers_with(&[("x-forwarded-for", "203.0.113.7")]);
        let peer = Some(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 4)));
        assert_eq!(extract_client_ip(&headers, peer, false), "192.0.2.4");
    }

    #[test]
    fn falls_back_to_peer_then_unknown() {
        let headers = HeaderMap::new();
        let peer = Some(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 4)));
        assert_eq!(extract_client_ip(&headers, peer, true), "192.0.2.4");
        assert_eq!(extract_client_ip(&headers, None, true), "unknown");
    }

    #[test]
    fn ipv6_brackets_normalized() {
        assert_eq!(normalize_ip("[::1]"), "::1");
        assert!(is_loopback("::1"));
        assert!(is_loopback("127.0.0.1"));
        assert!(!is_loopback("203.0.113.7"));
    }

    #[test]
    fn hop_by_hop_headers_detected() {
        assert!(is_hop_by_hop("Transfer-Encoding"));
        assert!(is_hop_by_hop("connection"));
        assert!(is_hop_by_hop("Proxy-Connection"));
        assert!(is_hop_by_hop("Upgrade"));
        assert!(!is_hop_by_hop("content-type"));
        assert!(!is_hop_by_hop("x-request-id"));
    }

    #[test]
    fn log_safe_id_is_short_and_salted() {
        let a = log_safe_id("user-1", "salt-a");
        let b = log_safe_id("user-1", "salt-b");
        assert_eq!(a.len(), 8);
        assert_ne!(a, b);
    }

    #[test]
    fn password_strength_rules() {
        assert!(validate_password_strength("Short1").is_err());
        assert!(validate_password_strength("lowercase123").is_err());
        assert!(validate_password_strength("UPPERCASE123").is_err());
        assert!(validate_password_strength("NoDigitsHere").is_err());
        assert!(validate_password_strength("ValidPass123").is_ok());
    }
}
