use http::{HeaderMap, HeaderValue};
use std::net::IpAddr;

/// Strip a trailing `:port` and unwrap IPv6 bracket notation, e.g.
/// `[::1]:443` -> `::1`, `1.2.3.4:8080` -> `1.2.3.4`.
fn strip_port(addr: &str) -> &str {
    let addr = addr.trim();
    if let Some(rest) = addr.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return &rest[..end];
        }
        return addr;
    }
    match addr.rsplit_once(':') {
        // Only strip when there's exactly one colon — a bare IPv6 literal
        // without brackets has many and must be returned whole.
        Some((host, port)) if !host.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => {
            host
        }
        _ => addr,
    }
}

/// Precedence: `CF-Connecting-IP` > first entry of existing `X-Forwarded-For`
/// > the raw connection peer.
pub fn resolve_real_ip(headers: &HeaderMap, peer_ip: IpAddr) -> String {
    if let Some(v) = headers.get("CF-Connecting-IP").and_then(|v| v.to_str().ok()) {
        let ip = strip_port(v);
        if !ip.is_empty() {
            return ip.to_string();
        }
    }
    if let Some(v) = headers.get(http::header::FORWARDED.as_str())
        .or_else(|| headers.get("X-Forwarded-For"))
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = v.split(',').next() {
            let ip = strip_port(first.trim());
            if !ip.is_empty() {
                return ip.to_string();
            }
        }
    }
    strip_port(&peer_ip.to_string()).to_string()
}

/// Mutates `headers` in place to inject the forwarding chain per §4.A:
/// appends the peer to any existing `X-Forwarded-For`, sets
/// `X-Forwarded-Host` from `original_host`, forces `X-Forwarded-Proto` to
/// `https` (the TLS front door is the only inbound path), and overwrites
/// `X-Real-IP` using `resolve_real_ip`'s precedence.
pub fn inject_forwarded_headers(headers: &mut HeaderMap, peer_ip: IpAddr, original_host: &str) {
    let real_ip = resolve_real_ip(headers, peer_ip);

    let xff = match headers.get("X-Forwarded-For").and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.is_empty() => format!("{existing}, {peer_ip}"),
        _ => peer_ip.to_string(),
    };
    if let Ok(v) = HeaderValue::from_str(&xff) {
        headers.insert("X-Forwarded-For", v);
    }

    if let Ok(v) = HeaderValue::from_str(original_host) {
        headers.insert("X-Forwarded-Host", v);
    }

    headers.insert("X-Forwarded-Proto", HeaderValue::from_static("https"));

    if let Ok(v) = HeaderValue::from_str(&real_ip) {
        headers.insert("X-Real-IP", v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderMap;
    use std::net::Ipv4Addr;

    fn peer() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9))
    }

    #[test]
    fn real_ip_prefers_cf_connecting_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("CF-Connecting-IP", HeaderValue::from_static("1.2.3.4"));
        headers.insert("X-Forwarded-For", HeaderValue::from_static("5.6.7.8"));
        assert_eq!(resolve_real_ip(&headers, peer()), "1.2.3.4");
    }

    #[test]
    fn real_ip_falls_back_to_first_xff_entry() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Forwarded-For", HeaderValue::from_static("5.6.7.8, 9.9.9.9"));
        assert_eq!(resolve_real_ip(&headers, peer()), "5.6.7.8");
    }

    #[test]
    fn real_ip_falls_back_to_peer() {
        let headers = HeaderMap::new();
        assert_eq!(resolve_real_ip(&headers, peer()), "203.0.113.9");
    }

    #[test]
    fn strip_port_handles_ipv4_and_ipv6() {
        assert_eq!(strip_port("1.2.3.4:8080"), "1.2.3.4");
        assert_eq!(strip_port("[::1]:443"), "::1");
        assert_eq!(strip_port("::1"), "::1");
    }

    #[test]
    fn inject_appends_to_existing_xff_chain() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Forwarded-For", HeaderValue::from_static("1.1.1.1"));
        inject_forwarded_headers(&mut headers, peer(), "example.com");
        assert_eq!(
            headers.get("X-Forwarded-For").unwrap().to_str().unwrap(),
            "1.1.1.1, 203.0.113.9"
        );
        assert_eq!(headers.get("X-Forwarded-Host").unwrap(), "example.com");
        assert_eq!(headers.get("X-Forwarded-Proto").unwrap(), "https");
    }

    #[test]
    fn inject_sets_xff_when_absent() {
        let mut headers = HeaderMap::new();
        inject_forwarded_headers(&mut headers, peer(), "example.com");
        assert_eq!(headers.get("X-Forwarded-For").unwrap(), "203.0.113.9");
    }
}
