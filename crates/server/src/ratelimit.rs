//! Per-key sliding-window rate limiting and client-IP resolution.
//!
//! The limiter keeps a ring of request timestamps per key. On arrival,
//! timestamps older than the window are discarded and the request is
//! accepted iff the ring is below the configured maximum. Keys idle for
//! longer than twice the window are dropped by a background sweep.
//!
//! The key is the client IP. Forwarded headers (`X-Forwarded-For`,
//! `X-Real-IP`) are honored only when the direct peer falls inside an
//! operator-configured trusted-CIDR set.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: usize,
    pub remaining: usize,
}

pub struct RateLimiter {
    window: Duration,
    max_requests: usize,
    entries: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(window: Duration, max_requests: usize) -> Self {
        Self {
            window,
            max_requests: max_requests.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, key: &str) -> RateDecision {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> RateDecision {
        let mut entries = self.entries.lock().expect("rate limiter poisoned");
        let ring = entries.entry(key.to_string()).or_default();
        Self::prune(ring, now, self.window);

        if ring.len() >= self.max_requests {
            return RateDecision {
                allowed: false,
                limit: self.max_requests,
                remaining: 0,
            };
        }
        ring.push_back(now);
        RateDecision {
            allowed: true,
            limit: self.max_requests,
            remaining: self.max_requests - ring.len(),
        }
    }

    /// Requests the key could still make right now, without recording one.
    pub fn remaining(&self, key: &str) -> usize {
        self.remaining_at(key, Instant::now())
    }

    fn remaining_at(&self, key: &str, now: Instant) -> usize {
        let mut entries = self.entries.lock().expect("rate limiter poisoned");
        match entries.get_mut(key) {
            Some(ring) => {
                Self::prune(ring, now, self.window);
                self.max_requests.saturating_sub(ring.len())
            }
            None => self.max_requests,
        }
    }

    /// Remove keys idle longer than 2x the window.
    pub fn sweep(&self) {
        let now = Instant::now();
        let idle_cutoff = self.window * 2;
        let mut entries = self.entries.lock().expect("rate limiter poisoned");
        let before = entries.len();
        entries.retain(|_, ring| {
            ring.back()
                .map(|last| now.duration_since(*last) < idle_cutoff)
                .unwrap_or(false)
        });
        let swept = before - entries.len();
        if swept > 0 {
            debug!(
                component = "ratelimit",
                event = "ratelimit.swept",
                swept = swept,
                remaining = entries.len(),
                "Swept idle rate-limit keys"
            );
        }
    }

    fn prune(ring: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(front) = ring.front() {
            if now.duration_since(*front) >= window {
                ring.pop_front();
            } else {
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Proxy trust / client IP
// ---------------------------------------------------------------------------

/// An operator-configured set of CIDR blocks whose forwarded headers are
/// trusted.
#[derive(Debug, Clone, Default)]
pub struct ProxyTrust {
    cidrs: Vec<Cidr>,
}

#[derive(Debug, Clone, Copy)]
struct Cidr {
    base: u128,
    prefix: u8,
}

impl ProxyTrust {
    /// Parse entries like `10.0.0.0/8`, `::1/128` or a bare IP.
    /// Malformed entries are skipped with a debug log.
    pub fn parse(entries: &[String]) -> Self {
        let mut cidrs = Vec::new();
        for entry in entries {
            match parse_cidr(entry) {
                Some(cidr) => cidrs.push(cidr),
                None => debug!(
                    component = "ratelimit",
                    event = "ratelimit.bad_cidr",
                    entry = %entry,
                    "Ignoring malformed trusted-proxy entry"
                ),
            }
        }
        Self { cidrs }
    }

    pub fn is_trusted(&self, ip: IpAddr) -> bool {
        let value = ip_to_u128(ip);
        self.cidrs.iter().any(|cidr| {
            let shift = 128 - cidr.prefix as u32;
            if shift >= 128 {
                return true;
            }
            (value >> shift) == (cidr.base >> shift)
        })
    }

    /// Resolve the effective client IP for `peer`, honoring forwarded
    /// headers only when the peer is trusted.
    pub fn client_ip(&self, peer: IpAddr, headers: &HeaderMap) -> IpAddr {
        if !self.is_trusted(peer) {
            return peer;
        }

        if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            if let Some(first) = forwarded.split(',').next() {
                if let Some(ip) = parse_ip_lenient(first.trim()) {
                    return ip;
                }
            }
        }
        if let Some(real) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
            if let Some(ip) = parse_ip_lenient(real.trim()) {
                return ip;
            }
        }
        peer
    }
}

fn parse_cidr(entry: &str) -> Option<Cidr> {
    let (ip_part, prefix) = match entry.split_once('/') {
        Some((ip, prefix)) => {
            let prefix: u8 = prefix.parse().ok()?;
            (ip, Some(prefix))
        }
        None => (entry, None),
    };
    let ip: IpAddr = ip_part.trim().parse().ok()?;
    let max = 128u8;
    let prefix = match (ip, prefix) {
        (IpAddr::V4(_), Some(p)) if p <= 32 => p + 96,
        (IpAddr::V4(_), None) => 128,
        (IpAddr::V6(_), Some(p)) if p <= 128 => p,
        (IpAddr::V6(_), None) => 128,
        _ => return None,
    };
    if prefix > max {
        return None;
    }
    Some(Cidr {
        base: ip_to_u128(ip),
        prefix,
    })
}

fn ip_to_u128(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u128::from(v4.to_ipv6_mapped()),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

/// Parse an IP that may carry a port or IPv6 brackets:
/// `1.2.3.4`, `1.2.3.4:5678`, `[::1]`, `[::1]:5678`, `::1`.
fn parse_ip_lenient(raw: &str) -> Option<IpAddr> {
    if raw.is_empty() {
        return None;
    }
    if let Ok(ip) = raw.parse::<IpAddr>() {
        return Some(ip);
    }
    if let Some(stripped) = raw.strip_prefix('[') {
        let end = stripped.find(']')?;
        return stripped[..end].parse().ok();
    }
    // v4:port
    if let Some((host, _port)) = raw.rsplit_once(':') {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Some(ip);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_enforced_within_window() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 3);
        let now = Instant::now();
        assert!(limiter.check_at("k", now).allowed);
        assert!(limiter.check_at("k", now).allowed);
        let third = limiter.check_at("k", now);
        assert!(third.allowed);
        assert_eq!(third.remaining, 0);
        assert!(!limiter.check_at("k", now).allowed);
    }

    #[test]
    fn converges_after_window_of_inactivity() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 5);
        let start = Instant::now();
        for _ in 0..5 {
            assert!(limiter.check_at("k", start).allowed);
        }
        assert_eq!(limiter.remaining_at("k", start), 0);

        let later = start + Duration::from_secs(60);
        assert_eq!(limiter.remaining_at("k", later), 5);
        assert!(limiter.check_at("k", later).allowed);
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 1);
        let now = Instant::now();
        assert!(limiter.check_at("a", now).allowed);
        assert!(!limiter.check_at("a", now).allowed);
        assert!(limiter.check_at("b", now).allowed);
    }

    #[test]
    fn trusted_peer_honors_forwarded_for() {
        let trust = ProxyTrust::parse(&["127.0.0.0/8".to_string()]);
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.9, 10.0.0.1".parse().unwrap());

        let ip = trust.client_ip("127.0.0.1".parse().unwrap(), &headers);
        assert_eq!(ip, "203.0.113.9".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn untrusted_peer_ignores_forwarded_for() {
        let trust = ProxyTrust::parse(&["10.0.0.0/8".to_string()]);
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.9".parse().unwrap());

        let peer: IpAddr = "192.0.2.7".parse().unwrap();
        assert_eq!(trust.client_ip(peer, &headers), peer);
    }

    #[test]
    fn bracketed_ipv6_forwarded_value() {
        let trust = ProxyTrust::parse(&["127.0.0.1".to_string()]);
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "[2001:db8::1]:443".parse().unwrap());

        let ip = trust.client_ip("127.0.0.1".parse().unwrap(), &headers);
        assert_eq!(ip, "2001:db8::1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn x_real_ip_fallback() {
        let trust = ProxyTrust::parse(&["127.0.0.1".to_string()]);
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "198.51.100.4".parse().unwrap());

        let ip = trust.client_ip("127.0.0.1".parse().unwrap(), &headers);
        assert_eq!(ip, "198.51.100.4".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn cidr_matching_v4_and_v6() {
        let trust = ProxyTrust::parse(&["10.1.0.0/16".to_string(), "fd00::/8".to_string()]);
        assert!(trust.is_trusted("10.1.200.3".parse().unwrap()));
        assert!(!trust.is_trusted("10.2.0.1".parse().unwrap()));
        assert!(trust.is_trusted("fd12::1".parse().unwrap()));
        assert!(!trust.is_trusted("fe80::1".parse().unwrap()));
    }

    #[test]
    fn malformed_cidrs_are_skipped() {
        let trust = ProxyTrust::parse(&["not-an-ip".to_string(), "10.0.0.0/33".to_string()]);
        assert!(!trust.is_trusted("10.0.0.1".parse().unwrap()));
    }
}
