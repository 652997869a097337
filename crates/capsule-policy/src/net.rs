//! Domain matching, blocked address ranges, and DNS resolution.
//!
//! Resolution happens during policy evaluation, not in the tool: the
//! engine resolves the host once, vets every address, and pins the result
//! into the decision. The tool connects to those exact addresses so a DNS
//! answer that changes between evaluation and connect cannot redirect the
//! request (DNS rebinding).

use std::io;
use std::net::{IpAddr, Ipv6Addr, ToSocketAddrs};

/// Host-to-address resolution, injectable for tests.
pub trait Resolver: Send + Sync {
    fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<IpAddr>>;
}

/// The production resolver: the platform's `getaddrinfo` via
/// `ToSocketAddrs`. Literal IPs short-circuit without a lookup.
#[derive(Debug, Default)]
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<IpAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        let mut addrs: Vec<IpAddr> =
            (host, port).to_socket_addrs()?.map(|a| a.ip()).collect();
        addrs.dedup();
        Ok(addrs)
    }
}

/// Whether `domain` matches an allow pattern.
///
/// `*` matches any host; `*.example.com` matches any subdomain and the
/// bare apex; anything else is an exact, case-insensitive comparison.
pub fn domain_matches(domain: &str, pattern: &str) -> bool {
    let domain = domain.to_ascii_lowercase();
    let pattern = pattern.to_ascii_lowercase();

    if pattern == "*" {
        return true;
    }
    if let Some(suffix) = pattern.strip_prefix("*.") {
        return domain == suffix || domain.ends_with(&format!(".{}", suffix));
    }
    domain == pattern
}

/// Whether `ip` falls in a range Capsule refuses to reach when
/// `deny_private_ips` is set.
///
/// Ranges: 10.0.0.0/8, 172.16.0.0/12, 192.168.0.0/16, 127.0.0.0/8,
/// 169.254.0.0/16 (cloud metadata lives here), 0.0.0.0/8, ::1/128,
/// fc00::/7, fe80::/10. IPv4-mapped IPv6 addresses are unwrapped first.
pub fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, _, _] = v4.octets();
            a == 10
                || (a == 172 && (16..=31).contains(&b))
                || (a == 192 && b == 168)
                || a == 127
                || (a == 169 && b == 254)
                || a == 0
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = to_mapped_v4(&v6) {
                return is_blocked_ip(IpAddr::V4(mapped));
            }
            let octets = v6.octets();
            v6 == Ipv6Addr::LOCALHOST
                || (octets[0] & 0xfe) == 0xfc
                || (octets[0] == 0xfe && (octets[1] & 0xc0) == 0x80)
        }
    }
}

fn to_mapped_v4(v6: &Ipv6Addr) -> Option<std::net::Ipv4Addr> {
    let segments = v6.segments();
    if segments[..5] == [0, 0, 0, 0, 0] && segments[5] == 0xffff {
        let [a, b] = segments[6].to_be_bytes();
        let [c, d] = segments[7].to_be_bytes();
        Some(std::net::Ipv4Addr::new(a, b, c, d))
    } else {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
