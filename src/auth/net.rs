//! Source-address normalization and allow-list matching
//!
//! Addresses arrive in many textual shapes (bracketed IPv6, zone ids,
//! trailing ports, IPv4-mapped IPv6). Everything is normalized to a
//! binary `IpAddr` before comparison so allow-lists match reliably.

use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;

/// Normalize one textual address to a binary `IpAddr`.
///
/// Handles `[2001:db8::1]:8080`, `10.0.0.1:52114`, `fe80::1%eth0` and
/// IPv4-mapped IPv6 (`::ffff:10.0.0.1` becomes `10.0.0.1`).
pub fn normalize_ip(raw: &str) -> Option<IpAddr> {
    let mut s = raw.trim();

    // Bracketed IPv6, optionally with a port.
    if let Some(rest) = s.strip_prefix('[') {
        s = rest.split(']').next()?;
    } else if s.matches(':').count() == 1 {
        // Exactly one colon on a non-bracketed address: IPv4 with port.
        s = s.split(':').next()?;
    }

    // Zone identifier (fe80::1%eth0).
    if let Some((addr, _zone)) = s.split_once('%') {
        s = addr;
    }

    let ip = IpAddr::from_str(s).ok()?;
    Some(unmap(ip))
}

fn unmap(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

/// Resolve the effective client address. With a trusted proxy in front,
/// the left-most `X-Forwarded-For` entry or the RFC 7239 `Forwarded:
/// for=` value wins; otherwise the socket peer.
pub fn client_ip(
    peer: &str,
    trusted_proxy: bool,
    x_forwarded_for: Option<&str>,
    forwarded: Option<&str>,
) -> Option<IpAddr> {
    if trusted_proxy {
        if let Some(xff) = x_forwarded_for {
            if let Some(first) = xff.split(',').next() {
                if let Some(ip) = normalize_ip(first) {
                    return Some(ip);
                }
            }
        }
        if let Some(fwd) = forwarded {
            if let Some(ip) = parse_forwarded_for(fwd) {
                return Some(ip);
            }
        }
    }
    normalize_ip(peer)
}

/// Extract the first `for=` element from an RFC 7239 `Forwarded` header.
fn parse_forwarded_for(header: &str) -> Option<IpAddr> {
    for element in header.split(';').flat_map(|p| p.split(',')) {
        let element = element.trim();
        if let Some(value) = element
            .strip_prefix("for=")
            .or_else(|| element.strip_prefix("For=").or_else(|| element.strip_prefix("FOR=")))
        {
            let value = value.trim_matches('"');
            return normalize_ip(value);
        }
    }
    None
}

/// Whether `ip` satisfies an allow-list. Empty lists mean unrestricted;
/// otherwise the address must match a listed IP verbatim (after
/// normalization) or fall inside a listed CIDR block.
pub fn ip_allowed(ip: IpAddr, allowed_ips: &[String], allowed_cidrs: &[String]) -> bool {
    if allowed_ips.is_empty() && allowed_cidrs.is_empty() {
        return true;
    }
    if allowed_ips
        .iter()
        .filter_map(|raw| normalize_ip(raw))
        .any(|allowed| allowed == ip)
    {
        return true;
    }
    allowed_cidrs
        .iter()
        .filter_map(|raw| IpNet::from_str(raw.trim()).ok())
        .any(|net| net.contains(&unmap(ip)))
}
