// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Client address normalization and classification.

use std::net::IpAddr;

/// Strip a port and IPv6 brackets from a reported client address.
///
/// `[2001:db8::1]:8080` and `[2001:db8::1]` become `2001:db8::1`,
/// `203.0.113.5:32400` becomes `203.0.113.5`; bare IPv6 is left intact.
#[must_use]
pub fn normalize(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix('[') {
        if let Some((host, _)) = rest.split_once(']') {
            return host.to_string();
        }
    }
    if trimmed.matches(':').count() == 1 {
        if let Some((host, _)) = trimmed.split_once(':') {
            return host.to_string();
        }
    }
    trimmed.to_string()
}

/// Normalize and parse an address; `None` for missing or unusable values.
#[must_use]
pub fn parse(raw: &str) -> Option<IpAddr> {
    let normalized = normalize(raw);
    if normalized.is_empty() || normalized.eq_ignore_ascii_case("n/a") {
        return None;
    }
    normalized.parse::<IpAddr>().ok().filter(|ip| !ip.is_unspecified())
}

/// Private, loopback or link-local: never sent to an external provider.
#[must_use]
pub fn is_local(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_local(&IpAddr::V4(v4));
            }
            let first = v6.segments()[0];
            v6.is_loopback()
                // fc00::/7 unique local
                || (first & 0xfe00) == 0xfc00
                // fe80::/10 link local
                || (first & 0xffc0) == 0xfe80
        }
    }
}
