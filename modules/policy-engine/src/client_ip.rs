//! Client address resolution from proxy/forwarded headers.
//!
//! Headers are consulted in a fixed priority order; the first valid address
//! wins. When several headers carry different valid addresses the mismatch is
//! logged but the first one stands.

use std::collections::HashMap;
use std::net::IpAddr;

/// Forwarded headers in priority order. Keys are expected lowercased.
const FORWARD_HEADERS: [&str; 9] = [
    "x-client-ip",
    "x-forwarded-for",
    "cf-connecting-ip",
    "fastly-client-ip",
    "true-client-ip",
    "x-real-ip",
    "x-cluster-client-ip",
    "x-forwarded",
    "forwarded-for",
];

/// Resolve the caller's address from forwarded headers, falling back to the
/// socket peer address.
///
/// Comma-separated lists (`x-forwarded-for`) contribute their first valid
/// entry.
#[must_use]
pub fn resolve_client_ip(
    headers: &HashMap<String, String>,
    peer: Option<IpAddr>,
) -> Option<IpAddr> {
    let mut chosen: Option<IpAddr> = None;
    for name in FORWARD_HEADERS {
        let Some(raw) = headers.get(name) else { continue };
        for part in raw.split(',') {
            let Ok(ip) = part.trim().parse::<IpAddr>() else {
                continue;
            };
            match chosen {
                None => chosen = Some(ip),
                Some(first) if first != ip => {
                    tracing::warn!(
                        header = name,
                        %first,
                        conflicting = %ip,
                        "forwarded headers disagree on client address"
                    );
                }
                Some(_) => {}
            }
            break;
        }
    }
    chosen.or(peer)
}
