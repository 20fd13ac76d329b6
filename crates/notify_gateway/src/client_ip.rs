//! Client address resolution behind reverse proxies.

use axum::http::HeaderMap;
use std::net::IpAddr;
use tracing::debug;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";

/// Resolve the address a request originated from.
///
/// Takes the first public address listed in `X-Forwarded-For`, then
/// `X-Real-Ip`, then the socket peer address.
pub fn resolve(headers: &HeaderMap, peer: IpAddr) -> IpAddr {
    if let Some(forwarded) = headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        let public = forwarded
            .split(',')
            .filter_map(|entry| entry.trim().parse::<IpAddr>().ok())
            .find(|ip| !is_private(*ip));
        if let Some(ip) = public {
            debug!(forwarded, extracted_ip = %ip, "Client address from X-Forwarded-For");
            return ip;
        }
    }

    if let Some(ip) = headers
        .get(X_REAL_IP)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<IpAddr>().ok())
    {
        return ip;
    }

    peer
}

/// Loopback, link-local and private-range addresses.
fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => ipv4.is_loopback() || ipv4.is_private() || ipv4.is_link_local(),
        IpAddr::V6(ipv6) => {
            // fc00::/7 unique local
            let octets = ipv6.octets();
            ipv6.is_loopback() || (octets[0] & 0xfe) == 0xfc
        }
    }
}
