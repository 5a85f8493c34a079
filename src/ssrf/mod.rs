//! SSRF risk check: resolve the request host and refuse anything that
//! lands in a private, loopback, link-local, unspecified, or otherwise
//! reserved range. Grounded on `app/services/unprotector.py::is_ssrf_risk`,
//! fail-closed on resolution error (a host that can't be resolved is
//! treated as risky, not as "probably fine").

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::net::lookup_host;

use crate::error::{PipelineError, Result};

/// Schemes the pipeline will fetch. Anything else is rejected before SSRF
/// resolution even runs.
pub const ALLOWED_SCHEMES: &[&str] = &["http", "https"];

#[must_use]
fn is_reserved(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_reserved_v4(v4),
        IpAddr::V6(v6) => is_reserved_v6(v6),
    }
}

fn is_reserved_v4(ip: Ipv4Addr) -> bool {
    ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_documentation()
        || ip.octets()[0] == 0
        // 100.64.0.0/10 carrier-grade NAT
        || (ip.octets()[0] == 100 && (64..=127).contains(&ip.octets()[1]))
        // 169.254.0.0/16 is covered by is_link_local already
        // 192.0.0.0/24 IETF protocol assignments
        || (ip.octets()[0] == 192 && ip.octets()[1] == 0 && ip.octets()[2] == 0)
}

fn is_reserved_v6(ip: Ipv6Addr) -> bool {
    if ip.is_loopback() || ip.is_unspecified() {
        return true;
    }
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_reserved_v4(v4);
    }
    let segments = ip.segments();
    // fc00::/7 unique local, fe80::/10 link-local
    (segments[0] & 0xfe00) == 0xfc00 || (segments[0] & 0xffc0) == 0xfe80
}

/// Returns `Ok(true)` if `host` resolves to (any of) a reserved address
/// range, `Ok(false)` if every resolved address is public, and `Err` only
/// for a malformed host string; a resolution failure is reported as
/// `Ok(true)` (risky), matching the source's fail-closed stance.
pub async fn is_ssrf_risk(host: &str, port: u16) -> bool {
    let lookup_target = format!("{host}:{port}");
    match lookup_host(&lookup_target).await {
        Ok(addrs) => {
            let addrs: Vec<SocketAddr> = addrs.collect();
            if addrs.is_empty() {
                tracing::debug!(host, "dns lookup returned no addresses, treating as risky");
                return true;
            }
            let risky = addrs.iter().any(|addr| is_reserved(addr.ip()));
            if risky {
                tracing::warn!(host, "host resolves to a private/reserved address, refusing to fetch");
            }
            risky
        }
        Err(error) => {
            tracing::debug!(host, %error, "dns lookup failed, treating as risky");
            true
        }
    }
}

/// Validates `url`'s scheme and (async) SSRF risk in one call, returning a
/// `PipelineError::Config` describing the first failure reason. Callers in
/// the orchestrator map this straight to the "invalid URL" / "SSRF refused"
/// placeholders rather than bubbling it further.
pub async fn check_url_is_fetchable(url: &url::Url) -> Result<()> {
    if !ALLOWED_SCHEMES.contains(&url.scheme()) {
        return Err(PipelineError::Config(format!(
            "unsupported scheme: {}",
            url.scheme()
        )));
    }
    let Some(host) = url.host_str() else {
        return Err(PipelineError::Config("URL has no host".to_string()));
    };
    let port = url.port_or_known_default().unwrap_or(443);
    if is_ssrf_risk(host, port).await {
        return Err(PipelineError::Config(format!(
            "refusing to fetch {host}: resolves to a private/reserved address"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_v4_is_reserved() {
        assert!(is_reserved(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))));
    }

    #[test]
    fn private_v4_ranges_are_reserved() {
        assert!(is_reserved(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
        assert!(is_reserved(IpAddr::V4(Ipv4Addr::new(172, 16, 0, 1))));
        assert!(is_reserved(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1))));
    }

    #[test]
    fn public_v4_is_not_reserved() {
        assert!(!is_reserved(IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34))));
    }

    #[test]
    fn link_local_v6_is_reserved() {
        assert!(is_reserved(IpAddr::V6("fe80::1".parse().unwrap())));
    }

    #[tokio::test]
    async fn unresolvable_host_is_treated_as_risky() {
        assert!(is_ssrf_risk("this-host-does-not-exist.invalid", 443).await);
    }
}
