use anyhow::{Result, anyhow};
use ipnet::IpNet;
use std::net::IpAddr;

/// Parses the original client IP from X-Forwarded-For header
/// Format: "client, proxy1, proxy2, ..." - returns the leftmost (original client) IP
#[must_use]
pub fn parse_original_client_ip(xff_header: &str) -> Option<String> {
    xff_header
        .split(',')
        .next()
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
}

enum ProxyEntry {
    Addr(IpAddr),
    Net(IpNet),
}

fn parse_entry(entry: &str) -> Result<ProxyEntry> {
    if let Ok(addr) = entry.parse::<IpAddr>() {
        return Ok(ProxyEntry::Addr(addr));
    }
    entry.parse::<IpNet>().map(ProxyEntry::Net).map_err(|_| {
        anyhow!("Invalid IP address or CIDR in allowed_proxy_ips: {entry}")
    })
}

/// Fails on the first entry that is neither an IP address nor a CIDR subnet.
pub fn validate_trusted_proxies(allowed: &[String]) -> Result<()> {
    allowed.iter().try_for_each(|entry| parse_entry(entry).map(drop))
}

/// Whether `X-Forwarded-For` from this peer may be believed.
///
/// No allowlist means every peer is trusted. The answer only affects which
/// address is logged; connections are never refused on this basis.
pub fn is_trusted_proxy(peer: IpAddr, allowed: Option<&[String]>) -> Result<bool> {
    let Some(allowed) = allowed else {
        return Ok(true);
    };

    for entry in allowed {
        let matched = match parse_entry(entry)? {
            ProxyEntry::Addr(addr) => addr == peer,
            ProxyEntry::Net(net) => net.contains(&peer),
        };
        if matched {
            return Ok(true);
        }
    }
    Ok(false)
}
