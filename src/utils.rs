use std::net::{IpAddr, Ipv4Addr};

use hickory_resolver::TokioAsyncResolver;
use log::debug;
use pnet::datalink;
use rand::{thread_rng, Rng};

/// Find the IPv4 address to source raw packets from: the first interface
/// that is up, not loopback, and carries a non-loopback IPv4 address.
pub fn find_source_ipv4() -> Option<Ipv4Addr> {
    for interface in datalink::interfaces() {
        if !interface.is_up() || interface.is_loopback() {
            continue;
        }
        let ipv4 = interface.ips.iter().find_map(|network| match network.ip() {
            IpAddr::V4(addr) if !addr.is_loopback() => Some(addr),
            _ => None,
        });
        if let Some(addr) = ipv4 {
            debug!("selected source interface {} ({})", interface.name, addr);
            return Some(addr);
        }
    }
    None
}

/// Random ephemeral source port in the 1024-65535 range
pub fn random_source_port() -> u16 {
    thread_rng().gen_range(1024..=65535)
}

/// Resolve a host to its first IPv4 address.
///
/// Literal addresses short-circuit the resolver; hosts that only resolve to
/// IPv6 yield `None`.
pub async fn resolve_ipv4(host: &str) -> Option<Ipv4Addr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return match ip {
            IpAddr::V4(addr) => Some(addr),
            IpAddr::V6(_) => None,
        };
    }

    let resolver = TokioAsyncResolver::tokio_from_system_conf().ok()?;
    let response = resolver.ipv4_lookup(host).await.ok()?;
    response.iter().next().map(|record| record.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_ports_stay_ephemeral() {
        for _ in 0..200 {
            let port = random_source_port();
            assert!(port >= 1024);
        }
    }

    #[tokio::test]
    async fn literal_addresses_bypass_the_resolver() {
        assert_eq!(
            resolve_ipv4("192.0.2.7").await,
            Some(Ipv4Addr::new(192, 0, 2, 7))
        );
        assert_eq!(resolve_ipv4("::1").await, None);
    }
}
