//! Sequential address allocation inside a VPN CIDR

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::IpNet;

use crate::{Result, VpnError};

/// Parse a VPN CIDR, normalising it to its network address
/// (`10.0.0.5/16` becomes `10.0.0.0/16`).
pub fn parse_cidr(cidr: &str) -> Result<IpNet> {
    cidr.trim()
        .parse::<IpNet>()
        .map(|net| net.trunc())
        .map_err(|e| VpnError::InvalidCidr {
            cidr: cidr.to_string(),
            reason: e.to_string(),
        })
}

/// Address handed out by the `index`-th allocation in `cidr`: the network
/// address plus `index + 1`.
///
/// Fails with [`VpnError::AddressExhausted`] once the result falls outside
/// the CIDR.
pub fn request_vpn_ip(cidr: &IpNet, index: u64) -> Result<IpAddr> {
    let offset = u128::from(index) + 1;

    let candidate = match cidr.network() {
        IpAddr::V4(network) => u128::from(u32::from(network))
            .checked_add(offset)
            .and_then(|n| u32::try_from(n).ok())
            .map(|n| IpAddr::V4(Ipv4Addr::from(n))),
        IpAddr::V6(network) => u128::from(network)
            .checked_add(offset)
            .map(|n| IpAddr::V6(Ipv6Addr::from(n))),
    };

    match candidate {
        Some(ip) if cidr.contains(&ip) => Ok(ip),
        _ => Err(VpnError::AddressExhausted { cidr: *cidr }),
    }
}

/// The single-address network of `ip` (`/32` for IPv4, `/128` for IPv6)
pub fn host_network(ip: IpAddr) -> IpNet {
    IpNet::from(ip)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNet {
        parse_cidr(s).unwrap()
    }

    #[test]
    fn allocations_are_network_plus_index_plus_one() {
        let cidr = net("10.0.0.0/16");
        let got: Vec<String> = (0..3)
            .map(|i| request_vpn_ip(&cidr, i).unwrap().to_string())
            .collect();
        assert_eq!(got, vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"]);

        assert_eq!(
            request_vpn_ip(&cidr, 255).unwrap().to_string(),
            "10.0.1.0"
        );
    }

    #[test]
    fn host_bits_in_the_input_are_dropped() {
        let cidr = net("10.0.0.5/16");
        assert_eq!(cidr.to_string(), "10.0.0.0/16");
        assert_eq!(request_vpn_ip(&cidr, 0).unwrap().to_string(), "10.0.0.1");
    }

    #[test]
    fn slash_31_holds_exactly_one_allocation() {
        let cidr = net("10.0.0.0/31");
        assert_eq!(request_vpn_ip(&cidr, 0).unwrap().to_string(), "10.0.0.1");

        let err = request_vpn_ip(&cidr, 1).unwrap_err();
        assert!(matches!(err, VpnError::AddressExhausted { cidr: c } if c == cidr));
        assert!(err.to_string().contains("10.0.0.0/31"));
    }

    #[test]
    fn last_ipv4_network_does_not_overflow() {
        let cidr = net("255.255.255.254/31");
        assert_eq!(
            request_vpn_ip(&cidr, 0).unwrap().to_string(),
            "255.255.255.255"
        );
        assert!(request_vpn_ip(&cidr, 1).is_err());
        assert!(request_vpn_ip(&cidr, u64::MAX).is_err());
    }

    #[test]
    fn ipv6_allocations_stay_in_family() {
        let cidr = net("fd00::/64");
        let ip = request_vpn_ip(&cidr, 1).unwrap();
        assert_eq!(ip.to_string(), "fd00::2");
        assert_eq!(host_network(ip).to_string(), "fd00::2/128");
    }

    #[test]
    fn host_network_is_full_length() {
        let ip = request_vpn_ip(&net("192.168.0.0/24"), 0).unwrap();
        assert_eq!(host_network(ip).to_string(), "192.168.0.1/32");
    }

    #[test]
    fn malformed_cidr_is_rejected() {
        for bad in ["", "10.0.0.0", "10.0.0.0/33", "not-a-cidr"] {
            assert!(
                matches!(parse_cidr(bad), Err(VpnError::InvalidCidr { .. })),
                "{bad:?} should be rejected"
            );
        }
    }
}
