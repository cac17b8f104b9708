//! IPv4 address arithmetic for private networks

use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

use vmrig_core::definition::DhcpRange;
use vmrig_core::error::{VmrigError, VmrigResult};

/// Block matched for private networks declared with neither name nor address
pub fn dhcp_only_network() -> Ipv4Net {
    let network = Ipv4Addr::new(172, 28, 128, 0);
    Ipv4Net::new(network, 24).unwrap_or_else(|_| Ipv4Net::from(network))
}

pub const DEFAULT_NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

/// Network containing `ip` under `netmask`, e.g. 10.20.30.40/255.255.255.0
/// gives 10.20.30.0/24
pub fn network_address(ip: Ipv4Addr, netmask: Ipv4Addr) -> VmrigResult<Ipv4Net> {
    let prefix = ipnet::ipv4_mask_to_prefix(netmask).map_err(|_| {
        VmrigError::configuration("networks", format!("invalid netmask {}", netmask))
    })?;
    let net = Ipv4Net::new(ip, prefix).map_err(|_| {
        VmrigError::configuration("networks", format!("invalid prefix length {}", prefix))
    })?;
    if prefix > 30 {
        return Err(VmrigError::configuration(
            "networks",
            format!("network {} is too small for a host and a guest", net.trunc()),
        ));
    }
    Ok(net.trunc())
}

/// Address the host side of the bridge takes: first address after the
/// network address
pub fn host_address(net: Ipv4Net) -> Ipv4Addr {
    offset(net.network(), 1)
}

/// Default DHCP range: two past the network address up to one before
/// broadcast
pub fn dhcp_range(net: Ipv4Net) -> DhcpRange {
    DhcpRange {
        start: offset(net.network(), 2),
        end: offset(net.broadcast(), -1),
    }
}

/// DHCP range honouring explicit start/stop overrides
pub fn dhcp_range_with(
    net: Ipv4Net,
    start: Option<Ipv4Addr>,
    stop: Option<Ipv4Addr>,
) -> VmrigResult<DhcpRange> {
    let default = dhcp_range(net);
    let range = DhcpRange {
        start: start.unwrap_or(default.start),
        end: stop.unwrap_or(default.end),
    };
    if !net.contains(&range.start) || !net.contains(&range.end) || range.start > range.end {
        return Err(VmrigError::configuration(
            "networks",
            format!(
                "DHCP range {} - {} does not fit network {}",
                range.start, range.end, net
            ),
        ));
    }
    Ok(range)
}

fn offset(addr: Ipv4Addr, delta: i64) -> Ipv4Addr {
    let value = i64::from(u32::from(addr)) + delta;
    Ipv4Addr::from(value.clamp(0, i64::from(u32::MAX)) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_address() {
        let net = network_address(Ipv4Addr::new(10, 20, 30, 40), DEFAULT_NETMASK).unwrap();
        assert_eq!(net.to_string(), "10.20.30.0/24");

        let net =
            network_address(Ipv4Addr::new(192, 168, 121, 1), Ipv4Addr::new(255, 255, 0, 0))
                .unwrap();
        assert_eq!(net.to_string(), "192.168.0.0/16");
    }

    #[test]
    fn test_invalid_netmask() {
        let err = network_address(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(255, 0, 255, 0))
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_too_small_network() {
        assert!(network_address(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(255, 255, 255, 254))
            .is_err());
    }

    #[test]
    fn test_host_and_dhcp_range() {
        let net: Ipv4Net = "192.168.121.0/24".parse().unwrap();
        assert_eq!(host_address(net), Ipv4Addr::new(192, 168, 121, 1));
        let range = dhcp_range(net);
        assert_eq!(range.start, Ipv4Addr::new(192, 168, 121, 2));
        assert_eq!(range.end, Ipv4Addr::new(192, 168, 121, 254));
    }

    #[test]
    fn test_dhcp_overrides() {
        let net: Ipv4Net = "10.0.0.0/24".parse().unwrap();
        let range =
            dhcp_range_with(net, Some(Ipv4Addr::new(10, 0, 0, 100)), None).unwrap();
        assert_eq!(range.start, Ipv4Addr::new(10, 0, 0, 100));
        assert_eq!(range.end, Ipv4Addr::new(10, 0, 0, 254));

        assert!(dhcp_range_with(net, Some(Ipv4Addr::new(10, 0, 1, 5)), None).is_err());
    }

    #[test]
    fn test_dhcp_only_block() {
        assert_eq!(dhcp_only_network().to_string(), "172.28.128.0/24");
    }
}
