//! Network attachment resolution
//!
//! Declared attachments are resolved to backend networks (found or created)
//! or to direct interface sources. See [`resolver::NetworkResolver`].

pub mod address;
pub mod resolver;

pub use resolver::{NetworkResolver, ResolvedInterface};

use vmrig_core::config::{MachineConfig, ManagementNetworkSettings};
use vmrig_core::types::{NetworkAttachment, NetworkKind};

/// One interface the machine should end up with, in attachment order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedInterface {
    pub attachment: NetworkAttachment,
    /// The management interface must sit on a DHCP network
    pub management: bool,
}

/// Attachment for the management network
pub fn management_attachment(settings: &ManagementNetworkSettings) -> NetworkAttachment {
    NetworkAttachment {
        kind: NetworkKind::Private,
        network_name: Some(settings.name.clone()),
        ip: Some(address::host_address(settings.address)),
        netmask: Some(settings.address.netmask()),
        dhcp_enabled: Some(true),
        forward_mode: settings.mode,
        mac: settings.mac.clone(),
        model_type: settings.model_type.clone(),
        autostart: settings.autostart,
        ..Default::default()
    }
}

/// Management interface first (unless disabled), then declared networks
pub fn planned_interfaces(config: &MachineConfig) -> Vec<PlannedInterface> {
    let mut planned = Vec::with_capacity(config.networks.len() + 1);
    if config.management_network.enabled {
        planned.push(PlannedInterface {
            attachment: management_attachment(&config.management_network),
            management: true,
        });
    }
    planned.extend(config.networks.iter().cloned().map(|attachment| PlannedInterface {
        attachment,
        management: false,
    }));
    planned
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use vmrig_core::config::ConfigBuilder;

    #[test]
    fn test_management_interface_comes_first() {
        let config = ConfigBuilder::new()
            .network(NetworkAttachment::private_static(
                Ipv4Addr::new(10, 20, 30, 40),
                Ipv4Addr::new(255, 255, 255, 0),
            ))
            .build()
            .unwrap();
        let planned = planned_interfaces(&config);
        assert_eq!(planned.len(), 2);
        assert!(planned[0].management);
        assert_eq!(
            planned[0].attachment.network_name.as_deref(),
            Some("vagrant-libvirt")
        );
        assert_eq!(planned[0].attachment.ip, Some(Ipv4Addr::new(192, 168, 121, 1)));
        assert!(!planned[1].management);
    }

    #[test]
    fn test_management_can_be_disabled() {
        let config = ConfigBuilder::new().management_network(false).build().unwrap();
        assert!(planned_interfaces(&config).is_empty());
    }
}
