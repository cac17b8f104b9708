use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use vmrig_core::backend::VirtBackend;
use vmrig_core::definition::{
    DefinitionRenderer, InterfaceSource, NetworkDefinition, NetworkInfo, NetworkIpDefinition,
};
use vmrig_core::error::{VmrigError, VmrigResult};
use vmrig_core::lock::{LockManager, NETWORKS_LOCK};
use vmrig_core::machine_data::MachineDataDir;
use vmrig_core::types::{NetworkAttachment, NetworkKind, TunnelType, VirtualNetwork};

use super::address::{self, DEFAULT_NETMASK};
use super::PlannedInterface;

/// Upper bound for the `virbrN` scan
const MAX_BRIDGES: u32 = 1024;

const DHCP_ONLY_NETWORK_NAME: &str = "vmrig-private-dhcp";

/// A planned interface after resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedInterface {
    pub attachment: NetworkAttachment,
    pub management: bool,
    pub source: InterfaceSource,
    /// Backend network the interface joins, for private attachments
    pub network: Option<VirtualNetwork>,
    /// Statically configured guest address, if any
    pub guest_ip: Option<Ipv4Addr>,
}

/// Finds or creates the backend networks a machine's interfaces join
///
/// Resolution of one machine's full attachment list runs under the
/// process-wide `networks` lock, so two machines never race to create the
/// same subnet or bridge.
pub struct NetworkResolver {
    backend: Arc<dyn VirtBackend>,
    locks: Arc<LockManager>,
    data: MachineDataDir,
    renderer: Arc<DefinitionRenderer>,
}

fn virtual_network(info: &NetworkInfo, created: bool) -> VirtualNetwork {
    VirtualNetwork {
        name: info.definition.name.clone(),
        uuid: info.uuid.clone(),
        bridge_name: info.definition.bridge.clone(),
        address: info.definition.network_address(),
        host_ip: info.definition.ip.as_ref().map(|ip| ip.address),
        dhcp_enabled: info.definition.dhcp_enabled(),
        created,
        active: info.active,
        autostart: info.autostart,
    }
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "enabled"
    } else {
        "disabled"
    }
}

impl NetworkResolver {
    pub fn new(
        backend: Arc<dyn VirtBackend>,
        locks: Arc<LockManager>,
        data: MachineDataDir,
        renderer: Arc<DefinitionRenderer>,
    ) -> Self {
        Self {
            backend,
            locks,
            data,
            renderer,
        }
    }

    /// Resolve every planned interface, in order
    pub async fn resolve(&self, planned: &[PlannedInterface]) -> VmrigResult<Vec<ResolvedInterface>> {
        let _guard = self.locks.lock(NETWORKS_LOCK).await?;

        let mut resolved = Vec::with_capacity(planned.len());
        for (index, interface) in planned.iter().enumerate() {
            let attachment = &interface.attachment;
            let result = match attachment.kind {
                NetworkKind::Private => {
                    let network = self.resolve_private(attachment, interface.management).await?;
                    ResolvedInterface {
                        attachment: attachment.clone(),
                        management: interface.management,
                        source: InterfaceSource::Network {
                            network: network.name.clone(),
                        },
                        network: Some(network),
                        guest_ip: if interface.management {
                            None
                        } else {
                            attachment.ip
                        },
                    }
                }
                NetworkKind::Public => ResolvedInterface {
                    attachment: attachment.clone(),
                    management: interface.management,
                    source: public_source(index, attachment)?,
                    network: None,
                    guest_ip: attachment.ip,
                },
                NetworkKind::Tunnel => ResolvedInterface {
                    attachment: attachment.clone(),
                    management: interface.management,
                    source: tunnel_source(index, attachment)?,
                    network: None,
                    guest_ip: attachment.ip,
                },
            };
            resolved.push(result);
        }
        Ok(resolved)
    }

    async fn resolve_private(
        &self,
        attachment: &NetworkAttachment,
        management: bool,
    ) -> VmrigResult<VirtualNetwork> {
        let declared_address = match attachment.ip {
            Some(ip) => Some(address::network_address(
                ip,
                attachment.netmask.unwrap_or(DEFAULT_NETMASK),
            )?),
            None if attachment.network_name.is_none() => Some(address::dhcp_only_network()),
            None => None,
        };

        let networks = self.backend.list_networks().await?;
        let matched = find_match(&networks, attachment, declared_address)?;

        match matched {
            Some(existing) => {
                self.check_dhcp(&existing, attachment, management)?;
                debug!(
                    "Matched network '{}' ({}) for {:?}",
                    existing.definition.name, existing.uuid, attachment.ip
                );
                self.activate(existing, attachment.autostart).await
            }
            None => {
                let address = declared_address.ok_or_else(|| {
                    VmrigError::configuration(
                        "networks",
                        format!(
                            "network '{}' does not exist and no address was given to create it",
                            attachment.network_name.as_deref().unwrap_or_default()
                        ),
                    )
                })?;
                self.create(attachment, address, management, &networks).await
            }
        }
    }

    fn check_dhcp(
        &self,
        existing: &NetworkInfo,
        attachment: &NetworkAttachment,
        management: bool,
    ) -> VmrigResult<()> {
        let existing_dhcp = existing.definition.dhcp_enabled();
        // Attachments with neither address nor name only work with DHCP.
        let dhcp_only = attachment.ip.is_none() && attachment.network_name.is_none();
        let declared = if management {
            Some(true)
        } else if dhcp_only {
            Some(attachment.dhcp_enabled.unwrap_or(true))
        } else {
            attachment.dhcp_enabled
        };
        match declared {
            Some(declared) if declared != existing_dhcp => Err(VmrigError::NetworkDhcpMismatch {
                network: existing.definition.name.clone(),
                existing: on_off(existing_dhcp),
                declared: on_off(declared),
            }),
            _ => Ok(()),
        }
    }

    async fn activate(&self, existing: NetworkInfo, autostart: bool) -> VmrigResult<VirtualNetwork> {
        let name = existing.definition.name.clone();
        let mut network = virtual_network(&existing, false);
        if !existing.active {
            info!("Starting network '{}'", name);
            self.backend.start_network(&name).await?;
            network.active = true;
        }
        if autostart && !existing.autostart {
            self.backend.set_network_autostart(&name, true).await?;
            network.autostart = true;
        }
        Ok(network)
    }

    async fn create(
        &self,
        attachment: &NetworkAttachment,
        address: Ipv4Net,
        management: bool,
        networks: &[NetworkInfo],
    ) -> VmrigResult<VirtualNetwork> {
        let name = match &attachment.network_name {
            Some(name) => name.clone(),
            None if attachment.ip.is_none() => DHCP_ONLY_NETWORK_NAME.to_string(),
            None => format!(
                "vmrig-private-{}",
                address.network().to_string().replace('.', "-")
            ),
        };
        let bridge = self.next_bridge(networks).await?;

        let dhcp_enabled = management || attachment.dhcp_enabled.unwrap_or(true);
        let dhcp = if dhcp_enabled {
            Some(address::dhcp_range_with(
                address,
                attachment.dhcp_start,
                attachment.dhcp_stop,
            )?)
        } else {
            None
        };

        let definition = NetworkDefinition {
            name: name.clone(),
            uuid: None,
            bridge,
            forward_mode: attachment.forward_mode,
            forward_device: attachment.forward_device.clone(),
            ip: Some(NetworkIpDefinition {
                address: address::host_address(address),
                netmask: address.netmask(),
                dhcp,
            }),
            mtu: attachment.mtu,
        };

        info!(
            "Creating network '{}' on {} ({}, DHCP {})",
            name,
            definition.bridge,
            address,
            on_off(dhcp_enabled)
        );
        let xml = self.renderer.render_network(&definition)?;
        debug!("Network definition:\n{}", xml);

        // Recorded before starting, so a failed start still leaves the
        // network owned by this machine.
        let info = self.backend.define_network(&definition).await?;
        self.data.record_created_network(&info.uuid).await?;
        self.backend.start_network(&name).await?;
        if attachment.autostart {
            self.backend.set_network_autostart(&name, true).await?;
        }

        let mut network = virtual_network(&info, true);
        network.active = true;
        network.autostart = attachment.autostart;
        Ok(network)
    }

    async fn next_bridge(&self, networks: &[NetworkInfo]) -> VmrigResult<String> {
        let mut taken: Vec<String> = networks
            .iter()
            .map(|network| network.definition.bridge.clone())
            .collect();
        taken.extend(self.backend.list_host_interfaces().await?);

        (0..MAX_BRIDGES)
            .map(|n| format!("virbr{}", n))
            .find(|candidate| !taken.contains(candidate))
            .ok_or(VmrigError::NoBridgeAvailable)
    }

    /// Tear down networks this machine created, unless another domain still
    /// uses them.
    ///
    /// Every uuid handled here leaves the ledger: destroyed networks, networks
    /// that no longer exist, and networks left in place for other domains.
    pub async fn release_networks(&self, domain_name: &str) -> VmrigResult<()> {
        let _guard = self.locks.lock(NETWORKS_LOCK).await?;

        for uuid in self.data.created_networks().await? {
            let Some(network) = self.backend.lookup_network_by_uuid(&uuid).await? else {
                debug!("Network {} is already gone", uuid);
                self.data.remove_created_network(&uuid).await?;
                continue;
            };
            let name = network.definition.name.clone();

            if self.in_use_by_others(&name, domain_name).await? {
                warn!(
                    "Network '{}' is still used by other domains; leaving it in place",
                    name
                );
                self.data.remove_created_network(&uuid).await?;
                continue;
            }

            info!("Removing network '{}'", name);
            if network.active {
                self.backend.destroy_network(&name).await?;
            }
            self.backend.undefine_network(&name).await?;
            self.data.remove_created_network(&uuid).await?;
        }
        Ok(())
    }

    async fn in_use_by_others(&self, network: &str, domain_name: &str) -> VmrigResult<bool> {
        for domain in self.backend.list_domains().await? {
            if domain.name == domain_name {
                continue;
            }
            let definition = self.backend.domain_definition(&domain.name, true).await?;
            if definition.network_names().contains(&network) {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Matching priority: explicit name, then declared address.
fn find_match(
    networks: &[NetworkInfo],
    attachment: &NetworkAttachment,
    declared_address: Option<Ipv4Net>,
) -> VmrigResult<Option<NetworkInfo>> {
    let by_address = |address: Ipv4Net| {
        networks
            .iter()
            .find(|network| network.definition.network_address() == Some(address))
    };

    if let Some(name) = &attachment.network_name {
        if let Some(network) = networks.iter().find(|n| &n.definition.name == name) {
            if let Some(declared) = declared_address {
                let actual = network.definition.network_address();
                if actual != Some(declared) {
                    return Err(VmrigError::NetworkNameAndAddressMismatch {
                        name: name.clone(),
                        address: declared.to_string(),
                        details: match actual {
                            Some(actual) => format!("network '{}' has address {}", name, actual),
                            None => format!("network '{}' has no address", name),
                        },
                    });
                }
            }
            return Ok(Some(network.clone()));
        }

        if let Some(declared) = declared_address {
            if let Some(other) = by_address(declared) {
                return Err(VmrigError::NetworkNameAndAddressMismatch {
                    name: name.clone(),
                    address: declared.to_string(),
                    details: format!(
                        "address is already used by network '{}'",
                        other.definition.name
                    ),
                });
            }
        }
        return Ok(None);
    }

    Ok(declared_address.and_then(by_address).cloned())
}

fn public_source(index: usize, attachment: &NetworkAttachment) -> VmrigResult<InterfaceSource> {
    let dev = attachment.host_device.clone().ok_or_else(|| {
        VmrigError::configuration(
            format!("networks[{}].host_device", index),
            "Public networks require a host device",
        )
    })?;
    Ok(InterfaceSource::Direct {
        dev,
        mode: attachment
            .direct_mode
            .clone()
            .unwrap_or_else(|| "bridge".to_string()),
    })
}

fn tunnel_source(index: usize, attachment: &NetworkAttachment) -> VmrigResult<InterfaceSource> {
    let port = attachment
        .tunnel_port
        .ok_or(VmrigError::TunnelPortNotDefined { index })?;
    let loopback = Ipv4Addr::LOCALHOST;
    let address = attachment.tunnel_ip.unwrap_or(loopback);

    Ok(match attachment.tunnel_type.unwrap_or_default() {
        TunnelType::Server => InterfaceSource::Server { address, port },
        TunnelType::Client => InterfaceSource::Client { address, port },
        TunnelType::Mcast => InterfaceSource::Mcast { address, port },
        TunnelType::Udp => InterfaceSource::Udp {
            address,
            port,
            local_address: attachment.tunnel_local_ip.unwrap_or(loopback),
            local_port: attachment.tunnel_local_port.ok_or_else(|| {
                VmrigError::configuration(
                    format!("networks[{}].tunnel_local_port", index),
                    "UDP tunnels require a local port",
                )
            })?,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tracing_test::traced_test;
    use vmrig_core::definition::DhcpRange;
    use vmrig_core::mock::MockBackend;
    use vmrig_core::types::ForwardMode;

    struct Fixture {
        _dir: TempDir,
        backend: Arc<MockBackend>,
        data: MachineDataDir,
        resolver: NetworkResolver,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::new());
        let data = MachineDataDir::new(dir.path().join("machine"));
        let resolver = NetworkResolver::new(
            backend.clone(),
            Arc::new(LockManager::new(dir.path().join("locks"))),
            data.clone(),
            Arc::new(DefinitionRenderer::new().unwrap()),
        );
        Fixture {
            _dir: dir,
            backend,
            data,
            resolver,
        }
    }

    fn existing_network(name: &str, bridge: &str, cidr: &str, dhcp: bool) -> NetworkDefinition {
        let net: Ipv4Net = cidr.parse().unwrap();
        NetworkDefinition {
            name: name.to_string(),
            uuid: None,
            bridge: bridge.to_string(),
            forward_mode: ForwardMode::Nat,
            forward_device: None,
            ip: Some(NetworkIpDefinition {
                address: address::host_address(net),
                netmask: net.netmask(),
                dhcp: dhcp.then(|| address::dhcp_range(net)),
            }),
            mtu: None,
        }
    }

    fn private(attachment: NetworkAttachment) -> Vec<PlannedInterface> {
        vec![PlannedInterface {
            attachment,
            management: false,
        }]
    }

    #[tokio::test]
    async fn test_match_by_address() {
        let f = fixture();
        let existing = f.backend.add_network(
            existing_network("shared", "virbr0", "192.168.121.0/24", true),
            true,
            false,
        );

        let resolved = f
            .resolver
            .resolve(&private(NetworkAttachment::private_static(
                Ipv4Addr::new(192, 168, 121, 1),
                Ipv4Addr::new(255, 255, 255, 0),
            )))
            .await
            .unwrap();

        let network = resolved[0].network.as_ref().unwrap();
        assert_eq!(network.uuid, existing.uuid);
        assert!(!network.created);
        assert_eq!(f.backend.call_count("define_network"), 0);
        assert!(f.data.created_networks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dhcp_mismatch_creates_nothing() {
        let f = fixture();
        f.backend.add_network(
            existing_network("shared", "virbr0", "192.168.121.0/24", true),
            true,
            false,
        );

        let err = f
            .resolver
            .resolve(&private(
                NetworkAttachment::private_static(
                    Ipv4Addr::new(192, 168, 121, 10),
                    Ipv4Addr::new(255, 255, 255, 0),
                )
                .with_dhcp(false),
            ))
            .await
            .unwrap_err();

        assert!(matches!(err, VmrigError::NetworkDhcpMismatch { .. }));
        assert!(err.is_configuration());
        assert_eq!(f.backend.call_count("define_network"), 0);
        assert_eq!(f.backend.call_count("start_network"), 0);
    }

    #[tokio::test]
    async fn test_management_requires_dhcp() {
        let f = fixture();
        f.backend.add_network(
            existing_network("vagrant-libvirt", "virbr0", "192.168.121.0/24", false),
            true,
            false,
        );
        let planned = vec![PlannedInterface {
            attachment: NetworkAttachment::named("vagrant-libvirt"),
            management: true,
        }];
        let err = f.resolver.resolve(&planned).await.unwrap_err();
        assert!(matches!(err, VmrigError::NetworkDhcpMismatch { .. }));
    }

    #[tokio::test]
    async fn test_creates_network_with_next_bridge() {
        let f = fixture();
        f.backend.add_network(
            existing_network("other", "virbr0", "10.0.0.0/24", true),
            true,
            false,
        );
        f.backend.add_host_interface("virbr1");

        let resolved = f
            .resolver
            .resolve(&private(NetworkAttachment::private_static(
                Ipv4Addr::new(10, 20, 30, 40),
                Ipv4Addr::new(255, 255, 255, 0),
            )))
            .await
            .unwrap();

        let network = resolved[0].network.as_ref().unwrap();
        assert!(network.created);
        assert!(network.active);
        assert_eq!(network.bridge_name, "virbr2");
        assert_eq!(network.host_ip, Some(Ipv4Addr::new(10, 20, 30, 1)));
        assert_eq!(resolved[0].guest_ip, Some(Ipv4Addr::new(10, 20, 30, 40)));

        let info = f.backend.lookup_network(&network.name).await.unwrap().unwrap();
        assert_eq!(
            info.definition.ip.unwrap().dhcp,
            Some(DhcpRange {
                start: Ipv4Addr::new(10, 20, 30, 2),
                end: Ipv4Addr::new(10, 20, 30, 254),
            })
        );
        assert_eq!(f.data.created_networks().await.unwrap(), vec![network.uuid.clone()]);
    }

    #[tokio::test]
    async fn test_name_and_address_mismatch() {
        let f = fixture();
        f.backend.add_network(
            existing_network("lab", "virbr0", "10.1.0.0/24", true),
            true,
            false,
        );
        let attachment = NetworkAttachment::private_static(
            Ipv4Addr::new(10, 2, 0, 5),
            Ipv4Addr::new(255, 255, 255, 0),
        )
        .with_name("lab");

        let err = f.resolver.resolve(&private(attachment)).await.unwrap_err();
        assert!(matches!(err, VmrigError::NetworkNameAndAddressMismatch { .. }));
    }

    #[tokio::test]
    async fn test_inactive_match_is_started() {
        let f = fixture();
        f.backend.add_network(
            existing_network("lab", "virbr0", "10.1.0.0/24", true),
            false,
            false,
        );
        let mut attachment = NetworkAttachment::named("lab");
        attachment.autostart = true;
        let resolved = f.resolver.resolve(&private(attachment)).await.unwrap();
        let network = resolved[0].network.as_ref().unwrap();
        assert!(network.active);
        assert!(network.autostart);
        assert_eq!(f.backend.call_count("start_network"), 1);
    }

    #[tokio::test]
    async fn test_dhcp_only_uses_reserved_block() {
        let f = fixture();
        let resolved = f
            .resolver
            .resolve(&private(NetworkAttachment::private_dhcp()))
            .await
            .unwrap();
        let network = resolved[0].network.as_ref().unwrap();
        assert_eq!(network.address.unwrap().to_string(), "172.28.128.0/24");
        assert!(network.dhcp_enabled);

        // A second DHCP-only attachment reuses it.
        let again = f
            .resolver
            .resolve(&private(NetworkAttachment::private_dhcp()))
            .await
            .unwrap();
        assert_eq!(again[0].network.as_ref().unwrap().uuid, network.uuid);
        assert_eq!(f.backend.call_count("define_network"), 1);
    }

    #[tokio::test]
    async fn test_dhcp_only_rejects_reserved_block_without_dhcp() {
        let f = fixture();
        f.backend.add_network(
            existing_network("static-lab", "virbr0", "172.28.128.0/24", false),
            true,
            false,
        );

        // No address, no name and no explicit DHCP setting.
        let err = f
            .resolver
            .resolve(&private(NetworkAttachment::default()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            VmrigError::NetworkDhcpMismatch {
                existing: "disabled",
                declared: "enabled",
                ..
            }
        ));
        assert_eq!(f.backend.call_count("define_network"), 0);
    }

    #[tokio::test]
    async fn test_failed_start_keeps_network_in_ledger() {
        let f = fixture();
        f.backend.fail_once("start_network", "bridge busy");

        let err = f
            .resolver
            .resolve(&private(NetworkAttachment::private_dhcp()))
            .await
            .unwrap_err();
        assert!(matches!(err, VmrigError::Backend { .. }));

        let networks = f.backend.list_networks().await.unwrap();
        assert_eq!(networks.len(), 1);
        assert_eq!(f.data.created_networks().await.unwrap(), vec![networks[0].uuid.clone()]);

        f.resolver.release_networks("web").await.unwrap();
        assert!(f.backend.list_networks().await.unwrap().is_empty());
        assert!(f.data.created_networks().await.unwrap().is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_created_network_definition_is_logged() {
        let f = fixture();
        f.resolver
            .resolve(&private(NetworkAttachment::private_dhcp()))
            .await
            .unwrap();
        assert!(logs_contain("Network definition:"));
        assert!(logs_contain("<name>vmrig-private-dhcp</name>"));
    }

    #[tokio::test]
    async fn test_tunnel_without_port() {
        let f = fixture();
        let attachment = NetworkAttachment {
            kind: NetworkKind::Tunnel,
            ..Default::default()
        };
        let err = f.resolver.resolve(&private(attachment)).await.unwrap_err();
        assert!(matches!(err, VmrigError::TunnelPortNotDefined { index: 0 }));
    }

    #[tokio::test]
    async fn test_public_resolves_to_direct() {
        let f = fixture();
        let attachment = NetworkAttachment {
            kind: NetworkKind::Public,
            host_device: Some("eth0".to_string()),
            ..Default::default()
        };
        let resolved = f.resolver.resolve(&private(attachment)).await.unwrap();
        assert_eq!(
            resolved[0].source,
            InterfaceSource::Direct {
                dev: "eth0".to_string(),
                mode: "bridge".to_string()
            }
        );
        assert!(resolved[0].network.is_none());
    }

    #[tokio::test]
    async fn test_release_networks_removes_owned() {
        let f = fixture();
        let resolved = f
            .resolver
            .resolve(&private(NetworkAttachment::private_dhcp()))
            .await
            .unwrap();
        let name = resolved[0].network.as_ref().unwrap().name.clone();

        f.resolver.release_networks("web").await.unwrap();

        assert!(f.backend.lookup_network(&name).await.unwrap().is_none());
        assert!(f.data.created_networks().await.unwrap().is_empty());
    }
}
