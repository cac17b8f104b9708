//! Typed backend definition documents
//!
//! These structs are the source of truth for what gets defined on the
//! backend. The reconciler diffs and edits them field by field; rendering to
//! the backend's native XML happens only at the edge through
//! [`DefinitionRenderer`].
//!
//! Fields the engine does not manage (backend-assigned PCI addresses,
//! device aliases, elements this crate has no model for) are carried in
//! `address`, `alias` and `extra` so a live definition can be re-defined
//! without losing them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use tera::{Context, Tera};

use crate::error::VmrigResult;
use crate::types::{
    BootDevice, CpuFeature, CpuTopology, DiskBus, DomainPowerState, ForwardMode, GraphicsType,
    TpmBackend,
};

/// Backend-assigned device address attributes, kept verbatim
pub type DeviceAddress = BTreeMap<String, String>;

/// Unmodelled definition content, kept verbatim
pub type Extra = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainDefinition {
    pub name: String,
    #[serde(default)]
    pub uuid: Option<String>,
    pub domain_type: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub memory_mib: u64,
    pub vcpus: u32,
    pub cpu: CpuDefinition,
    pub os: OsDefinition,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub emulator: Option<String>,
    #[serde(default)]
    pub disks: Vec<DiskDefinition>,
    #[serde(default)]
    pub interfaces: Vec<InterfaceDefinition>,
    #[serde(default)]
    pub graphics: Option<GraphicsDefinition>,
    #[serde(default)]
    pub video: Option<VideoDefinition>,
    #[serde(default)]
    pub tpm: Option<TpmDefinition>,
    #[serde(default, flatten)]
    pub extra: Extra,
}

impl DomainDefinition {
    pub fn disk(&self, device: &str) -> Option<&DiskDefinition> {
        self.disks.iter().find(|d| d.device == device)
    }

    /// Names of the backend networks this domain's interfaces are bound to
    pub fn network_names(&self) -> Vec<&str> {
        self.interfaces
            .iter()
            .filter_map(|iface| match &iface.source {
                InterfaceSource::Network { network } => Some(network.as_str()),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuDefinition {
    pub mode: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub fallback: Option<String>,
    #[serde(default)]
    pub features: Vec<CpuFeature>,
    #[serde(default)]
    pub topology: Option<CpuTopology>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct OsDefinition {
    #[serde(default)]
    pub arch: Option<String>,
    #[serde(default)]
    pub machine: Option<String>,
    /// OS-level boot order; empty when per-device boot order is used
    #[serde(default)]
    pub boot: Vec<BootDevice>,
    #[serde(default)]
    pub kernel: Option<String>,
    #[serde(default)]
    pub initrd: Option<String>,
    #[serde(default)]
    pub cmdline: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskDefinition {
    /// Target device name inside the guest, e.g. "vda"
    pub device: String,
    pub bus: DiskBus,
    pub format: String,
    pub source: String,
    #[serde(default)]
    pub cache: Option<String>,
    #[serde(default)]
    pub boot_order: Option<u32>,
    #[serde(default)]
    pub address: Option<DeviceAddress>,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default, flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InterfaceSource {
    Network {
        network: String,
    },
    Direct {
        dev: String,
        mode: String,
    },
    Udp {
        address: Ipv4Addr,
        port: u16,
        local_address: Ipv4Addr,
        local_port: u16,
    },
    Server {
        address: Ipv4Addr,
        port: u16,
    },
    Client {
        address: Ipv4Addr,
        port: u16,
    },
    Mcast {
        address: Ipv4Addr,
        port: u16,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceDefinition {
    pub source: InterfaceSource,
    #[serde(default)]
    pub mac: Option<String>,
    pub model: String,
    #[serde(default)]
    pub boot_order: Option<u32>,
    #[serde(default)]
    pub mtu: Option<u32>,
    #[serde(default)]
    pub target_dev: Option<String>,
    #[serde(default)]
    pub address: Option<DeviceAddress>,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default, flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphicsDefinition {
    pub kind: GraphicsType,
    pub listen: String,
    pub autoport: bool,
    #[serde(default)]
    pub port: Option<i32>,
    #[serde(default)]
    pub passwd: Option<String>,
    #[serde(default)]
    pub keymap: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoDefinition {
    pub model: String,
    pub vram_kib: u32,
    #[serde(default)]
    pub address: Option<DeviceAddress>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TpmDefinition {
    pub model: String,
    pub backend: TpmBackend,
}

/// Summary of a defined domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainInfo {
    pub name: String,
    pub uuid: String,
    pub state: DomainPowerState,
}

/// An address leased to one of a domain's interfaces
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceAddress {
    pub mac: String,
    pub ip: Ipv4Addr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhcpRange {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkIpDefinition {
    /// Address of the host side of the bridge
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    #[serde(default)]
    pub dhcp: Option<DhcpRange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDefinition {
    pub name: String,
    #[serde(default)]
    pub uuid: Option<String>,
    pub bridge: String,
    pub forward_mode: ForwardMode,
    #[serde(default)]
    pub forward_device: Option<String>,
    #[serde(default)]
    pub ip: Option<NetworkIpDefinition>,
    #[serde(default)]
    pub mtu: Option<u32>,
}

impl NetworkDefinition {
    /// Network address and prefix (ip & netmask) of this network, if it has one
    pub fn network_address(&self) -> Option<ipnet::Ipv4Net> {
        let ip = self.ip.as_ref()?;
        let prefix = ipnet::ipv4_mask_to_prefix(ip.netmask).ok()?;
        ipnet::Ipv4Net::new(ip.address, prefix).ok().map(|net| net.trunc())
    }

    pub fn dhcp_enabled(&self) -> bool {
        self.ip.as_ref().map(|ip| ip.dhcp.is_some()).unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub definition: NetworkDefinition,
    pub uuid: String,
    pub active: bool,
    pub autostart: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoragePoolDefinition {
    pub name: String,
    pub kind: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolInfo {
    pub name: String,
    pub path: String,
    pub active: bool,
    pub autostart: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackingStore {
    pub path: String,
    pub format: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeDefinition {
    pub name: String,
    pub capacity_bytes: u64,
    pub format: String,
    #[serde(default)]
    pub backing_store: Option<BackingStore>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub name: String,
    pub pool: String,
    pub path: String,
    pub capacity_bytes: u64,
    pub format: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub state: DomainPowerState,
}

/// Renders definition documents to the backend's native XML
pub struct DefinitionRenderer {
    tera: Tera,
}

impl DefinitionRenderer {
    pub fn new() -> VmrigResult<Self> {
        let mut tera = Tera::default();
        // Attribute values are emitted raw, paths included.
        tera.autoescape_on(vec![]);
        tera.add_raw_template("domain.xml", include_str!("../templates/domain.xml.tera"))?;
        tera.add_raw_template("network.xml", include_str!("../templates/network.xml.tera"))?;
        tera.add_raw_template("pool.xml", include_str!("../templates/pool.xml.tera"))?;
        Ok(Self { tera })
    }

    pub fn render_domain(&self, definition: &DomainDefinition) -> VmrigResult<String> {
        let context = Context::from_serialize(definition)?;
        Ok(self.tera.render("domain.xml", &context)?)
    }

    pub fn render_network(&self, definition: &NetworkDefinition) -> VmrigResult<String> {
        let context = Context::from_serialize(definition)?;
        Ok(self.tera.render("network.xml", &context)?)
    }

    pub fn render_pool(&self, definition: &StoragePoolDefinition) -> VmrigResult<String> {
        let context = Context::from_serialize(definition)?;
        Ok(self.tera.render("pool.xml", &context)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_domain() -> DomainDefinition {
        DomainDefinition {
            name: "proj_web".to_string(),
            uuid: None,
            domain_type: "kvm".to_string(),
            title: None,
            description: None,
            memory_mib: 1024,
            vcpus: 2,
            cpu: CpuDefinition {
                mode: "host-model".to_string(),
                model: None,
                fallback: None,
                features: vec![CpuFeature {
                    name: "vmx".to_string(),
                    policy: "optional".to_string(),
                }],
                topology: None,
            },
            os: OsDefinition {
                boot: vec![BootDevice::Hd],
                ..Default::default()
            },
            features: vec!["acpi".to_string(), "apic".to_string()],
            emulator: None,
            disks: vec![DiskDefinition {
                device: "vda".to_string(),
                bus: DiskBus::Virtio,
                format: "qcow2".to_string(),
                source: "/var/lib/libvirt/images/proj_web.img".to_string(),
                cache: None,
                boot_order: None,
                address: None,
                alias: None,
                extra: Extra::new(),
            }],
            interfaces: vec![InterfaceDefinition {
                source: InterfaceSource::Network {
                    network: "vagrant-libvirt".to_string(),
                },
                mac: Some("52:54:00:aa:bb:cc".to_string()),
                model: "virtio".to_string(),
                boot_order: None,
                mtu: None,
                target_dev: None,
                address: None,
                alias: None,
                extra: Extra::new(),
            }],
            graphics: Some(GraphicsDefinition {
                kind: GraphicsType::Vnc,
                listen: "127.0.0.1".to_string(),
                autoport: true,
                port: None,
                passwd: None,
                keymap: Some("en-us".to_string()),
            }),
            video: Some(VideoDefinition {
                model: "cirrus".to_string(),
                vram_kib: 16384,
                address: None,
            }),
            tpm: None,
            extra: Extra::new(),
        }
    }

    #[test]
    fn test_render_domain_xml() {
        let renderer = DefinitionRenderer::new().unwrap();
        let xml = renderer.render_domain(&sample_domain()).unwrap();

        assert!(xml.contains("<name>proj_web</name>"));
        assert!(xml.contains("<memory unit='MiB'>1024</memory>"));
        assert!(xml.contains("<vcpu>2</vcpu>"));
        assert!(xml.contains("<feature policy='optional' name='vmx'/>"));
        assert!(xml.contains("<target dev='vda' bus='virtio'/>"));
        assert!(xml.contains("<source network='vagrant-libvirt'/>"));
        assert!(xml.contains("<graphics type='vnc'"));
    }

    #[test]
    fn test_network_address() {
        let net = NetworkDefinition {
            name: "vagrant-libvirt".to_string(),
            uuid: None,
            bridge: "virbr1".to_string(),
            forward_mode: ForwardMode::Nat,
            forward_device: None,
            ip: Some(NetworkIpDefinition {
                address: Ipv4Addr::new(192, 168, 121, 1),
                netmask: Ipv4Addr::new(255, 255, 255, 0),
                dhcp: Some(DhcpRange {
                    start: Ipv4Addr::new(192, 168, 121, 2),
                    end: Ipv4Addr::new(192, 168, 121, 254),
                }),
            }),
            mtu: None,
        };

        assert_eq!(
            net.network_address().unwrap().to_string(),
            "192.168.121.0/24"
        );
        assert!(net.dhcp_enabled());

        let renderer = DefinitionRenderer::new().unwrap();
        let xml = renderer.render_network(&net).unwrap();
        assert!(xml.contains("<bridge name='virbr1'"));
        assert!(xml.contains("<range start='192.168.121.2' end='192.168.121.254'/>"));
    }
}
