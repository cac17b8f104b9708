use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::PathBuf;

/// Power state of a machine as seen by the orchestration engine.
///
/// Always derived from a fresh backend query; never cached across runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineState {
    NotCreated,
    /// Defined on the backend but powered off
    Created,
    Running,
    Suspended,
    Unknown,
}

impl MachineState {
    /// Map a backend power state (or its absence) onto a machine state
    pub fn from_power_state(state: Option<DomainPowerState>) -> Self {
        match state {
            None => MachineState::NotCreated,
            Some(DomainPowerState::Shutoff)
            | Some(DomainPowerState::Shutdown)
            | Some(DomainPowerState::Crashed) => MachineState::Created,
            Some(DomainPowerState::Running) => MachineState::Running,
            Some(DomainPowerState::Paused) | Some(DomainPowerState::PmSuspended) => {
                MachineState::Suspended
            }
            Some(DomainPowerState::NoState) | Some(DomainPowerState::Blocked) => {
                MachineState::Unknown
            }
        }
    }
}

impl std::fmt::Display for MachineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MachineState::NotCreated => write!(f, "not_created"),
            MachineState::Created => write!(f, "created"),
            MachineState::Running => write!(f, "running"),
            MachineState::Suspended => write!(f, "suspended"),
            MachineState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Raw power state reported by the hypervisor backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainPowerState {
    NoState,
    Running,
    Blocked,
    Paused,
    Shutdown,
    Shutoff,
    Crashed,
    PmSuspended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DiskBus {
    #[default]
    Virtio,
    Scsi,
    Sata,
    Ide,
    Usb,
}

impl DiskBus {
    /// Device name prefix the guest sees for disks on this bus
    pub fn device_prefix(&self) -> &'static str {
        match self {
            DiskBus::Virtio => "vd",
            DiskBus::Scsi | DiskBus::Sata | DiskBus::Usb => "sd",
            DiskBus::Ide => "hd",
        }
    }
}

impl std::fmt::Display for DiskBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiskBus::Virtio => write!(f, "virtio"),
            DiskBus::Scsi => write!(f, "scsi"),
            DiskBus::Sata => write!(f, "sata"),
            DiskBus::Ide => write!(f, "ide"),
            DiskBus::Usb => write!(f, "usb"),
        }
    }
}

/// A declared disk. `device` is either given explicitly or assigned by the
/// disk device resolver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskSpec {
    /// Optional label, used in diagnostics and volume names
    pub name: Option<String>,
    pub device: Option<String>,
    pub bus: DiskBus,
    /// Volume format, e.g. "qcow2" or "raw"
    #[serde(rename = "type")]
    pub format: String,
    pub size_gib: u64,
    /// Storage pool, defaults to the machine's pool
    pub pool: Option<String>,
    /// Explicit volume name or path inside the pool
    pub path: Option<String>,
    pub allow_existing: bool,
    pub cache: Option<String>,
}

impl Default for DiskSpec {
    fn default() -> Self {
        Self {
            name: None,
            device: None,
            bus: DiskBus::Virtio,
            format: "qcow2".to_string(),
            size_gib: 10,
            pool: None,
            path: None,
            allow_existing: false,
            cache: None,
        }
    }
}

impl DiskSpec {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }

    pub fn with_bus(mut self, bus: DiskBus) -> Self {
        self.bus = bus;
        self
    }
}

impl std::fmt::Display for DiskSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        if let Some(name) = &self.name {
            write!(f, "name: {}, ", name)?;
        }
        if let Some(path) = &self.path {
            write!(f, "path: {}, ", path)?;
        }
        write!(
            f,
            "device: {}, bus: {}, type: {}, size: {}G}}",
            self.device.as_deref().unwrap_or("<unassigned>"),
            self.bus,
            self.format,
            self.size_gib
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NetworkKind {
    #[default]
    Private,
    Public,
    Tunnel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ForwardMode {
    #[default]
    Nat,
    Route,
    Open,
    None,
    Veryisolated,
}

impl std::fmt::Display for ForwardMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ForwardMode::Nat => write!(f, "nat"),
            ForwardMode::Route => write!(f, "route"),
            ForwardMode::Open => write!(f, "open"),
            ForwardMode::None => write!(f, "none"),
            ForwardMode::Veryisolated => write!(f, "veryisolated"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TunnelType {
    #[default]
    Server,
    Client,
    Mcast,
    Udp,
}

/// A declared network interface of a machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkAttachment {
    pub kind: NetworkKind,
    pub network_name: Option<String>,
    pub ip: Option<Ipv4Addr>,
    pub netmask: Option<Ipv4Addr>,
    /// `None` leaves the DHCP state of a matched network unconstrained
    pub dhcp_enabled: Option<bool>,
    pub dhcp_start: Option<Ipv4Addr>,
    pub dhcp_stop: Option<Ipv4Addr>,
    pub forward_mode: ForwardMode,
    pub forward_device: Option<String>,
    pub mac: Option<String>,
    /// Overrides the machine-wide NIC model
    pub model_type: Option<String>,
    pub autostart: bool,
    pub mtu: Option<u32>,
    pub iface_name: Option<String>,
    /// Host device for public (macvtap) interfaces
    pub host_device: Option<String>,
    /// macvtap mode for public interfaces
    pub direct_mode: Option<String>,
    pub tunnel_type: Option<TunnelType>,
    pub tunnel_ip: Option<Ipv4Addr>,
    pub tunnel_port: Option<u16>,
    pub tunnel_local_ip: Option<Ipv4Addr>,
    pub tunnel_local_port: Option<u16>,
}

impl Default for NetworkAttachment {
    fn default() -> Self {
        Self {
            kind: NetworkKind::Private,
            network_name: None,
            ip: None,
            netmask: None,
            dhcp_enabled: None,
            dhcp_start: None,
            dhcp_stop: None,
            forward_mode: ForwardMode::Nat,
            forward_device: None,
            mac: None,
            model_type: None,
            autostart: false,
            mtu: None,
            iface_name: None,
            host_device: None,
            direct_mode: None,
            tunnel_type: None,
            tunnel_ip: None,
            tunnel_port: None,
            tunnel_local_ip: None,
            tunnel_local_port: None,
        }
    }
}

impl NetworkAttachment {
    /// A private network with a static address
    pub fn private_static(ip: Ipv4Addr, netmask: Ipv4Addr) -> Self {
        Self {
            ip: Some(ip),
            netmask: Some(netmask),
            ..Default::default()
        }
    }

    /// A private network whose address is handed out by DHCP
    pub fn private_dhcp() -> Self {
        Self {
            dhcp_enabled: Some(true),
            ..Default::default()
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            network_name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn with_dhcp(mut self, enabled: bool) -> Self {
        self.dhcp_enabled = Some(enabled);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.network_name = Some(name.into());
        self
    }
}

/// Handle to a resolved backend network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualNetwork {
    pub name: String,
    pub uuid: String,
    pub bridge_name: String,
    pub address: Option<ipnet::Ipv4Net>,
    pub host_ip: Option<Ipv4Addr>,
    pub dhcp_enabled: bool,
    /// Whether this run created the network
    pub created: bool,
    pub active: bool,
    pub autostart: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CpuMode {
    #[default]
    HostModel,
    HostPassthrough,
    Custom,
}

impl std::fmt::Display for CpuMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CpuMode::HostModel => write!(f, "host-model"),
            CpuMode::HostPassthrough => write!(f, "host-passthrough"),
            CpuMode::Custom => write!(f, "custom"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuFeature {
    pub name: String,
    /// require, optional, disable, forbid or force
    pub policy: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuTopology {
    pub sockets: u32,
    pub cores: u32,
    pub threads: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GraphicsType {
    #[default]
    Vnc,
    Spice,
    None,
}

impl std::fmt::Display for GraphicsType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GraphicsType::Vnc => write!(f, "vnc"),
            GraphicsType::Spice => write!(f, "spice"),
            GraphicsType::None => write!(f, "none"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphicsSettings {
    pub kind: GraphicsType,
    pub listen: String,
    pub autoport: bool,
    pub port: Option<i32>,
    pub password: Option<String>,
    pub keymap: String,
}

impl Default for GraphicsSettings {
    fn default() -> Self {
        Self {
            kind: GraphicsType::Vnc,
            listen: "127.0.0.1".to_string(),
            autoport: true,
            port: None,
            password: None,
            keymap: "en-us".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoSettings {
    pub model: String,
    pub vram_kib: u32,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            model: "cirrus".to_string(),
            vram_kib: 16384,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TpmBackend {
    Passthrough { path: String },
    Emulator { version: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TpmSettings {
    pub model: String,
    pub backend: TpmBackend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BootDevice {
    Hd,
    Cdrom,
    Network,
}

impl std::fmt::Display for BootDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BootDevice::Hd => write!(f, "hd"),
            BootDevice::Cdrom => write!(f, "cdrom"),
            BootDevice::Network => write!(f, "network"),
        }
    }
}

/// Declared hardware shape of one machine.
///
/// Built fresh from configuration for every run and never mutated by the
/// engine; the domain reconciler translates it into a backend definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainDescriptor {
    pub name: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub domain_type: String,
    pub memory_mib: u64,
    pub cpus: u32,
    pub cpu_mode: CpuMode,
    pub cpu_model: Option<String>,
    pub cpu_fallback: Option<String>,
    pub cpu_features: Vec<CpuFeature>,
    pub cpu_topology: Option<CpuTopology>,
    pub nested: bool,
    pub machine_type: Option<String>,
    pub machine_arch: Option<String>,
    pub emulator_path: Option<String>,
    /// Bus of the disks cloned from the box
    pub disk_bus: DiskBus,
    pub disks: Vec<DiskSpec>,
    /// All interfaces in attachment order, management interface first
    pub interfaces: Vec<NetworkAttachment>,
    pub nic_model_type: String,
    pub graphics: GraphicsSettings,
    pub video: Option<VideoSettings>,
    pub tpm: Option<TpmSettings>,
    pub boot_order: Vec<BootDevice>,
    pub kernel: Option<String>,
    pub initrd: Option<String>,
    pub cmdline: Option<String>,
}

/// A host-to-guest TCP port forward
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardedPort {
    pub host_ip: String,
    pub host_port: u16,
    pub guest_ip: Option<String>,
    pub guest_port: u16,
    pub protocol: String,
    pub gateway_ports: bool,
}

impl Default for ForwardedPort {
    fn default() -> Self {
        Self {
            host_ip: "127.0.0.1".to_string(),
            host_port: 0,
            guest_ip: None,
            guest_port: 0,
            protocol: "tcp".to_string(),
            gateway_ports: false,
        }
    }
}

/// One disk image shipped inside a box
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoxDisk {
    pub path: PathBuf,
    pub virtual_size_gib: u64,
    #[serde(default = "default_box_format")]
    pub format: String,
}

fn default_box_format() -> String {
    "qcow2".to_string()
}

/// Identity and disk images of the base box a machine is cloned from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoxDescriptor {
    pub name: String,
    pub version: String,
    pub disks: Vec<BoxDisk>,
}
