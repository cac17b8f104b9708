//! Per-machine configuration with TOML support
//!
//! This module provides the declared configuration of one managed machine:
//! - Loads from TOML files
//! - Supports environment variable overrides
//! - Validates configuration values before any backend call is made
//! - Derives the connection URI and the [`DomainDescriptor`] for a run

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::error::{VmrigError, VmrigResult};
use crate::types::{
    BoxDescriptor, BootDevice, CpuFeature, CpuMode, CpuTopology, DiskBus, DiskSpec,
    DomainDescriptor, ForwardMode, ForwardedPort, GraphicsSettings, NetworkAttachment,
    NetworkKind, TpmSettings, VideoSettings,
};

/// Complete configuration of one managed machine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    /// Name of the machine within the host environment (e.g. "default")
    pub machine_name: String,

    /// Hypervisor connection
    pub connection: ConnectionSettings,

    /// Hardware and naming of the domain
    pub domain: DomainSettings,

    /// Storage pool used for box and machine volumes
    pub storage: StorageSettings,

    /// Additional disks
    pub disks: Vec<DiskSpec>,

    /// Network interfaces, after the management interface
    pub networks: Vec<NetworkAttachment>,

    /// Management network used to reach the machine
    pub management_network: ManagementNetworkSettings,

    pub forwarded_ports: Vec<ForwardedPort>,

    /// Guest SSH access used by port forwarding
    pub ssh: SshSettings,

    /// Base box the root disk is cloned from
    #[serde(rename = "box")]
    pub box_image: Option<BoxDescriptor>,

    pub timeouts: TimeoutSettings,

    /// Failure handling
    pub policy: PolicySettings,

    pub logging: LoggingSettings,
}

/// Hypervisor connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Full connection URI; overrides every other field when set
    pub uri: Option<String>,

    /// Hypervisor driver, e.g. "qemu" or "kvm"
    pub driver: String,

    /// Remote host; local connection when unset
    pub host: Option<String>,

    /// "ssh", "tls", "tcp" or "unix"
    pub transport: Option<String>,

    pub username: Option<String>,

    pub id_ssh_key_file: Option<PathBuf>,

    pub socket: Option<String>,

    /// Connect to the per-user session daemon instead of the system one
    pub qemu_use_session: bool,

    /// Backend implementation registered with the backend registry
    pub backend: String,
}

/// Domain naming and hardware settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainSettings {
    /// Explicit domain name, bypassing prefix generation
    pub domain_name: Option<String>,
    /// Prefix for generated names; defaults to the project directory name
    pub default_prefix: Option<String>,
    /// Append a timestamp and random suffix to generated names
    pub random_hostname: bool,
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
    /// Expose hardware virtualization extensions to the guest
    pub nested: bool,
    pub machine_type: Option<String>,
    pub machine_arch: Option<String>,
    pub emulator_path: Option<String>,
    pub nic_model_type: String,
    pub disk_bus: DiskBus,
    /// Size of the root volume if larger than the box image
    pub machine_virtual_size_gib: Option<u64>,
    pub graphics: GraphicsSettings,
    pub video: Option<VideoSettings>,
    pub tpm: Option<TpmSettings>,
    pub boot_order: Vec<BootDevice>,
    pub kernel: Option<String>,
    pub initrd: Option<String>,
    pub cmdline: Option<String>,
    pub suspend_mode: SuspendMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SuspendMode {
    #[default]
    Pause,
    Managedsave,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub pool_name: String,
    /// Directory backing the default pool when it has to be created
    pub pool_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagementNetworkSettings {
    pub enabled: bool,
    pub name: String,
    pub address: Ipv4Net,
    pub mode: ForwardMode,
    pub mac: Option<String>,
    pub autostart: bool,
    pub model_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    pub username: String,
    pub port: u16,
    pub private_key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    /// Budget for address assignment and reachability
    #[serde(with = "humantime_serde")]
    pub boot_timeout: Duration,

    /// Budget for a clean guest shutdown before powering off
    #[serde(with = "humantime_serde")]
    pub graceful_halt_timeout: Duration,

    /// Delay between polls of any bounded wait
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySettings {
    /// Clean up after a failed `up`
    pub destroy_on_error: bool,
    /// Halt instead of destroying when cleaning up after a failed `up`
    pub halt_on_error: bool,
    /// Skip the destroy confirmation prompt
    pub force_confirm_destroy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            machine_name: "default".to_string(),
            connection: ConnectionSettings::default(),
            domain: DomainSettings::default(),
            storage: StorageSettings::default(),
            disks: Vec::new(),
            networks: Vec::new(),
            management_network: ManagementNetworkSettings::default(),
            forwarded_ports: Vec::new(),
            ssh: SshSettings::default(),
            box_image: None,
            timeouts: TimeoutSettings::default(),
            policy: PolicySettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            uri: None,
            driver: "kvm".to_string(),
            host: None,
            transport: None,
            username: None,
            id_ssh_key_file: None,
            socket: None,
            qemu_use_session: false,
            backend: "mock".to_string(),
        }
    }
}

impl Default for DomainSettings {
    fn default() -> Self {
        Self {
            domain_name: None,
            default_prefix: None,
            random_hostname: false,
            title: None,
            description: None,
            domain_type: "kvm".to_string(),
            memory_mib: 512,
            cpus: 1,
            cpu_mode: CpuMode::HostModel,
            cpu_model: None,
            cpu_fallback: None,
            cpu_features: Vec::new(),
            cpu_topology: None,
            nested: false,
            machine_type: None,
            machine_arch: None,
            emulator_path: None,
            nic_model_type: "virtio".to_string(),
            disk_bus: DiskBus::Virtio,
            machine_virtual_size_gib: None,
            graphics: GraphicsSettings::default(),
            video: Some(VideoSettings::default()),
            tpm: None,
            boot_order: Vec::new(),
            kernel: None,
            initrd: None,
            cmdline: None,
            suspend_mode: SuspendMode::Pause,
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            pool_name: DEFAULT_POOL_NAME.to_string(),
            pool_path: PathBuf::from("/var/lib/libvirt/images"),
        }
    }
}

impl Default for ManagementNetworkSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            name: "vagrant-libvirt".to_string(),
            address: management_address(),
            mode: ForwardMode::Nat,
            mac: None,
            autostart: false,
            model_type: None,
        }
    }
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            username: "vagrant".to_string(),
            port: 22,
            private_key_path: None,
        }
    }
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            boot_timeout: Duration::from_secs(300),
            graceful_halt_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(2),
        }
    }
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            destroy_on_error: true,
            halt_on_error: false,
            force_confirm_destroy: false,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

fn management_address() -> Ipv4Net {
    let network = Ipv4Addr::new(192, 168, 121, 0);
    Ipv4Net::new(network, 24).unwrap_or_else(|_| Ipv4Net::from(network))
}

/// Name of the only storage pool that is created on demand
pub const DEFAULT_POOL_NAME: &str = "default";

impl ConnectionSettings {
    /// Build the backend connection URI.
    ///
    /// `qemu:///system` for a local system connection,
    /// `qemu+ssh://user@host/system?keyfile=...` for a remote one.
    pub fn uri(&self) -> VmrigResult<String> {
        if let Some(uri) = &self.uri {
            Url::parse(uri).map_err(|e| {
                VmrigError::configuration("connection.uri", format!("invalid URI '{}': {}", uri, e))
            })?;
            return Ok(uri.clone());
        }

        let driver = match self.driver.as_str() {
            "kvm" | "qemu" => "qemu",
            other => other,
        };

        let transport = match (&self.transport, &self.host) {
            (Some(transport), _) => Some(transport.as_str()),
            (None, Some(_)) => Some("ssh"),
            (None, None) => None,
        };

        let mut uri = driver.to_string();
        if let Some(transport) = transport {
            if transport != "unix" || self.host.is_some() {
                uri.push('+');
                uri.push_str(transport);
            }
        }
        uri.push_str("://");
        if let Some(host) = &self.host {
            if let Some(username) = &self.username {
                uri.push_str(username);
                uri.push('@');
            }
            uri.push_str(host);
        }
        if driver == "qemu" {
            uri.push_str(if self.qemu_use_session {
                "/session"
            } else {
                "/system"
            });
        } else {
            uri.push('/');
        }

        let mut url = Url::parse(&uri).map_err(|e| {
            VmrigError::configuration("connection", format!("invalid URI '{}': {}", uri, e))
        })?;

        {
            let mut query = url.query_pairs_mut();
            if let Some(keyfile) = &self.id_ssh_key_file {
                query.append_pair("keyfile", &keyfile.to_string_lossy());
            }
            if let Some(socket) = &self.socket {
                query.append_pair("socket", socket);
            }
            if transport == Some("tls") {
                query.append_pair("no_verify", "1");
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }

        Ok(url.to_string())
    }
}

impl MachineConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> VmrigResult<Self> {
        let contents = fs::read_to_string(path.as_ref()).map_err(|e| {
            VmrigError::configuration(
                "config",
                format!("Failed to read {}: {}", path.as_ref().display(), e),
            )
        })?;

        let mut config = Self::from_toml(&contents)?;

        // Apply environment variable overrides
        config.apply_env_overrides();

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Parse configuration without overrides or validation
    pub fn from_toml(contents: &str) -> VmrigResult<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(uri) = std::env::var("VMRIG_URI") {
            self.connection.uri = Some(uri);
        }
        if let Ok(pool) = std::env::var("VMRIG_STORAGE_POOL") {
            self.storage.pool_name = pool;
        }
        if let Ok(level) = std::env::var("VMRIG_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(value) = std::env::var("VMRIG_DESTROY_ON_ERROR") {
            if let Ok(enabled) = value.parse() {
                self.policy.destroy_on_error = enabled;
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> VmrigResult<()> {
        if self.machine_name.is_empty() {
            return Err(VmrigError::configuration(
                "machine_name",
                "Machine name cannot be empty",
            ));
        }

        if self.domain.cpus == 0 {
            return Err(VmrigError::configuration(
                "domain.cpus",
                "At least one CPU is required",
            ));
        }

        if self.domain.memory_mib == 0 {
            return Err(VmrigError::configuration(
                "domain.memory_mib",
                "Memory must be greater than zero",
            ));
        }

        if let Some(topology) = &self.domain.cpu_topology {
            let total = topology.sockets * topology.cores * topology.threads;
            if total != self.domain.cpus {
                return Err(VmrigError::configuration(
                    "domain.cpu_topology",
                    format!(
                        "Topology provides {} CPUs but {} are configured",
                        total, self.domain.cpus
                    ),
                ));
            }
        }

        if self.domain.cpu_mode == CpuMode::Custom && self.domain.cpu_model.is_none() {
            return Err(VmrigError::configuration(
                "domain.cpu_model",
                "A CPU model is required when cpu_mode is custom",
            ));
        }

        if self.storage.pool_name.is_empty() {
            return Err(VmrigError::configuration(
                "storage.pool_name",
                "Storage pool name cannot be empty",
            ));
        }

        for (index, network) in self.networks.iter().enumerate() {
            match network.kind {
                NetworkKind::Tunnel => {
                    if network.tunnel_port.is_none() {
                        return Err(VmrigError::TunnelPortNotDefined { index });
                    }
                }
                NetworkKind::Public => {
                    if network.host_device.is_none() {
                        return Err(VmrigError::configuration(
                            format!("networks[{}].host_device", index),
                            "Public networks require a host device",
                        ));
                    }
                }
                NetworkKind::Private => {
                    if network.ip.is_none()
                        && network.network_name.is_none()
                        && network.dhcp_enabled == Some(false)
                    {
                        return Err(VmrigError::configuration(
                            format!("networks[{}]", index),
                            "A private network without an address needs DHCP",
                        ));
                    }
                }
            }
        }

        let mut host_ports = HashSet::new();
        for port in &self.forwarded_ports {
            if port.protocol != "tcp" {
                return Err(VmrigError::configuration(
                    "forwarded_ports",
                    format!("Only tcp forwarding is supported, got '{}'", port.protocol),
                ));
            }
            if !host_ports.insert((port.host_ip.clone(), port.host_port)) {
                return Err(VmrigError::configuration(
                    "forwarded_ports",
                    format!("Host port {} is forwarded twice", port.host_port),
                ));
            }
        }

        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(VmrigError::configuration(
                    "logging.level",
                    format!("Invalid log level: {}", self.logging.level),
                ))
            }
        }

        self.connection.uri()?;

        Ok(())
    }

    /// Build the hardware descriptor for a run of this machine
    pub fn domain_descriptor(&self, name: impl Into<String>) -> DomainDescriptor {
        let domain = &self.domain;
        DomainDescriptor {
            name: name.into(),
            title: domain.title.clone(),
            description: domain.description.clone(),
            domain_type: domain.domain_type.clone(),
            memory_mib: domain.memory_mib,
            cpus: domain.cpus,
            cpu_mode: domain.cpu_mode,
            cpu_model: domain.cpu_model.clone(),
            cpu_fallback: domain.cpu_fallback.clone(),
            cpu_features: domain.cpu_features.clone(),
            cpu_topology: domain.cpu_topology,
            nested: domain.nested,
            machine_type: domain.machine_type.clone(),
            machine_arch: domain.machine_arch.clone(),
            emulator_path: domain.emulator_path.clone(),
            disk_bus: domain.disk_bus,
            disks: self.disks.clone(),
            interfaces: self.networks.clone(),
            nic_model_type: domain.nic_model_type.clone(),
            graphics: domain.graphics.clone(),
            video: domain.video.clone(),
            tpm: domain.tpm.clone(),
            boot_order: domain.boot_order.clone(),
            kernel: domain.kernel.clone(),
            initrd: domain.initrd.clone(),
            cmdline: domain.cmdline.clone(),
        }
    }
}

/// Configuration builder for programmatic construction
pub struct ConfigBuilder {
    config: MachineConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: MachineConfig::default(),
        }
    }

    pub fn machine_name(mut self, name: impl Into<String>) -> Self {
        self.config.machine_name = name.into();
        self
    }

    pub fn default_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.domain.default_prefix = Some(prefix.into());
        self
    }

    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.config.connection.uri = Some(uri.into());
        self
    }

    pub fn memory_mib(mut self, memory: u64) -> Self {
        self.config.domain.memory_mib = memory;
        self
    }

    pub fn cpus(mut self, cpus: u32) -> Self {
        self.config.domain.cpus = cpus;
        self
    }

    pub fn disk(mut self, disk: DiskSpec) -> Self {
        self.config.disks.push(disk);
        self
    }

    pub fn network(mut self, network: NetworkAttachment) -> Self {
        self.config.networks.push(network);
        self
    }

    pub fn management_network(mut self, enabled: bool) -> Self {
        self.config.management_network.enabled = enabled;
        self
    }

    pub fn box_image(mut self, descriptor: BoxDescriptor) -> Self {
        self.config.box_image = Some(descriptor);
        self
    }

    pub fn forwarded_port(mut self, port: ForwardedPort) -> Self {
        self.config.forwarded_ports.push(port);
        self
    }

    pub fn storage_pool(mut self, name: impl Into<String>) -> Self {
        self.config.storage.pool_name = name.into();
        self
    }

    pub fn destroy_on_error(mut self, enabled: bool) -> Self {
        self.config.policy.destroy_on_error = enabled;
        self
    }

    pub fn halt_on_error(mut self, enabled: bool) -> Self {
        self.config.policy.halt_on_error = enabled;
        self
    }

    pub fn force_confirm_destroy(mut self, enabled: bool) -> Self {
        self.config.policy.force_confirm_destroy = enabled;
        self
    }

    pub fn timeouts(mut self, timeouts: TimeoutSettings) -> Self {
        self.config.timeouts = timeouts;
        self
    }

    pub fn build(self) -> VmrigResult<MachineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
