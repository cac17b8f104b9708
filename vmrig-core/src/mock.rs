//! In-memory backend for tests and dry runs
//!
//! Behaves like a small hypervisor: domains move through power states,
//! networks hand out DHCP leases to running domains, volumes live in pools.
//! Every call is recorded and any operation can be made to fail, so the
//! orchestration engine can be exercised without a real hypervisor.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;

use crate::backend::VirtBackend;
use crate::definition::{
    DeviceAddress, DomainDefinition, DomainInfo, InterfaceAddress, InterfaceDefinition,
    InterfaceSource, NetworkDefinition, NetworkInfo, PoolInfo, SnapshotInfo,
    StoragePoolDefinition, VolumeDefinition, VolumeInfo,
};
use crate::error::{VmrigError, VmrigResult};
use crate::types::DomainPowerState;

#[derive(Debug, Clone)]
struct MockDomain {
    definition: DomainDefinition,
    state: DomainPowerState,
    managed_save: bool,
    snapshots: Vec<SnapshotInfo>,
    leases: Vec<InterfaceAddress>,
}

#[derive(Debug, Clone)]
struct MockVolume {
    info: VolumeInfo,
    bytes_written: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailMode {
    Once,
    Always,
}

#[derive(Default)]
struct MockState {
    domains: BTreeMap<String, MockDomain>,
    networks: BTreeMap<String, NetworkInfo>,
    pools: BTreeMap<String, PoolInfo>,
    volumes: BTreeMap<(String, String), MockVolume>,
    host_interfaces: Vec<String>,
    calls: Vec<String>,
    failures: HashMap<String, (FailMode, String)>,
    next_lease: HashMap<String, u32>,
    mac_counter: u32,
    pci_slot: u32,
    ignore_shutdown: bool,
    no_leases: bool,
}

/// Mock backend for testing
pub struct MockBackend {
    uri: String,
    state: Mutex<MockState>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::with_uri("qemu:///system")
    }

    pub fn with_uri(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            state: Mutex::new(MockState {
                host_interfaces: vec!["lo".to_string(), "eth0".to_string()],
                pci_slot: 2,
                ..Default::default()
            }),
        }
    }

    /// Make every following call of `operation` fail
    pub fn fail_on(&self, operation: &str, message: impl Into<String>) {
        self.state
            .lock()
            .failures
            .insert(operation.to_string(), (FailMode::Always, message.into()));
    }

    /// Make only the next call of `operation` fail
    pub fn fail_once(&self, operation: &str, message: impl Into<String>) {
        self.state
            .lock()
            .failures
            .insert(operation.to_string(), (FailMode::Once, message.into()));
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// Guests ignore ACPI shutdown requests
    pub fn set_ignore_shutdown(&self, ignore: bool) {
        self.state.lock().ignore_shutdown = ignore;
    }

    /// Running domains never obtain DHCP leases
    pub fn set_no_leases(&self, no_leases: bool) {
        self.state.lock().no_leases = no_leases;
    }

    /// Every backend call made so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| call.as_str() == operation)
            .count()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Pre-seed a network as if created outside this process
    pub fn add_network(
        &self,
        mut definition: NetworkDefinition,
        active: bool,
        autostart: bool,
    ) -> NetworkInfo {
        let uuid = definition
            .uuid
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        definition.uuid = Some(uuid.clone());
        let info = NetworkInfo {
            definition,
            uuid,
            active,
            autostart,
        };
        self.state
            .lock()
            .networks
            .insert(info.definition.name.clone(), info.clone());
        info
    }

    pub fn add_pool(&self, name: &str, path: &str, active: bool) {
        self.state.lock().pools.insert(
            name.to_string(),
            PoolInfo {
                name: name.to_string(),
                path: path.to_string(),
                active,
                autostart: active,
            },
        );
    }

    pub fn add_volume(&self, pool: &str, name: &str, capacity_bytes: u64) -> VmrigResult<()> {
        let mut state = self.state.lock();
        let path = volume_path(&state, pool, name)?;
        state.volumes.insert(
            (pool.to_string(), name.to_string()),
            MockVolume {
                info: VolumeInfo {
                    name: name.to_string(),
                    pool: pool.to_string(),
                    path,
                    capacity_bytes,
                    format: "qcow2".to_string(),
                },
                bytes_written: capacity_bytes,
            },
        );
        Ok(())
    }

    pub fn add_host_interface(&self, name: &str) {
        self.state.lock().host_interfaces.push(name.to_string());
    }

    /// Force a domain into a power state, bypassing transitions
    pub fn set_domain_state(&self, name: &str, power: DomainPowerState) -> VmrigResult<()> {
        let mut state = self.state.lock();
        let domain = state
            .domains
            .get_mut(name)
            .ok_or_else(|| VmrigError::not_found(format!("domain {}", name)))?;
        domain.state = power;
        Ok(())
    }

    pub fn volume_bytes_written(&self, pool: &str, name: &str) -> Option<u64> {
        self.state
            .lock()
            .volumes
            .get(&(pool.to_string(), name.to_string()))
            .map(|volume| volume.bytes_written)
    }

    pub fn volume(&self, pool: &str, name: &str) -> Option<VolumeInfo> {
        self.state
            .lock()
            .volumes
            .get(&(pool.to_string(), name.to_string()))
            .map(|volume| volume.info.clone())
    }

    fn check(&self, operation: &str) -> VmrigResult<parking_lot::MutexGuard<'_, MockState>> {
        let mut state = self.state.lock();
        state.calls.push(operation.to_string());
        if let Some((mode, message)) = state.failures.get(operation).cloned() {
            if mode == FailMode::Once {
                state.failures.remove(operation);
            }
            return Err(VmrigError::backend(operation, message));
        }
        Ok(state)
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn volume_path(state: &MockState, pool: &str, name: &str) -> VmrigResult<String> {
    let pool = state
        .pools
        .get(pool)
        .ok_or_else(|| VmrigError::not_found(format!("storage pool {}", pool)))?;
    Ok(format!("{}/{}", pool.path.trim_end_matches('/'), name))
}

fn pci_address(slot: u32) -> DeviceAddress {
    let mut address = DeviceAddress::new();
    address.insert("type".to_string(), "pci".to_string());
    address.insert("domain".to_string(), "0x0000".to_string());
    address.insert("bus".to_string(), "0x00".to_string());
    address.insert("slot".to_string(), format!("0x{:02x}", slot));
    address.insert("function".to_string(), "0x0".to_string());
    address
}

fn domain_info(domain: &MockDomain) -> DomainInfo {
    DomainInfo {
        name: domain.definition.name.clone(),
        uuid: domain.definition.uuid.clone().unwrap_or_default(),
        state: domain.state,
    }
}

fn lookup<'a>(state: &'a mut MockState, name: &str) -> VmrigResult<&'a mut MockDomain> {
    state
        .domains
        .get_mut(name)
        .ok_or_else(|| VmrigError::not_found(format!("domain {}", name)))
}

fn not_in_state(operation: &str, name: &str, power: DomainPowerState) -> VmrigError {
    VmrigError::backend(
        operation,
        format!("domain '{}' is in state {:?}", name, power),
    )
}

impl MockState {
    fn next_mac(&mut self) -> String {
        self.mac_counter += 1;
        let n = self.mac_counter;
        format!(
            "52:54:00:{:02x}:{:02x}:{:02x}",
            (n >> 16) & 0xff,
            (n >> 8) & 0xff,
            n & 0xff
        )
    }

    fn next_pci(&mut self) -> DeviceAddress {
        self.pci_slot += 1;
        pci_address(self.pci_slot)
    }

    fn assign_backend_fields(&mut self, definition: &mut DomainDefinition) {
        for disk in &mut definition.disks {
            if disk.address.is_none() {
                disk.address = Some(self.next_pci());
            }
        }
        for iface in &mut definition.interfaces {
            if iface.mac.is_none() {
                iface.mac = Some(self.next_mac());
            }
            if iface.address.is_none() {
                iface.address = Some(self.next_pci());
            }
        }
        if let Some(video) = &mut definition.video {
            if video.address.is_none() {
                video.address = Some(self.next_pci());
            }
        }
    }

    fn lease(&mut self, network: &str, mac: &str) -> Option<InterfaceAddress> {
        let info = self.networks.get(network)?;
        if !info.active {
            return None;
        }
        let range = info.definition.ip.as_ref()?.dhcp?;
        let offset = self.next_lease.entry(network.to_string()).or_insert(0);
        let ip = Ipv4Addr::from(u32::from(range.start) + *offset);
        if ip > range.end {
            return None;
        }
        *offset += 1;
        Some(InterfaceAddress {
            mac: mac.to_string(),
            ip,
        })
    }

    fn grant_leases(&mut self, name: &str) {
        if self.no_leases {
            return;
        }
        let Some(domain) = self.domains.get(name) else {
            return;
        };
        let wanted: Vec<(String, String)> = domain
            .definition
            .interfaces
            .iter()
            .filter_map(|iface| match (&iface.source, &iface.mac) {
                (InterfaceSource::Network { network }, Some(mac))
                    if !domain.leases.iter().any(|lease| &lease.mac == mac) =>
                {
                    Some((network.clone(), mac.clone()))
                }
                _ => None,
            })
            .collect();
        let mut granted = Vec::new();
        for (network, mac) in wanted {
            if let Some(lease) = self.lease(&network, &mac) {
                granted.push(lease);
            }
        }
        if let Some(domain) = self.domains.get_mut(name) {
            domain.leases.extend(granted);
        }
    }
}

#[async_trait]
impl VirtBackend for MockBackend {
    fn uri(&self) -> &str {
        &self.uri
    }

    async fn lookup_domain(&self, name: &str) -> VmrigResult<Option<DomainInfo>> {
        let state = self.check("lookup_domain")?;
        Ok(state.domains.get(name).map(domain_info))
    }

    async fn lookup_domain_by_uuid(&self, uuid: &str) -> VmrigResult<Option<DomainInfo>> {
        let state = self.check("lookup_domain_by_uuid")?;
        Ok(state
            .domains
            .values()
            .find(|domain| domain.definition.uuid.as_deref() == Some(uuid))
            .map(domain_info))
    }

    async fn list_domains(&self) -> VmrigResult<Vec<DomainInfo>> {
        let state = self.check("list_domains")?;
        Ok(state.domains.values().map(domain_info).collect())
    }

    async fn domain_definition(&self, name: &str, inactive: bool) -> VmrigResult<DomainDefinition> {
        let mut state = self.check("domain_definition")?;
        let domain = lookup(&mut state, name)?;
        let mut definition = domain.definition.clone();
        if !inactive && domain.state == DomainPowerState::Running {
            for (index, disk) in definition.disks.iter_mut().enumerate() {
                if disk.alias.is_none() {
                    disk.alias = Some(format!("virtio-disk{}", index));
                }
            }
            for (index, iface) in definition.interfaces.iter_mut().enumerate() {
                if iface.alias.is_none() {
                    iface.alias = Some(format!("net{}", index));
                }
                if iface.target_dev.is_none() {
                    iface.target_dev = Some(format!("vnet{}", index));
                }
            }
        }
        Ok(definition)
    }

    async fn define_domain(&self, definition: &DomainDefinition) -> VmrigResult<DomainInfo> {
        let mut state = self.check("define_domain")?;
        let mut definition = definition.clone();

        let existing = state.domains.get(&definition.name).cloned();
        if let Some(existing) = &existing {
            if definition.uuid.is_some() && definition.uuid != existing.definition.uuid {
                return Err(VmrigError::backend(
                    "define_domain",
                    format!("domain '{}' already exists with another uuid", definition.name),
                ));
            }
            definition.uuid = existing.definition.uuid.clone();
        }
        if let Some(uuid) = &definition.uuid {
            let taken = state.domains.values().any(|d| {
                d.definition.uuid.as_ref() == Some(uuid) && d.definition.name != definition.name
            });
            if taken {
                return Err(VmrigError::backend(
                    "define_domain",
                    format!("uuid {} is already in use", uuid),
                ));
            }
        } else {
            definition.uuid = Some(uuid::Uuid::new_v4().to_string());
        }

        state.assign_backend_fields(&mut definition);

        let domain = match existing {
            Some(mut existing) => {
                existing.definition = definition;
                existing
            }
            None => MockDomain {
                definition,
                state: DomainPowerState::Shutoff,
                managed_save: false,
                snapshots: Vec::new(),
                leases: Vec::new(),
            },
        };
        let info = domain_info(&domain);
        state.domains.insert(info.name.clone(), domain);
        tracing::debug!("Mock: defined domain '{}'", info.name);
        Ok(info)
    }

    async fn undefine_domain(&self, name: &str) -> VmrigResult<()> {
        let mut state = self.check("undefine_domain")?;
        state
            .domains
            .remove(name)
            .ok_or_else(|| VmrigError::not_found(format!("domain {}", name)))?;
        Ok(())
    }

    async fn start_domain(&self, name: &str) -> VmrigResult<()> {
        let mut state = self.check("start_domain")?;
        let domain = lookup(&mut state, name)?;
        if domain.state == DomainPowerState::Running {
            return Err(not_in_state("start_domain", name, domain.state));
        }
        let networks: Vec<String> = domain
            .definition
            .network_names()
            .into_iter()
            .map(String::from)
            .collect();
        for network in &networks {
            let active = state
                .networks
                .get(network)
                .map(|n| n.active)
                .unwrap_or(false);
            if !active {
                return Err(VmrigError::backend(
                    "start_domain",
                    format!("network '{}' is not active", network),
                ));
            }
        }
        let domain = lookup(&mut state, name)?;
        domain.state = DomainPowerState::Running;
        domain.managed_save = false;
        state.grant_leases(name);
        Ok(())
    }

    async fn shutdown_domain(&self, name: &str) -> VmrigResult<()> {
        let mut state = self.check("shutdown_domain")?;
        let ignore = state.ignore_shutdown;
        let domain = lookup(&mut state, name)?;
        if domain.state != DomainPowerState::Running {
            return Err(not_in_state("shutdown_domain", name, domain.state));
        }
        if !ignore {
            domain.state = DomainPowerState::Shutoff;
        }
        Ok(())
    }

    async fn poweroff_domain(&self, name: &str) -> VmrigResult<()> {
        let mut state = self.check("poweroff_domain")?;
        let domain = lookup(&mut state, name)?;
        match domain.state {
            DomainPowerState::Shutoff | DomainPowerState::Shutdown => {
                Err(not_in_state("poweroff_domain", name, domain.state))
            }
            _ => {
                domain.state = DomainPowerState::Shutoff;
                Ok(())
            }
        }
    }

    async fn suspend_domain(&self, name: &str) -> VmrigResult<()> {
        let mut state = self.check("suspend_domain")?;
        let domain = lookup(&mut state, name)?;
        if domain.state != DomainPowerState::Running {
            return Err(not_in_state("suspend_domain", name, domain.state));
        }
        domain.state = DomainPowerState::Paused;
        Ok(())
    }

    async fn resume_domain(&self, name: &str) -> VmrigResult<()> {
        let mut state = self.check("resume_domain")?;
        let domain = lookup(&mut state, name)?;
        if domain.state != DomainPowerState::Paused {
            return Err(not_in_state("resume_domain", name, domain.state));
        }
        domain.state = DomainPowerState::Running;
        Ok(())
    }

    async fn managed_save(&self, name: &str) -> VmrigResult<()> {
        let mut state = self.check("managed_save")?;
        let domain = lookup(&mut state, name)?;
        match domain.state {
            DomainPowerState::Running | DomainPowerState::Paused => {
                domain.state = DomainPowerState::Shutoff;
                domain.managed_save = true;
                Ok(())
            }
            other => Err(not_in_state("managed_save", name, other)),
        }
    }

    async fn has_managed_save(&self, name: &str) -> VmrigResult<bool> {
        let mut state = self.check("has_managed_save")?;
        Ok(lookup(&mut state, name)?.managed_save)
    }

    async fn remove_managed_save(&self, name: &str) -> VmrigResult<()> {
        let mut state = self.check("remove_managed_save")?;
        lookup(&mut state, name)?.managed_save = false;
        Ok(())
    }

    async fn domain_state(&self, name: &str) -> VmrigResult<Option<DomainPowerState>> {
        let state = self.check("domain_state")?;
        Ok(state.domains.get(name).map(|domain| domain.state))
    }

    async fn attach_interface(
        &self,
        name: &str,
        interface: &InterfaceDefinition,
    ) -> VmrigResult<()> {
        let mut state = self.check("attach_interface")?;
        let mut interface = interface.clone();
        if interface.mac.is_none() {
            interface.mac = Some(state.next_mac());
        }
        if interface.address.is_none() {
            interface.address = Some(state.next_pci());
        }
        let domain = lookup(&mut state, name)?;
        let running = domain.state == DomainPowerState::Running;
        domain.definition.interfaces.push(interface);
        if running {
            state.grant_leases(name);
        }
        Ok(())
    }

    async fn domain_interface_addresses(&self, name: &str) -> VmrigResult<Vec<InterfaceAddress>> {
        let mut state = self.check("domain_interface_addresses")?;
        let domain = lookup(&mut state, name)?;
        if domain.state != DomainPowerState::Running {
            return Ok(Vec::new());
        }
        Ok(domain.leases.clone())
    }

    async fn list_networks(&self) -> VmrigResult<Vec<NetworkInfo>> {
        let state = self.check("list_networks")?;
        Ok(state.networks.values().cloned().collect())
    }

    async fn lookup_network(&self, name: &str) -> VmrigResult<Option<NetworkInfo>> {
        let state = self.check("lookup_network")?;
        Ok(state.networks.get(name).cloned())
    }

    async fn lookup_network_by_uuid(&self, uuid: &str) -> VmrigResult<Option<NetworkInfo>> {
        let state = self.check("lookup_network_by_uuid")?;
        Ok(state.networks.values().find(|n| n.uuid == uuid).cloned())
    }

    async fn define_network(&self, definition: &NetworkDefinition) -> VmrigResult<NetworkInfo> {
        let mut state = self.check("define_network")?;
        if state.networks.contains_key(&definition.name) {
            return Err(VmrigError::backend(
                "define_network",
                format!("network '{}' already exists", definition.name),
            ));
        }
        if state
            .networks
            .values()
            .any(|n| n.definition.bridge == definition.bridge)
        {
            return Err(VmrigError::backend(
                "define_network",
                format!("bridge '{}' is already in use", definition.bridge),
            ));
        }
        let mut definition = definition.clone();
        let uuid = definition
            .uuid
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        definition.uuid = Some(uuid.clone());
        let info = NetworkInfo {
            definition,
            uuid,
            active: false,
            autostart: false,
        };
        state
            .networks
            .insert(info.definition.name.clone(), info.clone());
        Ok(info)
    }

    async fn start_network(&self, name: &str) -> VmrigResult<()> {
        let mut state = self.check("start_network")?;
        let network = state
            .networks
            .get_mut(name)
            .ok_or_else(|| VmrigError::not_found(format!("network {}", name)))?;
        if network.active {
            return Err(VmrigError::backend(
                "start_network",
                format!("network '{}' is already active", name),
            ));
        }
        network.active = true;
        Ok(())
    }

    async fn set_network_autostart(&self, name: &str, autostart: bool) -> VmrigResult<()> {
        let mut state = self.check("set_network_autostart")?;
        let network = state
            .networks
            .get_mut(name)
            .ok_or_else(|| VmrigError::not_found(format!("network {}", name)))?;
        network.autostart = autostart;
        Ok(())
    }

    async fn destroy_network(&self, name: &str) -> VmrigResult<()> {
        let mut state = self.check("destroy_network")?;
        let network = state
            .networks
            .get_mut(name)
            .ok_or_else(|| VmrigError::not_found(format!("network {}", name)))?;
        network.active = false;
        Ok(())
    }

    async fn undefine_network(&self, name: &str) -> VmrigResult<()> {
        let mut state = self.check("undefine_network")?;
        state
            .networks
            .remove(name)
            .ok_or_else(|| VmrigError::not_found(format!("network {}", name)))?;
        state.next_lease.remove(name);
        Ok(())
    }

    async fn list_host_interfaces(&self) -> VmrigResult<Vec<String>> {
        let state = self.check("list_host_interfaces")?;
        let mut interfaces = state.host_interfaces.clone();
        interfaces.extend(
            state
                .networks
                .values()
                .filter(|n| n.active)
                .map(|n| n.definition.bridge.clone()),
        );
        Ok(interfaces)
    }

    async fn lookup_pool(&self, name: &str) -> VmrigResult<Option<PoolInfo>> {
        let state = self.check("lookup_pool")?;
        Ok(state.pools.get(name).cloned())
    }

    async fn define_pool(&self, definition: &StoragePoolDefinition) -> VmrigResult<PoolInfo> {
        let mut state = self.check("define_pool")?;
        if state.pools.contains_key(&definition.name) {
            return Err(VmrigError::backend(
                "define_pool",
                format!("pool '{}' already exists", definition.name),
            ));
        }
        let info = PoolInfo {
            name: definition.name.clone(),
            path: definition.path.clone(),
            active: false,
            autostart: false,
        };
        state.pools.insert(info.name.clone(), info.clone());
        Ok(info)
    }

    async fn build_pool(&self, name: &str) -> VmrigResult<()> {
        let state = self.check("build_pool")?;
        if !state.pools.contains_key(name) {
            return Err(VmrigError::not_found(format!("storage pool {}", name)));
        }
        Ok(())
    }

    async fn start_pool(&self, name: &str) -> VmrigResult<()> {
        let mut state = self.check("start_pool")?;
        let pool = state
            .pools
            .get_mut(name)
            .ok_or_else(|| VmrigError::not_found(format!("storage pool {}", name)))?;
        pool.active = true;
        Ok(())
    }

    async fn set_pool_autostart(&self, name: &str, autostart: bool) -> VmrigResult<()> {
        let mut state = self.check("set_pool_autostart")?;
        let pool = state
            .pools
            .get_mut(name)
            .ok_or_else(|| VmrigError::not_found(format!("storage pool {}", name)))?;
        pool.autostart = autostart;
        Ok(())
    }

    async fn refresh_pool(&self, name: &str) -> VmrigResult<()> {
        let state = self.check("refresh_pool")?;
        if !state.pools.contains_key(name) {
            return Err(VmrigError::not_found(format!("storage pool {}", name)));
        }
        Ok(())
    }

    async fn lookup_volume(&self, pool: &str, name: &str) -> VmrigResult<Option<VolumeInfo>> {
        let state = self.check("lookup_volume")?;
        Ok(state
            .volumes
            .get(&(pool.to_string(), name.to_string()))
            .map(|volume| volume.info.clone()))
    }

    async fn list_volumes(&self, pool: &str) -> VmrigResult<Vec<VolumeInfo>> {
        let state = self.check("list_volumes")?;
        Ok(state
            .volumes
            .iter()
            .filter(|((volume_pool, _), _)| volume_pool == pool)
            .map(|(_, volume)| volume.info.clone())
            .collect())
    }

    async fn create_volume(
        &self,
        pool: &str,
        definition: &VolumeDefinition,
    ) -> VmrigResult<VolumeInfo> {
        let mut state = self.check("create_volume")?;
        let active = state.pools.get(pool).map(|p| p.active).unwrap_or(false);
        if !active {
            return Err(VmrigError::backend(
                "create_volume",
                format!("storage pool '{}' is not active", pool),
            ));
        }
        let key = (pool.to_string(), definition.name.clone());
        if state.volumes.contains_key(&key) {
            return Err(VmrigError::backend(
                "create_volume",
                format!("storage volume '{}' already exists", definition.name),
            ));
        }
        if let Some(backing) = &definition.backing_store {
            if !state.volumes.values().any(|v| v.info.path == backing.path) {
                return Err(VmrigError::backend(
                    "create_volume",
                    format!("backing store '{}' does not exist", backing.path),
                ));
            }
        }
        let info = VolumeInfo {
            name: definition.name.clone(),
            pool: pool.to_string(),
            path: volume_path(&state, pool, &definition.name)?,
            capacity_bytes: definition.capacity_bytes,
            format: definition.format.clone(),
        };
        state.volumes.insert(
            key,
            MockVolume {
                info: info.clone(),
                bytes_written: 0,
            },
        );
        Ok(info)
    }

    async fn upload_volume_chunk(
        &self,
        pool: &str,
        name: &str,
        offset: u64,
        data: &[u8],
    ) -> VmrigResult<()> {
        let mut state = self.check("upload_volume_chunk")?;
        let volume = state
            .volumes
            .get_mut(&(pool.to_string(), name.to_string()))
            .ok_or_else(|| VmrigError::not_found(format!("volume {}/{}", pool, name)))?;
        volume.bytes_written = volume.bytes_written.max(offset + data.len() as u64);
        Ok(())
    }

    async fn delete_volume(&self, pool: &str, name: &str) -> VmrigResult<()> {
        let mut state = self.check("delete_volume")?;
        state
            .volumes
            .remove(&(pool.to_string(), name.to_string()))
            .ok_or_else(|| VmrigError::not_found(format!("volume {}/{}", pool, name)))?;
        Ok(())
    }

    async fn create_snapshot(
        &self,
        domain: &str,
        name: &str,
        description: Option<&str>,
    ) -> VmrigResult<SnapshotInfo> {
        let mut state = self.check("create_snapshot")?;
        let entry = lookup(&mut state, domain)?;
        if entry.snapshots.iter().any(|s| s.name == name) {
            return Err(VmrigError::backend(
                "create_snapshot",
                format!("snapshot '{}' already exists", name),
            ));
        }
        let snapshot = SnapshotInfo {
            name: name.to_string(),
            description: description.map(String::from),
            state: entry.state,
        };
        entry.snapshots.push(snapshot.clone());
        Ok(snapshot)
    }

    async fn list_snapshots(&self, domain: &str) -> VmrigResult<Vec<SnapshotInfo>> {
        let mut state = self.check("list_snapshots")?;
        Ok(lookup(&mut state, domain)?.snapshots.clone())
    }

    async fn revert_snapshot(&self, domain: &str, name: &str) -> VmrigResult<()> {
        let mut state = self.check("revert_snapshot")?;
        let entry = lookup(&mut state, domain)?;
        let snapshot = entry
            .snapshots
            .iter()
            .find(|s| s.name == name)
            .cloned()
            .ok_or_else(|| VmrigError::not_found(format!("snapshot {}", name)))?;
        entry.state = snapshot.state;
        Ok(())
    }

    async fn delete_snapshot(&self, domain: &str, name: &str) -> VmrigResult<()> {
        let mut state = self.check("delete_snapshot")?;
        let entry = lookup(&mut state, domain)?;
        let before = entry.snapshots.len();
        entry.snapshots.retain(|s| s.name != name);
        if entry.snapshots.len() == before {
            return Err(VmrigError::not_found(format!("snapshot {}", name)));
        }
        Ok(())
    }
}
