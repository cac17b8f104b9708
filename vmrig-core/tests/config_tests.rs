use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::io::Write;
use std::net::Ipv4Addr;
use std::time::Duration;
use tempfile::NamedTempFile;

use vmrig_core::config::{ConfigBuilder, MachineConfig, SuspendMode};
use vmrig_core::types::{CpuTopology, DiskBus, ForwardMode, NetworkAttachment, NetworkKind};
use vmrig_core::VmrigError;

#[test]
fn test_default_config() {
    let config = MachineConfig::default();

    assert_eq!(config.machine_name, "default");
    assert_eq!(config.connection.backend, "mock");
    assert!(config.management_network.enabled);
    assert_eq!(config.management_network.name, "vagrant-libvirt");
    assert_eq!(config.management_network.address.to_string(), "192.168.121.0/24");
    assert_eq!(config.storage.pool_name, "default");
    assert_eq!(config.timeouts.boot_timeout, Duration::from_secs(300));
    assert!(config.policy.destroy_on_error);
    assert!(!config.policy.halt_on_error);
    assert_eq!(config.domain.suspend_mode, SuspendMode::Pause);
    assert!(config.validate().is_ok());
}

#[test]
fn test_load_from_toml() {
    let contents = r#"
machine_name = "web"

[connection]
host = "hv1.example.com"
username = "ops"

[domain]
memory_mib = 2048
cpus = 4
disk_bus = "scsi"
suspend_mode = "managedsave"

[management_network]
name = "mgmt"
address = "10.99.0.0/24"
mode = "route"

[[networks]]
ip = "10.20.30.40"
netmask = "255.255.255.0"
dhcp_enabled = false

[[disks]]
name = "data"
type = "raw"
size_gib = 40

[[forwarded_ports]]
host_port = 8080
guest_port = 80

[timeouts]
boot_timeout = "5m"
graceful_halt_timeout = "30s"
poll_interval = "500ms"

[policy]
halt_on_error = true

[box]
name = "acme/debian"
version = "12.1"

[[box.disks]]
path = "/boxes/debian/box.img"
virtual_size_gib = 20
"#;
    let config = MachineConfig::from_toml(contents).unwrap();
    config.validate().unwrap();

    assert_eq!(config.machine_name, "web");
    assert_eq!(
        config.connection.uri().unwrap(),
        "qemu+ssh://ops@hv1.example.com/system"
    );
    assert_eq!(config.domain.memory_mib, 2048);
    assert_eq!(config.domain.disk_bus, DiskBus::Scsi);
    assert_eq!(config.domain.suspend_mode, SuspendMode::Managedsave);
    assert_eq!(config.management_network.mode, ForwardMode::Route);

    assert_eq!(config.networks.len(), 1);
    assert_eq!(config.networks[0].kind, NetworkKind::Private);
    assert_eq!(config.networks[0].ip, Some(Ipv4Addr::new(10, 20, 30, 40)));
    assert_eq!(config.networks[0].dhcp_enabled, Some(false));

    assert_eq!(config.disks[0].format, "raw");
    assert_eq!(config.disks[0].size_gib, 40);
    assert_eq!(config.forwarded_ports[0].host_ip, "127.0.0.1");

    assert_eq!(config.timeouts.boot_timeout, Duration::from_secs(300));
    assert_eq!(config.timeouts.poll_interval, Duration::from_millis(500));
    assert!(config.policy.halt_on_error);
    assert!(config.policy.destroy_on_error);

    let image = config.box_image.unwrap();
    assert_eq!(image.name, "acme/debian");
    assert_eq!(image.disks[0].format, "qcow2");
}

#[test]
fn test_from_file_validates() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "[domain]\ncpus = 0").unwrap();

    let err = MachineConfig::from_file(file.path()).unwrap_err();
    assert!(err.is_configuration());
    assert!(err.to_string().contains("domain.cpus"));
}

#[test]
fn test_from_file_missing() {
    let err = MachineConfig::from_file("/nonexistent/vmrig.toml").unwrap_err();
    assert!(err.is_configuration());
}

#[test]
fn test_invalid_toml_is_rejected() {
    let err = MachineConfig::from_toml("machine_name = [").unwrap_err();
    assert!(matches!(err, VmrigError::TomlError(_)));
}

#[test]
fn test_builder_rejects_invalid_values() {
    assert!(ConfigBuilder::new().machine_name("").build().is_err());
    assert!(ConfigBuilder::new().memory_mib(0).build().is_err());
    assert!(ConfigBuilder::new().storage_pool("").build().is_err());
    assert!(ConfigBuilder::new().uri("not a uri").build().is_err());

    let public = NetworkAttachment {
        kind: NetworkKind::Public,
        ..Default::default()
    };
    assert!(ConfigBuilder::new().network(public).build().is_err());

    let no_address = NetworkAttachment::private_dhcp().with_dhcp(false);
    assert!(ConfigBuilder::new().network(no_address).build().is_err());

    let named = NetworkAttachment::named("lab").with_dhcp(false);
    assert!(ConfigBuilder::new().network(named).build().is_ok());
}

#[test]
fn test_builder_sets_policy() {
    let config = ConfigBuilder::new()
        .machine_name("db")
        .default_prefix("lab")
        .destroy_on_error(false)
        .force_confirm_destroy(true)
        .management_network(false)
        .build()
        .unwrap();

    assert_eq!(config.machine_name, "db");
    assert_eq!(config.domain.default_prefix.as_deref(), Some("lab"));
    assert!(!config.policy.destroy_on_error);
    assert!(config.policy.force_confirm_destroy);
    assert!(!config.management_network.enabled);
}

proptest! {
    #[test]
    fn test_topology_must_match_cpu_count(
        sockets in 1u32..4,
        cores in 1u32..4,
        threads in 1u32..3,
        extra in 0u32..3,
    ) {
        let total = sockets * cores * threads;
        let mut config = MachineConfig::default();
        config.domain.cpus = total + extra;
        config.domain.cpu_topology = Some(CpuTopology { sockets, cores, threads });

        prop_assert_eq!(config.validate().is_ok(), extra == 0);
    }

    #[test]
    fn test_positive_hardware_is_valid(memory in 1u64..65536, cpus in 1u32..64) {
        let config = ConfigBuilder::new().memory_mib(memory).cpus(cpus).build();
        prop_assert!(config.is_ok());
    }
}
