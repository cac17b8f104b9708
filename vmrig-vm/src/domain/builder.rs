//! Declared hardware to backend definition
//!
//! Everything here is a pure function of its inputs. The reconciler uses the
//! same helpers to compute desired values, so a domain built here and diffed
//! right away reports no change.

use vmrig_core::definition::{
    CpuDefinition, DiskDefinition, DomainDefinition, GraphicsDefinition, InterfaceDefinition,
    OsDefinition, TpmDefinition, VideoDefinition,
};
use vmrig_core::types::{BootDevice, CpuFeature, CpuMode, DiskSpec, DomainDescriptor, GraphicsType};

use crate::network::ResolvedInterface;

/// CPU features toggled by nested virtualization
const NESTED_FEATURES: [&str; 2] = ["vmx", "svm"];

const DOMAIN_FEATURES: [&str; 3] = ["acpi", "apic", "pae"];

/// A disk with its device resolved and its backing volume known
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedDisk {
    pub spec: DiskSpec,
    /// Path of the backing volume
    pub source: String,
}

/// Build the definition for a new domain
pub fn build(
    descriptor: &DomainDescriptor,
    disks: &[AttachedDisk],
    interfaces: &[ResolvedInterface],
) -> DomainDefinition {
    DomainDefinition {
        name: descriptor.name.clone(),
        uuid: None,
        domain_type: descriptor.domain_type.clone(),
        title: descriptor.title.clone(),
        description: descriptor.description.clone(),
        memory_mib: descriptor.memory_mib,
        vcpus: descriptor.cpus,
        cpu: cpu_definition(descriptor),
        os: OsDefinition {
            arch: descriptor.machine_arch.clone(),
            machine: descriptor.machine_type.clone(),
            boot: if descriptor.boot_order.is_empty() {
                vec![BootDevice::Hd]
            } else {
                Vec::new()
            },
            kernel: descriptor.kernel.clone(),
            initrd: descriptor.initrd.clone(),
            cmdline: descriptor.cmdline.clone(),
        },
        features: DOMAIN_FEATURES.iter().map(|f| f.to_string()).collect(),
        emulator: descriptor.emulator_path.clone(),
        disks: disks.iter().map(disk_definition).collect(),
        interfaces: interfaces
            .iter()
            .map(|iface| interface_definition(descriptor, iface))
            .collect(),
        graphics: graphics_definition(descriptor),
        video: video_definition(descriptor),
        tpm: tpm_definition(descriptor),
        extra: Default::default(),
    }
}

pub fn cpu_definition(descriptor: &DomainDescriptor) -> CpuDefinition {
    let mut features = descriptor.cpu_features.clone();
    if descriptor.nested {
        for name in NESTED_FEATURES {
            if !features.iter().any(|f| f.name == name) {
                features.push(CpuFeature {
                    name: name.to_string(),
                    policy: "optional".to_string(),
                });
            }
        }
    }

    let custom = descriptor.cpu_mode == CpuMode::Custom;
    CpuDefinition {
        mode: descriptor.cpu_mode.to_string(),
        model: if custom {
            descriptor.cpu_model.clone()
        } else {
            None
        },
        fallback: if custom {
            descriptor.cpu_fallback.clone()
        } else {
            None
        },
        features,
        topology: descriptor.cpu_topology,
    }
}

pub fn disk_definition(disk: &AttachedDisk) -> DiskDefinition {
    DiskDefinition {
        device: disk.spec.device.clone().unwrap_or_default(),
        bus: disk.spec.bus,
        format: disk.spec.format.clone(),
        source: disk.source.clone(),
        cache: disk.spec.cache.clone(),
        boot_order: None,
        address: None,
        alias: None,
        extra: Default::default(),
    }
}

/// NIC model for an interface: its own override or the machine default
pub fn nic_model(descriptor: &DomainDescriptor, model_type: Option<&str>) -> String {
    model_type
        .unwrap_or(descriptor.nic_model_type.as_str())
        .to_string()
}

pub fn interface_definition(
    descriptor: &DomainDescriptor,
    iface: &ResolvedInterface,
) -> InterfaceDefinition {
    InterfaceDefinition {
        source: iface.source.clone(),
        mac: iface.attachment.mac.clone(),
        model: nic_model(descriptor, iface.attachment.model_type.as_deref()),
        boot_order: None,
        mtu: iface.attachment.mtu,
        target_dev: iface.attachment.iface_name.clone(),
        address: None,
        alias: None,
        extra: Default::default(),
    }
}

pub fn graphics_definition(descriptor: &DomainDescriptor) -> Option<GraphicsDefinition> {
    let graphics = &descriptor.graphics;
    if graphics.kind == GraphicsType::None {
        return None;
    }
    Some(GraphicsDefinition {
        kind: graphics.kind,
        listen: graphics.listen.clone(),
        autoport: graphics.autoport,
        port: if graphics.autoport { None } else { graphics.port },
        passwd: graphics.password.clone(),
        keymap: Some(graphics.keymap.clone()),
    })
}

pub fn video_definition(descriptor: &DomainDescriptor) -> Option<VideoDefinition> {
    descriptor.video.as_ref().map(|video| VideoDefinition {
        model: video.model.clone(),
        vram_kib: video.vram_kib,
        address: None,
    })
}

pub fn tpm_definition(descriptor: &DomainDescriptor) -> Option<TpmDefinition> {
    descriptor.tpm.as_ref().map(|tpm| TpmDefinition {
        model: tpm.model.clone(),
        backend: tpm.backend.clone(),
    })
}

/// Apply the declared boot order as per-device `<boot order>` entries.
///
/// `hd` entries take disks in device order and `network` entries take
/// interfaces in attachment order. Returns whether anything changed.
pub fn apply_boot_order(definition: &mut DomainDefinition, order: &[BootDevice]) -> bool {
    if order.is_empty() {
        return false;
    }

    let before = definition.clone();
    definition.os.boot.clear();
    for disk in &mut definition.disks {
        disk.boot_order = None;
    }
    for iface in &mut definition.interfaces {
        iface.boot_order = None;
    }

    let mut disks: Vec<usize> = (0..definition.disks.len()).collect();
    disks.sort_by(|&a, &b| definition.disks[a].device.cmp(&definition.disks[b].device));
    let mut disks = disks.into_iter();
    let mut interfaces = 0..definition.interfaces.len();

    let mut position = 1;
    for device in order {
        match device {
            BootDevice::Hd => {
                if let Some(i) = disks.next() {
                    definition.disks[i].boot_order = Some(position);
                    position += 1;
                }
            }
            BootDevice::Network => {
                if let Some(i) = interfaces.next() {
                    definition.interfaces[i].boot_order = Some(position);
                    position += 1;
                }
            }
            BootDevice::Cdrom => {
                tracing::warn!("No cdrom device to boot from; skipping boot entry");
            }
        }
    }

    *definition != before
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use vmrig_core::config::MachineConfig;
    use vmrig_core::definition::{DefinitionRenderer, InterfaceSource};
    use vmrig_core::types::{DiskBus, NetworkAttachment};

    fn descriptor() -> DomainDescriptor {
        let mut config = MachineConfig::default();
        config.domain.cpus = 2;
        config.domain.memory_mib = 1024;
        config.domain.nested = true;
        config.domain_descriptor("proj_web")
    }

    fn root_disk() -> AttachedDisk {
        AttachedDisk {
            spec: DiskSpec::named("root").with_device("vda"),
            source: "/var/lib/libvirt/images/proj_web.img".to_string(),
        }
    }

    fn management() -> ResolvedInterface {
        ResolvedInterface {
            attachment: NetworkAttachment::named("vagrant-libvirt"),
            management: true,
            source: InterfaceSource::Network {
                network: "vagrant-libvirt".to_string(),
            },
            network: None,
            guest_ip: None,
        }
    }

    #[test]
    fn test_build_is_deterministic() {
        let d = descriptor();
        let first = build(&d, &[root_disk()], &[management()]);
        let second = build(&d, &[root_disk()], &[management()]);
        assert_eq!(first, second);
    }

    #[test]
    fn test_build_maps_hardware() {
        let definition = build(&descriptor(), &[root_disk()], &[management()]);
        assert_eq!(definition.name, "proj_web");
        assert_eq!(definition.vcpus, 2);
        assert_eq!(definition.memory_mib, 1024);
        assert_eq!(definition.cpu.mode, "host-model");
        assert!(definition.cpu.model.is_none());
        let names: Vec<_> = definition.cpu.features.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["vmx", "svm"]);
        assert_eq!(definition.disks[0].device, "vda");
        assert_eq!(definition.disks[0].bus, DiskBus::Virtio);
        assert_eq!(definition.interfaces[0].model, "virtio");
        assert_eq!(definition.os.boot, vec![BootDevice::Hd]);
    }

    #[test]
    fn test_rendered_definition() {
        let definition = build(&descriptor(), &[root_disk()], &[management()]);
        let xml = DefinitionRenderer::new()
            .unwrap()
            .render_domain(&definition)
            .unwrap();
        assert!(xml.contains("<source file='/var/lib/libvirt/images/proj_web.img'/>"));
        assert!(xml.contains("<source network='vagrant-libvirt'/>"));
        assert!(xml.contains("<feature policy='optional' name='vmx'/>"));
    }

    #[test]
    fn test_boot_order() {
        let mut definition = build(&descriptor(), &[root_disk()], &[management()]);
        let changed =
            apply_boot_order(&mut definition, &[BootDevice::Network, BootDevice::Hd]);
        assert!(changed);
        assert!(definition.os.boot.is_empty());
        assert_eq!(definition.interfaces[0].boot_order, Some(1));
        assert_eq!(definition.disks[0].boot_order, Some(2));

        let again = apply_boot_order(&mut definition, &[BootDevice::Network, BootDevice::Hd]);
        assert!(!again);
    }

    #[test]
    fn test_empty_boot_order_is_untouched() {
        let mut definition = build(&descriptor(), &[root_disk()], &[]);
        assert!(!apply_boot_order(&mut definition, &[]));
        assert_eq!(definition.os.boot, vec![BootDevice::Hd]);
    }
}
