//! Start-time reconciliation of a live definition against the declared
//! hardware
//!
//! Only the fields listed in [`reconcile`] are compared and rewritten. All
//! other live structure is carried over untouched, including backend-assigned
//! PCI addresses, device aliases and MAC addresses.

use vmrig_core::definition::DomainDefinition;
use vmrig_core::types::DomainDescriptor;

use super::builder::{
    cpu_definition, graphics_definition, nic_model, tpm_definition, video_definition,
};

/// Outcome of diffing a live definition
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    pub changed: bool,
    /// Live definition with the declared values applied
    pub updated: DomainDefinition,
    /// Human-readable description of each change
    pub changes: Vec<String>,
}

/// Diff `live` against `descriptor`.
///
/// Compared: memory, vCPU count, CPU mode/model/features/topology, per-disk
/// bus, NIC model, graphics, video and TPM.
pub fn reconcile(live: &DomainDefinition, descriptor: &DomainDescriptor) -> Reconciliation {
    let mut updated = live.clone();
    let mut changes = Vec::new();

    if updated.memory_mib != descriptor.memory_mib {
        changes.push(format!(
            "memory {} MiB -> {} MiB",
            updated.memory_mib, descriptor.memory_mib
        ));
        updated.memory_mib = descriptor.memory_mib;
    }

    if updated.vcpus != descriptor.cpus {
        changes.push(format!("vcpus {} -> {}", updated.vcpus, descriptor.cpus));
        updated.vcpus = descriptor.cpus;
    }

    let cpu = cpu_definition(descriptor);
    if updated.cpu.mode != cpu.mode {
        changes.push(format!("cpu mode {} -> {}", updated.cpu.mode, cpu.mode));
        updated.cpu.mode = cpu.mode;
    }
    if updated.cpu.model != cpu.model || updated.cpu.fallback != cpu.fallback {
        changes.push(format!(
            "cpu model {:?} -> {:?}",
            updated.cpu.model, cpu.model
        ));
        updated.cpu.model = cpu.model;
        updated.cpu.fallback = cpu.fallback;
    }
    if updated.cpu.features != cpu.features {
        let names: Vec<&str> = cpu.features.iter().map(|f| f.name.as_str()).collect();
        changes.push(format!("cpu features -> [{}]", names.join(", ")));
        updated.cpu.features = cpu.features;
    }
    if updated.cpu.topology != cpu.topology {
        changes.push("cpu topology".to_string());
        updated.cpu.topology = cpu.topology;
    }

    for disk in &mut updated.disks {
        let bus = descriptor
            .disks
            .iter()
            .find(|spec| spec.device.as_deref() == Some(disk.device.as_str()))
            .map(|spec| spec.bus)
            .unwrap_or(descriptor.disk_bus);
        if disk.bus != bus {
            changes.push(format!("disk {} bus {} -> {}", disk.device, disk.bus, bus));
            disk.bus = bus;
            // A PCI address is invalid on the new bus.
            disk.address = None;
        }
    }

    for (index, iface) in updated.interfaces.iter_mut().enumerate() {
        let override_model = descriptor
            .interfaces
            .get(index)
            .and_then(|attachment| attachment.model_type.as_deref());
        let model = nic_model(descriptor, override_model);
        if iface.model != model {
            changes.push(format!("interface {} model {} -> {}", index, iface.model, model));
            iface.model = model;
        }
    }

    let graphics = graphics_definition(descriptor);
    if updated.graphics != graphics {
        changes.push(match &graphics {
            Some(graphics) => format!("graphics {} on {}", graphics.kind, graphics.listen),
            None => "graphics removed".to_string(),
        });
        updated.graphics = graphics;
    }

    let video = video_definition(descriptor);
    match (updated.video.is_some(), video) {
        (true, Some(video)) => {
            if let Some(live_video) = updated.video.as_mut() {
                if live_video.model != video.model || live_video.vram_kib != video.vram_kib {
                    changes.push(format!(
                        "video {} ({} KiB) -> {} ({} KiB)",
                        live_video.model, live_video.vram_kib, video.model, video.vram_kib
                    ));
                    live_video.model = video.model;
                    live_video.vram_kib = video.vram_kib;
                }
            }
        }
        (false, Some(video)) => {
            changes.push(format!("video {} added", video.model));
            updated.video = Some(video);
        }
        (true, None) => {
            changes.push("video removed".to_string());
            updated.video = None;
        }
        (false, None) => {}
    }

    let tpm = tpm_definition(descriptor);
    if updated.tpm != tpm {
        changes.push(match &tpm {
            Some(tpm) => format!("tpm {}", tpm.model),
            None => "tpm removed".to_string(),
        });
        updated.tpm = tpm;
    }

    Reconciliation {
        changed: !changes.is_empty(),
        updated,
        changes,
    }
}
