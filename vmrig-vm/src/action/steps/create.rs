//! Steps that create a machine's resources

use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use vmrig_core::config::MachineConfig;
use vmrig_core::error::{VmrigError, VmrigResult};
use vmrig_core::lock::STORAGE_LOCK;
use vmrig_core::types::DiskSpec;

use crate::action::context::RunContext;
use crate::action::pipeline::Step;
use crate::disk::resolve_by_bus;
use crate::domain::{self, apply_boot_order, builder, AttachedDisk};
use crate::network::planned_interfaces;
use crate::provision::{self, BoxImporter};

/// Root disks from the box followed by the additional disks, with devices
/// resolved.
///
/// Resolution always starts from an empty existing-device map, so the
/// assignment made when the machine was created is reproduced on every
/// later run.
pub fn declared_disks(config: &MachineConfig) -> VmrigResult<Vec<DiskSpec>> {
    let mut disks = Vec::new();
    if let Some(image) = &config.box_image {
        for (index, disk) in image.disks.iter().enumerate() {
            let name = if index == 0 {
                "root".to_string()
            } else {
                format!("root_{}", index)
            };
            disks.push(DiskSpec {
                name: Some(name),
                bus: config.domain.disk_bus,
                format: disk.format.clone(),
                size_gib: disk.virtual_size_gib,
                ..Default::default()
            });
        }
    }
    disks.extend(config.disks.iter().cloned());
    resolve_by_bus(&disks, &BTreeMap::new())
}

pub struct SetDomainName;

#[async_trait]
impl Step for SetDomainName {
    fn name(&self) -> &'static str {
        "set_domain_name"
    }

    async fn run(&self, ctx: &mut RunContext) -> VmrigResult<()> {
        let name = domain::domain_name(ctx.config(), &ctx.env.project_name);
        // Checked before the name enters the context, so failure cleanup
        // can never reach the other machine's domain.
        if ctx.backend().lookup_domain(&name).await?.is_some() {
            return Err(VmrigError::DomainNameExists { name });
        }
        info!("Domain name is '{}'", name);
        ctx.domain_name = Some(name);
        Ok(())
    }
}

pub struct EnsureStoragePool;

#[async_trait]
impl Step for EnsureStoragePool {
    fn name(&self) -> &'static str {
        "ensure_storage_pool"
    }

    async fn run(&self, ctx: &mut RunContext) -> VmrigResult<()> {
        let env = ctx.env.clone();
        let _guard = env.locks.lock(STORAGE_LOCK).await?;
        provision::ensure_storage_pool(env.backend.as_ref(), &env.renderer, &env.config.storage)
            .await?;
        Ok(())
    }
}

pub struct ImportBox;

#[async_trait]
impl Step for ImportBox {
    fn name(&self) -> &'static str {
        "import_box"
    }

    async fn run(&self, ctx: &mut RunContext) -> VmrigResult<()> {
        let env = ctx.env.clone();
        let Some(image) = &env.config.box_image else {
            debug!("No box configured; skipping import");
            return Ok(());
        };
        let importer = BoxImporter::new(env.backend.clone(), env.locks.clone(), env.host.ui.clone());
        ctx.box_volumes = importer
            .import(&env.config.storage.pool_name, image, &ctx.interrupted)
            .await?;
        Ok(())
    }
}

pub struct CloneBoxVolumes;

#[async_trait]
impl Step for CloneBoxVolumes {
    fn name(&self) -> &'static str {
        "clone_box_volumes"
    }

    async fn run(&self, ctx: &mut RunContext) -> VmrigResult<()> {
        if ctx.box_volumes.is_empty() {
            return Ok(());
        }
        let name = ctx.require_domain_name()?.to_string();
        ctx.env.host.ui.info("Creating image (snapshot of base box volume).");
        ctx.root_volumes = provision::clone_box_volumes(
            ctx.backend(),
            &ctx.config().storage.pool_name,
            &name,
            &ctx.box_volumes,
            ctx.config().domain.machine_virtual_size_gib,
        )
        .await?;
        Ok(())
    }
}

pub struct ResolveDiskSettings;

#[async_trait]
impl Step for ResolveDiskSettings {
    fn name(&self) -> &'static str {
        "resolve_disk_settings"
    }

    async fn run(&self, ctx: &mut RunContext) -> VmrigResult<()> {
        ctx.disks = declared_disks(ctx.config())?;

        // On an existing machine, report declared disks it does not have.
        if let Some(name) = ctx.locate_domain().await? {
            let live = ctx.backend().domain_definition(&name, true).await?;
            for disk in &ctx.disks {
                if let Some(device) = &disk.device {
                    if live.disk(device).is_none() {
                        warn!(
                            "Disk {} is not attached to '{}'; recreate the machine to add it",
                            disk, name
                        );
                    }
                }
            }
        }
        Ok(())
    }
}

/// Create the additional disk volumes and pair every disk with its source
pub struct CreateAdditionalDisks;

#[async_trait]
impl Step for CreateAdditionalDisks {
    fn name(&self) -> &'static str {
        "create_additional_disks"
    }

    async fn run(&self, ctx: &mut RunContext) -> VmrigResult<()> {
        let name = ctx.require_domain_name()?.to_string();
        let root_count = ctx.root_disk_count();
        if ctx.root_volumes.len() != root_count || ctx.disks.len() < root_count {
            return Err(VmrigError::internal(format!(
                "expected {} root volumes, have {}",
                root_count,
                ctx.root_volumes.len()
            )));
        }

        let mut attached: Vec<AttachedDisk> = ctx.disks[..root_count]
            .iter()
            .zip(&ctx.root_volumes)
            .map(|(spec, volume)| AttachedDisk {
                spec: spec.clone(),
                source: volume.path.clone(),
            })
            .collect();

        let default_pool = ctx.config().storage.pool_name.clone();
        for disk in &ctx.disks[root_count..] {
            let pool = disk.pool.as_deref().unwrap_or(&default_pool);
            let volume = provision::ensure_disk(ctx.backend(), pool, &name, disk).await?;
            attached.push(AttachedDisk {
                spec: disk.clone(),
                source: volume.path,
            });
        }
        ctx.attached_disks = attached;
        Ok(())
    }
}

/// Define the domain with its disks; interfaces are attached afterwards
pub struct CreateDomain;

#[async_trait]
impl Step for CreateDomain {
    fn name(&self) -> &'static str {
        "create_domain"
    }

    async fn run(&self, ctx: &mut RunContext) -> VmrigResult<()> {
        let descriptor = ctx.descriptor()?;
        let definition = domain::build(&descriptor, &ctx.attached_disks, &[]);

        let ui = ctx.env.host.ui.clone();
        ui.info("Creating domain with the following settings...");
        ui.info(&format!(" -- Name:   {}", descriptor.name));
        ui.info(&format!(" -- Cpus:   {}", descriptor.cpus));
        ui.info(&format!(" -- Memory: {}M", descriptor.memory_mib));
        for disk in &ctx.attached_disks {
            ui.info(&format!(
                " -- Disk({}): {}",
                disk.spec.device.as_deref().unwrap_or("?"),
                disk.source
            ));
        }
        let xml = ctx.env.renderer.render_domain(&definition)?;
        debug!("Domain definition:\n{}", xml);

        let info = ctx.backend().define_domain(&definition).await?;
        ctx.env.data.write_id(&info.uuid).await?;
        ctx.domain_uuid = Some(info.uuid);
        Ok(())
    }
}

/// Find or create the networks of every planned interface
pub struct CreateNetworks;

#[async_trait]
impl Step for CreateNetworks {
    fn name(&self) -> &'static str {
        "create_networks"
    }

    async fn run(&self, ctx: &mut RunContext) -> VmrigResult<()> {
        let planned = planned_interfaces(ctx.config());
        let resolved = ctx.env.network_resolver().resolve(&planned).await?;
        for iface in &resolved {
            if let Some(network) = &iface.network {
                let verb = if network.created { "Created" } else { "Using" };
                ctx.env.host.ui.info(&format!(
                    "{} network '{}' on bridge {}",
                    verb, network.name, network.bridge_name
                ));
            }
        }
        ctx.interfaces = resolved;
        Ok(())
    }
}

pub struct CreateNetworkInterfaces;

#[async_trait]
impl Step for CreateNetworkInterfaces {
    fn name(&self) -> &'static str {
        "create_network_interfaces"
    }

    async fn run(&self, ctx: &mut RunContext) -> VmrigResult<()> {
        let name = ctx.require_domain_name()?.to_string();
        let descriptor = ctx.descriptor()?;
        for (index, iface) in ctx.interfaces.iter().enumerate() {
            let definition = builder::interface_definition(&descriptor, iface);
            ctx.env.host.ui.info(&format!(
                "Attaching interface {} ({})",
                index,
                describe_source(&definition.source)
            ));
            ctx.env.backend.attach_interface(&name, &definition).await?;
        }
        Ok(())
    }
}

fn describe_source(source: &vmrig_core::definition::InterfaceSource) -> String {
    use vmrig_core::definition::InterfaceSource;
    match source {
        InterfaceSource::Network { network } => format!("network {}", network),
        InterfaceSource::Direct { dev, mode } => format!("direct {} ({})", dev, mode),
        InterfaceSource::Udp { address, port, .. } => format!("udp {}:{}", address, port),
        InterfaceSource::Server { address, port } => format!("server {}:{}", address, port),
        InterfaceSource::Client { address, port } => format!("client {}:{}", address, port),
        InterfaceSource::Mcast { address, port } => format!("mcast {}:{}", address, port),
    }
}

pub struct SetBootOrder;

#[async_trait]
impl Step for SetBootOrder {
    fn name(&self) -> &'static str {
        "set_boot_order"
    }

    async fn run(&self, ctx: &mut RunContext) -> VmrigResult<()> {
        let order = ctx.config().domain.boot_order.clone();
        if order.is_empty() {
            return Ok(());
        }
        let name = ctx.require_domain_name()?.to_string();
        let mut definition = ctx.backend().domain_definition(&name, true).await?;
        if apply_boot_order(&mut definition, &order) {
            let order: Vec<String> = order.iter().map(ToString::to_string).collect();
            info!("Setting boot order of '{}' to {}", name, order.join(", "));
            ctx.backend().define_domain(&definition).await?;
        }
        Ok(())
    }
}
