//! Steps that tear a machine down

use async_trait::async_trait;
use std::collections::BTreeSet;
use tracing::{debug, info};

use vmrig_core::definition::VolumeInfo;
use vmrig_core::error::VmrigResult;
use vmrig_core::types::MachineState;

use crate::action::context::RunContext;
use crate::action::pipeline::Step;
use crate::action::steps::create::declared_disks;
use crate::provision::{additional_disk_volume_name, box_volume_name};

pub struct ConfirmDestroy;

#[async_trait]
impl Step for ConfirmDestroy {
    fn name(&self) -> &'static str {
        "confirm_destroy"
    }

    async fn run(&self, ctx: &mut RunContext) -> VmrigResult<()> {
        if ctx.force_confirm_destroy {
            ctx.destroy_confirmed = true;
            return Ok(());
        }
        let machine = ctx.config().machine_name.clone();
        let prompt = format!("Are you sure you want to destroy the '{}' VM?", machine);
        ctx.destroy_confirmed = ctx.env.host.confirmation.confirm(&prompt).await?;
        Ok(())
    }
}

pub struct ProvisionerCleanup;

#[async_trait]
impl Step for ProvisionerCleanup {
    fn name(&self) -> &'static str {
        "provisioner_cleanup"
    }

    async fn run(&self, ctx: &mut RunContext) -> VmrigResult<()> {
        let name = ctx.require_domain_name()?.to_string();
        ctx.env.host.provisioners.cleanup(&name).await
    }
}

pub struct PruneExports;

#[async_trait]
impl Step for PruneExports {
    fn name(&self) -> &'static str {
        "prune_exports"
    }

    async fn run(&self, ctx: &mut RunContext) -> VmrigResult<()> {
        let name = ctx.require_domain_name()?.to_string();
        ctx.env.host.synced_folders.prune_exports(&name).await
    }
}

/// Power off, undefine, and delete the machine's own volumes.
///
/// Box volumes and additional disks declared with `allow_existing` are
/// left in their pools.
pub struct DestroyDomain;

#[async_trait]
impl Step for DestroyDomain {
    fn name(&self) -> &'static str {
        "destroy_domain"
    }

    async fn run(&self, ctx: &mut RunContext) -> VmrigResult<()> {
        let state = ctx.machine_state().await?;
        let Some(name) = ctx.locate_domain().await? else {
            debug!("Domain is already gone");
            ctx.env.data.clear_id().await?;
            return Ok(());
        };
        ctx.env.host.ui.info("Removing domain...");

        let live = ctx.backend().domain_definition(&name, true).await?;
        if matches!(state, MachineState::Running | MachineState::Suspended) {
            ctx.backend().poweroff_domain(&name).await?;
        }
        if ctx.backend().has_managed_save(&name).await? {
            ctx.backend().remove_managed_save(&name).await?;
        }
        for snapshot in ctx.backend().list_snapshots(&name).await? {
            debug!("Deleting snapshot '{}'", snapshot.name);
            ctx.backend().delete_snapshot(&name, &snapshot.name).await?;
        }
        ctx.backend().undefine_domain(&name).await?;

        let keep = kept_volumes(ctx, &name)?;
        let volumes = pool_volumes(ctx).await?;
        for disk in &live.disks {
            let Some(volume) = volumes.iter().find(|v| v.path == disk.source) else {
                debug!("No volume in a known pool backs {}", disk.source);
                continue;
            };
            if keep.contains(&volume.name) {
                info!("Keeping volume '{}'", volume.name);
                continue;
            }
            info!("Deleting volume '{}'", volume.name);
            ctx.backend().delete_volume(&volume.pool, &volume.name).await?;
        }

        ctx.env.data.clear_id().await?;
        ctx.domain_uuid = None;
        Ok(())
    }
}

/// Names of volumes a destroy must never delete
fn kept_volumes(ctx: &RunContext, name: &str) -> VmrigResult<BTreeSet<String>> {
    let config = ctx.config();
    let mut keep = BTreeSet::new();
    if let Some(image) = &config.box_image {
        for index in 0..image.disks.len() {
            keep.insert(box_volume_name(image, index));
        }
    }
    let disks = declared_disks(config)?;
    for disk in disks.iter().skip(ctx.root_disk_count()) {
        if disk.allow_existing {
            keep.insert(additional_disk_volume_name(name, disk));
        }
    }
    Ok(keep)
}

/// Volumes of the machine pool and every pool an additional disk names
async fn pool_volumes(ctx: &RunContext) -> VmrigResult<Vec<VolumeInfo>> {
    let config = ctx.config();
    let mut pools = BTreeSet::new();
    pools.insert(config.storage.pool_name.clone());
    pools.extend(config.disks.iter().filter_map(|disk| disk.pool.clone()));

    let mut volumes = Vec::new();
    for pool in pools {
        if ctx.backend().lookup_pool(&pool).await?.is_none() {
            continue;
        }
        volumes.extend(ctx.backend().list_volumes(&pool).await?);
    }
    Ok(volumes)
}

pub struct DestroyNetworks;

#[async_trait]
impl Step for DestroyNetworks {
    fn name(&self) -> &'static str {
        "destroy_networks"
    }

    async fn run(&self, ctx: &mut RunContext) -> VmrigResult<()> {
        let name = ctx.require_domain_name()?.to_string();
        ctx.env.network_resolver().release_networks(&name).await
    }
}
