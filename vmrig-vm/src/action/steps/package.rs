use async_trait::async_trait;
use tracing::debug;

use vmrig_core::error::{VmrigError, VmrigResult};

use crate::action::context::RunContext;
use crate::action::pipeline::Step;

/// Hand the halted machine's root volume to the host packager
pub struct PackageDomain;

#[async_trait]
impl Step for PackageDomain {
    fn name(&self) -> &'static str {
        "package_domain"
    }

    async fn run(&self, ctx: &mut RunContext) -> VmrigResult<()> {
        let name = ctx.require_domain_name()?.to_string();
        let live = ctx.backend().domain_definition(&name, true).await?;
        let root = live
            .disks
            .first()
            .ok_or_else(|| VmrigError::InvalidOperation {
                operation: "package".to_string(),
                reason: format!("domain '{}' has no disks", name),
            })?;

        let pool = ctx.config().storage.pool_name.clone();
        let volume = ctx
            .backend()
            .list_volumes(&pool)
            .await?
            .into_iter()
            .find(|volume| volume.path == root.source)
            .ok_or_else(|| {
                VmrigError::not_found(format!("volume backing {} in pool {}", root.source, pool))
            })?;
        debug!("Packaging volume '{}' of '{}'", volume.name, name);

        ctx.env.host.ui.info("Creating box from the machine's root disk...");
        let path = ctx.env.host.packager.package(&name, &volume).await?;
        ctx.env
            .host
            .ui
            .info(&format!("Box created at {}", path.display()));
        ctx.package_path = Some(path);
        Ok(())
    }
}
