//! Snapshot steps

use async_trait::async_trait;

use vmrig_core::error::{VmrigError, VmrigResult};

use crate::action::context::RunContext;
use crate::action::pipeline::Step;

fn snapshot_name<'a>(ctx: &'a RunContext, operation: &str) -> VmrigResult<&'a str> {
    ctx.snapshot_name
        .as_deref()
        .ok_or_else(|| VmrigError::InvalidOperation {
            operation: operation.to_string(),
            reason: "a snapshot name is required".to_string(),
        })
}

pub struct SnapshotSave;

#[async_trait]
impl Step for SnapshotSave {
    fn name(&self) -> &'static str {
        "snapshot_save"
    }

    async fn run(&self, ctx: &mut RunContext) -> VmrigResult<()> {
        let domain = ctx.require_domain_name()?.to_string();
        let snapshot = snapshot_name(ctx, "snapshot_save")?.to_string();
        ctx.env
            .host
            .ui
            .info(&format!("Snapshotting the machine as '{}'...", snapshot));
        let info = ctx.backend().create_snapshot(&domain, &snapshot, None).await?;
        ctx.snapshots = vec![info];
        Ok(())
    }
}

pub struct SnapshotRestore;

#[async_trait]
impl Step for SnapshotRestore {
    fn name(&self) -> &'static str {
        "snapshot_restore"
    }

    async fn run(&self, ctx: &mut RunContext) -> VmrigResult<()> {
        let domain = ctx.require_domain_name()?.to_string();
        let snapshot = snapshot_name(ctx, "snapshot_restore")?.to_string();
        ctx.env
            .host
            .ui
            .info(&format!("Restoring the snapshot '{}'...", snapshot));
        ctx.backend().revert_snapshot(&domain, &snapshot).await
    }
}

pub struct SnapshotDelete;

#[async_trait]
impl Step for SnapshotDelete {
    fn name(&self) -> &'static str {
        "snapshot_delete"
    }

    async fn run(&self, ctx: &mut RunContext) -> VmrigResult<()> {
        let domain = ctx.require_domain_name()?.to_string();
        let snapshot = snapshot_name(ctx, "snapshot_delete")?.to_string();
        ctx.env
            .host
            .ui
            .info(&format!("Deleting the snapshot '{}'...", snapshot));
        ctx.backend().delete_snapshot(&domain, &snapshot).await
    }
}

pub struct SnapshotList;

#[async_trait]
impl Step for SnapshotList {
    fn name(&self) -> &'static str {
        "snapshot_list"
    }

    async fn run(&self, ctx: &mut RunContext) -> VmrigResult<()> {
        let domain = ctx.require_domain_name()?.to_string();
        ctx.snapshots = ctx.backend().list_snapshots(&domain).await?;
        Ok(())
    }
}
