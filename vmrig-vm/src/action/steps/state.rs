//! State checks guarding branches
//!
//! Each check queries the backend when it is reached; nothing is cached, as
//! an earlier step may just have changed the state.

use async_trait::async_trait;

use vmrig_core::error::VmrigResult;
use vmrig_core::types::MachineState;

use crate::action::context::RunContext;
use crate::action::pipeline::{Condition, Step};

/// The domain is defined on the backend, in any power state
pub struct IsCreated;

#[async_trait]
impl Condition for IsCreated {
    fn name(&self) -> &'static str {
        "is_created"
    }

    async fn check(&self, ctx: &mut RunContext) -> VmrigResult<bool> {
        Ok(ctx.machine_state().await? != MachineState::NotCreated)
    }
}

pub struct IsRunning;

#[async_trait]
impl Condition for IsRunning {
    fn name(&self) -> &'static str {
        "is_running"
    }

    async fn check(&self, ctx: &mut RunContext) -> VmrigResult<bool> {
        Ok(ctx.machine_state().await? == MachineState::Running)
    }
}

/// Paused, or stopped with a managed-save image to restore from
pub struct IsSuspended;

#[async_trait]
impl Condition for IsSuspended {
    fn name(&self) -> &'static str {
        "is_suspended"
    }

    async fn check(&self, ctx: &mut RunContext) -> VmrigResult<bool> {
        match ctx.machine_state().await? {
            MachineState::Suspended => Ok(true),
            MachineState::Created => {
                let name = ctx.require_domain_name()?.to_string();
                ctx.backend().has_managed_save(&name).await
            }
            _ => Ok(false),
        }
    }
}

/// Set by [`super::destroy::ConfirmDestroy`]
pub struct DestroyConfirmed;

#[async_trait]
impl Condition for DestroyConfirmed {
    fn name(&self) -> &'static str {
        "destroy_confirmed"
    }

    async fn check(&self, ctx: &mut RunContext) -> VmrigResult<bool> {
        Ok(ctx.destroy_confirmed)
    }
}

/// Tell the user something and do nothing else
pub struct Message(pub &'static str);

#[async_trait]
impl Step for Message {
    fn name(&self) -> &'static str {
        "message"
    }

    async fn run(&self, ctx: &mut RunContext) -> VmrigResult<()> {
        let machine = ctx
            .domain_name
            .clone()
            .unwrap_or_else(|| ctx.config().machine_name.clone());
        ctx.env.host.ui.info(&format!("{}: {}", machine, self.0));
        Ok(())
    }
}
