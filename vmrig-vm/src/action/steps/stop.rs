//! Steps that stop or pause a machine

use async_trait::async_trait;
use tracing::{debug, info, warn};

use vmrig_core::config::SuspendMode;
use vmrig_core::error::VmrigResult;
use vmrig_core::types::{DomainPowerState, MachineState};

use crate::action::context::RunContext;
use crate::action::pipeline::Step;
use crate::action::wait::{poll_until, WaitOutcome};

pub struct ClearForwardedPorts;

#[async_trait]
impl Step for ClearForwardedPorts {
    fn name(&self) -> &'static str {
        "clear_forwarded_ports"
    }

    async fn run(&self, ctx: &mut RunContext) -> VmrigResult<()> {
        let cleared = ctx.env.forwarder.clear(&ctx.env.data).await?;
        if cleared > 0 {
            ctx.env.host.ui.info("Removing forwarded ports...");
        }
        Ok(())
    }
}

/// Stop the machine.
///
/// A running machine is asked to shut down and given the graceful halt
/// timeout before it is powered off. A paused machine is resumed and
/// powered off straight away.
pub struct HaltDomain;

#[async_trait]
impl Step for HaltDomain {
    fn name(&self) -> &'static str {
        "halt_domain"
    }

    async fn run(&self, ctx: &mut RunContext) -> VmrigResult<()> {
        let state = ctx.machine_state().await?;
        let name = ctx.require_domain_name()?.to_string();
        let ui = ctx.env.host.ui.clone();

        match state {
            MachineState::Suspended => {
                ui.info("Halting domain...");
                if ctx.backend().domain_state(&name).await? == Some(DomainPowerState::Paused) {
                    ctx.backend().resume_domain(&name).await?;
                }
                ctx.backend().poweroff_domain(&name).await
            }
            MachineState::Running => {
                ui.info("Attempting graceful shutdown of domain...");
                if let Err(e) = ctx.backend().shutdown_domain(&name).await {
                    warn!("Graceful shutdown of '{}' failed: {}", name, e);
                }

                let timeouts = ctx.config().timeouts.clone();
                let backend = ctx.env.backend.clone();
                let outcome = poll_until(
                    &ctx.interrupted,
                    timeouts.graceful_halt_timeout,
                    timeouts.poll_interval,
                    || {
                        let backend = backend.clone();
                        let name = name.clone();
                        async move {
                            let power = backend.domain_state(&name).await?;
                            let stopped = MachineState::from_power_state(power) != MachineState::Running;
                            Ok(stopped.then_some(()))
                        }
                    },
                )
                .await?;

                match outcome {
                    WaitOutcome::Ready(()) => {
                        info!("'{}' shut down gracefully", name);
                        Ok(())
                    }
                    WaitOutcome::Interrupted => Ok(()),
                    WaitOutcome::TimedOut => {
                        ui.info("Halting domain...");
                        ctx.backend().poweroff_domain(&name).await
                    }
                }
            }
            state => {
                debug!("'{}' is {}; nothing to halt", name, state);
                Ok(())
            }
        }
    }
}

pub struct SuspendDomain;

#[async_trait]
impl Step for SuspendDomain {
    fn name(&self) -> &'static str {
        "suspend_domain"
    }

    async fn run(&self, ctx: &mut RunContext) -> VmrigResult<()> {
        let state = ctx.machine_state().await?;
        let name = ctx.require_domain_name()?.to_string();
        if state != MachineState::Running {
            ctx.env
                .host
                .ui
                .info(&format!("{}: Domain is not running; not suspending.", name));
            return Ok(());
        }

        ctx.env.host.ui.info("Suspending domain...");
        match ctx.config().domain.suspend_mode {
            SuspendMode::Pause => ctx.backend().suspend_domain(&name).await,
            SuspendMode::Managedsave => ctx.backend().managed_save(&name).await,
        }
    }
}
