//! Run validation and the failure guard around machine creation

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use vmrig_core::error::{VmrigError, VmrigResult};

use crate::action::context::{RunContext, SetupState};
use crate::action::pipeline::{Pipeline, Step};

pub struct ValidateConfig;

#[async_trait]
impl Step for ValidateConfig {
    fn name(&self) -> &'static str {
        "validate_config"
    }

    async fn run(&self, ctx: &mut RunContext) -> VmrigResult<()> {
        if ctx.config_validate {
            ctx.config().validate()?;
        }
        Ok(())
    }
}

/// Marks the run as `starting` and cleans up if it fails before
/// [`MarkSetupComplete`].
///
/// Cleanup runs only when the domain was actually defined, the run had not
/// finished, and `destroy_on_error` is set. It then runs the halt pipeline
/// (with `halt_on_error`) or the destroy pipeline against a recovery copy of
/// the context.
pub struct StartGuard {
    halt: Arc<Pipeline>,
    destroy: Arc<Pipeline>,
}

impl StartGuard {
    pub fn new(halt: Arc<Pipeline>, destroy: Arc<Pipeline>) -> Self {
        Self { halt, destroy }
    }
}

#[async_trait]
impl Step for StartGuard {
    fn name(&self) -> &'static str {
        "start_guard"
    }

    async fn run(&self, ctx: &mut RunContext) -> VmrigResult<()> {
        ctx.setup_state = SetupState::Starting;
        Ok(())
    }

    async fn recover(&self, ctx: &mut RunContext, error: &VmrigError) -> VmrigResult<()> {
        if ctx.setup_state != SetupState::Starting {
            debug!("Setup state is {:?}; nothing to clean up", ctx.setup_state);
            return Ok(());
        }

        let policy = ctx.config().policy.clone();
        if !policy.destroy_on_error {
            info!("Leaving the machine as it is after failure: {}", error);
            return Ok(());
        }

        if ctx.locate_domain().await?.is_none() {
            debug!("Domain was never defined; nothing to clean up");
            return Ok(());
        }

        let mut recovery = ctx.for_recovery();
        if policy.halt_on_error {
            warn!("Halting the machine after failure: {}", error);
            ctx.env.host.ui.warn("An error occurred. Halting the machine.");
            self.halt.run(&mut recovery).await
        } else {
            warn!("Destroying the machine after failure: {}", error);
            ctx.env
                .host
                .ui
                .warn("An error occurred. Destroying the machine and its resources.");
            self.destroy.run(&mut recovery).await
        }
    }
}

/// Last step of a successful `up`; failures after it never clean up
pub struct MarkSetupComplete;

#[async_trait]
impl Step for MarkSetupComplete {
    fn name(&self) -> &'static str {
        "mark_setup_complete"
    }

    async fn run(&self, ctx: &mut RunContext) -> VmrigResult<()> {
        ctx.setup_state = SetupState::Finished;
        ctx.env.host.ui.info("Machine is up.");
        Ok(())
    }
}
