//! Steps that power a machine on and make it usable

use async_trait::async_trait;
use std::net::Ipv4Addr;
use tracing::{debug, info, warn};

use vmrig_core::error::{VmrigError, VmrigResult};
use vmrig_core::types::MachineState;

use crate::action::context::RunContext;
use crate::action::pipeline::Step;
use crate::action::wait::{poll_until, WaitOutcome};
use crate::domain;
use crate::port_forward::SshTarget;

/// Bring the definition in line with configuration, then power on.
///
/// A domain with a managed-save image is restored as saved; reconciling it
/// would invalidate the image.
pub struct StartDomain;

#[async_trait]
impl Step for StartDomain {
    fn name(&self) -> &'static str {
        "start_domain"
    }

    async fn run(&self, ctx: &mut RunContext) -> VmrigResult<()> {
        let name = ctx.require_domain_name()?.to_string();
        if ctx.backend().has_managed_save(&name).await? {
            debug!("'{}' has a managed save image; skipping reconcile", name);
        } else {
            let descriptor = ctx.descriptor()?;
            domain::reconcile_domain(ctx.backend(), &ctx.env.renderer, &descriptor).await?;
        }

        ctx.env.host.ui.info("Starting domain.");
        ctx.backend().start_domain(&name).await
    }
}

/// Start the inactive networks a suspended domain is attached to
pub struct ResumeNetworks;

#[async_trait]
impl Step for ResumeNetworks {
    fn name(&self) -> &'static str {
        "resume_networks"
    }

    async fn run(&self, ctx: &mut RunContext) -> VmrigResult<()> {
        let name = ctx.require_domain_name()?.to_string();
        let definition = ctx.backend().domain_definition(&name, false).await?;
        for network in definition.network_names() {
            match ctx.backend().lookup_network(network).await? {
                Some(info) if !info.active => {
                    info!("Starting network '{}'", network);
                    ctx.backend().start_network(network).await?;
                }
                Some(_) => {}
                None => warn!("Network '{}' of '{}' no longer exists", network, name),
            }
        }
        Ok(())
    }
}

pub struct ResumeDomain;

#[async_trait]
impl Step for ResumeDomain {
    fn name(&self) -> &'static str {
        "resume_domain"
    }

    async fn run(&self, ctx: &mut RunContext) -> VmrigResult<()> {
        let name = ctx.require_domain_name()?.to_string();
        ctx.env.host.ui.info("Resuming domain...");
        match ctx.machine_state().await? {
            MachineState::Suspended => ctx.backend().resume_domain(&name).await,
            MachineState::Created if ctx.backend().has_managed_save(&name).await? => {
                ctx.backend().start_domain(&name).await
            }
            state => {
                debug!("'{}' is {}; nothing to resume", name, state);
                Ok(())
            }
        }
    }
}

/// Wait for an address, then for the guest to accept connections.
///
/// Both waits are bounded by the boot timeout. An interrupted wait returns
/// quietly; the pipeline stops at the next step boundary.
pub struct WaitTillUp;

#[async_trait]
impl Step for WaitTillUp {
    fn name(&self) -> &'static str {
        "wait_till_up"
    }

    async fn run(&self, ctx: &mut RunContext) -> VmrigResult<()> {
        let name = ctx.require_domain_name()?.to_string();
        let timeouts = ctx.config().timeouts.clone();
        let ui = ctx.env.host.ui.clone();

        let address = match static_address(ctx) {
            Some(ip) => ip,
            None => {
                ui.info("Waiting for domain to get an IP address...");
                let mac = management_mac(ctx, &name).await?;
                let backend = ctx.env.backend.clone();
                let outcome = poll_until(
                    &ctx.interrupted,
                    timeouts.boot_timeout,
                    timeouts.poll_interval,
                    || {
                        let backend = backend.clone();
                        let name = name.clone();
                        let mac = mac.clone();
                        async move {
                            let leases = backend.domain_interface_addresses(&name).await?;
                            Ok(leases
                                .into_iter()
                                .find(|lease| mac.as_ref().map_or(true, |mac| &lease.mac == mac))
                                .map(|lease| lease.ip))
                        }
                    },
                )
                .await?;
                match outcome {
                    WaitOutcome::Ready(ip) => ip,
                    WaitOutcome::Interrupted => return Ok(()),
                    WaitOutcome::TimedOut => {
                        return Err(VmrigError::Timeout {
                            operation: format!("waiting for an IP address on '{}'", name),
                            duration: timeouts.boot_timeout,
                        })
                    }
                }
            }
        };
        ui.info(&format!("Got IP address {}", address));
        ctx.address = Some(address);

        ui.info("Waiting for machine to become reachable...");
        let communicator = ctx.env.host.communicator.clone();
        let outcome = poll_until(
            &ctx.interrupted,
            timeouts.boot_timeout,
            timeouts.poll_interval,
            || {
                let communicator = communicator.clone();
                async move { Ok(communicator.ready(address).await?.then_some(())) }
            },
        )
        .await?;
        match outcome {
            WaitOutcome::Ready(()) => {
                ui.info("Machine is reachable.");
                Ok(())
            }
            WaitOutcome::Interrupted => Ok(()),
            WaitOutcome::TimedOut => Err(VmrigError::Timeout {
                operation: format!("waiting for '{}' to become reachable", name),
                duration: timeouts.boot_timeout,
            }),
        }
    }
}

/// Without a management network the first static address is the one to
/// connect to.
fn static_address(ctx: &RunContext) -> Option<Ipv4Addr> {
    if ctx.config().management_network.enabled {
        return None;
    }
    ctx.interfaces.iter().find_map(|iface| iface.guest_ip)
}

/// MAC of the first interface, which is the management interface whenever
/// the management network is enabled
async fn management_mac(ctx: &RunContext, name: &str) -> VmrigResult<Option<String>> {
    if !ctx.config().management_network.enabled {
        return Ok(None);
    }
    let live = ctx.backend().domain_definition(name, false).await?;
    Ok(live.interfaces.first().and_then(|iface| iface.mac.clone()))
}

pub struct ForwardPorts;

#[async_trait]
impl Step for ForwardPorts {
    fn name(&self) -> &'static str {
        "forward_ports"
    }

    async fn run(&self, ctx: &mut RunContext) -> VmrigResult<()> {
        let config = ctx.config();
        if config.forwarded_ports.is_empty() {
            return Ok(());
        }
        let Some(address) = ctx.address else {
            warn!("No address known for the machine; not forwarding ports");
            return Ok(());
        };

        ctx.env.host.ui.info("Forwarding ports...");
        let target = SshTarget::new(address, &config.ssh, &config.connection);
        for port in &config.forwarded_ports {
            ctx.env.host.ui.info(&format!(
                "{} (guest) => {} (host)",
                port.guest_port, port.host_port
            ));
            ctx.env
                .forwarder
                .forward(&ctx.env.data, &target, port)
                .await?;
        }
        Ok(())
    }
}

pub struct Provision;

#[async_trait]
impl Step for Provision {
    fn name(&self) -> &'static str {
        "provision"
    }

    async fn run(&self, ctx: &mut RunContext) -> VmrigResult<()> {
        let name = ctx.require_domain_name()?.to_string();
        ctx.env
            .host
            .provisioners
            .provision(&name, ctx.address)
            .await
    }
}
