//! Per-run context threaded through every step
//!
//! Steps read the long-lived collaborators from [`MachineEnv`] and pass
//! results forward through the documented fields of [`RunContext`]. Nothing
//! here survives the run: the next run starts from configuration again.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use vmrig_core::backend::VirtBackend;
use vmrig_core::config::MachineConfig;
use vmrig_core::definition::{DefinitionRenderer, SnapshotInfo, VolumeInfo};
use vmrig_core::error::{VmrigError, VmrigResult};
use vmrig_core::lock::LockManager;
use vmrig_core::machine_data::MachineDataDir;
use vmrig_core::types::{DiskSpec, DomainDescriptor, MachineState};

use crate::domain::AttachedDisk;
use crate::host::HostServices;
use crate::network::{planned_interfaces, NetworkResolver, ResolvedInterface};
use crate::port_forward::{CommandExecutor, PortForwarder, SystemCommandExecutor};

/// Collaborators shared by every run of one machine
pub struct MachineEnv {
    pub config: MachineConfig,
    /// Directory name of the project, the default domain name prefix
    pub project_name: String,
    pub backend: Arc<dyn VirtBackend>,
    pub locks: Arc<LockManager>,
    pub data: MachineDataDir,
    pub renderer: Arc<DefinitionRenderer>,
    pub host: HostServices,
    pub forwarder: Arc<PortForwarder>,
}

impl MachineEnv {
    pub fn new(
        config: MachineConfig,
        project_name: impl Into<String>,
        backend: Arc<dyn VirtBackend>,
        data: MachineDataDir,
    ) -> VmrigResult<Self> {
        Ok(Self {
            config,
            project_name: project_name.into(),
            backend,
            locks: Arc::new(LockManager::default()),
            data,
            renderer: Arc::new(DefinitionRenderer::new()?),
            host: HostServices::headless(),
            forwarder: Arc::new(PortForwarder::new(Arc::new(SystemCommandExecutor))),
        })
    }

    pub fn with_locks(mut self, locks: Arc<LockManager>) -> Self {
        self.locks = locks;
        self
    }

    pub fn with_host(mut self, host: HostServices) -> Self {
        self.host = host;
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.forwarder = Arc::new(PortForwarder::new(executor));
        self
    }

    pub fn network_resolver(&self) -> NetworkResolver {
        NetworkResolver::new(
            self.backend.clone(),
            self.locks.clone(),
            self.data.clone(),
            self.renderer.clone(),
        )
    }
}

/// Progress marker of an `up` run, consulted by failure recovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SetupState {
    #[default]
    NotStarted,
    /// The guard step ran; a failure from here on may trigger cleanup
    Starting,
    /// Setup completed; later failures never trigger cleanup
    Finished,
}

/// Mutable state of one orchestration run
#[derive(Clone)]
pub struct RunContext {
    pub env: Arc<MachineEnv>,
    /// Set by a signal handler or the host to cancel the run
    pub interrupted: Arc<AtomicBool>,
    pub setup_state: SetupState,
    /// Skip the destroy confirmation prompt
    pub force_confirm_destroy: bool,
    /// Run configuration validation; cleared for recovery runs
    pub config_validate: bool,
    pub domain_name: Option<String>,
    pub domain_uuid: Option<String>,
    /// Box volumes in the storage pool, in box disk order
    pub box_volumes: Vec<VolumeInfo>,
    /// The machine's copies of the box volumes, in box disk order
    pub root_volumes: Vec<VolumeInfo>,
    /// Root disks followed by additional disks, devices resolved
    pub disks: Vec<DiskSpec>,
    /// Disks with their backing volumes, in `disks` order
    pub attached_disks: Vec<AttachedDisk>,
    pub interfaces: Vec<ResolvedInterface>,
    /// Address the machine is reachable on
    pub address: Option<Ipv4Addr>,
    pub destroy_confirmed: bool,
    pub snapshot_name: Option<String>,
    pub snapshots: Vec<SnapshotInfo>,
    pub package_path: Option<PathBuf>,
}

impl RunContext {
    pub fn new(env: Arc<MachineEnv>, interrupted: Arc<AtomicBool>) -> Self {
        let force_confirm_destroy = env.config.policy.force_confirm_destroy;
        Self {
            env,
            interrupted,
            setup_state: SetupState::NotStarted,
            force_confirm_destroy,
            config_validate: true,
            domain_name: None,
            domain_uuid: None,
            box_volumes: Vec::new(),
            root_volumes: Vec::new(),
            disks: Vec::new(),
            attached_disks: Vec::new(),
            interfaces: Vec::new(),
            address: None,
            destroy_confirmed: false,
            snapshot_name: None,
            snapshots: Vec::new(),
            package_path: None,
        }
    }

    /// Copy of this context for running cleanup after a failure.
    ///
    /// The copy has its own cleared interruption flag, so the interruption
    /// that caused the failure cannot abort the cleanup. Destroy is forced
    /// and configuration is not validated again.
    pub fn for_recovery(&self) -> Self {
        let mut recovery = self.clone();
        recovery.interrupted = Arc::new(AtomicBool::new(false));
        recovery.force_confirm_destroy = true;
        recovery.config_validate = false;
        recovery
    }

    pub fn config(&self) -> &MachineConfig {
        &self.env.config
    }

    pub fn backend(&self) -> &dyn VirtBackend {
        self.env.backend.as_ref()
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    pub fn check_interrupted(&self, operation: &str) -> VmrigResult<()> {
        if self.is_interrupted() {
            return Err(VmrigError::interrupted(operation));
        }
        Ok(())
    }

    pub fn require_domain_name(&self) -> VmrigResult<&str> {
        self.domain_name
            .as_deref()
            .ok_or_else(|| VmrigError::internal("domain name is not known yet"))
    }

    /// Find the machine's domain on the backend through its recorded id.
    ///
    /// Returns the domain name, caching it in the context.
    pub async fn locate_domain(&mut self) -> VmrigResult<Option<String>> {
        if let Some(name) = &self.domain_name {
            if self.env.backend.lookup_domain(name).await?.is_some() {
                return Ok(Some(name.clone()));
            }
        }
        let Some(id) = self.env.data.read_id().await? else {
            return Ok(None);
        };
        match self.env.backend.lookup_domain_by_uuid(&id).await? {
            Some(domain) => {
                self.domain_uuid = Some(domain.uuid);
                self.domain_name = Some(domain.name.clone());
                Ok(Some(domain.name))
            }
            None => Ok(None),
        }
    }

    /// Current machine state, always queried fresh
    pub async fn machine_state(&mut self) -> VmrigResult<MachineState> {
        let Some(name) = self.locate_domain().await? else {
            return Ok(MachineState::NotCreated);
        };
        let power = self.env.backend.domain_state(&name).await?;
        Ok(MachineState::from_power_state(power))
    }

    /// Descriptor for this run: configuration plus the resolved disks, with
    /// interfaces in attachment order (management first)
    pub fn descriptor(&self) -> VmrigResult<DomainDescriptor> {
        let name = self.require_domain_name()?;
        let config = self.config();
        let mut descriptor = config.domain_descriptor(name);
        let root_count = self.root_disk_count();
        if self.disks.len() >= root_count {
            descriptor.disks = self.disks[root_count..].to_vec();
        }
        descriptor.interfaces = planned_interfaces(config)
            .into_iter()
            .map(|planned| planned.attachment)
            .collect();
        Ok(descriptor)
    }

    /// Number of disks that come from the box
    pub fn root_disk_count(&self) -> usize {
        self.config()
            .box_image
            .as_ref()
            .map(|image| image.disks.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use vmrig_core::config::ConfigBuilder;
    use vmrig_core::mock::MockBackend;

    fn context(dir: &TempDir) -> RunContext {
        let config = ConfigBuilder::new().build().unwrap();
        let env = MachineEnv::new(
            config,
            "proj",
            Arc::new(MockBackend::new()),
            MachineDataDir::new(dir.path()),
        )
        .unwrap();
        RunContext::new(Arc::new(env), Arc::new(AtomicBool::new(false)))
    }

    #[test]
    fn test_recovery_context_clears_interrupt() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        ctx.interrupted.store(true, Ordering::SeqCst);

        let recovery = ctx.for_recovery();
        assert!(ctx.is_interrupted());
        assert!(!recovery.is_interrupted());
        assert!(recovery.force_confirm_destroy);
        assert!(!recovery.config_validate);
    }

    #[tokio::test]
    async fn test_state_without_id_is_not_created() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(&dir);
        assert_eq!(ctx.machine_state().await.unwrap(), MachineState::NotCreated);
    }

    #[test]
    fn test_descriptor_puts_management_first() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(&dir);
        assert!(ctx.descriptor().is_err());

        ctx.domain_name = Some("proj_default".to_string());
        let descriptor = ctx.descriptor().unwrap();
        assert_eq!(descriptor.interfaces.len(), 1);
        assert_eq!(
            descriptor.interfaces[0].network_name.as_deref(),
            Some("vagrant-libvirt")
        );
    }
}
