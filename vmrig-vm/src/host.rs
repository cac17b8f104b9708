//! Collaborators supplied by the host environment
//!
//! The engine reports progress, probes reachability, runs provisioners and
//! asks for confirmation only through these traits. The defaults here are
//! what a headless run uses; a host plugs in its own implementations.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use vmrig_core::definition::VolumeInfo;
use vmrig_core::error::{VmrigError, VmrigResult};

/// Human-readable progress sink
pub trait Ui: Send + Sync {
    fn info(&self, message: &str);

    fn warn(&self, message: &str);

    fn error(&self, message: &str);

    /// Report `done` of `total` units of a long transfer
    fn progress(&self, label: &str, done: u64, total: u64);
}

/// Forwards everything to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingUi;

impl Ui for TracingUi {
    fn info(&self, message: &str) {
        info!("{}", message);
    }

    fn warn(&self, message: &str) {
        warn!("{}", message);
    }

    fn error(&self, message: &str) {
        error!("{}", message);
    }

    fn progress(&self, label: &str, done: u64, total: u64) {
        let percent = if total == 0 { 100 } else { done * 100 / total };
        info!("{}: {}%", label, percent);
    }
}

/// Keeps every message, for tests and for hosts that render later
#[derive(Debug, Default)]
pub struct RecordingUi {
    messages: Mutex<Vec<String>>,
}

impl RecordingUi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.messages.lock().iter().any(|m| m.contains(needle))
    }
}

impl Ui for RecordingUi {
    fn info(&self, message: &str) {
        self.messages.lock().push(message.to_string());
    }

    fn warn(&self, message: &str) {
        self.messages.lock().push(format!("warning: {}", message));
    }

    fn error(&self, message: &str) {
        self.messages.lock().push(format!("error: {}", message));
    }

    fn progress(&self, label: &str, done: u64, total: u64) {
        self.messages
            .lock()
            .push(format!("{}: {}/{}", label, done, total));
    }
}

/// Reachability probe for a booted guest (SSH, WinRM...)
#[async_trait]
pub trait Communicator: Send + Sync {
    /// Whether the guest at `address` accepts connections yet
    async fn ready(&self, address: Ipv4Addr) -> VmrigResult<bool>;
}

/// Treats any guest with an address as reachable
#[derive(Debug, Default, Clone, Copy)]
pub struct AddressOnlyCommunicator;

#[async_trait]
impl Communicator for AddressOnlyCommunicator {
    async fn ready(&self, _address: Ipv4Addr) -> VmrigResult<bool> {
        Ok(true)
    }
}

/// Provisioners configured for the machine
#[async_trait]
pub trait ProvisionerHooks: Send + Sync {
    async fn provision(&self, machine: &str, address: Option<Ipv4Addr>) -> VmrigResult<()>;

    /// Runs before the machine is destroyed
    async fn cleanup(&self, machine: &str) -> VmrigResult<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoProvisioners;

#[async_trait]
impl ProvisionerHooks for NoProvisioners {
    async fn provision(&self, _machine: &str, _address: Option<Ipv4Addr>) -> VmrigResult<()> {
        Ok(())
    }

    async fn cleanup(&self, _machine: &str) -> VmrigResult<()> {
        Ok(())
    }
}

/// Synced-folder exports kept on the host (NFS and similar)
#[async_trait]
pub trait SyncedFolders: Send + Sync {
    async fn prune_exports(&self, machine: &str) -> VmrigResult<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoSyncedFolders;

#[async_trait]
impl SyncedFolders for NoSyncedFolders {
    async fn prune_exports(&self, _machine: &str) -> VmrigResult<()> {
        Ok(())
    }
}

#[async_trait]
pub trait Confirmation: Send + Sync {
    async fn confirm(&self, prompt: &str) -> VmrigResult<bool>;
}

/// Answers every prompt the same way
#[derive(Debug, Clone, Copy)]
pub struct FixedAnswer(pub bool);

#[async_trait]
impl Confirmation for FixedAnswer {
    async fn confirm(&self, _prompt: &str) -> VmrigResult<bool> {
        Ok(self.0)
    }
}

/// Turns a halted machine's root volume into a box artifact
#[async_trait]
pub trait BoxPackager: Send + Sync {
    async fn package(&self, machine: &str, root_volume: &VolumeInfo) -> VmrigResult<PathBuf>;
}

/// Packaging is unavailable without a host packager
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPackager;

#[async_trait]
impl BoxPackager for NoPackager {
    async fn package(&self, _machine: &str, _root_volume: &VolumeInfo) -> VmrigResult<PathBuf> {
        Err(VmrigError::InvalidOperation {
            operation: "package".to_string(),
            reason: "no box packager is configured".to_string(),
        })
    }
}

/// Everything the host supplies to a run
#[derive(Clone)]
pub struct HostServices {
    pub ui: Arc<dyn Ui>,
    pub communicator: Arc<dyn Communicator>,
    pub provisioners: Arc<dyn ProvisionerHooks>,
    pub synced_folders: Arc<dyn SyncedFolders>,
    pub confirmation: Arc<dyn Confirmation>,
    pub packager: Arc<dyn BoxPackager>,
}

impl HostServices {
    /// Non-interactive services: log to tracing, decline destroy prompts
    pub fn headless() -> Self {
        Self {
            ui: Arc::new(TracingUi),
            communicator: Arc::new(AddressOnlyCommunicator),
            provisioners: Arc::new(NoProvisioners),
            synced_folders: Arc::new(NoSyncedFolders),
            confirmation: Arc::new(FixedAnswer(false)),
            packager: Arc::new(NoPackager),
        }
    }

    pub fn with_ui(mut self, ui: Arc<dyn Ui>) -> Self {
        self.ui = ui;
        self
    }

    pub fn with_communicator(mut self, communicator: Arc<dyn Communicator>) -> Self {
        self.communicator = communicator;
        self
    }

    pub fn with_provisioners(mut self, provisioners: Arc<dyn ProvisionerHooks>) -> Self {
        self.provisioners = provisioners;
        self
    }

    pub fn with_synced_folders(mut self, synced_folders: Arc<dyn SyncedFolders>) -> Self {
        self.synced_folders = synced_folders;
        self
    }

    pub fn with_confirmation(mut self, confirmation: Arc<dyn Confirmation>) -> Self {
        self.confirmation = confirmation;
        self
    }

    pub fn with_packager(mut self, packager: Arc<dyn BoxPackager>) -> Self {
        self.packager = packager;
        self
    }
}

impl Default for HostServices {
    fn default() -> Self {
        Self::headless()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_ui() {
        let ui = RecordingUi::new();
        ui.info("Creating domain");
        ui.warn("slow");
        ui.progress("Uploading", 5, 10);
        assert_eq!(
            ui.messages(),
            vec!["Creating domain", "warning: slow", "Uploading: 5/10"]
        );
        assert!(ui.contains("domain"));
    }

    #[tokio::test]
    async fn test_headless_declines_destroy() {
        let host = HostServices::headless();
        assert!(!host.confirmation.confirm("destroy?").await.unwrap());
        assert!(host
            .communicator
            .ready(Ipv4Addr::new(10, 0, 0, 2))
            .await
            .unwrap());
    }
}
