use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::ConnectionSettings;
use crate::definition::{
    DomainDefinition, DomainInfo, InterfaceAddress, InterfaceDefinition, NetworkDefinition,
    NetworkInfo, PoolInfo, SnapshotInfo, StoragePoolDefinition, VolumeDefinition, VolumeInfo,
};
use crate::error::{VmrigError, VmrigResult};
use crate::mock::MockBackend;
use crate::types::DomainPowerState;

/// Abstract interface to the virtualization backend
///
/// One connection is constructed at program start and shared as
/// `Arc<dyn VirtBackend>` by every component that needs it. Implementations
/// wrap their client library's failures into [`VmrigError::Backend`] so that
/// callers only branch on this crate's error taxonomy.
///
/// Lookups return `Ok(None)` for absent resources; every other operation on
/// an absent resource fails with [`VmrigError::NotFound`].
#[async_trait]
pub trait VirtBackend: Send + Sync {
    /// URI this backend is connected to
    fn uri(&self) -> &str;

    // Domains

    async fn lookup_domain(&self, name: &str) -> VmrigResult<Option<DomainInfo>>;

    async fn lookup_domain_by_uuid(&self, uuid: &str) -> VmrigResult<Option<DomainInfo>>;

    async fn list_domains(&self) -> VmrigResult<Vec<DomainInfo>>;

    /// Current definition of a domain.
    ///
    /// With `inactive` set the persistent definition is returned, which is
    /// what a subsequent define will replace.
    async fn domain_definition(&self, name: &str, inactive: bool) -> VmrigResult<DomainDefinition>;

    /// Define (or redefine) a persistent domain
    async fn define_domain(&self, definition: &DomainDefinition) -> VmrigResult<DomainInfo>;

    async fn undefine_domain(&self, name: &str) -> VmrigResult<()>;

    async fn start_domain(&self, name: &str) -> VmrigResult<()>;

    /// Ask the guest to shut down (ACPI)
    async fn shutdown_domain(&self, name: &str) -> VmrigResult<()>;

    /// Power the domain off immediately
    async fn poweroff_domain(&self, name: &str) -> VmrigResult<()>;

    async fn suspend_domain(&self, name: &str) -> VmrigResult<()>;

    async fn resume_domain(&self, name: &str) -> VmrigResult<()>;

    /// Save memory state to disk and stop the domain
    async fn managed_save(&self, name: &str) -> VmrigResult<()>;

    async fn has_managed_save(&self, name: &str) -> VmrigResult<bool>;

    async fn remove_managed_save(&self, name: &str) -> VmrigResult<()>;

    async fn domain_state(&self, name: &str) -> VmrigResult<Option<DomainPowerState>>;

    async fn attach_interface(
        &self,
        name: &str,
        interface: &InterfaceDefinition,
    ) -> VmrigResult<()>;

    /// Addresses leased to the domain's interfaces
    async fn domain_interface_addresses(&self, name: &str) -> VmrigResult<Vec<InterfaceAddress>>;

    // Networks

    async fn list_networks(&self) -> VmrigResult<Vec<NetworkInfo>>;

    async fn lookup_network(&self, name: &str) -> VmrigResult<Option<NetworkInfo>>;

    async fn lookup_network_by_uuid(&self, uuid: &str) -> VmrigResult<Option<NetworkInfo>>;

    async fn define_network(&self, definition: &NetworkDefinition) -> VmrigResult<NetworkInfo>;

    async fn start_network(&self, name: &str) -> VmrigResult<()>;

    async fn set_network_autostart(&self, name: &str, autostart: bool) -> VmrigResult<()>;

    async fn destroy_network(&self, name: &str) -> VmrigResult<()>;

    async fn undefine_network(&self, name: &str) -> VmrigResult<()>;

    /// Host network interfaces, used to avoid bridge name collisions
    async fn list_host_interfaces(&self) -> VmrigResult<Vec<String>>;

    // Storage pools

    async fn lookup_pool(&self, name: &str) -> VmrigResult<Option<PoolInfo>>;

    async fn define_pool(&self, definition: &StoragePoolDefinition) -> VmrigResult<PoolInfo>;

    async fn build_pool(&self, name: &str) -> VmrigResult<()>;

    async fn start_pool(&self, name: &str) -> VmrigResult<()>;

    async fn set_pool_autostart(&self, name: &str, autostart: bool) -> VmrigResult<()>;

    async fn refresh_pool(&self, name: &str) -> VmrigResult<()>;

    // Volumes

    async fn lookup_volume(&self, pool: &str, name: &str) -> VmrigResult<Option<VolumeInfo>>;

    async fn list_volumes(&self, pool: &str) -> VmrigResult<Vec<VolumeInfo>>;

    /// Create a volume; with a backing store this is a copy-on-write clone
    async fn create_volume(
        &self,
        pool: &str,
        definition: &VolumeDefinition,
    ) -> VmrigResult<VolumeInfo>;

    /// Write one chunk of volume contents at `offset`
    async fn upload_volume_chunk(
        &self,
        pool: &str,
        name: &str,
        offset: u64,
        data: &[u8],
    ) -> VmrigResult<()>;

    async fn delete_volume(&self, pool: &str, name: &str) -> VmrigResult<()>;

    // Snapshots

    async fn create_snapshot(
        &self,
        domain: &str,
        name: &str,
        description: Option<&str>,
    ) -> VmrigResult<SnapshotInfo>;

    async fn list_snapshots(&self, domain: &str) -> VmrigResult<Vec<SnapshotInfo>>;

    async fn revert_snapshot(&self, domain: &str, name: &str) -> VmrigResult<()>;

    async fn delete_snapshot(&self, domain: &str, name: &str) -> VmrigResult<()>;
}

/// Factory trait for creating backend connections
///
/// Real hypervisor bindings register a factory with the [`BackendRegistry`]
/// and the binary connects once through it at startup.
pub trait BackendFactory: Send + Sync {
    /// Connect to the backend described by `settings`
    fn connect(&self, settings: &ConnectionSettings) -> VmrigResult<Arc<dyn VirtBackend>>;

    /// Name of this backend type
    fn backend_type(&self) -> &'static str;

    fn description(&self) -> &'static str;
}

/// Registry for backend factories
#[derive(Clone)]
pub struct BackendRegistry {
    factories: HashMap<String, Arc<dyn BackendFactory>>,
}

impl BackendRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register(&mut self, factory: Arc<dyn BackendFactory>) {
        let backend_type = factory.backend_type().to_string();
        tracing::info!(
            "Registering backend: {} ({})",
            backend_type,
            factory.description()
        );
        self.factories.insert(backend_type, factory);
    }

    /// Connect using the backend named in `settings.backend`
    pub fn connect(&self, settings: &ConnectionSettings) -> VmrigResult<Arc<dyn VirtBackend>> {
        let factory = self.factories.get(&settings.backend).ok_or_else(|| {
            VmrigError::configuration(
                "connection.backend",
                format!(
                    "Unknown backend type: '{}'. Available backends: {:?}",
                    settings.backend,
                    self.list_available_backends()
                ),
            )
        })?;

        factory.connect(settings)
    }

    pub fn list_available_backends(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(MockBackendFactory));
        registry
    }
}

/// Factory for the in-memory backend
pub struct MockBackendFactory;

impl BackendFactory for MockBackendFactory {
    fn connect(&self, settings: &ConnectionSettings) -> VmrigResult<Arc<dyn VirtBackend>> {
        let uri = settings.uri()?;
        Ok(Arc::new(MockBackend::with_uri(uri)))
    }

    fn backend_type(&self) -> &'static str {
        "mock"
    }

    fn description(&self) -> &'static str {
        "In-memory backend for testing (no hypervisor required)"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_registry() {
        let mut registry = BackendRegistry::new();
        assert!(registry.list_available_backends().is_empty());

        registry.register(Arc::new(MockBackendFactory));
        assert_eq!(registry.list_available_backends(), vec!["mock"]);

        let default_registry = BackendRegistry::default();
        assert!(default_registry.list_available_backends().contains(&"mock"));
    }

    #[tokio::test]
    async fn test_connect_uses_settings_uri() {
        let registry = BackendRegistry::default();
        let settings = ConnectionSettings::default();
        let backend = registry.connect(&settings).unwrap();
        assert_eq!(backend.uri(), "qemu:///system");
        assert!(backend.list_domains().await.unwrap().is_empty());
    }

    #[test]
    fn test_unknown_backend_error() {
        let registry = BackendRegistry::default();
        let settings = ConnectionSettings {
            backend: "xen".to_string(),
            ..Default::default()
        };
        let err = registry.connect(&settings).err().unwrap();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("Unknown backend type"));
    }
}
