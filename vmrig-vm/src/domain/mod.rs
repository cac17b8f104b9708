//! Domain naming, definition building and start-time reconciliation

pub mod builder;
pub mod reconcile;

pub use builder::{apply_boot_order, build, AttachedDisk};
pub use reconcile::{reconcile, Reconciliation};

use rand::Rng;
use tracing::{debug, info, warn};

use vmrig_core::backend::VirtBackend;
use vmrig_core::config::MachineConfig;
use vmrig_core::definition::{DefinitionRenderer, DomainDefinition};
use vmrig_core::error::{VmrigError, VmrigResult};
use vmrig_core::types::DomainDescriptor;

/// Name of the machine's domain.
///
/// An explicit `domain_name` wins. Otherwise `<prefix>_<machine>`, where the
/// prefix defaults to the project directory name stripped to
/// `[-A-Za-z0-9_.]`, optionally followed by `_<unix-ts>_<hex>`.
pub fn domain_name(config: &MachineConfig, project_dir: &str) -> String {
    if let Some(name) = &config.domain.domain_name {
        return name.clone();
    }

    let prefix = match &config.domain.default_prefix {
        Some(prefix) => prefix.clone(),
        None => project_dir
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            .collect(),
    };

    let mut name = if prefix.is_empty() {
        config.machine_name.clone()
    } else {
        format!("{}_{}", prefix, config.machine_name)
    };

    if config.domain.random_hostname {
        let mut rng = rand::thread_rng();
        let suffix: String = (0..10)
            .map(|_| format!("{:02x}", rng.gen::<u8>()))
            .collect();
        name.push_str(&format!("_{}_{}", chrono::Utc::now().timestamp(), suffix));
    }
    name
}

/// Replace a domain's definition as a unit.
///
/// The backend cannot partially redefine static fields, so the domain is
/// undefined and the new document defined. If that define fails the
/// original definition is put back before the error is returned.
pub async fn redefine(
    backend: &dyn VirtBackend,
    original: &DomainDefinition,
    updated: &DomainDefinition,
) -> VmrigResult<()> {
    backend.undefine_domain(&original.name).await?;
    match backend.define_domain(updated).await {
        Ok(_) => Ok(()),
        Err(cause) => {
            warn!(
                "Redefining '{}' failed, restoring the previous definition: {}",
                original.name, cause
            );
            if let Err(restore) = backend.define_domain(original).await {
                return Err(VmrigError::RestoreFailed {
                    domain: original.name.clone(),
                    cause: cause.to_string(),
                    restore: restore.to_string(),
                });
            }
            Err(cause)
        }
    }
}

/// Bring an existing domain's persistent definition in line with the
/// descriptor, redefining only when something differs.
pub async fn reconcile_domain(
    backend: &dyn VirtBackend,
    renderer: &DefinitionRenderer,
    descriptor: &DomainDescriptor,
) -> VmrigResult<Reconciliation> {
    let live = backend.domain_definition(&descriptor.name, true).await?;
    let result = reconcile(&live, descriptor);

    if result.changed {
        info!(
            "Updating domain '{}': {}",
            descriptor.name,
            result.changes.join(", ")
        );
        let xml = renderer.render_domain(&result.updated)?;
        debug!("Updated definition:\n{}", xml);
        redefine(backend, &live, &result.updated).await?;
    } else {
        debug!("Domain '{}' matches its configuration", descriptor.name);
    }
    Ok(result)
}
