use tracing::{debug, info};

use vmrig_core::backend::VirtBackend;
use vmrig_core::config::{StorageSettings, DEFAULT_POOL_NAME};
use vmrig_core::definition::{DefinitionRenderer, PoolInfo, StoragePoolDefinition};
use vmrig_core::error::{VmrigError, VmrigResult};

/// Make sure the configured storage pool exists and is active.
///
/// Only the default pool is ever created. A missing pool that was named
/// explicitly is a configuration error. Callers hold the `storage` lock.
pub async fn ensure_storage_pool(
    backend: &dyn VirtBackend,
    renderer: &DefinitionRenderer,
    settings: &StorageSettings,
) -> VmrigResult<PoolInfo> {
    let name = settings.pool_name.as_str();

    let pool = match backend.lookup_pool(name).await? {
        Some(pool) => pool,
        None if name == DEFAULT_POOL_NAME => {
            info!(
                "Creating storage pool '{}' at {}",
                name,
                settings.pool_path.display()
            );
            let definition = StoragePoolDefinition {
                name: name.to_string(),
                kind: "dir".to_string(),
                path: settings.pool_path.to_string_lossy().into_owned(),
            };
            let xml = renderer.render_pool(&definition)?;
            debug!("Pool definition:\n{}", xml);
            backend.define_pool(&definition).await?;
            backend.build_pool(name).await?;
            backend.start_pool(name).await?;
            backend.set_pool_autostart(name, true).await?;
            return backend
                .lookup_pool(name)
                .await?
                .ok_or_else(|| VmrigError::not_found(format!("storage pool {}", name)));
        }
        None => {
            return Err(VmrigError::StoragePoolNotFound {
                name: name.to_string(),
            })
        }
    };

    if pool.active {
        return Ok(pool);
    }

    info!("Starting storage pool '{}'", name);
    backend.start_pool(name).await?;
    Ok(PoolInfo {
        active: true,
        ..pool
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmrig_core::error::ErrorKind;
    use vmrig_core::mock::MockBackend;

    fn settings(name: &str) -> StorageSettings {
        StorageSettings {
            pool_name: name.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_default_pool_is_created_once() {
        let backend = MockBackend::new();
        let renderer = DefinitionRenderer::new().unwrap();

        let pool = ensure_storage_pool(&backend, &renderer, &settings("default"))
            .await
            .unwrap();
        assert!(pool.active);
        assert!(pool.autostart);
        assert_eq!(pool.path, "/var/lib/libvirt/images");

        ensure_storage_pool(&backend, &renderer, &settings("default"))
            .await
            .unwrap();
        assert_eq!(backend.call_count("define_pool"), 1);
        assert_eq!(backend.call_count("build_pool"), 1);
    }

    #[tokio::test]
    async fn test_named_pool_is_never_created() {
        let backend = MockBackend::new();
        let renderer = DefinitionRenderer::new().unwrap();

        let err = ensure_storage_pool(&backend, &renderer, &settings("fast"))
            .await
            .unwrap_err();
        assert!(matches!(err, VmrigError::StoragePoolNotFound { .. }));
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(backend.call_count("define_pool"), 0);
    }

    #[tokio::test]
    async fn test_inactive_pool_is_started() {
        let backend = MockBackend::new();
        backend.add_pool("fast", "/srv/fast", false);
        let renderer = DefinitionRenderer::new().unwrap();

        let pool = ensure_storage_pool(&backend, &renderer, &settings("fast"))
            .await
            .unwrap();
        assert!(pool.active);
        assert_eq!(backend.call_count("start_pool"), 1);
    }
}
