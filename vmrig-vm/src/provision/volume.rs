use tracing::info;

use vmrig_core::backend::VirtBackend;
use vmrig_core::definition::{BackingStore, VolumeDefinition, VolumeInfo};
use vmrig_core::error::{VmrigError, VmrigResult};
use vmrig_core::types::DiskSpec;

use super::GIB;

/// Name of the machine's root volume cloned from box disk `index`
pub fn root_volume_name(domain: &str, index: usize) -> String {
    if index == 0 {
        format!("{}.img", domain)
    } else {
        format!("{}_{}.img", domain, index)
    }
}

/// Volume name of an additional disk: its explicit path, or
/// `<domain>-<device>.<format>`
pub fn additional_disk_volume_name(domain: &str, disk: &DiskSpec) -> String {
    match &disk.path {
        Some(path) => path.clone(),
        None => format!(
            "{}-{}.{}",
            domain,
            disk.device.as_deref().unwrap_or("disk"),
            disk.format
        ),
    }
}

/// Copy-on-write clones of the box volumes for a new machine.
///
/// Fails with `DomainVolumeExists` rather than touching a volume that
/// already carries the machine's name.
pub async fn clone_box_volumes(
    backend: &dyn VirtBackend,
    pool: &str,
    domain: &str,
    box_volumes: &[VolumeInfo],
    root_size_gib: Option<u64>,
) -> VmrigResult<Vec<VolumeInfo>> {
    let mut volumes = Vec::with_capacity(box_volumes.len());
    for (index, base) in box_volumes.iter().enumerate() {
        let name = root_volume_name(domain, index);
        if backend.lookup_volume(pool, &name).await?.is_some() {
            return Err(VmrigError::DomainVolumeExists {
                pool: pool.to_string(),
                volume: name,
            });
        }

        let mut capacity_bytes = base.capacity_bytes;
        if index == 0 {
            if let Some(size) = root_size_gib {
                capacity_bytes = capacity_bytes.max(size * GIB);
            }
        }

        info!("Creating volume '{}' backed by '{}'", name, base.name);
        let definition = VolumeDefinition {
            name,
            capacity_bytes,
            format: "qcow2".to_string(),
            backing_store: Some(BackingStore {
                path: base.path.clone(),
                format: base.format.clone(),
            }),
        };
        volumes.push(backend.create_volume(pool, &definition).await?);
    }
    Ok(volumes)
}

/// Create the volume behind an additional disk, or reuse it when the disk
/// allows that.
pub async fn ensure_disk(
    backend: &dyn VirtBackend,
    pool: &str,
    domain: &str,
    disk: &DiskSpec,
) -> VmrigResult<VolumeInfo> {
    let name = additional_disk_volume_name(domain, disk);
    if let Some(existing) = backend.lookup_volume(pool, &name).await? {
        if disk.allow_existing {
            info!("Reusing existing volume '{}'", name);
            return Ok(existing);
        }
        return Err(VmrigError::DomainVolumeExists {
            pool: pool.to_string(),
            volume: name,
        });
    }

    info!("Creating disk volume '{}' ({} GiB)", name, disk.size_gib);
    let definition = VolumeDefinition {
        name,
        capacity_bytes: disk.size_gib * GIB,
        format: disk.format.clone(),
        backing_store: None,
    };
    backend.create_volume(pool, &definition).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmrig_core::error::ErrorKind;
    use vmrig_core::mock::MockBackend;

    async fn backend_with_box() -> (MockBackend, VolumeInfo) {
        let backend = MockBackend::new();
        backend.add_pool("default", "/pool", true);
        backend.add_volume("default", "box.img", 20 * GIB).unwrap();
        let base = backend.lookup_volume("default", "box.img").await.unwrap().unwrap();
        (backend, base)
    }

    #[tokio::test]
    async fn test_clone_uses_backing_store() {
        let (backend, base) = backend_with_box().await;
        let volumes = clone_box_volumes(&backend, "default", "proj_web", &[base], Some(40))
            .await
            .unwrap();
        assert_eq!(volumes[0].name, "proj_web.img");
        assert_eq!(volumes[0].path, "/pool/proj_web.img");
        assert_eq!(volumes[0].capacity_bytes, 40 * GIB);
    }

    #[tokio::test]
    async fn test_clone_refuses_existing_volume() {
        let (backend, base) = backend_with_box().await;
        backend.add_volume("default", "proj_web.img", GIB).unwrap();

        let err = clone_box_volumes(&backend, "default", "proj_web", &[base], None)
            .await
            .unwrap_err();
        assert!(matches!(err, VmrigError::DomainVolumeExists { .. }));
        assert_eq!(err.kind(), ErrorKind::ResourceConflict);
        assert_eq!(backend.call_count("create_volume"), 0);
    }

    #[test]
    fn test_volume_names() {
        assert_eq!(root_volume_name("web", 0), "web.img");
        assert_eq!(root_volume_name("web", 1), "web_1.img");
        let disk = DiskSpec::named("data").with_device("vdb");
        assert_eq!(additional_disk_volume_name("web", &disk), "web-vdb.qcow2");
    }

    #[tokio::test]
    async fn test_existing_disk_reuse() {
        let (backend, _) = backend_with_box().await;
        let mut disk = DiskSpec::named("data").with_device("vdb");
        backend.add_volume("default", "web-vdb.qcow2", GIB).unwrap();

        let err = ensure_disk(&backend, "default", "web", &disk).await.unwrap_err();
        assert!(matches!(err, VmrigError::DomainVolumeExists { .. }));

        disk.allow_existing = true;
        let volume = ensure_disk(&backend, "default", "web", &disk).await.unwrap();
        assert_eq!(volume.capacity_bytes, GIB);
        assert_eq!(backend.call_count("create_volume"), 0);
    }
}
