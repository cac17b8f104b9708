//! Box image import into the storage pool
//!
//! Each box disk becomes one volume whose name is derived from the box
//! identity and the disk index, so a second import of the same box finds
//! the volume and skips the upload.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use vmrig_core::backend::VirtBackend;
use vmrig_core::definition::{VolumeDefinition, VolumeInfo};
use vmrig_core::error::{VmrigError, VmrigResult};
use vmrig_core::lock::{LockManager, STORAGE_LOCK};
use vmrig_core::types::{BoxDescriptor, BoxDisk};

use super::GIB;
use crate::host::Ui;

/// Upload chunk size
pub const UPLOAD_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Stands in for `/` in box names, which volume names cannot contain
const SLASH_ESCAPE: &str = "-SLASH-";

/// Deterministic pool volume name for disk `index` of a box
pub fn box_volume_name(descriptor: &BoxDescriptor, index: usize) -> String {
    let name = descriptor.name.replace('/', SLASH_ESCAPE);
    let suffix = if index == 0 {
        String::new()
    } else {
        format!("_{}", index)
    };
    format!("{}_box_image_{}{}.img", name, descriptor.version, suffix)
}

pub struct BoxImporter {
    backend: Arc<dyn VirtBackend>,
    locks: Arc<LockManager>,
    ui: Arc<dyn Ui>,
}

impl BoxImporter {
    pub fn new(backend: Arc<dyn VirtBackend>, locks: Arc<LockManager>, ui: Arc<dyn Ui>) -> Self {
        Self { backend, locks, ui }
    }

    /// Ensure every disk of the box is present in `pool`.
    ///
    /// Returns the box volumes in disk order. A volume left behind by a
    /// failed or interrupted upload is deleted before the error is returned.
    pub async fn import(
        &self,
        pool: &str,
        descriptor: &BoxDescriptor,
        interrupted: &AtomicBool,
    ) -> VmrigResult<Vec<VolumeInfo>> {
        let _guard = self.locks.lock(STORAGE_LOCK).await?;

        let mut volumes = Vec::with_capacity(descriptor.disks.len());
        for (index, disk) in descriptor.disks.iter().enumerate() {
            let name = box_volume_name(descriptor, index);
            if let Some(volume) = self.backend.lookup_volume(pool, &name).await? {
                debug!("Box volume '{}' already present", name);
                volumes.push(volume);
                continue;
            }

            self.ui.info(&format!(
                "Uploading base box image as volume into storage pool: {}",
                name
            ));
            let volume = self.create_and_upload(pool, &name, disk, interrupted).await?;
            volumes.push(volume);
        }
        Ok(volumes)
    }

    async fn create_and_upload(
        &self,
        pool: &str,
        name: &str,
        disk: &BoxDisk,
        interrupted: &AtomicBool,
    ) -> VmrigResult<VolumeInfo> {
        let definition = VolumeDefinition {
            name: name.to_string(),
            capacity_bytes: disk.virtual_size_gib * GIB,
            format: disk.format.clone(),
            backing_store: None,
        };
        let volume = self.backend.create_volume(pool, &definition).await?;

        match self.upload(pool, name, disk, interrupted).await {
            Ok(()) => {
                info!("Imported box volume '{}'", name);
                Ok(volume)
            }
            Err(e) => {
                warn!("Upload of '{}' did not complete, removing it: {}", name, e);
                if let Err(delete) = self.backend.delete_volume(pool, name).await {
                    warn!("Failed to remove partial volume '{}': {}", name, delete);
                }
                Err(e)
            }
        }
    }

    async fn upload(
        &self,
        pool: &str,
        name: &str,
        disk: &BoxDisk,
        interrupted: &AtomicBool,
    ) -> VmrigResult<()> {
        let mut file = tokio::fs::File::open(&disk.path).await?;
        let total = file.metadata().await?.len();
        let label = format!("Progress of {}", name);

        let mut buffer = vec![0u8; UPLOAD_CHUNK_SIZE];
        let mut offset = 0u64;
        loop {
            if interrupted.load(Ordering::SeqCst) {
                return Err(VmrigError::interrupted(format!("upload of {}", name)));
            }
            let read = file.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            self.backend
                .upload_volume_chunk(pool, name, offset, &buffer[..read])
                .await?;
            offset += read as u64;
            self.ui.progress(&label, offset, total);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::RecordingUi;
    use tempfile::TempDir;
    use vmrig_core::mock::MockBackend;

    fn descriptor(dir: &TempDir, size: usize) -> BoxDescriptor {
        let path = dir.path().join("box.img");
        std::fs::write(&path, vec![7u8; size]).unwrap();
        BoxDescriptor {
            name: "generic/debian12".to_string(),
            version: "4.3.12".to_string(),
            disks: vec![BoxDisk {
                path,
                virtual_size_gib: 20,
                format: "qcow2".to_string(),
            }],
        }
    }

    fn importer(backend: Arc<MockBackend>, dir: &TempDir) -> BoxImporter {
        BoxImporter::new(
            backend,
            Arc::new(LockManager::new(dir.path().join("locks"))),
            Arc::new(RecordingUi::new()),
        )
    }

    #[test]
    fn test_volume_names() {
        let descriptor = BoxDescriptor {
            name: "generic/debian12".to_string(),
            version: "1.0".to_string(),
            disks: Vec::new(),
        };
        assert_eq!(
            box_volume_name(&descriptor, 0),
            "generic-SLASH-debian12_box_image_1.0.img"
        );
        assert_eq!(
            box_volume_name(&descriptor, 2),
            "generic-SLASH-debian12_box_image_1.0_2.img"
        );
    }

    #[tokio::test]
    async fn test_second_import_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::new());
        backend.add_pool("default", "/pool", true);
        let importer = importer(backend.clone(), &dir);
        let descriptor = descriptor(&dir, 1000);
        let interrupted = AtomicBool::new(false);

        let first = importer.import("default", &descriptor, &interrupted).await.unwrap();
        let second = importer.import("default", &descriptor, &interrupted).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(backend.call_count("create_volume"), 1);
        assert_eq!(backend.call_count("upload_volume_chunk"), 1);
        assert_eq!(first[0].capacity_bytes, 20 * GIB);
        assert_eq!(
            backend.volume_bytes_written("default", &first[0].name),
            Some(1000)
        );
    }

    #[tokio::test]
    async fn test_failed_upload_removes_volume() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::new());
        backend.add_pool("default", "/pool", true);
        backend.fail_once("upload_volume_chunk", "connection reset");
        let importer = importer(backend.clone(), &dir);
        let descriptor = descriptor(&dir, 10);

        let err = importer
            .import("default", &descriptor, &AtomicBool::new(false))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("connection reset"));
        assert!(backend
            .volume("default", &box_volume_name(&descriptor, 0))
            .is_none());
    }

    #[tokio::test]
    async fn test_interrupted_upload_removes_volume() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::new());
        backend.add_pool("default", "/pool", true);
        let importer = importer(backend.clone(), &dir);
        let descriptor = descriptor(&dir, 10);

        let err = importer
            .import("default", &descriptor, &AtomicBool::new(true))
            .await
            .unwrap_err();
        assert!(matches!(err, VmrigError::Interrupted { .. }));
        assert_eq!(backend.call_count("delete_volume"), 1);
        assert_eq!(backend.call_count("upload_volume_chunk"), 0);
    }
}
