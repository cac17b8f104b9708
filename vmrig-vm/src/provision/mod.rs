//! Idempotent "ensure present" operations for storage
//!
//! Pool and box-volume checks run inside the process-wide `storage` lock so
//! the existence check and the create-if-absent action are atomic with
//! respect to other machines sharing the same pool or box. Machine volumes
//! are namespaced by domain name and need no lock.

pub mod box_image;
pub mod storage_pool;
pub mod volume;

pub use box_image::{box_volume_name, BoxImporter};
pub use storage_pool::ensure_storage_pool;
pub use volume::{additional_disk_volume_name, clone_box_volumes, ensure_disk, root_volume_name};

/// Bytes in one GiB, the unit sizes are declared in
pub const GIB: u64 = 1024 * 1024 * 1024;
