//! Core types, configuration and backend abstraction for vmrig
//!
//! `vmrig-vm` builds the orchestration engine on top of these pieces:
//! the [`backend::VirtBackend`] trait, typed backend definitions, the
//! per-machine configuration, named file locks and the durable machine
//! data directory.

pub mod backend;
pub mod config;
pub mod definition;
pub mod error;
pub mod lock;
pub mod machine_data;
pub mod mock;
pub mod observability;
pub mod types;

pub use backend::{BackendFactory, BackendRegistry, VirtBackend};
pub use config::{ConfigBuilder, MachineConfig};
pub use error::{ErrorKind, VmrigError, VmrigResult};
pub use lock::{LockGuard, LockManager};
pub use machine_data::MachineDataDir;
pub use mock::MockBackend;
pub use types::*;
