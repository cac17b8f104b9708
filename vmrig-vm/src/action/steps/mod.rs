//! The steps pipelines are built from

pub mod create;
pub mod destroy;
pub mod guard;
pub mod package;
pub mod snapshot;
pub mod start;
pub mod state;
pub mod stop;

pub use create::{
    CloneBoxVolumes, CreateAdditionalDisks, CreateDomain, CreateNetworkInterfaces, CreateNetworks,
    EnsureStoragePool, ImportBox, ResolveDiskSettings, SetBootOrder, SetDomainName,
};
pub use destroy::{ConfirmDestroy, DestroyDomain, DestroyNetworks, ProvisionerCleanup, PruneExports};
pub use guard::{MarkSetupComplete, StartGuard, ValidateConfig};
pub use package::PackageDomain;
pub use snapshot::{SnapshotDelete, SnapshotList, SnapshotRestore, SnapshotSave};
pub use start::{ForwardPorts, Provision, ResumeDomain, ResumeNetworks, StartDomain, WaitTillUp};
pub use state::{DestroyConfirmed, IsCreated, IsRunning, IsSuspended, Message};
pub use stop::{ClearForwardedPorts, HaltDomain, SuspendDomain};
