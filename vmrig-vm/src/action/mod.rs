//! Machine lifecycle operations as step pipelines
//!
//! Every [`Operation`] maps to one pipeline of the [`ActionTable`], which is
//! built once and shared by every run. Pipelines branch on the machine state
//! as it is when the branch is reached.

pub mod context;
pub mod pipeline;
pub mod steps;
pub mod wait;

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

use vmrig_core::error::VmrigError;

pub use context::{MachineEnv, RunContext, SetupState};
pub use pipeline::{Condition, Pipeline, Step};
pub use wait::{poll_until, WaitOutcome};

use steps::*;

/// Top-level operations on a machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Up,
    Start,
    Halt,
    Reload,
    Destroy,
    Suspend,
    Resume,
    Package,
    Provision,
    State,
    SnapshotSave,
    SnapshotRestore,
    SnapshotDelete,
    SnapshotList,
}

impl Operation {
    pub const ALL: [Operation; 14] = [
        Operation::Up,
        Operation::Start,
        Operation::Halt,
        Operation::Reload,
        Operation::Destroy,
        Operation::Suspend,
        Operation::Resume,
        Operation::Package,
        Operation::Provision,
        Operation::State,
        Operation::SnapshotSave,
        Operation::SnapshotRestore,
        Operation::SnapshotDelete,
        Operation::SnapshotList,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Up => "up",
            Operation::Start => "start",
            Operation::Halt => "halt",
            Operation::Reload => "reload",
            Operation::Destroy => "destroy",
            Operation::Suspend => "suspend",
            Operation::Resume => "resume",
            Operation::Package => "package",
            Operation::Provision => "provision",
            Operation::State => "state",
            Operation::SnapshotSave => "snapshot_save",
            Operation::SnapshotRestore => "snapshot_restore",
            Operation::SnapshotDelete => "snapshot_delete",
            Operation::SnapshotList => "snapshot_list",
        }
    }

    /// Whether the operation needs a snapshot name
    pub fn takes_snapshot_name(&self) -> bool {
        matches!(
            self,
            Operation::SnapshotSave | Operation::SnapshotRestore | Operation::SnapshotDelete
        )
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Operation {
    type Err = VmrigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Operation::ALL
            .iter()
            .copied()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| VmrigError::InvalidOperation {
                operation: s.to_string(),
                reason: "unknown operation".to_string(),
            })
    }
}

/// The fixed pipelines behind every operation
pub struct ActionTable {
    pub up: Arc<Pipeline>,
    pub start: Arc<Pipeline>,
    pub halt: Arc<Pipeline>,
    pub reload: Arc<Pipeline>,
    pub destroy: Arc<Pipeline>,
    pub suspend: Arc<Pipeline>,
    pub resume: Arc<Pipeline>,
    pub package: Arc<Pipeline>,
    pub provision: Arc<Pipeline>,
    pub snapshot_save: Arc<Pipeline>,
    pub snapshot_restore: Arc<Pipeline>,
    pub snapshot_delete: Arc<Pipeline>,
    pub snapshot_list: Arc<Pipeline>,
}

impl ActionTable {
    pub fn new() -> Self {
        let halt = Arc::new(halt_pipeline());
        let destroy = Arc::new(destroy_pipeline());
        let start = Arc::new(start_pipeline());

        Self {
            up: Arc::new(up_pipeline(start.clone(), halt.clone(), destroy.clone())),
            reload: Arc::new(
                Pipeline::new("reload").branch(
                    IsCreated,
                    Arc::new(Pipeline::new("reload_created").sub(halt.clone()).sub(start.clone())),
                    not_created(),
                ),
            ),
            suspend: Arc::new(if_created("suspend", Pipeline::new("suspend_created").step(SuspendDomain))),
            resume: Arc::new(if_created(
                "resume",
                Pipeline::new("resume_created").branch(
                    IsSuspended,
                    Arc::new(
                        Pipeline::new("resume_suspended")
                            .step(ResumeNetworks)
                            .step(ResumeDomain)
                            .step(Provision),
                    ),
                    Arc::new(Pipeline::new("not_suspended").step(Message("Domain is not suspended."))),
                ),
            )),
            package: Arc::new(if_created(
                "package",
                Pipeline::new("package_created").sub(halt.clone()).step(PackageDomain),
            )),
            provision: Arc::new(if_created(
                "provision",
                Pipeline::new("provision_created").branch(
                    IsRunning,
                    Arc::new(Pipeline::new("provision_running").step(Provision)),
                    Arc::new(Pipeline::new("not_running").step(Message("Domain is not running."))),
                ),
            )),
            snapshot_save: Arc::new(if_created("snapshot_save", Pipeline::new("save").step(SnapshotSave))),
            snapshot_restore: Arc::new(if_created(
                "snapshot_restore",
                Pipeline::new("restore").step(SnapshotRestore),
            )),
            snapshot_delete: Arc::new(if_created(
                "snapshot_delete",
                Pipeline::new("delete").step(SnapshotDelete),
            )),
            snapshot_list: Arc::new(if_created("snapshot_list", Pipeline::new("list").step(SnapshotList))),
            start: Arc::new(if_created("start", Pipeline::new("start_created").sub(start))),
            halt,
            destroy,
        }
    }

    /// Pipeline of `operation`; `State` has none
    pub fn pipeline(&self, operation: Operation) -> Option<Arc<Pipeline>> {
        let pipeline = match operation {
            Operation::Up => &self.up,
            Operation::Start => &self.start,
            Operation::Halt => &self.halt,
            Operation::Reload => &self.reload,
            Operation::Destroy => &self.destroy,
            Operation::Suspend => &self.suspend,
            Operation::Resume => &self.resume,
            Operation::Package => &self.package,
            Operation::Provision => &self.provision,
            Operation::State => return None,
            Operation::SnapshotSave => &self.snapshot_save,
            Operation::SnapshotRestore => &self.snapshot_restore,
            Operation::SnapshotDelete => &self.snapshot_delete,
            Operation::SnapshotList => &self.snapshot_list,
        };
        Some(pipeline.clone())
    }
}

impl Default for ActionTable {
    fn default() -> Self {
        Self::new()
    }
}

fn not_created() -> Arc<Pipeline> {
    Arc::new(Pipeline::new("not_created").step(Message("Domain is not created. Please run `up` first.")))
}

fn if_created(name: &str, then: Pipeline) -> Pipeline {
    Pipeline::new(name).branch(IsCreated, Arc::new(then), not_created())
}

fn halt_pipeline() -> Pipeline {
    if_created(
        "halt",
        Pipeline::new("halt_created")
            .step(ClearForwardedPorts)
            .step(HaltDomain),
    )
}

fn destroy_pipeline() -> Pipeline {
    let confirmed = Pipeline::new("destroy_confirmed")
        .step(ProvisionerCleanup)
        .step(ClearForwardedPorts)
        .step(PruneExports)
        .step(DestroyDomain)
        .step(DestroyNetworks);
    let declined = Pipeline::new("destroy_declined").step(Message("The domain will not be destroyed."));

    if_created(
        "destroy",
        Pipeline::new("destroy_created")
            .step(ConfirmDestroy)
            .branch(DestroyConfirmed, Arc::new(confirmed), Arc::new(declined)),
    )
}

/// Start a created machine from whatever state it is in
fn start_pipeline() -> Pipeline {
    let running = Pipeline::new("start_running").step(Provision);
    let suspended = Pipeline::new("start_suspended")
        .step(ResumeNetworks)
        .step(ResumeDomain)
        .step(Provision);
    let boot = Pipeline::new("start_boot")
        .step(ResolveDiskSettings)
        .step(CreateNetworks)
        .step(SetBootOrder)
        .step(StartDomain)
        .step(WaitTillUp)
        .step(ForwardPorts)
        .step(Provision);

    Pipeline::new("start").branch(
        IsRunning,
        Arc::new(running),
        Arc::new(Pipeline::new("start_stopped").branch(
            IsSuspended,
            Arc::new(suspended),
            Arc::new(boot),
        )),
    )
}

fn up_pipeline(start: Arc<Pipeline>, halt: Arc<Pipeline>, destroy: Arc<Pipeline>) -> Pipeline {
    let create = Pipeline::new("create")
        .step(StartGuard::new(halt, destroy))
        .step(SetDomainName)
        .step(EnsureStoragePool)
        .step(ImportBox)
        .step(CloneBoxVolumes)
        .step(ResolveDiskSettings)
        .step(CreateAdditionalDisks)
        .step(CreateDomain)
        .step(CreateNetworks)
        .step(CreateNetworkInterfaces)
        .step(SetBootOrder)
        .step(StartDomain)
        .step(WaitTillUp)
        .step(ForwardPorts)
        .step(Provision)
        .step(MarkSetupComplete);

    Pipeline::new("up")
        .step(ValidateConfig)
        .branch(IsCreated, start, Arc::new(create))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_names_round_trip() {
        for op in Operation::ALL {
            assert_eq!(op.to_string().parse::<Operation>().unwrap(), op);
        }
        assert!("explode".parse::<Operation>().is_err());
    }

    #[test]
    fn test_every_operation_but_state_has_a_pipeline() {
        let table = ActionTable::new();
        for op in Operation::ALL {
            assert_eq!(table.pipeline(op).is_some(), op != Operation::State, "{}", op);
        }
        assert_eq!(table.up.step_names(), vec!["validate_config"]);
    }
}
