pub mod action;
pub mod disk;
pub mod domain;
pub mod host;
pub mod network;
pub mod orchestrator;
pub mod port_forward;
pub mod provision;

pub use action::{ActionTable, MachineEnv, Operation, Pipeline, RunContext, Step};
pub use host::HostServices;
pub use orchestrator::{Orchestrator, RunReport};
pub use port_forward::{CommandExecutor, CommandOutput, PortForwarder, SystemCommandExecutor};

// Re-export core types for convenience
pub use vmrig_core::{
    backend::VirtBackend,
    config::MachineConfig,
    error::{ErrorKind, VmrigError, VmrigResult},
    machine_data::MachineDataDir,
    types::MachineState,
};
