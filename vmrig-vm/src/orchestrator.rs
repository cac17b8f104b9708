//! Entry point for running operations against one machine
//!
//! The orchestrator owns the machine's [`MachineEnv`], the shared
//! [`ActionTable`] and the interruption flag. One operation runs at a time
//! per machine; separate machines get separate orchestrators and may run
//! concurrently.

use serde::Serialize;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Instrument, Span};
use uuid::Uuid;

use vmrig_core::backend::BackendRegistry;
use vmrig_core::config::MachineConfig;
use vmrig_core::definition::SnapshotInfo;
use vmrig_core::error::{VmrigError, VmrigResult};
use vmrig_core::machine_data::MachineDataDir;
use vmrig_core::observability::{operation_span, record_duration};
use vmrig_core::types::MachineState;

use crate::action::{ActionTable, MachineEnv, Operation, Pipeline, RunContext};

/// Outcome of one successful operation
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub operation: Operation,
    /// Machine state after the run, queried fresh
    pub state: MachineState,
    pub domain_name: Option<String>,
    pub address: Option<Ipv4Addr>,
    pub snapshots: Vec<SnapshotInfo>,
    pub package: Option<PathBuf>,
}

pub struct Orchestrator {
    env: Arc<MachineEnv>,
    actions: Arc<ActionTable>,
    interrupted: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(env: MachineEnv) -> Self {
        Self::with_actions(env, Arc::new(ActionTable::new()))
    }

    /// Share one action table between the orchestrators of many machines
    pub fn with_actions(env: MachineEnv, actions: Arc<ActionTable>) -> Self {
        Self {
            env: Arc::new(env),
            actions,
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Connect through `registry` and build the machine environment with
    /// headless host services
    pub fn connect(
        config: MachineConfig,
        project_name: impl Into<String>,
        registry: &BackendRegistry,
        data: MachineDataDir,
    ) -> VmrigResult<Self> {
        let backend = registry.connect(&config.connection)?;
        info!("Connected to {}", backend.uri());
        let env = MachineEnv::new(config, project_name, backend, data)?;
        Ok(Self::new(env))
    }

    pub fn env(&self) -> &Arc<MachineEnv> {
        &self.env
    }

    /// Flag that cancels the running operation when set
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        self.interrupted.clone()
    }

    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    /// Set the interruption flag on every Ctrl-C until the task is aborted
    pub fn install_signal_handler(&self) -> JoinHandle<()> {
        let flag = self.interrupted.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!("Cannot listen for interrupts: {}", e);
                    return;
                }
                warn!("Interrupt received; stopping at the next step boundary");
                flag.store(true, Ordering::SeqCst);
            }
        })
    }

    pub async fn run(&self, operation: Operation) -> VmrigResult<RunReport> {
        if operation.takes_snapshot_name() {
            return Err(VmrigError::InvalidOperation {
                operation: operation.to_string(),
                reason: "a snapshot name is required".to_string(),
            });
        }
        self.execute(operation, None).await
    }

    pub async fn run_snapshot(
        &self,
        operation: Operation,
        name: impl Into<String>,
    ) -> VmrigResult<RunReport> {
        if !operation.takes_snapshot_name() {
            return Err(VmrigError::InvalidOperation {
                operation: operation.to_string(),
                reason: "not a snapshot operation".to_string(),
            });
        }
        self.execute(operation, Some(name.into())).await
    }

    /// Run a pipeline that is not in the action table, e.g. a host-defined
    /// composition of the built-in steps
    pub async fn run_pipeline(
        &self,
        operation: Operation,
        pipeline: &Pipeline,
    ) -> VmrigResult<RunReport> {
        let span = operation_span(pipeline.name(), &self.env.config.machine_name);
        self.run_in_span(operation, pipeline, None).instrument(span).await
    }

    /// Current machine state, always queried from the backend
    pub async fn state(&self) -> VmrigResult<MachineState> {
        let mut ctx = RunContext::new(self.env.clone(), self.interrupted.clone());
        ctx.machine_state().await
    }

    async fn execute(
        &self,
        operation: Operation,
        snapshot: Option<String>,
    ) -> VmrigResult<RunReport> {
        let span = operation_span(operation.as_str(), &self.env.config.machine_name);
        let Some(pipeline) = self.actions.pipeline(operation) else {
            let state = self.state().instrument(span).await?;
            return Ok(RunReport {
                run_id: Uuid::new_v4(),
                operation,
                state,
                domain_name: None,
                address: None,
                snapshots: Vec::new(),
                package: None,
            });
        };
        self.run_in_span(operation, &pipeline, snapshot)
            .instrument(span)
            .await
    }

    async fn run_in_span(
        &self,
        operation: Operation,
        pipeline: &Pipeline,
        snapshot: Option<String>,
    ) -> VmrigResult<RunReport> {
        let started = Instant::now();
        let run_id = Uuid::new_v4();
        self.interrupted.store(false, Ordering::SeqCst);

        let mut ctx = RunContext::new(self.env.clone(), self.interrupted.clone());
        ctx.snapshot_name = snapshot;
        info!("Running {} ({})", operation, run_id);

        let result = pipeline.run(&mut ctx).await;
        record_duration(started);
        if let Err(e) = result {
            Span::current().record("status", "failed");
            error!("{} failed: {}", operation, e);
            return Err(e);
        }
        Span::current().record("status", "ok");

        let state = ctx.machine_state().await?;
        info!("{} finished; machine is {}", operation, state);
        Ok(RunReport {
            run_id,
            operation,
            state,
            domain_name: ctx.domain_name,
            address: ctx.address,
            snapshots: ctx.snapshots,
            package: ctx.package_path,
        })
    }
}
