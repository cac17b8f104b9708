//! Step composition
//!
//! A [`Pipeline`] is a fixed list of nodes: plain steps, nested pipelines,
//! and branches guarded by a [`Condition`] that is evaluated right before
//! the branch is taken. When a step fails, every step this pipeline already
//! ran (the failing one included) gets its `recover` hook called, newest
//! first, before the error propagates to the enclosing pipeline.

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn, Instrument};

use vmrig_core::error::{VmrigError, VmrigResult};
use vmrig_core::observability::step_span;

use super::context::RunContext;

/// One unit of work in a pipeline
#[async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: &mut RunContext) -> VmrigResult<()>;

    /// Called after this step, or any step after it in the same pipeline,
    /// failed. Errors are logged and otherwise ignored.
    async fn recover(&self, _ctx: &mut RunContext, _error: &VmrigError) -> VmrigResult<()> {
        Ok(())
    }
}

/// Predicate guarding a branch
#[async_trait]
pub trait Condition: Send + Sync {
    fn name(&self) -> &'static str;

    async fn check(&self, ctx: &mut RunContext) -> VmrigResult<bool>;
}

enum Node {
    Step(Arc<dyn Step>),
    Branch {
        condition: Arc<dyn Condition>,
        then: Arc<Pipeline>,
        otherwise: Option<Arc<Pipeline>>,
    },
    Sub(Arc<Pipeline>),
}

pub struct Pipeline {
    name: String,
    nodes: Vec<Node>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn step(mut self, step: impl Step + 'static) -> Self {
        self.nodes.push(Node::Step(Arc::new(step)));
        self
    }

    pub fn shared_step(mut self, step: Arc<dyn Step>) -> Self {
        self.nodes.push(Node::Step(step));
        self
    }

    /// Run `then` when `condition` holds at this point of the run
    pub fn when(self, condition: impl Condition + 'static, then: Arc<Pipeline>) -> Self {
        self.push_branch(Arc::new(condition), then, None)
    }

    pub fn branch(
        self,
        condition: impl Condition + 'static,
        then: Arc<Pipeline>,
        otherwise: Arc<Pipeline>,
    ) -> Self {
        self.push_branch(Arc::new(condition), then, Some(otherwise))
    }

    pub fn sub(mut self, pipeline: Arc<Pipeline>) -> Self {
        self.nodes.push(Node::Sub(pipeline));
        self
    }

    fn push_branch(
        mut self,
        condition: Arc<dyn Condition>,
        then: Arc<Pipeline>,
        otherwise: Option<Arc<Pipeline>>,
    ) -> Self {
        self.nodes.push(Node::Branch {
            condition,
            then,
            otherwise,
        });
        self
    }

    /// Names of the top-level steps, for diagnostics
    pub fn step_names(&self) -> Vec<&'static str> {
        self.nodes
            .iter()
            .filter_map(|node| match node {
                Node::Step(step) => Some(step.name()),
                _ => None,
            })
            .collect()
    }

    pub fn run<'a>(&'a self, ctx: &'a mut RunContext) -> BoxFuture<'a, VmrigResult<()>> {
        async move {
            let mut executed: Vec<Arc<dyn Step>> = Vec::new();
            let result = self.run_nodes(ctx, &mut executed).await;
            if let Err(error) = &result {
                for step in executed.iter().rev() {
                    debug!("Recovering step {}", step.name());
                    if let Err(e) = step.recover(ctx, error).await {
                        warn!("Recovery of step {} failed: {}", step.name(), e);
                    }
                }
            }
            result
        }
        .boxed()
    }

    async fn run_nodes(
        &self,
        ctx: &mut RunContext,
        executed: &mut Vec<Arc<dyn Step>>,
    ) -> VmrigResult<()> {
        for node in &self.nodes {
            ctx.check_interrupted(&self.name)?;
            match node {
                Node::Step(step) => {
                    executed.push(step.clone());
                    let started = Instant::now();
                    step.run(ctx).instrument(step_span(step.name())).await?;
                    debug!(
                        "Step {} finished in {} ms",
                        step.name(),
                        started.elapsed().as_millis()
                    );
                }
                Node::Branch {
                    condition,
                    then,
                    otherwise,
                } => {
                    let holds = condition.check(ctx).await?;
                    debug!("Condition {} is {}", condition.name(), holds);
                    if holds {
                        then.run(ctx).await?;
                    } else if let Some(otherwise) = otherwise {
                        otherwise.run(ctx).await?;
                    }
                }
                Node::Sub(pipeline) => pipeline.run(ctx).await?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;
    use vmrig_core::config::ConfigBuilder;
    use vmrig_core::machine_data::MachineDataDir;
    use vmrig_core::mock::MockBackend;

    use crate::action::context::MachineEnv;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Record {
        name: &'static str,
        log: Log,
        fail: bool,
    }

    #[async_trait]
    impl Step for Record {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn run(&self, _ctx: &mut RunContext) -> VmrigResult<()> {
            self.log.lock().push(format!("run {}", self.name));
            if self.fail {
                return Err(VmrigError::internal(format!("{} failed", self.name)));
            }
            Ok(())
        }

        async fn recover(&self, _ctx: &mut RunContext, _error: &VmrigError) -> VmrigResult<()> {
            self.log.lock().push(format!("recover {}", self.name));
            Ok(())
        }
    }

    struct Flag(Arc<AtomicBool>);

    #[async_trait]
    impl Condition for Flag {
        fn name(&self) -> &'static str {
            "flag"
        }

        async fn check(&self, _ctx: &mut RunContext) -> VmrigResult<bool> {
            Ok(self.0.load(Ordering::SeqCst))
        }
    }

    fn record(name: &'static str, log: &Log) -> Record {
        Record {
            name,
            log: log.clone(),
            fail: false,
        }
    }

    fn failing(name: &'static str, log: &Log) -> Record {
        Record {
            name,
            log: log.clone(),
            fail: true,
        }
    }

    fn context(dir: &TempDir) -> RunContext {
        let env = MachineEnv::new(
            ConfigBuilder::new().build().unwrap(),
            "proj",
            Arc::new(MockBackend::new()),
            MachineDataDir::new(dir.path()),
        )
        .unwrap();
        RunContext::new(Arc::new(env), Arc::new(AtomicBool::new(false)))
    }

    #[tokio::test]
    async fn test_steps_run_in_order() {
        let dir = TempDir::new().unwrap();
        let log: Log = Default::default();
        let pipeline = Pipeline::new("test")
            .step(record("a", &log))
            .step(record("b", &log));

        pipeline.run(&mut context(&dir)).await.unwrap();
        assert_eq!(*log.lock(), vec!["run a", "run b"]);
        assert_eq!(pipeline.step_names(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_failure_recovers_executed_steps_newest_first() {
        let dir = TempDir::new().unwrap();
        let log: Log = Default::default();
        let pipeline = Pipeline::new("test")
            .step(record("a", &log))
            .step(failing("b", &log))
            .step(record("c", &log));

        let err = pipeline.run(&mut context(&dir)).await.unwrap_err();
        assert!(err.to_string().contains("b failed"));
        assert_eq!(
            *log.lock(),
            vec!["run a", "run b", "recover b", "recover a"]
        );
    }

    #[tokio::test]
    async fn test_condition_is_evaluated_when_reached() {
        let dir = TempDir::new().unwrap();
        let log: Log = Default::default();
        let flag = Arc::new(AtomicBool::new(false));

        struct SetFlag(Arc<AtomicBool>);

        #[async_trait]
        impl Step for SetFlag {
            fn name(&self) -> &'static str {
                "set_flag"
            }

            async fn run(&self, _ctx: &mut RunContext) -> VmrigResult<()> {
                self.0.store(true, Ordering::SeqCst);
                Ok(())
            }
        }

        let then = Arc::new(Pipeline::new("then").step(record("then", &log)));
        let otherwise = Arc::new(Pipeline::new("otherwise").step(record("otherwise", &log)));
        let pipeline = Pipeline::new("test")
            .step(SetFlag(flag.clone()))
            .branch(Flag(flag), then, otherwise);

        pipeline.run(&mut context(&dir)).await.unwrap();
        assert_eq!(*log.lock(), vec!["run then"]);
    }

    #[tokio::test]
    async fn test_nested_failure_recovers_each_level() {
        let dir = TempDir::new().unwrap();
        let log: Log = Default::default();
        let inner = Arc::new(Pipeline::new("inner").step(failing("inner", &log)));
        let pipeline = Pipeline::new("outer").step(record("outer", &log)).sub(inner);

        assert!(pipeline.run(&mut context(&dir)).await.is_err());
        assert_eq!(
            *log.lock(),
            vec!["run outer", "run inner", "recover inner", "recover outer"]
        );
    }

    #[tokio::test]
    async fn test_interruption_stops_between_steps() {
        let dir = TempDir::new().unwrap();
        let log: Log = Default::default();
        let mut ctx = context(&dir);
        ctx.interrupted.store(true, Ordering::SeqCst);

        let pipeline = Pipeline::new("test").step(record("a", &log));
        let err = pipeline.run(&mut ctx).await.unwrap_err();
        assert!(matches!(err, VmrigError::Interrupted { .. }));
        assert!(log.lock().is_empty());
    }
}
