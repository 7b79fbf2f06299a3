//! Execution node composition root
//!
//! Builds the engine and the node-side step controller of one execution
//! node around a shared store.

use std::sync::Arc;

use anyhow::Result;
use conduit_controller::{Controller, ControllerOptions};
use conduit_core::{ActionCatalog, KeyLayout};
use conduit_informer::PipelineInformer;
use conduit_kv::KvStore;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::engine::Engine;
use crate::executor::{ExecutorReconciler, node_step_informer};
use crate::runner::Runner;

/// Dependencies of an execution node
pub struct NodeParams {
    pub kv: Arc<dyn KvStore>,
    pub layout: KeyLayout,

    /// Instance name this node registered under
    pub instance: String,
    pub options: ControllerOptions,
    pub catalog: Arc<dyn ActionCatalog>,
    pub runners: Vec<Arc<dyn Runner>>,
}

pub struct ExecutionNode {
    instance: String,
    engine: Arc<Engine>,
    steps: Controller<ExecutorReconciler>,
}

impl ExecutionNode {
    pub fn new(params: NodeParams) -> Self {
        let NodeParams {
            kv,
            layout,
            instance,
            options,
            catalog,
            runners,
        } = params;

        let steps = Arc::new(node_step_informer(Arc::clone(&kv), layout.clone(), &instance));
        let pipelines = Arc::new(PipelineInformer::new(kv, layout));

        let engine = runners
            .into_iter()
            .fold(Engine::new(Arc::clone(&steps), pipelines, catalog), |engine, runner| {
                engine.with_runner(runner)
            });
        let engine = Arc::new(engine);

        let steps = Controller::new(
            Arc::new(ExecutorReconciler::new(Arc::clone(&engine), instance.clone())),
            steps,
            options,
        );

        Self {
            instance,
            engine,
            steps,
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Runs the step controller until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let runners: Vec<String> = self
            .engine
            .runner_types()
            .iter()
            .map(ToString::to_string)
            .collect();
        info!(
            "Starting execution node {} with runners: {}",
            self.instance,
            runners.join(", ")
        );

        self.steps.run(cancel).await?;

        info!("Execution node {} stopped", self.instance);
        Ok(())
    }
}
