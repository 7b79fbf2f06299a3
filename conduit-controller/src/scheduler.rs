//! Scheduler composition root
//!
//! Builds the node, pipeline and step controllers of one scheduler instance
//! around a shared store and runs them until cancelled.

use std::sync::Arc;

use anyhow::Result;
use conduit_core::domain::NodeType;
use conduit_core::{ActionCatalog, KeyLayout};
use conduit_informer::{NodeInformer, PipelineInformer, StepInformer};
use conduit_kv::KvStore;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::controller::{Controller, ControllerOptions};
use crate::nodes::NodeReconciler;
use crate::picker::{NodeSet, Picker, RoundRobin};
use crate::pipelines::PipelineReconciler;
use crate::steps::StepReconciler;
use crate::webhook::WebhookDispatcher;

/// Dependencies of a scheduler instance
pub struct SchedulerParams {
    pub kv: Arc<dyn KvStore>,
    pub layout: KeyLayout,

    /// Instance name this scheduler registered under
    pub instance: String,
    pub options: ControllerOptions,
    pub catalog: Option<Arc<dyn ActionCatalog>>,
    pub webhooks: Option<Arc<WebhookDispatcher>>,
}

/// Node, pipeline and step controllers of one scheduler instance
pub struct Scheduler {
    nodes: Controller<NodeReconciler>,
    pipelines: Controller<PipelineReconciler>,
    steps: Controller<StepReconciler>,
}

impl Scheduler {
    pub fn new(params: SchedulerParams) -> Self {
        let SchedulerParams {
            kv,
            layout,
            instance,
            options,
            catalog,
            webhooks,
        } = params;

        let node_informer = Arc::new(NodeInformer::new(Arc::clone(&kv), layout.clone()));
        let pipeline_informer = Arc::new(PipelineInformer::new(Arc::clone(&kv), layout.clone()));
        let step_informer = Arc::new(StepInformer::new(kv, layout));

        let scheduler_picker: Arc<dyn Picker> = Arc::new(RoundRobin::new(NodeSet::new(
            Arc::clone(node_informer.indexer()),
            NodeType::Scheduler,
        )));
        let node_picker: Arc<dyn Picker> = Arc::new(RoundRobin::new(NodeSet::new(
            Arc::clone(node_informer.indexer()),
            NodeType::Node,
        )));

        let nodes = Controller::new(
            Arc::new(NodeReconciler::new()),
            node_informer,
            options.clone(),
        );

        let pipelines = Controller::new(
            Arc::new(PipelineReconciler::new(
                Arc::clone(&pipeline_informer),
                Arc::clone(&step_informer),
                scheduler_picker,
                catalog,
                instance.clone(),
            )),
            pipeline_informer,
            options.clone(),
        );

        let mut step_reconciler = StepReconciler::new(Arc::clone(&step_informer), node_picker, instance)
            .with_pipeline_queue(pipelines.queue());
        if let Some(webhooks) = webhooks {
            step_reconciler = step_reconciler.with_webhooks(webhooks);
        }
        let steps = Controller::new(Arc::new(step_reconciler), step_informer, options);

        Self {
            nodes,
            pipelines,
            steps,
        }
    }

    /// Runs every controller until `cancel` fires
    ///
    /// The node set is cached before steps are reconciled, so the pickers
    /// never see an empty set just because the process is new. Steps are
    /// cached before pipelines, so a pipeline sync after a restart folds in
    /// every step that finished while the scheduler was down.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!("Starting scheduler controllers");

        let nodes = self.nodes.run(cancel.clone());
        tokio::pin!(nodes);

        tokio::select! {
            result = &mut nodes => return result,
            _ = self.nodes.wait_synced() => {}
        }

        let steps = self.steps.run(cancel.clone());
        tokio::pin!(steps);

        tokio::select! {
            result = &mut nodes => return result,
            result = &mut steps => return result,
            _ = self.steps.wait_synced() => {}
        }

        tokio::try_join!(nodes, steps, self.pipelines.run(cancel.clone()))?;

        info!("Scheduler controllers stopped");
        Ok(())
    }
}
