//! Step controller (scheduler side)
//!
//! Assigns each pending step to an execution node, holding audited steps at
//! the audit gate until they are approved. Step completions are fanned out to
//! webhooks and to the owning pipeline's queue.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use conduit_core::domain::{Step, StepState};
use conduit_informer::StepInformer;
use tracing::{debug, info, warn};

use crate::controller::Reconciler;
use crate::picker::Picker;
use crate::queue::WorkQueue;
use crate::webhook::WebhookDispatcher;

pub struct StepReconciler {
    steps: Arc<StepInformer>,
    picker: Arc<dyn Picker>,

    /// Instance name of this scheduler
    instance: String,
    pipeline_queue: Option<Arc<WorkQueue<String>>>,
    webhooks: Option<Arc<WebhookDispatcher>>,
}

impl StepReconciler {
    /// Creates the reconciler
    ///
    /// # Arguments
    /// * `picker` - Chooses the execution node a step runs on
    /// * `instance` - Instance name of this scheduler
    pub fn new(steps: Arc<StepInformer>, picker: Arc<dyn Picker>, instance: impl Into<String>) -> Self {
        Self {
            steps,
            picker,
            instance: instance.into(),
            pipeline_queue: None,
            webhooks: None,
        }
    }

    /// Notifies the pipeline controller when a pipeline step completes
    pub fn with_pipeline_queue(mut self, queue: Arc<WorkQueue<String>>) -> Self {
        self.pipeline_queue = Some(queue);
        self
    }

    /// Pushes step completions to webhooks
    pub fn with_webhooks(mut self, webhooks: Arc<WebhookDispatcher>) -> Self {
        self.webhooks = Some(webhooks);
        self
    }

    fn owned(&self, step: &Step) -> bool {
        match step.scheduler_node.as_deref() {
            Some(owner) => owner == self.instance,
            // Standalone steps are claimed by whichever scheduler sees them first.
            None => !step.from_pipeline,
        }
    }

    fn scheduled_by_self(&self, step: &Step) -> bool {
        step.scheduler_node.as_deref() == Some(self.instance.as_str())
    }

    /// Queues the owning pipeline for another pass
    fn notify_pipeline(&self, step: &Step) {
        if let (Some(queue), Some(pipeline)) = (&self.pipeline_queue, step.pipeline_key()) {
            queue.add(pipeline);
        }
    }

    async fn record(&self, key: &str, step: &mut Step) -> Result<()> {
        self.steps
            .claim(step)
            .await
            .with_context(|| format!("Failed to record step {}", key))?;
        Ok(())
    }
}

#[async_trait]
impl Reconciler for StepReconciler {
    type Object = Step;

    fn name(&self) -> &'static str {
        "step"
    }

    fn wants(&self, step: &Step) -> bool {
        step.status.status == StepState::Pending
            && step.status.scheduled_node.is_none()
            && self.owned(step)
    }

    fn on_add(&self, step: &Step) -> bool {
        // A step that finished while this scheduler was down still has to
        // advance its pipeline once the cache is rebuilt.
        if step.status.status.is_terminal() && self.scheduled_by_self(step) {
            self.notify_pipeline(step);
        }

        self.wants(step)
    }

    fn on_update(&self, old: &Step, new: &Step) -> bool {
        let completed = new.status.status.is_terminal() && old.status.status != new.status.status;

        if completed && self.scheduled_by_self(new) {
            debug!(
                "Step {} finished: {}",
                new.composite_key(),
                new.status.status
            );

            if let Some(webhooks) = &self.webhooks {
                webhooks.spawn_dispatch(new.clone());
            }
            self.notify_pipeline(new);
        }

        old.resource_version != new.resource_version && self.wants(new)
    }

    fn on_delete(&self, _step: &Step) -> bool {
        false
    }

    async fn sync(&self, key: &str, obj: Arc<Step>) -> Result<()> {
        let mut step = obj.as_ref().clone();
        if !self.wants(&step) {
            return Ok(());
        }

        if step.scheduler_node.is_none() {
            step.scheduler_node = Some(self.instance.clone());
            self.record(key, &mut step).await?;
            debug!("Claimed standalone step {}", key);
            return Ok(());
        }

        if step.with_audit {
            if step.status.audit.is_none() {
                step.request_audit(Utc::now());
                self.record(key, &mut step).await?;
                info!("Step {} is awaiting audit", key);
                return Ok(());
            }
            if step.awaiting_audit() {
                return Ok(());
            }
        }

        match self.picker.pick() {
            Ok(node) => {
                step.status.scheduled_node = Some(node.instance_name.clone());
                self.record(key, &mut step).await?;
                info!("Step {} scheduled on {}", key, node.instance_name);
            }
            Err(e) => {
                step.finish(StepState::ScheduleFailed, Some(e.to_string()), Utc::now());
                self.record(key, &mut step).await?;
                warn!("Failed to schedule step {}: {}", key, e);
            }
        }

        Ok(())
    }
}
