//! Pipeline controller
//!
//! Drives each pipeline owned by this scheduler instance through its flows:
//! claims ownership of unowned pipelines, folds recorded step statuses back
//! into the pipeline, releases the next flow once the current one passed and
//! completes the pipeline when a flow breaks or nothing is left.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use conduit_core::domain::{ActionRef, NextStep, Pipeline, Step};
use conduit_core::{ActionCatalog, CatalogError, Resource};
use conduit_informer::{IndexFunc, PipelineInformer, StepInformer};
use tracing::{debug, info, warn};

use crate::controller::Reconciler;
use crate::picker::Picker;

/// Index of steps by owning pipeline key
pub const PIPELINE_INDEX: &str = "pipeline";

pub struct PipelineReconciler {
    pipelines: Arc<PipelineInformer>,
    steps: Arc<StepInformer>,
    picker: Arc<dyn Picker>,
    catalog: Option<Arc<dyn ActionCatalog>>,

    /// Instance name of this scheduler
    instance: String,
}

impl PipelineReconciler {
    /// Creates the reconciler, registering the pipeline index on the step cache
    ///
    /// # Arguments
    /// * `picker` - Chooses the scheduler instance owning a new pipeline
    /// * `catalog` - Validates step actions before a pipeline is claimed
    /// * `instance` - Instance name of this scheduler
    pub fn new(
        pipelines: Arc<PipelineInformer>,
        steps: Arc<StepInformer>,
        picker: Arc<dyn Picker>,
        catalog: Option<Arc<dyn ActionCatalog>>,
        instance: impl Into<String>,
    ) -> Self {
        let by_pipeline: IndexFunc<Step> =
            Arc::new(|s: &Step| s.pipeline_key().into_iter().collect());
        steps
            .indexer()
            .add_indexers(vec![(PIPELINE_INDEX, by_pipeline)]);

        Self {
            pipelines,
            steps,
            picker,
            catalog,
            instance: instance.into(),
        }
    }

    fn owned(&self, pipeline: &Pipeline) -> bool {
        pipeline
            .status
            .scheduler_node
            .as_deref()
            .is_none_or(|owner| owner == self.instance)
    }

    /// Checks structure and action references of a new pipeline
    ///
    /// `Ok(Some(reason))` means the pipeline is permanently invalid. A
    /// catalog that cannot be reached is an error, so the pipeline is retried.
    async fn validate(&self, pipeline: &Pipeline) -> Result<Option<String>> {
        if let Err(e) = pipeline.validate() {
            return Ok(Some(e.to_string()));
        }

        let Some(catalog) = &self.catalog else {
            return Ok(None);
        };

        for step in pipeline.steps() {
            let action: ActionRef = match step.action.parse() {
                Ok(action) => action,
                Err(e) => return Ok(Some(format!("step '{}': {}", step.id, e))),
            };

            match catalog.describe_action(&pipeline.namespace, &action).await {
                Ok(_) => {}
                Err(e @ CatalogError::NotFound { .. }) => {
                    return Ok(Some(format!("step '{}': {}", step.id, e)));
                }
                Err(e) => {
                    return Err(e).context("Failed to validate pipeline actions");
                }
            }
        }

        Ok(None)
    }

    /// Picks the owning scheduler and records the claim
    async fn claim(&self, key: &str, mut pipeline: Pipeline) -> Result<()> {
        if let Some(reason) = self.validate(&pipeline).await? {
            warn!("Rejecting pipeline {}: {}", key, reason);
            pipeline.complete(Some(reason), Utc::now());
            self.pipelines.claim(&mut pipeline).await?;
            return Ok(());
        }

        match self.picker.pick() {
            Ok(node) => {
                pipeline.status.scheduler_node = Some(node.instance_name.clone());
                pipeline.status.start_at = Some(Utc::now());
                self.pipelines
                    .claim(&mut pipeline)
                    .await
                    .with_context(|| format!("Failed to claim pipeline {}", key))?;
                info!("Pipeline {} assigned to scheduler {}", key, node.instance_name);
            }
            Err(e) => {
                warn!("Failed to schedule pipeline {}: {}", key, e);
                pipeline.complete(Some(e.to_string()), Utc::now());
                self.pipelines.claim(&mut pipeline).await?;
            }
        }

        Ok(())
    }

    /// Copies statuses of recorded steps onto the pipeline's embedded steps
    fn merge_step_statuses(&self, key: &str, pipeline: &mut Pipeline) -> Result<bool> {
        let mut changed = false;
        for step in self.steps.indexer().by_index(PIPELINE_INDEX, key)? {
            changed |= pipeline.apply_step_status(&step);
        }
        Ok(changed)
    }

    /// Writes steps that do not exist yet
    async fn create_steps(&self, steps: Vec<Step>) -> Result<usize> {
        let mut created = 0;
        for mut step in steps {
            match self.steps.create(&mut step).await {
                Ok(_) => created += 1,
                Err(e) if e.is_conflict() => {
                    debug!("Step {} already recorded", step.composite_key());
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to record step {}", step.composite_key()));
                }
            }
        }
        Ok(created)
    }

    /// Rewrites members of the current flow missing from the step store
    async fn repair_flow(&self, key: &str, pipeline: &Pipeline) -> Result<()> {
        if pipeline.status.current_flow == 0 {
            return Ok(());
        }

        let missing: Vec<Step> = pipeline
            .flow_steps(pipeline.status.current_flow)
            .into_iter()
            .filter(|s| !self.steps.indexer().contains_key(&s.key()))
            .cloned()
            .collect();

        if missing.is_empty() {
            return Ok(());
        }

        let created = self.create_steps(missing).await?;
        if created > 0 {
            warn!(
                "Repaired {} missing step(s) of flow {} in pipeline {}",
                created, pipeline.status.current_flow, key
            );
        }
        Ok(())
    }
}

#[async_trait]
impl Reconciler for PipelineReconciler {
    type Object = Pipeline;

    fn name(&self) -> &'static str {
        "pipeline"
    }

    fn wants(&self, pipeline: &Pipeline) -> bool {
        !pipeline.is_complete() && self.owned(pipeline)
    }

    async fn sync(&self, key: &str, obj: Arc<Pipeline>) -> Result<()> {
        let mut pipeline = obj.as_ref().clone();
        if !self.wants(&pipeline) {
            return Ok(());
        }

        if pipeline.status.scheduler_node.is_none() {
            return self.claim(key, pipeline).await;
        }

        let changed = self.merge_step_statuses(key, &mut pipeline)?;
        self.repair_flow(key, &pipeline).await?;

        match pipeline.next_step(Utc::now()) {
            NextStep::Flow(flow) => {
                // The pipeline goes first so a crash before the steps are
                // written is repaired on the next pass.
                self.pipelines
                    .claim(&mut pipeline)
                    .await
                    .with_context(|| format!("Failed to record pipeline {}", key))?;

                info!(
                    "Pipeline {} released flow {} ({} step(s))",
                    key,
                    flow.number,
                    flow.steps.len()
                );
                self.create_steps(flow.steps).await?;
            }
            NextStep::Waiting => {
                if changed {
                    self.pipelines
                        .claim(&mut pipeline)
                        .await
                        .with_context(|| format!("Failed to record pipeline {}", key))?;
                }
            }
            NextStep::Complete => {
                self.pipelines
                    .claim(&mut pipeline)
                    .await
                    .with_context(|| format!("Failed to record pipeline {}", key))?;

                match pipeline.outcome() {
                    Some(outcome) => info!(
                        "Pipeline {} complete: {}{}",
                        key,
                        outcome,
                        pipeline
                            .status
                            .message
                            .as_deref()
                            .map(|m| format!(" ({})", m))
                            .unwrap_or_default()
                    ),
                    None => bail!("pipeline {} reported complete without an outcome", key),
                }
            }
        }

        Ok(())
    }

    async fn on_missing(&self, key: &str) -> Result<()> {
        let tombstone = Pipeline::tombstone(key)?;
        let prefix = self
            .steps
            .layout()
            .pipeline_steps_prefix(&tombstone.namespace, &tombstone.id)?;

        let deleted = self.steps.delete_prefix(&prefix).await?;
        if deleted > 0 {
            info!("Pipeline {} deleted, removed {} step(s)", key, deleted);
        }
        Ok(())
    }
}
