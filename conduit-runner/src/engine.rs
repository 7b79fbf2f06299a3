//! Execution engine
//!
//! Turns a step scheduled on this node into a workload:
//! 1. Resolve the action from the catalog and the run parameters
//! 2. Mark the step running
//! 3. Start the workload on the runner the action declares
//! 4. Record the correlation data, wait, record the outcome
//!
//! Every failure that belongs to the step (unknown action, missing
//! parameter, runner error) ends up in the step's status. Only failures
//! that a retry can fix, such as an unreachable store or catalog, are
//! returned as errors.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use conduit_core::domain::{Action, ActionRef, RunnerType, Step, StepState};
use conduit_core::{ActionCatalog, Error};
use conduit_informer::{PipelineInformer, StepInformer};
use tracing::{debug, info, warn};

use crate::runner::{RunOutcome, RunRequest, Runner};

/// Attempts at a step write that keeps losing to concurrent writers
const MAX_WRITE_ATTEMPTS: u32 = 5;

/// Result of resolving a step before dispatch
enum Preparation {
    Ready {
        runner: Arc<dyn Runner>,
        request: RunRequest,
    },

    /// The step cannot run; the message becomes its failure reason
    Rejected(String),
}

/// Merges run parameters, lowest precedence first
///
/// Action defaults < pipeline `with` < step `with`.
pub fn resolve_params(
    action: &Action,
    pipeline_with: Option<&BTreeMap<String, String>>,
    step_with: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut params = action.run_params.clone();
    if let Some(with) = pipeline_with {
        params.extend(with.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    params.extend(step_with.iter().map(|(k, v)| (k.clone(), v.clone())));
    params
}

/// Required parameters that are absent or empty
pub fn missing_params(action: &Action, params: &BTreeMap<String, String>) -> Vec<String> {
    action
        .required_params
        .iter()
        .filter(|key| params.get(*key).is_none_or(|v| v.trim().is_empty()))
        .cloned()
        .collect()
}

pub struct Engine {
    steps: Arc<StepInformer>,
    pipelines: Arc<PipelineInformer>,
    catalog: Arc<dyn ActionCatalog>,
    runners: HashMap<RunnerType, Arc<dyn Runner>>,
}

impl Engine {
    /// Creates an engine with no runners
    ///
    /// # Arguments
    /// * `steps` - Recorder for step status
    /// * `pipelines` - Source of pipeline-level parameters and mounts
    /// * `catalog` - Action definitions
    pub fn new(
        steps: Arc<StepInformer>,
        pipelines: Arc<PipelineInformer>,
        catalog: Arc<dyn ActionCatalog>,
    ) -> Self {
        Self {
            steps,
            pipelines,
            catalog,
            runners: HashMap::new(),
        }
    }

    /// Registers a runner for the backend it drives
    pub fn with_runner(mut self, runner: Arc<dyn Runner>) -> Self {
        self.runners.insert(runner.runner_type(), runner);
        self
    }

    /// Backends this engine can dispatch to
    pub fn runner_types(&self) -> Vec<RunnerType> {
        let mut types: Vec<RunnerType> = self.runners.keys().copied().collect();
        types.sort_by_key(|t| t.to_string());
        types
    }

    /// Runs the step stored under `key` to completion
    ///
    /// Returns the step's final status. A step that is not pending, or is
    /// still held at the audit gate, is left untouched.
    pub async fn execute(&self, key: &str) -> Result<StepState> {
        let step = self.fetch(key).await?;
        if step.status.status != StepState::Pending || step.awaiting_audit() {
            debug!("Step {} is {}, nothing to execute", key, step.status.status);
            return Ok(step.status.status);
        }

        let (runner, mut request) = match self.prepare(&step).await? {
            Preparation::Ready { runner, request } => (runner, request),
            Preparation::Rejected(reason) => {
                warn!("Step {} rejected: {}", key, reason);
                return self.finish(key, StepState::Failed, Some(reason)).await;
            }
        };

        let running = self
            .modify(key, |step| {
                if step.status.status != StepState::Pending {
                    return false;
                }
                step.status.status = StepState::Running;
                step.status.start_at = Some(Utc::now());
                step.status.message = None;
                true
            })
            .await?;
        if running.status.status != StepState::Running {
            return Ok(running.status.status);
        }

        info!(
            "Dispatching step {} ({}) to the {} runner",
            key,
            request.action.name,
            runner.runner_type()
        );

        request.step = running;
        let response = match runner.run(&request).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Failed to start step {}: {}", key, e);
                return self.finish(key, StepState::Failed, Some(e.to_string())).await;
            }
        };

        let started = self
            .modify(key, |step| {
                step.status.response = response.clone();
                true
            })
            .await?;

        if started.status.status == StepState::Canceled {
            info!("Step {} was cancelled while starting", key);
            match runner.cancel(&started).await {
                // Reap the stopped workload so the runner drops its bookkeeping.
                Ok(()) => {
                    if let Err(e) = runner.wait(&started).await {
                        debug!("Failed to reap workload of step {}: {}", key, e);
                    }
                }
                Err(e) => warn!("Failed to stop workload of step {}: {}", key, e),
            }
            return Ok(StepState::Canceled);
        }

        let (status, message) = match runner.wait(&started).await {
            Ok(RunOutcome::Succeeded) => (StepState::Succeeded, None),
            Ok(RunOutcome::Failed(reason)) => (StepState::Failed, Some(reason)),
            Err(e) => (StepState::Failed, Some(e.to_string())),
        };

        let status = self.finish(key, status, message).await?;
        info!("Step {} finished: {}", key, status);
        Ok(status)
    }

    /// Stops the workload of the step stored under `key`
    ///
    /// Fails if the step never recorded correlation data.
    pub async fn cancel(&self, key: &str) -> Result<()> {
        let step = self.fetch(key).await?;
        let runner = self.runner_for(&step).await?;

        runner
            .cancel(&step)
            .await
            .with_context(|| format!("Failed to cancel step {}", key))?;
        info!("Cancelled workload of step {}", key);
        Ok(())
    }

    /// Output of the step's workload so far
    pub async fn logs(&self, key: &str) -> Result<String> {
        let step = self.fetch(key).await?;
        let runner = self.runner_for(&step).await?;
        runner
            .logs(&step)
            .await
            .with_context(|| format!("Failed to read logs of step {}", key))
    }

    /// Runs `command` inside the step's live workload
    pub async fn connect(&self, key: &str, command: &[String]) -> Result<String> {
        let step = self.fetch(key).await?;
        let runner = self.runner_for(&step).await?;
        runner
            .connect(&step, command)
            .await
            .with_context(|| format!("Failed to connect to step {}", key))
    }

    async fn fetch(&self, key: &str) -> Result<Step> {
        let step = self
            .steps
            .get(key)
            .await
            .with_context(|| format!("Failed to read step {}", key))?
            .ok_or_else(|| Error::not_found("step", key))?;
        Ok(step)
    }

    async fn describe(&self, step: &Step) -> Result<std::result::Result<Action, String>> {
        let action_ref: ActionRef = match step.action.parse() {
            Ok(action_ref) => action_ref,
            Err(e) => return Ok(Err(format!("{}", e))),
        };

        match self.catalog.describe_action(&step.namespace, &action_ref).await {
            Ok(action) => Ok(Ok(action)),
            Err(e) if e.is_not_found() => Ok(Err(e.to_string())),
            Err(e) => Err(e).with_context(|| format!("Failed to describe action {}", action_ref)),
        }
    }

    fn runner_of(&self, action: &Action) -> std::result::Result<Arc<dyn Runner>, String> {
        let runner_type = action.runner().map_err(|e| e.to_string())?;
        self.runners
            .get(&runner_type)
            .cloned()
            .ok_or_else(|| format!("no {} runner is configured on this node", runner_type))
    }

    async fn runner_for(&self, step: &Step) -> Result<Arc<dyn Runner>> {
        let action = self.describe(step).await?.map_err(anyhow::Error::msg)?;
        self.runner_of(&action).map_err(anyhow::Error::msg)
    }

    async fn prepare(&self, step: &Step) -> Result<Preparation> {
        let action = match self.describe(step).await? {
            Ok(action) => action,
            Err(reason) => return Ok(Preparation::Rejected(reason)),
        };

        let pipeline = match step.pipeline_key() {
            Some(key) => self
                .pipelines
                .get(&key)
                .await
                .with_context(|| format!("Failed to read pipeline {}", key))?,
            None => None,
        };

        let params = resolve_params(&action, pipeline.as_ref().map(|p| &p.with), &step.with);
        let missing = missing_params(&action, &params);
        if !missing.is_empty() {
            return Ok(Preparation::Rejected(format!(
                "missing required parameter(s): {}",
                missing.join(", ")
            )));
        }

        let runner = match self.runner_of(&action) {
            Ok(runner) => runner,
            Err(reason) => return Ok(Preparation::Rejected(reason)),
        };

        Ok(Preparation::Ready {
            runner,
            request: RunRequest {
                step: step.clone(),
                action,
                params,
                mounts: pipeline.map(|p| p.mounts).unwrap_or_default(),
            },
        })
    }

    /// Records a terminal status unless the step already has one
    ///
    /// A step cancelled while its workload ran keeps `canceled`.
    async fn finish(
        &self,
        key: &str,
        status: StepState,
        message: Option<String>,
    ) -> Result<StepState> {
        let step = self
            .modify(key, |step| {
                if step.status.status.is_terminal() {
                    return false;
                }
                step.finish(status, message.clone(), Utc::now());
                true
            })
            .await?;
        Ok(step.status.status)
    }

    /// Applies `change` to the latest stored step and writes it back
    ///
    /// `change` returns `false` to leave the step as it is. Lost races are
    /// retried against a fresh read.
    async fn modify<F>(&self, key: &str, mut change: F) -> Result<Step>
    where
        F: FnMut(&mut Step) -> bool + Send,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;

            let mut step = self.fetch(key).await?;
            if !change(&mut step) {
                return Ok(step);
            }

            match self.steps.claim(&mut step).await {
                Ok(_) => return Ok(step),
                Err(e) if e.is_conflict() && attempt < MAX_WRITE_ATTEMPTS => {
                    debug!("Step {} changed concurrently, retrying write", key);
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to record step {}", key));
                }
            }
        }
    }
}
