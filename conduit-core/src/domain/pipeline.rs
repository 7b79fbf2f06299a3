//! Pipeline domain model and state machine
//!
//! Stages run strictly in order. Inside a stage steps run in order, except
//! that a run of consecutive parallel steps is released together as one
//! flow. A flow passes when every member succeeded or was skipped; it breaks
//! when any member failed, was canceled or refused, which completes the
//! pipeline early.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use super::step::{Step, StepState};
use super::{Resource, validate_segment};
use crate::error::{Error, Result};

/// Lifecycle status of a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    #[default]
    Pending,
    Executing,
    Complete,
}

/// Mutable status block of a pipeline
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PipelineStatus {
    #[serde(default)]
    pub status: PipelineState,

    /// Number of the last flow released; 0 before the first
    #[serde(default)]
    pub current_flow: u32,

    #[serde(default)]
    pub start_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub end_at: Option<DateTime<Utc>>,

    /// Scheduler instance that owns the pipeline
    #[serde(default)]
    pub scheduler_node: Option<String>,

    /// Why the pipeline completed early, if it did
    #[serde(default)]
    pub message: Option<String>,
}

/// Volume made available to every step of a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mount {
    pub name: String,
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

/// Branch and event patterns a pipeline is triggered by
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Trigger {
    #[serde(default)]
    pub branches: Vec<String>,
    #[serde(default)]
    pub events: Vec<String>,
}

impl Trigger {
    /// Whether a branch/event pair fires this trigger
    ///
    /// An empty pattern list matches anything. Patterns are anchored.
    pub fn matches(&self, branch: &str, event: &str) -> Result<bool> {
        Ok(Self::any_match(&self.branches, branch)? && Self::any_match(&self.events, event)?)
    }

    fn any_match(patterns: &[String], value: &str) -> Result<bool> {
        if patterns.is_empty() {
            return Ok(true);
        }

        for pattern in patterns {
            let re = Regex::new(&format!("^(?:{})$", pattern)).map_err(|e| {
                Error::validation(format!("invalid trigger pattern '{}': {}", pattern, e))
            })?;
            if re.is_match(value) {
                return Ok(true);
            }
        }

        Ok(false)
    }
}

/// Ordered group of steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    /// 1-based position of the stage in its pipeline
    pub number: u32,

    #[serde(default)]
    pub name: String,

    pub steps: Vec<Step>,
}

impl Stage {
    pub fn new(number: u32, steps: Vec<Step>) -> Self {
        Self {
            number,
            name: String::new(),
            steps,
        }
    }

    /// Every step was released and passed
    pub fn is_passed(&self) -> bool {
        self.steps
            .iter()
            .all(|s| s.is_scheduled() && s.status.status.is_passed())
    }

    /// Some step failed, was canceled or refused
    pub fn is_broken(&self) -> bool {
        self.steps.iter().any(|s| s.status.status.is_broken())
    }

    /// Some released step has not reached a terminal status yet
    pub fn has_in_flight(&self) -> bool {
        self.steps
            .iter()
            .any(|s| s.is_scheduled() && !s.status.status.is_terminal())
    }

    /// Indexes of the next batch to release
    ///
    /// Scheduled steps are skipped. A leading serial step is returned alone;
    /// otherwise consecutive unscheduled parallel steps are collected until a
    /// serial step ends the scan.
    pub fn next_batch(&self) -> Vec<usize> {
        let mut batch = Vec::new();

        for (idx, step) in self.steps.iter().enumerate() {
            if step.is_scheduled() {
                if batch.is_empty() {
                    continue;
                }
                break;
            }

            if !step.parallel {
                if batch.is_empty() {
                    batch.push(idx);
                }
                break;
            }

            batch.push(idx);
        }

        batch
    }
}

/// Steps released together, tagged with their flow number
#[derive(Debug, Clone, PartialEq)]
pub struct Flow {
    pub number: u32,
    pub steps: Vec<Step>,
}

/// Outcome of asking a pipeline for its next work
#[derive(Debug, Clone, PartialEq)]
pub enum NextStep {
    /// A new flow was released
    Flow(Flow),

    /// The current flow is still running
    Waiting,

    /// Nothing is left to run; the pipeline is now complete
    Complete,
}

/// Multi-stage pipeline definition plus its execution status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub namespace: String,
    pub id: String,

    #[serde(default)]
    pub name: String,

    pub stages: Vec<Stage>,

    /// Pipeline-scoped parameters, between action defaults and step overrides
    #[serde(default)]
    pub with: BTreeMap<String, String>,

    #[serde(default)]
    pub mounts: Vec<Mount>,

    #[serde(default)]
    pub on: Option<Trigger>,

    #[serde(default)]
    pub status: PipelineStatus,

    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub resource_version: i64,
}

impl Pipeline {
    /// Creates a pending pipeline from stages of steps, numbering the stages
    pub fn new(namespace: impl Into<String>, id: impl Into<String>, stages: Vec<Vec<Step>>) -> Self {
        let stages = stages
            .into_iter()
            .enumerate()
            .map(|(i, steps)| Stage::new(i as u32 + 1, steps))
            .collect();

        Self {
            namespace: namespace.into(),
            id: id.into(),
            name: String::new(),
            stages,
            with: BTreeMap::new(),
            mounts: Vec::new(),
            on: None,
            status: PipelineStatus::default(),
            created_at: None,
            resource_version: 0,
        }
    }

    /// Checks identity segments, stage numbering and step id uniqueness
    pub fn validate(&self) -> Result<()> {
        validate_segment("namespace", &self.namespace)?;
        validate_segment("pipeline id", &self.id)?;

        if self.stages.is_empty() {
            return Err(Error::validation(format!(
                "pipeline '{}' has no stages",
                self.id
            )));
        }

        for (idx, stage) in self.stages.iter().enumerate() {
            if stage.number != idx as u32 + 1 {
                return Err(Error::validation(format!(
                    "stage {} of pipeline '{}' is numbered {}",
                    idx + 1,
                    self.id,
                    stage.number
                )));
            }

            let mut seen = HashSet::new();
            for step in &stage.steps {
                validate_segment("step id", &step.id)?;
                if step.action.trim().is_empty() {
                    return Err(Error::validation(format!("step '{}' has no action", step.id)));
                }
                if !seen.insert(step.id.as_str()) {
                    return Err(Error::validation(format!(
                        "duplicate step id '{}' in stage {}",
                        step.id, stage.number
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.status.status == PipelineState::Complete
    }

    /// Marks the pipeline complete
    pub fn complete(&mut self, message: Option<String>, now: DateTime<Utc>) {
        self.status.status = PipelineState::Complete;
        self.status.end_at = Some(now);
        if message.is_some() {
            self.status.message = message;
        }
    }

    /// All steps across all stages
    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.stages.iter().flat_map(|s| s.steps.iter())
    }

    /// Steps released in the given flow
    pub fn flow_steps(&self, flow: u32) -> Vec<&Step> {
        self.steps().filter(|s| s.flow == Some(flow)).collect()
    }

    /// Copies the status of a stored step onto the embedded step
    ///
    /// Returns `true` if the embedded status changed.
    pub fn apply_step_status(&mut self, step: &Step) -> bool {
        let key = step.composite_key();
        let embedded = self
            .stages
            .iter_mut()
            .flat_map(|s| s.steps.iter_mut())
            .find(|s| s.composite_key() == key);

        match embedded {
            Some(embedded) if embedded.status != step.status => {
                embedded.status = step.status.clone();
                true
            }
            _ => false,
        }
    }

    /// Releases the next batch of steps
    ///
    /// Stages that passed are skipped; a broken stage or a stage with steps
    /// still in flight stops the scan. Every returned step is stamped with its
    /// pipeline linkage, creation time and the new flow number, and the flow
    /// counter advances exactly once per non-empty batch.
    pub fn get_next_flow(&mut self, now: DateTime<Utc>) -> Option<Flow> {
        for stage_idx in 0..self.stages.len() {
            let stage = &self.stages[stage_idx];

            if stage.is_broken() {
                return None;
            }
            if stage.is_passed() {
                continue;
            }
            if stage.has_in_flight() {
                return None;
            }

            let batch = stage.next_batch();
            if batch.is_empty() {
                return None;
            }

            self.status.current_flow += 1;
            let number = self.status.current_flow;
            let stage_number = self.stages[stage_idx].number;

            let mut released = Vec::with_capacity(batch.len());
            for idx in batch {
                let step = &mut self.stages[stage_idx].steps[idx];
                step.namespace = self.namespace.clone();
                step.pipeline_id = self.id.clone();
                step.stage = stage_number;
                step.from_pipeline = true;
                step.flow = Some(number);
                step.created_at = Some(now);
                step.scheduler_node = self.status.scheduler_node.clone();
                released.push(step.clone());
            }

            return Some(Flow {
                number,
                steps: released,
            });
        }

        None
    }

    /// Advances the pipeline
    ///
    /// The first call releases the first flow. Later calls report
    /// [`NextStep::Waiting`] until the current flow passes, then release the
    /// next one. A broken flow, or nothing left to release, completes the
    /// pipeline.
    pub fn next_step(&mut self, now: DateTime<Utc>) -> NextStep {
        if self.is_complete() {
            return NextStep::Complete;
        }

        if self.status.current_flow > 0 {
            let current = self.flow_steps(self.status.current_flow);

            if let Some(broken) = current.iter().find(|s| s.status.status.is_broken()) {
                let message = format!(
                    "flow {} broke: step '{}' is {}",
                    self.status.current_flow, broken.id, broken.status.status
                );
                self.complete(Some(message), now);
                return NextStep::Complete;
            }

            if !current.iter().all(|s| s.status.status.is_passed()) {
                return NextStep::Waiting;
            }
        }

        match self.get_next_flow(now) {
            Some(flow) => {
                if self.status.status == PipelineState::Pending {
                    self.status.status = PipelineState::Executing;
                }
                NextStep::Flow(flow)
            }
            None => {
                self.complete(None, now);
                NextStep::Complete
            }
        }
    }

    /// Final status summary: the first broken step wins, else succeeded
    pub fn outcome(&self) -> Option<StepState> {
        if !self.is_complete() {
            return None;
        }

        Some(
            self.steps()
                .map(|s| s.status.status)
                .find(|s| s.is_broken())
                .unwrap_or(StepState::Succeeded),
        )
    }
}

impl Resource for Pipeline {
    const COLLECTION: &'static str = "pipelines";

    fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.id)
    }

    fn tombstone(key: &str) -> Result<Self> {
        let (namespace, id) = key
            .split_once('/')
            .ok_or_else(|| Error::InvalidKey(key.to_string()))?;

        if namespace.is_empty() || id.is_empty() || id.contains('/') {
            return Err(Error::InvalidKey(key.to_string()));
        }

        Ok(Pipeline::new(namespace, id, Vec::new()))
    }

    fn resource_version(&self) -> i64 {
        self.resource_version
    }

    fn set_resource_version(&mut self, revision: i64) {
        self.resource_version = revision;
    }
}
