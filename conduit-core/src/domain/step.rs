//! Step domain model
//!
//! A step is one invocation of an action. Once dispatched to a runner only
//! its status block changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::{Resource, validate_segment};
use crate::error::{Error, Result};

/// Execution status of a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
    Skip,
    Auditing,
    Refuse,
    ScheduleFailed,
}

impl StepState {
    /// No further transition will happen on its own
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepState::Succeeded
                | StepState::Failed
                | StepState::Canceled
                | StepState::Skip
                | StepState::Refuse
                | StepState::ScheduleFailed
        )
    }

    /// Lets the owning flow proceed
    pub fn is_passed(&self) -> bool {
        matches!(self, StepState::Succeeded | StepState::Skip)
    }

    /// Breaks the owning flow and completes the pipeline early
    pub fn is_broken(&self) -> bool {
        matches!(
            self,
            StepState::Failed | StepState::Canceled | StepState::Refuse | StepState::ScheduleFailed
        )
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepState::Pending => "pending",
            StepState::Running => "running",
            StepState::Succeeded => "succeeded",
            StepState::Failed => "failed",
            StepState::Canceled => "canceled",
            StepState::Skip => "skip",
            StepState::Auditing => "auditing",
            StepState::Refuse => "refuse",
            StepState::ScheduleFailed => "schedule_failed",
        };
        f.write_str(s)
    }
}

/// Decision state of an audit gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditState {
    Pending,
    Approved,
    Refused,
}

/// Audit request attached to a step with `with_audit`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Audit {
    pub state: AuditState,
    pub requested_at: DateTime<Utc>,

    #[serde(default)]
    pub decided_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub reviewer: Option<String>,
}

/// Mutable status block of a step
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StepStatus {
    #[serde(default)]
    pub status: StepState,

    /// Execution node chosen by the scheduler
    #[serde(default)]
    pub scheduled_node: Option<String>,

    /// Opaque runner output, e.g. a container id used for cancellation
    #[serde(default)]
    pub response: BTreeMap<String, String>,

    /// Failure or scheduling message
    #[serde(default)]
    pub message: Option<String>,

    #[serde(default)]
    pub start_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub end_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub audit: Option<Audit>,
}

/// One action invocation inside a stage, or a standalone unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    #[serde(default)]
    pub namespace: String,

    #[serde(default)]
    pub pipeline_id: String,

    /// 1-based number of the owning stage
    #[serde(default)]
    pub stage: u32,

    pub id: String,

    #[serde(default)]
    pub name: String,

    /// Action reference, `name@version`
    pub action: String,

    /// Step-level parameter overrides, highest precedence
    #[serde(default)]
    pub with: BTreeMap<String, String>,

    #[serde(default)]
    pub with_audit: bool,

    /// Dispatched together with adjacent parallel steps
    #[serde(default)]
    pub parallel: bool,

    /// Flow number the step was released in; `None` until scheduled
    #[serde(default)]
    pub flow: Option<u32>,

    /// Whether the step was released by a pipeline
    #[serde(default)]
    pub from_pipeline: bool,

    /// Scheduler instance that owns this step
    #[serde(default)]
    pub scheduler_node: Option<String>,

    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub status: StepStatus,

    #[serde(default)]
    pub resource_version: i64,
}

impl Step {
    /// Creates an unscheduled serial step
    pub fn new(id: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            namespace: String::new(),
            pipeline_id: String::new(),
            stage: 0,
            id: id.into(),
            name: String::new(),
            action: action.into(),
            with: BTreeMap::new(),
            with_audit: false,
            parallel: false,
            flow: None,
            from_pipeline: false,
            scheduler_node: None,
            created_at: None,
            status: StepStatus::default(),
            resource_version: 0,
        }
    }

    /// Marks the step as parallel
    pub fn parallel(mut self) -> Self {
        self.parallel = true;
        self
    }

    /// Requires an audit approval before dispatch
    pub fn audited(mut self) -> Self {
        self.with_audit = true;
        self
    }

    /// Adds a step-level parameter
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.with.insert(key.into(), value.into());
        self
    }

    /// Composite key `namespace.pipelineId.stageNumber.stepId`
    pub fn composite_key(&self) -> String {
        format!(
            "{}.{}.{}.{}",
            self.namespace, self.pipeline_id, self.stage, self.id
        )
    }

    /// Parses a composite key into `(namespace, pipeline_id, stage, id)`
    pub fn parse_composite_key(key: &str) -> Result<(String, String, u32, String)> {
        let parts: Vec<&str> = key.split('.').collect();
        if parts.len() != 4 || parts.iter().any(|p| p.is_empty()) {
            return Err(Error::InvalidKey(key.to_string()));
        }

        let stage = parts[2]
            .parse::<u32>()
            .map_err(|_| Error::InvalidKey(key.to_string()))?;

        Ok((
            parts[0].to_string(),
            parts[1].to_string(),
            stage,
            parts[3].to_string(),
        ))
    }

    /// Key of the owning pipeline, if the step came from one
    pub fn pipeline_key(&self) -> Option<String> {
        if self.from_pipeline {
            Some(format!("{}/{}", self.namespace, self.pipeline_id))
        } else {
            None
        }
    }

    /// Checks the identity segments
    pub fn validate(&self) -> Result<()> {
        validate_segment("namespace", &self.namespace)?;
        validate_segment("pipeline id", &self.pipeline_id)?;
        validate_segment("step id", &self.id)?;

        if self.action.trim().is_empty() {
            return Err(Error::validation(format!("step '{}' has no action", self.id)));
        }

        Ok(())
    }

    /// Whether the step has been released in a flow
    pub fn is_scheduled(&self) -> bool {
        self.flow.is_some()
    }

    /// Whether dispatch is still blocked on an audit decision
    pub fn awaiting_audit(&self) -> bool {
        self.with_audit
            && !matches!(
                self.status.audit.as_ref().map(|a| a.state),
                Some(AuditState::Approved)
            )
    }

    /// Opens the audit gate: status becomes `auditing`
    pub fn request_audit(&mut self, now: DateTime<Utc>) {
        self.status.status = StepState::Auditing;
        self.status.audit = Some(Audit {
            state: AuditState::Pending,
            requested_at: now,
            decided_at: None,
            reviewer: None,
        });
    }

    /// Approves a pending audit; the step becomes schedulable again
    pub fn approve_audit(&mut self, reviewer: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        let audit = self.pending_audit_mut()?;
        audit.state = AuditState::Approved;
        audit.decided_at = Some(now);
        audit.reviewer = Some(reviewer.into());
        self.status.status = StepState::Pending;
        Ok(())
    }

    /// Refuses a pending audit; the step is terminal and breaks its flow
    pub fn refuse_audit(&mut self, reviewer: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        let reviewer = reviewer.into();
        let audit = self.pending_audit_mut()?;
        audit.state = AuditState::Refused;
        audit.decided_at = Some(now);
        audit.reviewer = Some(reviewer.clone());
        self.status.status = StepState::Refuse;
        self.status.message = Some(format!("audit refused by {}", reviewer));
        self.status.end_at = Some(now);
        Ok(())
    }

    fn pending_audit_mut(&mut self) -> Result<&mut Audit> {
        let key = self.composite_key();
        match self.status.audit.as_mut() {
            Some(audit) if audit.state == AuditState::Pending => Ok(audit),
            Some(_) => Err(Error::validation(format!(
                "audit for step '{}' was already decided",
                key
            ))),
            None => Err(Error::validation(format!(
                "step '{}' has no audit request",
                key
            ))),
        }
    }

    /// Moves the step into a terminal status
    pub fn finish(&mut self, status: StepState, message: Option<String>, now: DateTime<Utc>) {
        self.status.status = status;
        self.status.message = message;
        self.status.end_at = Some(now);
    }
}

impl Resource for Step {
    const COLLECTION: &'static str = "steps";

    fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.composite_key())
    }

    fn tombstone(key: &str) -> Result<Self> {
        let (namespace, composite) = key
            .split_once('/')
            .ok_or_else(|| Error::InvalidKey(key.to_string()))?;

        let (ns, pipeline_id, stage, id) = Step::parse_composite_key(composite)?;
        if ns != namespace {
            return Err(Error::InvalidKey(key.to_string()));
        }

        let mut step = Step::new(id, String::new());
        step.namespace = ns;
        step.pipeline_id = pipeline_id;
        step.stage = stage;
        Ok(step)
    }

    fn resource_version(&self) -> i64 {
        self.resource_version
    }

    fn set_resource_version(&mut self, revision: i64) {
        self.resource_version = revision;
    }
}
