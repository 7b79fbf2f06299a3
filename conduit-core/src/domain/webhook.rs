//! WebHook domain model
//!
//! A webhook is an external notification sink that receives the JSON of a
//! step whenever the step reaches a status it subscribes to.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::step::{Step, StepState};

/// Notification sink for step status changes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebHook {
    pub id: String,
    pub url: String,

    /// Extra headers sent with every delivery
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Statuses that trigger a delivery; empty means every completion status
    #[serde(default)]
    pub statuses: Vec<StepState>,

    /// Restricts the hook to one namespace
    #[serde(default)]
    pub namespace: Option<String>,

    #[serde(default)]
    pub last_attempt_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub last_success: Option<bool>,

    #[serde(default)]
    pub last_error: Option<String>,
}

impl WebHook {
    /// Creates a hook subscribed to every completion status
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            headers: BTreeMap::new(),
            statuses: Vec::new(),
            namespace: None,
            last_attempt_at: None,
            last_success: None,
            last_error: None,
        }
    }

    /// Whether this hook wants to hear about the step in its current status
    pub fn matches(&self, step: &Step) -> bool {
        if let Some(namespace) = &self.namespace {
            if namespace != &step.namespace {
                return false;
            }
        }

        if self.statuses.is_empty() {
            return step.status.status.is_terminal();
        }

        self.statuses.contains(&step.status.status)
    }

    /// Records the outcome of a delivery attempt
    pub fn record_attempt(&mut self, at: DateTime<Utc>, result: std::result::Result<(), String>) {
        self.last_attempt_at = Some(at);
        match result {
            Ok(()) => {
                self.last_success = Some(true);
                self.last_error = None;
            }
            Err(e) => {
                self.last_success = Some(false);
                self.last_error = Some(e);
            }
        }
    }
}
