//! Test doubles shared by the engine, executor and node tests

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use conduit_core::domain::{Action, RunnerType, Step};
use tokio::sync::Notify;

use crate::error::Result;
use crate::runner::{RunOutcome, RunRequest, Runner, correlation};

pub const FAKE_ID: &str = "fake_id";

/// Records every call; `wait` can be held until released or cancelled
pub struct FakeRunner {
    pub requests: Mutex<Vec<RunRequest>>,
    pub cancelled: Mutex<Vec<String>>,
    pub waited: Mutex<Vec<String>>,
    outcome: Mutex<RunOutcome>,
    hold: bool,
    release: Notify,
}

impl FakeRunner {
    pub fn new() -> Arc<Self> {
        Self::build(false)
    }

    /// `wait` blocks until [`FakeRunner::release`] or `cancel`
    pub fn holding() -> Arc<Self> {
        Self::build(true)
    }

    fn build(hold: bool) -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            waited: Mutex::new(Vec::new()),
            outcome: Mutex::new(RunOutcome::Succeeded),
            hold,
            release: Notify::new(),
        })
    }

    pub fn set_outcome(&self, outcome: RunOutcome) {
        *self.outcome.lock().unwrap() = outcome;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }

    pub fn runs(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn last_request(&self) -> Option<RunRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Runner for FakeRunner {
    fn runner_type(&self) -> RunnerType {
        RunnerType::Local
    }

    async fn run(&self, request: &RunRequest) -> Result<BTreeMap<String, String>> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(BTreeMap::from([(
            FAKE_ID.to_string(),
            request.step.composite_key(),
        )]))
    }

    async fn wait(&self, step: &Step) -> Result<RunOutcome> {
        let id = correlation(step, FAKE_ID)?.to_string();
        self.waited.lock().unwrap().push(id);
        if self.hold {
            self.release.notified().await;
        }
        Ok(self.outcome.lock().unwrap().clone())
    }

    async fn cancel(&self, step: &Step) -> Result<()> {
        let id = correlation(step, FAKE_ID)?.to_string();
        self.cancelled.lock().unwrap().push(id);
        self.set_outcome(RunOutcome::Failed("killed".to_string()));
        self.release.notify_one();
        Ok(())
    }

    async fn logs(&self, step: &Step) -> Result<String> {
        Ok(format!("logs of {}", correlation(step, FAKE_ID)?))
    }

    async fn connect(&self, step: &Step, command: &[String]) -> Result<String> {
        Ok(format!("{}: {}", correlation(step, FAKE_ID)?, command.join(" ")))
    }
}

/// Action run by the fake runner
pub fn local_action(name: &str, version: &str) -> Action {
    Action {
        name: name.to_string(),
        version: version.to_string(),
        runner_type: "local".to_string(),
        run_params: BTreeMap::new(),
        required_params: Vec::new(),
        runner_params: BTreeMap::from([("command".to_string(), "true".to_string())]),
    }
}
