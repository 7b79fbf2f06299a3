//! Runner contract
//!
//! A runner drives one workload per step on a specific backend. Starting a
//! workload returns the correlation data the engine stores in the step's
//! `response` map; every later call (wait, cancel, logs, connect) finds the
//! workload again through that map, so a restarted node can still cancel a
//! workload it started before the restart.

use std::collections::BTreeMap;
use std::process::Output;

use async_trait::async_trait;
use conduit_core::domain::{Action, Mount, RunnerType, Step};
use tokio::process::Command;
use tracing::debug;

use crate::error::{Result, RunnerError};

/// Everything a runner needs to start one step
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub step: Step,
    pub action: Action,

    /// Run parameters after precedence resolution
    pub params: BTreeMap<String, String>,

    /// Host paths declared on the pipeline
    pub mounts: Vec<Mount>,
}

impl RunRequest {
    /// Backend-specific parameter from the action
    pub fn runner_param(&self, key: &str) -> Option<&str> {
        self.action
            .runner_params
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    /// Backend-specific parameter the runner cannot do without
    pub fn required_runner_param(&self, key: &str) -> Result<&str> {
        self.runner_param(key).ok_or_else(|| {
            RunnerError::InvalidParams(format!(
                "action '{}@{}' has no '{}' runner parameter",
                self.action.name, self.action.version, key
            ))
        })
    }
}

/// How a workload ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded,
    Failed(String),
}

/// One execution backend
#[async_trait]
pub trait Runner: Send + Sync {
    fn runner_type(&self) -> RunnerType;

    /// Starts the workload and returns its correlation data
    async fn run(&self, request: &RunRequest) -> Result<BTreeMap<String, String>>;

    /// Blocks until the workload started for `step` ends
    async fn wait(&self, step: &Step) -> Result<RunOutcome>;

    /// Stops the workload started for `step`
    async fn cancel(&self, step: &Step) -> Result<()>;

    /// Output produced by the workload so far
    async fn logs(&self, step: &Step) -> Result<String>;

    /// Runs `command` inside the live workload and returns its output
    async fn connect(&self, step: &Step, command: &[String]) -> Result<String>;
}

/// Reads one correlation value from a step's response
pub fn correlation<'a>(step: &'a Step, key: &str) -> Result<&'a str> {
    step.status
        .response
        .get(key)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| RunnerError::MissingCorrelation {
            step: step.composite_key(),
            key: key.to_string(),
        })
}

/// Runs a backend CLI to completion
///
/// Stdout and stderr are logged at debug level. A non-zero exit becomes
/// [`RunnerError::CommandFailed`] carrying stderr.
pub(crate) async fn exec(program: &str, args: &[String]) -> Result<Output> {
    debug!("Running {} {}", program, args.join(" "));

    let output = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| RunnerError::Spawn {
            program: program.to_string(),
            source,
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    if !stdout.trim().is_empty() {
        debug!("{} stdout: {}", program, stdout.trim());
    }
    if !stderr.trim().is_empty() {
        debug!("{} stderr: {}", program, stderr.trim());
    }

    if !output.status.success() {
        return Err(RunnerError::CommandFailed {
            command: format!("{} {}", program, args.first().map(String::as_str).unwrap_or("")),
            code: output.status.code().unwrap_or(-1),
            stderr: stderr.trim().to_string(),
        });
    }

    Ok(output)
}

/// Trimmed stdout of a backend CLI call
pub(crate) async fn exec_stdout(program: &str, args: &[String]) -> Result<String> {
    let output = exec(program, args).await?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Stdout followed by stderr, as a workload's logs are usually read
pub(crate) async fn exec_combined(program: &str, args: &[String]) -> Result<String> {
    let output = exec(program, args).await?;
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(text)
}

/// Name for a new workload, unique per run
///
/// Lowercase and limited to `[a-z0-9-]` so it is valid as a container name
/// and as a pod name.
pub(crate) fn workload_name(step: &Step) -> String {
    let sanitize = |s: &str| -> String {
        s.chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
            .collect()
    };
    let suffix = uuid::Uuid::new_v4().simple().to_string();

    let mut name = format!(
        "conduit-{}-{}",
        sanitize(&step.pipeline_id),
        sanitize(&step.id)
    );
    name.truncate(50);
    format!("{}-{}", name.trim_end_matches('-'), &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correlation_requires_value() {
        let mut step = Step::new("build", "make@v1");
        let err = correlation(&step, "container_id").unwrap_err();
        assert!(err.is_missing_correlation());
        assert!(err.to_string().contains("container_id"));

        step.status
            .response
            .insert("container_id".to_string(), "abc".to_string());
        assert_eq!(correlation(&step, "container_id").unwrap(), "abc");
    }

    #[test]
    fn test_workload_name_is_dns_safe() {
        let mut step = Step::new("Build_Image", "make@v1");
        step.pipeline_id = "Release.42".to_string();

        let name = workload_name(&step);
        assert!(name.starts_with("conduit-release-42-build-image-"));
        assert!(
            name.chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        );
        assert_ne!(name, workload_name(&step));
    }

    #[tokio::test]
    async fn test_exec_reports_exit_code() {
        let err = exec("sh", &["-c".to_string(), "echo boom >&2; exit 3".to_string()])
            .await
            .unwrap_err();
        match err {
            RunnerError::CommandFailed { code, stderr, .. } => {
                assert_eq!(code, 3);
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}
