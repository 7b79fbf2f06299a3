//! Local runner
//!
//! Runs each step as a `sh -c` process on the execution node itself. Output
//! goes to `<work_dir>/<run_id>.log`. Processes are supervised by this
//! runner instance, so waiting on or cancelling a run started before a
//! restart reports an unknown workload.
//!
//! Runner parameters:
//! - `command` (required): shell command
//!
//! Run parameters are exported as environment variables and every mount as
//! `CONDUIT_MOUNT_<NAME>=<source>`.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;

use async_trait::async_trait;
use conduit_core::domain::{RunnerType, Step};
use tokio::process::Command;
use tokio::sync::{oneshot, watch};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Result, RunnerError};
use crate::runner::{RunOutcome, RunRequest, Runner, correlation};

/// Response key holding the run id
pub const RUN_ID: &str = "run_id";

/// Response key holding the process id
pub const PID: &str = "pid";

/// A supervised process
struct LocalRun {
    kill: Option<oneshot::Sender<()>>,

    /// `None` while running
    exit: watch::Receiver<Option<RunOutcome>>,
    env: Vec<(String, String)>,
}

pub struct LocalRunner {
    work_dir: PathBuf,
    runs: Mutex<HashMap<String, LocalRun>>,
}

impl LocalRunner {
    /// Creates a runner writing logs under `work_dir`
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            runs: Mutex::new(HashMap::new()),
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    fn log_path(&self, run_id: &str) -> PathBuf {
        self.work_dir.join(format!("{}.log", run_id))
    }

    fn environment(request: &RunRequest) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = request
            .params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        for mount in &request.mounts {
            let name: String = mount
                .name
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
                .collect();
            env.push((format!("CONDUIT_MOUNT_{}", name), mount.source.clone()));
        }

        env
    }

    fn runs(&self) -> std::sync::MutexGuard<'_, HashMap<String, LocalRun>> {
        self.runs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Runner for LocalRunner {
    fn runner_type(&self) -> RunnerType {
        RunnerType::Local
    }

    async fn run(&self, request: &RunRequest) -> Result<BTreeMap<String, String>> {
        let command = request.required_runner_param("command")?.to_string();

        tokio::fs::create_dir_all(&self.work_dir).await?;
        let run_id = Uuid::new_v4().to_string();
        let log = std::fs::File::create(self.log_path(&run_id))?;
        let log_err = log.try_clone()?;

        let env = Self::environment(request);
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .current_dir(&self.work_dir)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RunnerError::Spawn {
                program: "sh".to_string(),
                source,
            })?;

        let pid = child.id().unwrap_or_default();
        info!(
            "Started local process {} (run {}) for step {}",
            pid,
            run_id,
            request.step.composite_key()
        );

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);

        let id = run_id.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) if status.success() => RunOutcome::Succeeded,
                    Ok(status) => RunOutcome::Failed(match status.code() {
                        Some(code) => format!("process exited with code {}", code),
                        None => "process killed by signal".to_string(),
                    }),
                    Err(e) => RunOutcome::Failed(format!("failed to wait for process: {}", e)),
                },
                _ = kill_rx => {
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill local run {}: {}", id, e);
                    }
                    RunOutcome::Failed("process was cancelled".to_string())
                }
            };
            exit_tx.send_replace(Some(outcome));
        });

        self.runs().insert(
            run_id.clone(),
            LocalRun {
                kill: Some(kill_tx),
                exit: exit_rx,
                env,
            },
        );

        Ok(BTreeMap::from([
            (RUN_ID.to_string(), run_id),
            (PID.to_string(), pid.to_string()),
        ]))
    }

    async fn wait(&self, step: &Step) -> Result<RunOutcome> {
        let run_id = correlation(step, RUN_ID)?;
        let mut exit = self
            .runs()
            .get(run_id)
            .map(|run| run.exit.clone())
            .ok_or_else(|| RunnerError::UnknownWorkload(run_id.to_string()))?;

        let outcome = match exit.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };

        self.runs().remove(run_id);
        Ok(outcome.unwrap_or_else(|| RunOutcome::Failed("process supervisor stopped".to_string())))
    }

    async fn cancel(&self, step: &Step) -> Result<()> {
        let run_id = correlation(step, RUN_ID)?;
        let kill = self
            .runs()
            .get_mut(run_id)
            .ok_or_else(|| RunnerError::UnknownWorkload(run_id.to_string()))?
            .kill
            .take();

        if let Some(kill) = kill {
            info!("Killing local run {} of step {}", run_id, step.composite_key());
            let _ = kill.send(());
        }
        Ok(())
    }

    async fn logs(&self, step: &Step) -> Result<String> {
        let run_id = correlation(step, RUN_ID)?;
        match tokio::fs::read_to_string(self.log_path(run_id)).await {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(RunnerError::UnknownWorkload(run_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Runs `command` in the working directory with the run's environment
    async fn connect(&self, step: &Step, command: &[String]) -> Result<String> {
        let run_id = correlation(step, RUN_ID)?;
        let env = self
            .runs()
            .get(run_id)
            .map(|run| run.env.clone())
            .ok_or_else(|| RunnerError::UnknownWorkload(run_id.to_string()))?;

        let (program, args) = command
            .split_first()
            .ok_or_else(|| RunnerError::InvalidParams("empty command".to_string()))?;

        let output = Command::new(program)
            .args(args)
            .current_dir(&self.work_dir)
            .envs(env)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| RunnerError::Spawn {
                program: program.clone(),
                source,
            })?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::domain::{Action, Mount};

    fn request(command: &str) -> RunRequest {
        RunRequest {
            step: Step::new("hello", "echo@v1"),
            action: Action {
                name: "echo".to_string(),
                version: "v1".to_string(),
                runner_type: "local".to_string(),
                run_params: BTreeMap::new(),
                required_params: Vec::new(),
                runner_params: BTreeMap::from([("command".to_string(), command.to_string())]),
            },
            params: BTreeMap::from([("GREETING".to_string(), "hello".to_string())]),
            mounts: vec![Mount {
                name: "src".to_string(),
                source: "/srv/src".to_string(),
                target: "/src".to_string(),
                read_only: false,
            }],
        }
    }

    fn work_dir() -> PathBuf {
        std::env::temp_dir().join(format!("conduit-local-{}", Uuid::new_v4()))
    }

    fn started(mut step: Step, response: BTreeMap<String, String>) -> Step {
        step.status.response = response;
        step
    }

    #[tokio::test]
    async fn test_run_wait_and_logs() {
        let runner = LocalRunner::new(work_dir());
        let req = request("echo \"$GREETING $CONDUIT_MOUNT_SRC\"");

        let response = runner.run(&req).await.unwrap();
        let step = started(req.step.clone(), response);

        assert_eq!(runner.wait(&step).await.unwrap(), RunOutcome::Succeeded);
        assert_eq!(runner.logs(&step).await.unwrap().trim(), "hello /srv/src");
    }

    #[tokio::test]
    async fn test_failure_exit_code() {
        let runner = LocalRunner::new(work_dir());
        let req = request("exit 7");

        let response = runner.run(&req).await.unwrap();
        let step = started(req.step.clone(), response);

        assert_eq!(
            runner.wait(&step).await.unwrap(),
            RunOutcome::Failed("process exited with code 7".to_string())
        );
    }

    #[tokio::test]
    async fn test_cancel_kills_process() {
        let runner = LocalRunner::new(work_dir());
        let req = request("sleep 30");

        let response = runner.run(&req).await.unwrap();
        let step = started(req.step.clone(), response);

        runner.cancel(&step).await.unwrap();
        let outcome = tokio::time::timeout(std::time::Duration::from_secs(5), runner.wait(&step))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, RunOutcome::Failed("process was cancelled".to_string()));
    }

    #[tokio::test]
    async fn test_connect_uses_run_environment() {
        let runner = LocalRunner::new(work_dir());
        let req = request("sleep 30");

        let response = runner.run(&req).await.unwrap();
        let step = started(req.step.clone(), response);

        let out = runner
            .connect(&step, &["sh".to_string(), "-c".to_string(), "echo $GREETING".to_string()])
            .await
            .unwrap();
        assert_eq!(out.trim(), "hello");

        runner.cancel(&step).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_run() {
        let runner = LocalRunner::new(work_dir());
        let mut step = Step::new("hello", "echo@v1");
        step.status
            .response
            .insert(RUN_ID.to_string(), "missing".to_string());

        assert!(matches!(
            runner.wait(&step).await.unwrap_err(),
            RunnerError::UnknownWorkload(_)
        ));
    }
}
