//! Kubernetes runner
//!
//! Runs each step as a bare pod through `kubectl`. Completion is detected by
//! polling the pod phase. Host mounts have no meaning inside a cluster and
//! are ignored.
//!
//! Runner parameters:
//! - `image` (required): image reference
//! - `command`: shell command run with `sh -c` instead of the image default
//! - `namespace`: overrides the runner's default namespace

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use conduit_core::domain::{RunnerType, Step};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::runner::{
    RunOutcome, RunRequest, Runner, correlation, exec, exec_combined, exec_stdout, workload_name,
};

/// Response key holding the pod name
pub const POD: &str = "pod";

/// Response key holding the pod namespace
pub const NAMESPACE: &str = "namespace";

/// Default interval between pod phase checks
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct K8sRunner {
    /// CLI binary, usually `kubectl`
    binary: String,

    /// Namespace pods are created in
    namespace: String,
    poll_interval: Duration,
}

impl K8sRunner {
    /// Creates a runner
    ///
    /// # Arguments
    /// * `binary` - kubectl binary
    /// * `namespace` - Default namespace for pods
    pub fn new(binary: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            namespace: namespace.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn run_args(&self, pod: &str, namespace: &str, request: &RunRequest) -> Result<Vec<String>> {
        let image = request.required_runner_param("image")?;

        let mut args = vec![
            "run".to_string(),
            pod.to_string(),
            "-n".to_string(),
            namespace.to_string(),
            format!("--image={}", image),
            "--restart=Never".to_string(),
            format!("--labels=conduit-pipeline={}", request.step.pipeline_id),
        ];

        for (key, value) in &request.params {
            args.push(format!("--env={}={}", key, value));
        }

        if let Some(command) = request.runner_param("command") {
            args.push("--command".to_string());
            args.push("--".to_string());
            args.push("sh".to_string());
            args.push("-c".to_string());
            args.push(command.to_string());
        }

        Ok(args)
    }

    fn target<'a>(&self, step: &'a Step) -> Result<(&'a str, &'a str)> {
        let pod = correlation(step, POD)?;
        let namespace = correlation(step, NAMESPACE)?;
        Ok((pod, namespace))
    }
}

#[async_trait]
impl Runner for K8sRunner {
    fn runner_type(&self) -> RunnerType {
        RunnerType::K8s
    }

    async fn run(&self, request: &RunRequest) -> Result<BTreeMap<String, String>> {
        if !request.mounts.is_empty() {
            warn!(
                "Ignoring {} host mount(s) for step {} on kubernetes",
                request.mounts.len(),
                request.step.composite_key()
            );
        }

        let pod = workload_name(&request.step);
        let namespace = request
            .runner_param("namespace")
            .unwrap_or(&self.namespace)
            .to_string();
        let args = self.run_args(&pod, &namespace, request)?;

        info!(
            "Creating pod {}/{} for step {}",
            namespace,
            pod,
            request.step.composite_key()
        );
        exec(&self.binary, &args).await?;

        Ok(BTreeMap::from([
            (POD.to_string(), pod),
            (NAMESPACE.to_string(), namespace),
        ]))
    }

    async fn wait(&self, step: &Step) -> Result<RunOutcome> {
        let (pod, namespace) = self.target(step)?;
        let args = vec![
            "get".to_string(),
            "pod".to_string(),
            pod.to_string(),
            "-n".to_string(),
            namespace.to_string(),
            "-o".to_string(),
            "jsonpath={.status.phase}".to_string(),
        ];

        loop {
            let phase = exec_stdout(&self.binary, &args).await?;
            debug!("Pod {}/{} phase: {}", namespace, pod, phase);

            match phase.as_str() {
                "Succeeded" => return Ok(RunOutcome::Succeeded),
                "Failed" => return Ok(RunOutcome::Failed(format!("pod {} failed", pod))),
                _ => tokio::time::sleep(self.poll_interval).await,
            }
        }
    }

    async fn cancel(&self, step: &Step) -> Result<()> {
        let (pod, namespace) = self.target(step)?;

        info!("Deleting pod {}/{}", namespace, pod);
        exec(
            &self.binary,
            &[
                "delete".to_string(),
                "pod".to_string(),
                pod.to_string(),
                "-n".to_string(),
                namespace.to_string(),
                "--wait=false".to_string(),
            ],
        )
        .await?;
        Ok(())
    }

    async fn logs(&self, step: &Step) -> Result<String> {
        let (pod, namespace) = self.target(step)?;
        exec_combined(
            &self.binary,
            &[
                "logs".to_string(),
                pod.to_string(),
                "-n".to_string(),
                namespace.to_string(),
            ],
        )
        .await
    }

    async fn connect(&self, step: &Step, command: &[String]) -> Result<String> {
        let (pod, namespace) = self.target(step)?;

        let mut args = vec![
            "exec".to_string(),
            pod.to_string(),
            "-n".to_string(),
            namespace.to_string(),
            "--".to_string(),
        ];
        args.extend(command.iter().cloned());
        exec_combined(&self.binary, &args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::domain::Action;

    #[test]
    fn test_run_args() {
        let runner = K8sRunner::new("kubectl", "ci");
        let mut step = Step::new("test", "pytest@v1");
        step.pipeline_id = "p1".to_string();

        let request = RunRequest {
            step,
            action: Action {
                name: "pytest".to_string(),
                version: "v1".to_string(),
                runner_type: "k8s".to_string(),
                run_params: BTreeMap::new(),
                required_params: Vec::new(),
                runner_params: BTreeMap::from([
                    ("image".to_string(), "python:3.12".to_string()),
                    ("command".to_string(), "pytest -q".to_string()),
                ]),
            },
            params: BTreeMap::from([("CI".to_string(), "1".to_string())]),
            mounts: Vec::new(),
        };

        let args = runner.run_args("conduit-p1-test-1", "ci", &request).unwrap();
        let joined = args.join(" ");
        assert!(joined.starts_with("run conduit-p1-test-1 -n ci --image=python:3.12"));
        assert!(joined.contains("--restart=Never"));
        assert!(joined.contains("--env=CI=1"));
        assert!(joined.ends_with("--command -- sh -c pytest -q"));
    }

    #[tokio::test]
    async fn test_target_needs_pod_and_namespace() {
        let runner = K8sRunner::new("kubectl", "ci");
        let mut step = Step::new("test", "pytest@v1");
        step.status
            .response
            .insert(POD.to_string(), "conduit-p1-test-1".to_string());

        let err = runner.logs(&step).await.unwrap_err();
        assert!(err.is_missing_correlation());
        assert!(err.to_string().contains(NAMESPACE));
    }
}
