//! Docker runner
//!
//! Runs each step as a detached container through the docker CLI (or any
//! CLI-compatible engine such as podman). The container is kept after it
//! exits so its logs stay readable; cancelling removes it.
//!
//! Runner parameters:
//! - `image` (required): image reference
//! - `command`: shell command run with `sh -c` instead of the image default
//! - `entrypoint`: entrypoint override
//! - `workdir`: working directory inside the container

use std::collections::BTreeMap;

use async_trait::async_trait;
use conduit_core::domain::{RunnerType, Step};
use tracing::{debug, info};

use crate::error::Result;
use crate::runner::{
    RunOutcome, RunRequest, Runner, correlation, exec, exec_combined, exec_stdout, workload_name,
};

/// Response key holding the container id
pub const CONTAINER_ID: &str = "container_id";

/// Response key holding the container name
pub const CONTAINER_NAME: &str = "container_name";

pub struct DockerRunner {
    /// CLI binary (`docker`, `podman`, ...)
    binary: String,
}

impl Default for DockerRunner {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerRunner {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Arguments of the `run` invocation for one request
    fn run_args(&self, name: &str, request: &RunRequest) -> Result<Vec<String>> {
        let image = request.required_runner_param("image")?;

        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            name.to_string(),
            "--label".to_string(),
            format!("conduit.step={}", request.step.composite_key()),
        ];

        for (key, value) in &request.params {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        for mount in &request.mounts {
            let mut volume = format!("{}:{}", mount.source, mount.target);
            if mount.read_only {
                volume.push_str(":ro");
            }
            args.push("-v".to_string());
            args.push(volume);
        }

        if let Some(workdir) = request.runner_param("workdir") {
            args.push("-w".to_string());
            args.push(workdir.to_string());
        }

        if let Some(entrypoint) = request.runner_param("entrypoint") {
            args.push("--entrypoint".to_string());
            args.push(entrypoint.to_string());
        }

        args.push(image.to_string());

        if let Some(command) = request.runner_param("command") {
            args.push("sh".to_string());
            args.push("-c".to_string());
            args.push(command.to_string());
        }

        Ok(args)
    }
}

#[async_trait]
impl Runner for DockerRunner {
    fn runner_type(&self) -> RunnerType {
        RunnerType::Docker
    }

    async fn run(&self, request: &RunRequest) -> Result<BTreeMap<String, String>> {
        let name = workload_name(&request.step);
        let args = self.run_args(&name, request)?;

        info!(
            "Starting container {} for step {}",
            name,
            request.step.composite_key()
        );
        let container_id = exec_stdout(&self.binary, &args).await?;
        info!("Container {} started with ID: {}", name, container_id);

        Ok(BTreeMap::from([
            (CONTAINER_ID.to_string(), container_id),
            (CONTAINER_NAME.to_string(), name),
        ]))
    }

    async fn wait(&self, step: &Step) -> Result<RunOutcome> {
        let id = correlation(step, CONTAINER_ID)?;

        let status = exec_stdout(&self.binary, &["wait".to_string(), id.to_string()]).await?;
        debug!("Container {} exited with {}", id, status);

        Ok(match status.trim().parse::<i32>() {
            Ok(0) => RunOutcome::Succeeded,
            Ok(code) => RunOutcome::Failed(format!("container exited with code {}", code)),
            Err(_) => RunOutcome::Failed(format!("unexpected wait status '{}'", status)),
        })
    }

    async fn cancel(&self, step: &Step) -> Result<()> {
        let id = correlation(step, CONTAINER_ID)?;

        info!("Removing container {} of step {}", id, step.composite_key());
        exec(
            &self.binary,
            &["rm".to_string(), "-f".to_string(), id.to_string()],
        )
        .await?;
        Ok(())
    }

    async fn logs(&self, step: &Step) -> Result<String> {
        let id = correlation(step, CONTAINER_ID)?;
        exec_combined(&self.binary, &["logs".to_string(), id.to_string()]).await
    }

    async fn connect(&self, step: &Step, command: &[String]) -> Result<String> {
        let id = correlation(step, CONTAINER_ID)?;

        let mut args = vec!["exec".to_string(), id.to_string()];
        args.extend(command.iter().cloned());
        exec_combined(&self.binary, &args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RunnerError;
    use conduit_core::domain::{Action, Mount};

    fn request(runner_params: &[(&str, &str)]) -> RunRequest {
        RunRequest {
            step: Step::new("build", "make@v1"),
            action: Action {
                name: "make".to_string(),
                version: "v1".to_string(),
                runner_type: "docker".to_string(),
                run_params: BTreeMap::new(),
                required_params: Vec::new(),
                runner_params: runner_params
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            },
            params: BTreeMap::from([("TARGET".to_string(), "release".to_string())]),
            mounts: vec![Mount {
                name: "cache".to_string(),
                source: "/var/cache/conduit".to_string(),
                target: "/cache".to_string(),
                read_only: true,
            }],
        }
    }

    #[test]
    fn test_run_args() {
        let runner = DockerRunner::default();
        let args = runner
            .run_args(
                "conduit-x",
                &request(&[("image", "alpine:3"), ("command", "make $TARGET")]),
            )
            .unwrap();

        let joined = args.join(" ");
        assert!(joined.starts_with("run -d --name conduit-x"));
        assert!(joined.contains("-e TARGET=release"));
        assert!(joined.contains("-v /var/cache/conduit:/cache:ro"));
        assert!(joined.ends_with("alpine:3 sh -c make $TARGET"));
    }

    #[test]
    fn test_run_args_require_image() {
        let runner = DockerRunner::default();
        let err = runner.run_args("conduit-x", &request(&[])).unwrap_err();
        assert!(matches!(err, RunnerError::InvalidParams(_)));
    }

    #[tokio::test]
    async fn test_cancel_without_container_id() {
        let runner = DockerRunner::default();
        let err = runner
            .cancel(&Step::new("build", "make@v1"))
            .await
            .unwrap_err();
        assert!(err.is_missing_correlation());
    }
}
