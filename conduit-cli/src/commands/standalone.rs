//! Standalone command handlers
//!
//! Runs the scheduler and execution node roles in one process sharing one
//! store, optionally submitting pipelines from JSON files.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Subcommand;
use conduit_core::Resource;
use conduit_core::domain::{NodeType, Pipeline};
use conduit_informer::PipelineInformer;
use tracing::{info, warn};

use super::ConfigArgs;
use crate::runtime::Runtime;

/// Standalone subcommands
#[derive(Subcommand)]
pub enum StandaloneCommands {
    /// Run scheduler and node together
    Start {
        #[command(flatten)]
        config: ConfigArgs,

        /// Pipeline JSON file to submit on startup (repeatable)
        #[arg(long = "pipeline")]
        pipelines: Vec<PathBuf>,
    },
}

pub async fn handle_standalone_command(command: StandaloneCommands) -> Result<()> {
    match command {
        StandaloneCommands::Start { config, pipelines } => start(config, pipelines).await,
    }
}

async fn start(args: ConfigArgs, files: Vec<PathBuf>) -> Result<()> {
    let runtime = Runtime::start(args.load().await?).await?;
    info!("Starting Conduit standalone {}", runtime.config.instance_name);

    let scheduler_heartbeat = runtime.register(NodeType::Scheduler).await?;
    let node_heartbeat = runtime.register(NodeType::Node).await?;

    let pipelines = PipelineInformer::new(runtime.kv.clone(), runtime.config.layout());
    for file in &files {
        submit(&pipelines, file).await?;
    }

    let scheduler = runtime.scheduler()?;
    let node = runtime.execution_node()?;

    let result = tokio::try_join!(
        scheduler.run(runtime.cancel.clone()),
        node.run(runtime.cancel.clone()),
    )
    .map(|_| ());

    runtime.cancel.cancel();
    for heartbeat in [scheduler_heartbeat, node_heartbeat] {
        if let Err(e) = heartbeat.await {
            warn!("Heartbeat task failed: {}", e);
        }
    }

    result
}

/// Loads a pipeline definition and writes it to the store
async fn submit(pipelines: &PipelineInformer, path: &Path) -> Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read pipeline {}", path.display()))?;
    let mut pipeline: Pipeline = serde_json::from_str(&text)
        .with_context(|| format!("Invalid pipeline {}", path.display()))?;
    pipeline.validate()?;

    pipelines
        .create(&mut pipeline)
        .await
        .with_context(|| format!("Failed to submit pipeline {}", pipeline.key()))?;

    info!(
        "Submitted pipeline {} with {} stage(s)",
        pipeline.key(),
        pipeline.stages.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::KeyLayout;
    use conduit_kv::MemoryKv;

    #[tokio::test]
    async fn test_submit_pipeline_file() {
        let kv = MemoryKv::new();
        let pipelines = PipelineInformer::new(kv, KeyLayout::new("acme", "conduit"));

        let path = std::env::temp_dir().join(format!("conduit-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            r#"{
                "namespace": "default",
                "id": "release",
                "stages": [
                    {"number": 1, "steps": [{"id": "build", "action": "make@v1"}]}
                ]
            }"#,
        )
        .unwrap();

        submit(&pipelines, &path).await.unwrap();
        let stored = pipelines.get("default/release").await.unwrap().unwrap();
        assert_eq!(stored.stages[0].steps[0].action, "make@v1");

        assert!(submit(&pipelines, &path).await.is_err());
        std::fs::remove_file(&path).unwrap();
    }
}
