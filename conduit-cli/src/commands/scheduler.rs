//! Scheduler command handlers

use anyhow::Result;
use clap::Subcommand;
use conduit_core::domain::NodeType;
use tracing::{info, warn};

use super::ConfigArgs;
use crate::runtime::Runtime;

/// Scheduler subcommands
#[derive(Subcommand)]
pub enum SchedulerCommands {
    /// Register as a scheduler and run the pipeline and step controllers
    Start {
        #[command(flatten)]
        config: ConfigArgs,
    },
}

pub async fn handle_scheduler_command(command: SchedulerCommands) -> Result<()> {
    match command {
        SchedulerCommands::Start { config } => start(config).await,
    }
}

async fn start(args: ConfigArgs) -> Result<()> {
    let runtime = Runtime::start(args.load().await?).await?;
    info!("Starting Conduit scheduler {}", runtime.config.instance_name);

    let heartbeat = runtime.register(NodeType::Scheduler).await?;
    let scheduler = runtime.scheduler()?;

    let result = scheduler.run(runtime.cancel.clone()).await;

    runtime.cancel.cancel();
    if let Err(e) = heartbeat.await {
        warn!("Heartbeat task failed: {}", e);
    }

    result
}
