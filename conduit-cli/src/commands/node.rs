//! Execution node command handlers
//!
//! Starts an execution node, or lists the nodes currently registered.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Subcommand;
use colored::*;
use conduit_core::domain::{Node, NodeType};
use conduit_informer::NodeInformer;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::ConfigArgs;
use crate::runtime::{Runtime, open_store};

/// Node subcommands
#[derive(Subcommand)]
pub enum NodeCommands {
    /// Register as an execution node and run scheduled steps
    Start {
        #[command(flatten)]
        config: ConfigArgs,
    },
    /// List all registered nodes
    List {
        #[command(flatten)]
        config: ConfigArgs,
    },
}

/// Handle node commands
///
/// # Arguments
/// * `command` - The node command to execute
pub async fn handle_node_command(command: NodeCommands) -> Result<()> {
    match command {
        NodeCommands::Start { config } => start(config).await,
        NodeCommands::List { config } => list_nodes(config).await,
    }
}

async fn start(args: ConfigArgs) -> Result<()> {
    let runtime = Runtime::start(args.load().await?).await?;
    info!("Starting Conduit node {}", runtime.config.instance_name);

    let heartbeat = runtime.register(NodeType::Node).await?;
    let node = runtime.execution_node()?;

    let result = node.run(runtime.cancel.clone()).await;

    runtime.cancel.cancel();
    if let Err(e) = heartbeat.await {
        warn!("Heartbeat task failed: {}", e);
    }

    result
}

/// List all registered nodes
async fn list_nodes(args: ConfigArgs) -> Result<()> {
    let config = args.load().await?;
    let cancel = CancellationToken::new();
    let kv = open_store(&config, &cancel).await?;

    let informer = NodeInformer::new(kv, config.layout());
    let (mut nodes, _) = informer.list().await.context("Failed to list nodes")?;
    cancel.cancel();

    nodes.sort_by(|a, b| {
        (a.node_type.as_str(), &a.instance_name).cmp(&(b.node_type.as_str(), &b.instance_name))
    });

    if nodes.is_empty() {
        println!("{}", "No nodes registered.".yellow());
    } else {
        println!(
            "{}",
            format!("Found {} registered node(s):", nodes.len()).bold()
        );
        println!();
        for node in nodes {
            print_node_summary(&node);
        }
    }

    Ok(())
}

/// Print a node summary
fn print_node_summary(node: &Node) {
    println!("  {} Node {}", "▸".cyan(), node.instance_name.bold());
    println!("    Type:         {}", colorize_type(node.node_type));
    println!(
        "    Address:      {}",
        if node.address.is_empty() {
            "-".dimmed()
        } else {
            node.address.normal()
        }
    );
    println!("    Version:      {}", node.version);
    println!(
        "    Started:      {} ({} ago)",
        node.start_at
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
            .dimmed(),
        format_age(Utc::now().signed_duration_since(node.start_at))
    );
    println!();
}

/// Colorize node type for display
fn colorize_type(node_type: NodeType) -> ColoredString {
    match node_type {
        NodeType::Scheduler => node_type.as_str().blue(),
        NodeType::Node => node_type.as_str().green(),
        NodeType::Api => node_type.as_str().magenta(),
    }
}

fn format_age(age: chrono::TimeDelta) -> String {
    let secs = age.num_seconds().max(0);
    match secs {
        s if s < 60 => format!("{}s", s),
        s if s < 3600 => format!("{}m{}s", s / 60, s % 60),
        s if s < 86_400 => format!("{}h{}m", s / 3600, (s % 3600) / 60),
        s => format!("{}d{}h", s / 86_400, (s % 86_400) / 3600),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_age() {
        assert_eq!(format_age(chrono::TimeDelta::seconds(-3)), "0s");
        assert_eq!(format_age(chrono::TimeDelta::seconds(59)), "59s");
        assert_eq!(format_age(chrono::TimeDelta::seconds(125)), "2m5s");
        assert_eq!(format_age(chrono::TimeDelta::seconds(7_260)), "2h1m");
        assert_eq!(format_age(chrono::TimeDelta::seconds(90_000)), "1d1h");
    }
}
