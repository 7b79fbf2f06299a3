//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod node;
mod scheduler;
mod standalone;

pub use node::NodeCommands;
pub use scheduler::SchedulerCommands;
pub use standalone::StandaloneCommands;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Subcommand, ValueEnum};
use conduit_kv::KvStore;
use tracing::info;

use crate::config::{Config, StoreBackend, split_list};
use crate::runtime;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Execution node management
    Node {
        #[command(subcommand)]
        command: NodeCommands,
    },
    /// Scheduler management
    Scheduler {
        #[command(subcommand)]
        command: SchedulerCommands,
    },
    /// Scheduler and execution node in one process
    Standalone {
        #[command(subcommand)]
        command: StandaloneCommands,
    },
}

/// Where the configuration is read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ConfigType {
    /// TOML file given by --config-file
    File,
    /// CONDUIT_* environment variables
    Env,
    /// TOML document stored in etcd at <org>/<service>/config/<instance>
    Etcd,
}

/// Configuration source arguments
#[derive(Debug, Clone, Args)]
pub struct ConfigArgs {
    #[arg(long, value_enum, env = "CONDUIT_CONFIG_TYPE", default_value = "env")]
    pub config_type: ConfigType,

    /// Configuration file for --config-type file
    #[arg(long, env = "CONDUIT_CONFIG_FILE", default_value = "conduit.toml")]
    pub config_file: PathBuf,

    /// Comma-separated etcd endpoints for --config-type etcd
    #[arg(long, env = "CONDUIT_CONFIG_ETCD")]
    pub config_etcd: Option<String>,
}

impl ConfigArgs {
    /// Loads and validates the configuration
    pub async fn load(&self) -> Result<Config> {
        let config = match self.config_type {
            ConfigType::File => Config::from_file(&self.config_file)?,
            ConfigType::Env => Config::from_env()?,
            ConfigType::Etcd => self.load_from_etcd().await?,
        };

        config.validate()?;
        info!(
            "Loaded configuration: instance={}, root={}, store={:?}",
            config.instance_name,
            config.layout().root(),
            config.store.backend
        );
        Ok(config)
    }

    /// Reads the stored document of this instance
    ///
    /// Identity comes from the environment, since it is what locates the
    /// document. The store defaults to the etcd cluster the document was
    /// read from.
    async fn load_from_etcd(&self) -> Result<Config> {
        let endpoints = self
            .config_etcd
            .as_deref()
            .map(split_list)
            .filter(|endpoints| !endpoints.is_empty())
            .context("--config-etcd is required with --config-type etcd")?;

        if std::env::var("CONDUIT_INSTANCE_NAME").is_err() {
            anyhow::bail!("CONDUIT_INSTANCE_NAME must be set to locate the stored configuration");
        }
        let identity = Config::from_env()?;

        let kv = runtime::connect_etcd(&endpoints).await?;
        let key = identity.layout().config_key(&identity.instance_name);
        let stored = kv
            .get(&key)
            .await
            .with_context(|| format!("Failed to read configuration {}", key))?
            .with_context(|| format!("No configuration stored under {}", key))?;
        let text = String::from_utf8(stored.value)
            .with_context(|| format!("Configuration {} is not UTF-8", key))?;

        let mut config = Config::from_toml(&text)?;
        config.org = identity.org;
        config.service_name = identity.service_name;
        config.instance_name = identity.instance_name;
        if config.store.endpoints.is_empty() {
            config.store.backend = StoreBackend::Etcd;
            config.store.endpoints = endpoints;
        }

        Ok(config)
    }
}

/// Handle a CLI command
///
/// Routes the command to the appropriate handler module.
///
/// # Arguments
/// * `command` - The command to execute
pub async fn handle_command(command: Commands) -> Result<()> {
    match command {
        Commands::Node { command } => node::handle_node_command(command).await,
        Commands::Scheduler { command } => scheduler::handle_scheduler_command(command).await,
        Commands::Standalone { command } => standalone::handle_standalone_command(command).await,
    }
}
