//! Process wiring shared by every command
//!
//! Opens the store, registers node records, and builds the scheduler and
//! execution node from a validated [`Config`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use conduit_controller::{Scheduler, SchedulerParams, StaticHookProvider, WebhookDispatcher};
use conduit_core::ActionCatalog;
use conduit_core::domain::{Node, NodeType};
use conduit_informer::Registry;
use conduit_kv::{KvStore, MemoryKv};
use conduit_runner::{
    DockerRunner, ExecutionNode, HttpActionCatalog, K8sRunner, LocalRunner, NodeParams, Runner,
    StaticActionCatalog,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Config, StoreBackend};

/// Registration attempts before giving up on an unreachable store
const REGISTER_RETRIES: u32 = 10;

/// Timeout of catalog requests
const CATALOG_TIMEOUT: Duration = Duration::from_secs(10);

/// How often the in-memory store expires leases
const LEASE_REAP_INTERVAL: Duration = Duration::from_secs(1);

/// A running process: its configuration, store and shutdown signal
pub struct Runtime {
    pub config: Config,
    pub kv: Arc<dyn KvStore>,
    pub cancel: CancellationToken,
}

impl Runtime {
    /// Opens the store and cancels on Ctrl-C
    pub async fn start(config: Config) -> Result<Self> {
        let cancel = CancellationToken::new();
        let kv = open_store(&config, &cancel).await?;

        let signal = cancel.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received shutdown signal"),
                Err(e) => warn!("Failed to listen for shutdown signal: {}", e),
            }
            signal.cancel();
        });

        Ok(Self { config, kv, cancel })
    }

    /// Registers this process as `node_type` and keeps the lease alive
    ///
    /// The returned task unregisters the node once the runtime is cancelled.
    pub async fn register(&self, node_type: NodeType) -> Result<JoinHandle<()>> {
        let node = Node::new(
            &self.config.service_name,
            &self.config.instance_name,
            node_type,
            self.config.lease_ttl_secs,
        )
        .with_address(&self.config.address);

        let registry = Arc::new(Registry::new(
            Arc::clone(&self.kv),
            self.config.layout(),
            node,
        ));
        registry
            .register_with_retry(REGISTER_RETRIES)
            .await
            .with_context(|| format!("Failed to register {} {}", node_type, self.config.instance_name))?;

        info!(
            "Registered {} {} (lease TTL {}s)",
            node_type, self.config.instance_name, self.config.lease_ttl_secs
        );
        Ok(registry.spawn(self.cancel.clone()))
    }

    /// Catalog service client, or the actions declared in the configuration
    pub fn catalog(&self) -> Result<Arc<dyn ActionCatalog>> {
        match &self.config.catalog.url {
            Some(url) => {
                let client = reqwest::Client::builder()
                    .timeout(CATALOG_TIMEOUT)
                    .build()
                    .context("Failed to build catalog HTTP client")?;
                info!("Using action catalog at {}", url);
                Ok(Arc::new(HttpActionCatalog::with_client(url, client)))
            }
            None => {
                info!(
                    "Using {} action(s) declared in the configuration",
                    self.config.catalog.actions.len()
                );
                Ok(Arc::new(StaticActionCatalog::new(
                    self.config.catalog.actions.clone(),
                )))
            }
        }
    }

    fn webhooks(&self) -> Result<Option<Arc<WebhookDispatcher>>> {
        let hooks = &self.config.webhooks;
        if hooks.hooks.is_empty() {
            return Ok(None);
        }

        let dispatcher = WebhookDispatcher::new(
            Arc::new(StaticHookProvider::new(hooks.hooks.clone())),
            Duration::from_secs(hooks.timeout_secs),
            hooks.max_hooks,
        )?;
        info!("Delivering step completions to {} webhook(s)", hooks.hooks.len());
        Ok(Some(Arc::new(dispatcher)))
    }

    fn runners(&self) -> Vec<Arc<dyn Runner>> {
        let runners = &self.config.runners;
        let docker: Arc<dyn Runner> = Arc::new(DockerRunner::new(&runners.docker_binary));
        let k8s: Arc<dyn Runner> = Arc::new(K8sRunner::new(
            &runners.kubectl_binary,
            &runners.k8s_namespace,
        ));
        let local: Arc<dyn Runner> = Arc::new(LocalRunner::new(&runners.work_dir));
        vec![docker, k8s, local]
    }

    pub fn scheduler(&self) -> Result<Scheduler> {
        let catalog = match (&self.config.catalog.url, self.config.catalog.actions.is_empty()) {
            (None, true) => {
                warn!("No action catalog configured, pipelines are not validated against it");
                None
            }
            _ => Some(self.catalog()?),
        };

        Ok(Scheduler::new(SchedulerParams {
            kv: Arc::clone(&self.kv),
            layout: self.config.layout(),
            instance: self.config.instance_name.clone(),
            options: self.config.controller_options(),
            catalog,
            webhooks: self.webhooks()?,
        }))
    }

    pub fn execution_node(&self) -> Result<ExecutionNode> {
        Ok(ExecutionNode::new(NodeParams {
            kv: Arc::clone(&self.kv),
            layout: self.config.layout(),
            instance: self.config.instance_name.clone(),
            options: self.config.controller_options(),
            catalog: self.catalog()?,
            runners: self.runners(),
        }))
    }
}

/// Opens the configured store
pub async fn open_store(config: &Config, cancel: &CancellationToken) -> Result<Arc<dyn KvStore>> {
    match config.store.backend {
        StoreBackend::Memory => {
            warn!("Using the in-memory store: state is lost on exit and not shared with other processes");
            let kv = MemoryKv::new();
            kv.spawn_lease_reaper(LEASE_REAP_INTERVAL, cancel.clone());
            Ok(kv)
        }
        StoreBackend::Etcd => connect_etcd(&config.store.endpoints).await,
    }
}

#[cfg(feature = "etcd")]
pub async fn connect_etcd(endpoints: &[String]) -> Result<Arc<dyn KvStore>> {
    let kv = conduit_kv::EtcdKv::connect(endpoints)
        .await
        .with_context(|| format!("Failed to connect to etcd at {}", endpoints.join(",")))?;
    info!("Connected to etcd at {}", endpoints.join(","));
    Ok(Arc::new(kv))
}

#[cfg(not(feature = "etcd"))]
pub async fn connect_etcd(_endpoints: &[String]) -> Result<Arc<dyn KvStore>> {
    anyhow::bail!("this build has no etcd support; rebuild with the `etcd` feature")
}
