//! Process configuration
//!
//! A configuration can come from a TOML file, from `CONDUIT_*` environment
//! variables, or from a TOML document stored in the KV store. Every field
//! has a default, so a file only needs the values it changes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use conduit_controller::ControllerOptions;
use conduit_core::KeyLayout;
use conduit_core::domain::{Action, WebHook};
use serde::{Deserialize, Serialize};

/// Process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Organization segment of every storage key
    pub org: String,

    /// Service segment of every storage key
    pub service_name: String,

    /// Unique name of this process
    pub instance_name: String,

    /// Address advertised in the node record
    pub address: String,

    /// Node lease TTL in seconds
    pub lease_ttl_secs: u64,

    pub controller: ControllerConfig,
    pub store: StoreConfig,
    pub catalog: CatalogConfig,
    pub webhooks: WebhookConfig,
    pub runners: RunnerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Workers per controller
    pub workers: usize,

    /// Seconds workers get to finish on shutdown
    pub shutdown_timeout_secs: u64,

    /// First retry delay of a failed sync, in milliseconds
    pub base_delay_ms: u64,

    /// Retry delay ceiling, in seconds
    pub max_delay_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local store, for standalone runs and demos
    Memory,
    Etcd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub endpoints: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Catalog service URL; when unset, `actions` is used
    pub url: Option<String>,

    /// Actions served from memory
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Per-request timeout in seconds
    pub timeout_secs: u64,

    /// Cap on hooks notified per step event
    pub max_hooks: usize,
    pub hooks: Vec<WebHook>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Docker-compatible CLI
    pub docker_binary: String,
    pub kubectl_binary: String,

    /// Namespace pods are created in
    pub k8s_namespace: String,

    /// Working directory of the local runner
    pub work_dir: PathBuf,
}

fn default_instance_name() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("conduit-{}", &id[..8])
}

impl Default for Config {
    fn default() -> Self {
        Self {
            org: "conduit".to_string(),
            service_name: "conduit".to_string(),
            instance_name: default_instance_name(),
            address: String::new(),
            lease_ttl_secs: 10,
            controller: ControllerConfig::default(),
            store: StoreConfig::default(),
            catalog: CatalogConfig::default(),
            webhooks: WebhookConfig::default(),
            runners: RunnerConfig::default(),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            shutdown_timeout_secs: 30,
            base_delay_ms: 5,
            max_delay_secs: 1000,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            endpoints: Vec::new(),
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 3,
            max_hooks: 12,
            hooks: Vec::new(),
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            docker_binary: "docker".to_string(),
            kubectl_binary: "kubectl".to_string(),
            k8s_namespace: "default".to_string(),
            work_dir: std::env::temp_dir().join("conduit"),
        }
    }
}

impl Config {
    /// Parses a TOML document
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("Failed to parse configuration")
    }

    /// Loads a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Creates configuration from environment variables
    ///
    /// Recognized variables (all optional):
    /// - CONDUIT_ORG, CONDUIT_SERVICE_NAME, CONDUIT_INSTANCE_NAME, CONDUIT_ADDRESS
    /// - CONDUIT_LEASE_TTL (seconds)
    /// - CONDUIT_WORKERS, CONDUIT_SHUTDOWN_TIMEOUT (seconds)
    /// - CONDUIT_STORE_BACKEND (memory|etcd), CONDUIT_STORE_ENDPOINTS (comma-separated)
    /// - CONDUIT_CATALOG_URL
    /// - CONDUIT_WEBHOOK_TIMEOUT (seconds), CONDUIT_MAX_HOOKS
    /// - CONDUIT_DOCKER_BINARY, CONDUIT_KUBECTL_BINARY, CONDUIT_K8S_NAMESPACE, CONDUIT_WORK_DIR
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`Config::from_env`] with a custom variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(v) = var("CONDUIT_ORG") {
            config.org = v;
        }
        if let Some(v) = var("CONDUIT_SERVICE_NAME") {
            config.service_name = v;
        }
        if let Some(v) = var("CONDUIT_INSTANCE_NAME") {
            config.instance_name = v;
        }
        if let Some(v) = var("CONDUIT_ADDRESS") {
            config.address = v;
        }
        if let Some(v) = var("CONDUIT_LEASE_TTL") {
            config.lease_ttl_secs = parse_var("CONDUIT_LEASE_TTL", &v)?;
        }
        if let Some(v) = var("CONDUIT_WORKERS") {
            config.controller.workers = parse_var("CONDUIT_WORKERS", &v)?;
        }
        if let Some(v) = var("CONDUIT_SHUTDOWN_TIMEOUT") {
            config.controller.shutdown_timeout_secs = parse_var("CONDUIT_SHUTDOWN_TIMEOUT", &v)?;
        }
        if let Some(v) = var("CONDUIT_STORE_BACKEND") {
            config.store.backend = match v.as_str() {
                "memory" => StoreBackend::Memory,
                "etcd" => StoreBackend::Etcd,
                other => anyhow::bail!("CONDUIT_STORE_BACKEND must be memory or etcd, got '{}'", other),
            };
        }
        if let Some(v) = var("CONDUIT_STORE_ENDPOINTS") {
            config.store.endpoints = split_list(&v);
        }
        if let Some(v) = var("CONDUIT_CATALOG_URL") {
            config.catalog.url = Some(v);
        }
        if let Some(v) = var("CONDUIT_WEBHOOK_TIMEOUT") {
            config.webhooks.timeout_secs = parse_var("CONDUIT_WEBHOOK_TIMEOUT", &v)?;
        }
        if let Some(v) = var("CONDUIT_MAX_HOOKS") {
            config.webhooks.max_hooks = parse_var("CONDUIT_MAX_HOOKS", &v)?;
        }
        if let Some(v) = var("CONDUIT_DOCKER_BINARY") {
            config.runners.docker_binary = v;
        }
        if let Some(v) = var("CONDUIT_KUBECTL_BINARY") {
            config.runners.kubectl_binary = v;
        }
        if let Some(v) = var("CONDUIT_K8S_NAMESPACE") {
            config.runners.k8s_namespace = v;
        }
        if let Some(v) = var("CONDUIT_WORK_DIR") {
            config.runners.work_dir = PathBuf::from(v);
        }

        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("org", &self.org),
            ("service_name", &self.service_name),
            ("instance_name", &self.instance_name),
        ] {
            if value.trim().is_empty() {
                anyhow::bail!("{} cannot be empty", name);
            }
            if value.contains('/') {
                anyhow::bail!("{} '{}' must not contain '/'", name, value);
            }
        }

        if self.lease_ttl_secs == 0 {
            anyhow::bail!("lease_ttl_secs must be greater than 0");
        }

        if self.controller.workers == 0 {
            anyhow::bail!("controller.workers must be greater than 0");
        }

        if self.controller.shutdown_timeout_secs == 0 {
            anyhow::bail!("controller.shutdown_timeout_secs must be greater than 0");
        }

        if self.store.backend == StoreBackend::Etcd && self.store.endpoints.is_empty() {
            anyhow::bail!("store.endpoints cannot be empty for the etcd backend");
        }

        if let Some(url) = &self.catalog.url {
            check_url("catalog.url", url)?;
        }

        if self.webhooks.timeout_secs == 0 {
            anyhow::bail!("webhooks.timeout_secs must be greater than 0");
        }

        if self.webhooks.max_hooks == 0 {
            anyhow::bail!("webhooks.max_hooks must be greater than 0");
        }

        for hook in &self.webhooks.hooks {
            check_url(&format!("webhook '{}'", hook.id), &hook.url)?;
        }

        Ok(())
    }

    pub fn layout(&self) -> KeyLayout {
        KeyLayout::new(&self.org, &self.service_name)
    }

    pub fn controller_options(&self) -> ControllerOptions {
        ControllerOptions {
            workers: self.controller.workers,
            shutdown_timeout: Duration::from_secs(self.controller.shutdown_timeout_secs),
            base_delay: Duration::from_millis(self.controller.base_delay_ms),
            max_delay: Duration::from_secs(self.controller.max_delay_secs),
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("{} must be a number, got '{}'", name, value))
}

pub(crate) fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn check_url(name: &str, url: &str) -> Result<()> {
    if !url.starts_with("http://") && !url.starts_with("https://") {
        anyhow::bail!("{} must start with http:// or https://", name);
    }
    Ok(())
}
