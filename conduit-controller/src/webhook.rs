//! Webhook dispatch
//!
//! When a step reaches a terminal status, the JSON-serialized step is POSTed
//! to every matching hook. Deliveries run concurrently, are bounded in number
//! and time, and are never retried: a failure is logged and recorded on the
//! hook.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conduit_core::domain::{Step, WebHook};
use reqwest::Client;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Default per-request timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Default cap on hooks notified for one step event
pub const DEFAULT_MAX_HOOKS: usize = 12;

/// Source of webhook registrations
#[async_trait]
pub trait HookProvider: Send + Sync {
    /// Hooks interested in this step's current status
    async fn hooks_for(&self, step: &Step) -> Result<Vec<WebHook>>;

    /// Stores the outcome of one delivery attempt
    async fn record_delivery(
        &self,
        hook_id: &str,
        at: DateTime<Utc>,
        result: std::result::Result<(), String>,
    ) -> Result<()>;
}

/// Hooks declared up front, kept in memory
#[derive(Default)]
pub struct StaticHookProvider {
    hooks: RwLock<Vec<WebHook>>,
}

impl StaticHookProvider {
    pub fn new(hooks: Vec<WebHook>) -> Self {
        Self {
            hooks: RwLock::new(hooks),
        }
    }

    /// Snapshot of every hook with its delivery bookkeeping
    pub fn hooks(&self) -> Vec<WebHook> {
        self.hooks.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl HookProvider for StaticHookProvider {
    async fn hooks_for(&self, step: &Step) -> Result<Vec<WebHook>> {
        Ok(self
            .hooks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|h| h.matches(step))
            .cloned()
            .collect())
    }

    async fn record_delivery(
        &self,
        hook_id: &str,
        at: DateTime<Utc>,
        result: std::result::Result<(), String>,
    ) -> Result<()> {
        let mut hooks = self.hooks.write().unwrap_or_else(|e| e.into_inner());
        let hook = hooks
            .iter_mut()
            .find(|h| h.id == hook_id)
            .with_context(|| format!("webhook '{}' not found", hook_id))?;
        hook.record_attempt(at, result);
        Ok(())
    }
}

/// Pushes step completions to webhook sinks
pub struct WebhookDispatcher {
    client: Client,
    provider: Arc<dyn HookProvider>,
    max_hooks: usize,
}

impl WebhookDispatcher {
    /// Creates a dispatcher
    ///
    /// # Arguments
    /// * `provider` - Where hook registrations come from
    /// * `timeout` - Per-request timeout
    /// * `max_hooks` - Cap on hooks notified for one step event
    pub fn new(provider: Arc<dyn HookProvider>, timeout: Duration, max_hooks: usize) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build webhook HTTP client")?;

        Ok(Self {
            client,
            provider,
            max_hooks,
        })
    }

    /// Delivers `step` to every matching hook and waits for all deliveries
    ///
    /// Returns the number of successful deliveries.
    pub async fn dispatch(&self, step: &Step) -> usize {
        let mut hooks = match self.provider.hooks_for(step).await {
            Ok(hooks) => hooks,
            Err(e) => {
                warn!("Failed to load webhooks for step {}: {:#}", step.composite_key(), e);
                return 0;
            }
        };

        if hooks.is_empty() {
            return 0;
        }
        if hooks.len() > self.max_hooks {
            warn!(
                "Step {} matches {} webhooks, notifying the first {}",
                step.composite_key(),
                hooks.len(),
                self.max_hooks
            );
            hooks.truncate(self.max_hooks);
        }

        let body = Arc::new(step.clone());
        let mut deliveries = JoinSet::new();
        for hook in hooks {
            let client = self.client.clone();
            let body = Arc::clone(&body);
            deliveries.spawn(async move {
                let result = Self::deliver(&client, &hook, &body).await;
                (hook.id, result)
            });
        }

        let mut delivered = 0;
        while let Some(joined) = deliveries.join_next().await {
            let (hook_id, result) = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!("Webhook delivery task failed: {}", e);
                    continue;
                }
            };

            match &result {
                Ok(()) => {
                    delivered += 1;
                    debug!("Delivered step {} to webhook {}", step.composite_key(), hook_id);
                }
                Err(e) => warn!(
                    "Webhook {} failed for step {}: {}",
                    hook_id,
                    step.composite_key(),
                    e
                ),
            }

            if let Err(e) = self
                .provider
                .record_delivery(&hook_id, Utc::now(), result)
                .await
            {
                warn!("Failed to record delivery for webhook {}: {:#}", hook_id, e);
            }
        }

        info!(
            "Step {} ({}) delivered to {} webhook(s)",
            step.composite_key(),
            step.status.status,
            delivered
        );
        delivered
    }

    /// Dispatches in the background
    pub fn spawn_dispatch(self: &Arc<Self>, step: Step) {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            dispatcher.dispatch(&step).await;
        });
    }

    async fn deliver(
        client: &Client,
        hook: &WebHook,
        step: &Step,
    ) -> std::result::Result<(), String> {
        let mut request = client.post(&hook.url).json(step);
        for (name, value) in &hook.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await.map_err(|e| e.to_string())?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(format!("HTTP {}", status.as_u16()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::domain::StepState;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal HTTP sink answering every request with `status`
    async fn sink(status: u16) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 16 * 1024];
                    let _ = socket.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 {} X\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                        status
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        format!("http://{}/hook", addr)
    }

    fn finished_step() -> Step {
        let mut step = Step::new("build", "make@v1");
        step.namespace = "default".to_string();
        step.pipeline_id = "p1".to_string();
        step.stage = 1;
        step.finish(StepState::Succeeded, None, Utc::now());
        step
    }

    #[tokio::test]
    async fn test_dispatch_records_outcomes() {
        let ok = sink(200).await;
        let failing = sink(500).await;

        let mut filtered = WebHook::new("only-failures", ok.clone());
        filtered.statuses = vec![StepState::Failed];

        let provider = Arc::new(StaticHookProvider::new(vec![
            WebHook::new("ok", ok),
            WebHook::new("failing", failing),
            filtered,
        ]));
        let dispatcher =
            WebhookDispatcher::new(provider.clone(), DEFAULT_TIMEOUT, DEFAULT_MAX_HOOKS).unwrap();

        assert_eq!(dispatcher.dispatch(&finished_step()).await, 1);

        let hooks = provider.hooks();
        let by_id = |id: &str| hooks.iter().find(|h| h.id == id).unwrap().clone();
        assert_eq!(by_id("ok").last_success, Some(true));
        assert_eq!(by_id("failing").last_success, Some(false));
        assert_eq!(by_id("failing").last_error.as_deref(), Some("HTTP 500"));
        assert!(by_id("only-failures").last_attempt_at.is_none());
    }

    #[tokio::test]
    async fn test_dispatch_is_capped() {
        let url = sink(204).await;
        let hooks = (0..5)
            .map(|i| WebHook::new(format!("h{}", i), url.clone()))
            .collect();
        let provider = Arc::new(StaticHookProvider::new(hooks));
        let dispatcher = WebhookDispatcher::new(provider.clone(), DEFAULT_TIMEOUT, 2).unwrap();

        assert_eq!(dispatcher.dispatch(&finished_step()).await, 2);
        let attempted = provider
            .hooks()
            .iter()
            .filter(|h| h.last_attempt_at.is_some())
            .count();
        assert_eq!(attempted, 2);
    }

    #[tokio::test]
    async fn test_unreachable_sink_is_not_retried() {
        let provider = Arc::new(StaticHookProvider::new(vec![WebHook::new(
            "down",
            "http://127.0.0.1:9/hook",
        )]));
        let dispatcher = WebhookDispatcher::new(
            provider.clone(),
            Duration::from_millis(500),
            DEFAULT_MAX_HOOKS,
        )
        .unwrap();

        assert_eq!(dispatcher.dispatch(&finished_step()).await, 0);
        assert_eq!(provider.hooks()[0].last_success, Some(false));
    }
}
