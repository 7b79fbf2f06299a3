//! Generic reconciling controller
//!
//! A [`Controller`] wires one [`Informer`] to a [`WorkQueue`] of cache keys
//! and drains the queue with a fixed pool of workers. Workers always read the
//! current object from the cache, so a burst of events for one key collapses
//! into a single sync of the latest state.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use conduit_core::Resource;
use conduit_informer::{EventHandler, Informer};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::queue::{DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY, WorkQueue};

/// Resource-specific reconciliation logic
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    type Object: Resource;

    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Whether a newly seen object needs a sync
    fn wants(&self, _obj: &Self::Object) -> bool {
        true
    }

    /// Called for every object entering the cache; returns whether to enqueue it
    ///
    /// Runs on the watcher's dispatch loop and must not block.
    fn on_add(&self, obj: &Self::Object) -> bool {
        self.wants(obj)
    }

    /// Called for every cache update; returns whether to enqueue `new`
    ///
    /// Runs on the watcher's dispatch loop and must not block.
    fn on_update(&self, old: &Self::Object, new: &Self::Object) -> bool {
        old.resource_version() != new.resource_version() && self.wants(new)
    }

    /// Called when an object leaves the cache; returns whether to enqueue it
    fn on_delete(&self, _obj: &Self::Object) -> bool {
        true
    }

    /// Drives the current state of one object
    async fn sync(&self, key: &str, obj: Arc<Self::Object>) -> Result<()>;

    /// Handles a dequeued key that is no longer cached
    async fn on_missing(&self, key: &str) -> Result<()> {
        debug!("{} {} is gone", self.name(), key);
        Ok(())
    }
}

/// Worker pool settings
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub workers: usize,
    pub shutdown_timeout: Duration,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            shutdown_timeout: Duration::from_secs(30),
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

/// Forwards informer callbacks into the queue
struct QueueHandler<R: Reconciler> {
    reconciler: Arc<R>,
    queue: Arc<WorkQueue<String>>,
}

impl<R: Reconciler> EventHandler<R::Object> for QueueHandler<R> {
    fn on_add(&self, obj: &R::Object) {
        if self.reconciler.on_add(obj) {
            self.queue.add(obj.key());
        }
    }

    fn on_update(&self, old: &R::Object, new: &R::Object) {
        if self.reconciler.on_update(old, new) {
            self.queue.add(new.key());
        }
    }

    fn on_delete(&self, obj: &R::Object) {
        if self.reconciler.on_delete(obj) {
            self.queue.add(obj.key());
        }
    }
}

/// Rate-limited reconciler loop for one resource type
pub struct Controller<R: Reconciler> {
    reconciler: Arc<R>,
    informer: Arc<Informer<R::Object>>,
    queue: Arc<WorkQueue<String>>,
    options: ControllerOptions,

    /// Flips to `true` once the initial listing is cached
    synced: watch::Sender<bool>,
}

impl<R: Reconciler> Controller<R> {
    pub fn new(
        reconciler: Arc<R>,
        informer: Arc<Informer<R::Object>>,
        options: ControllerOptions,
    ) -> Self {
        let queue = WorkQueue::with_backoff(options.base_delay, options.max_delay);
        Self {
            reconciler,
            informer,
            queue,
            options,
            synced: watch::Sender::new(false),
        }
    }

    /// Waits until the initial listing has been cached
    pub async fn wait_synced(&self) {
        let mut rx = self.synced.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|synced| *synced).await;
    }

    /// Queue of keys awaiting a sync; other controllers may feed it
    pub fn queue(&self) -> Arc<WorkQueue<String>> {
        Arc::clone(&self.queue)
    }

    pub fn informer(&self) -> &Arc<Informer<R::Object>> {
        &self.informer
    }

    /// Runs until `cancel` fires
    ///
    /// Seeds the cache from a full listing, enqueues every object the
    /// reconciler wants, then watches for changes while the workers drain
    /// the queue. On cancellation the queue stops accepting keys and workers
    /// get the shutdown timeout to finish their current item.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let name = self.reconciler.name();
        let handler: Arc<dyn EventHandler<R::Object>> = Arc::new(QueueHandler {
            reconciler: Arc::clone(&self.reconciler),
            queue: Arc::clone(&self.queue),
        });

        let revision = self
            .informer
            .resync(handler.as_ref())
            .await
            .with_context(|| format!("Failed to list {} objects", name))?;
        self.synced.send_replace(true);

        info!(
            "Starting {} controller: {} object(s) at revision {}, {} worker(s)",
            name,
            self.informer.indexer().len(),
            revision,
            self.options.workers
        );

        let mut tasks = JoinSet::new();
        tasks.spawn(Arc::clone(&self.informer).run(handler, revision, cancel.child_token()));

        for worker in 0..self.options.workers.max(1) {
            tasks.spawn(Self::worker(
                worker,
                Arc::clone(&self.reconciler),
                Arc::clone(&self.informer),
                Arc::clone(&self.queue),
            ));
        }

        cancel.cancelled().await;
        info!("Stopping {} controller", name);
        self.queue.shut_down();

        let drained = tokio::time::timeout(self.options.shutdown_timeout, async {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    warn!("{} controller task panicked: {}", name, e);
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                "{} controller workers did not stop within {:?}, aborting",
                name, self.options.shutdown_timeout
            );
            tasks.abort_all();
        }

        info!("{} controller stopped", name);
        Ok(())
    }

    async fn worker(
        id: usize,
        reconciler: Arc<R>,
        informer: Arc<Informer<R::Object>>,
        queue: Arc<WorkQueue<String>>,
    ) {
        debug!("{} worker {} started", reconciler.name(), id);

        while let Some(key) = queue.get().await {
            Self::process(&reconciler, &informer, &queue, &key).await;
            queue.done(&key);
        }

        debug!("{} worker {} stopped", reconciler.name(), id);
    }

    async fn process(
        reconciler: &Arc<R>,
        informer: &Arc<Informer<R::Object>>,
        queue: &Arc<WorkQueue<String>>,
        key: &str,
    ) {
        let result = match informer.cached(key) {
            Some(obj) => reconciler.sync(key, obj).await,
            None => reconciler.on_missing(key).await,
        };

        match result {
            Ok(()) => queue.forget(&key.to_string()),
            Err(e) => {
                let delay = queue.add_rate_limited(key.to_string());
                warn!("Failed to sync {} {}: {:#}", reconciler.name(), key, e);
                debug!("Requeued {} {} in {:?}", reconciler.name(), key, delay);
            }
        }
    }
}
