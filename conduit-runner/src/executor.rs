//! Step controller (execution node side)
//!
//! Watches only the steps scheduled on this node. A pending step is handed
//! to the engine, which runs it on the calling worker; a running step that is
//! moved to `canceled` in the store has its workload stopped.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use conduit_controller::Reconciler;
use conduit_core::domain::{Step, StepState};
use conduit_core::{KeyLayout, Resource};
use conduit_informer::StepInformer;
use conduit_kv::KvStore;
use tracing::{debug, info, warn};

use crate::engine::Engine;

/// Step informer holding only the steps scheduled on `instance`
pub fn node_step_informer(kv: Arc<dyn KvStore>, layout: KeyLayout, instance: &str) -> StepInformer {
    let instance = instance.to_string();
    StepInformer::new(kv, layout)
        .with_filter(move |step| step.status.scheduled_node.as_deref() == Some(instance.as_str()))
}

pub struct ExecutorReconciler {
    engine: Arc<Engine>,

    /// Instance name of this execution node
    instance: String,
}

impl ExecutorReconciler {
    pub fn new(engine: Arc<Engine>, instance: impl Into<String>) -> Self {
        Self {
            engine,
            instance: instance.into(),
        }
    }

    fn scheduled_here(&self, step: &Step) -> bool {
        step.status.scheduled_node.as_deref() == Some(self.instance.as_str())
    }
}

#[async_trait]
impl Reconciler for ExecutorReconciler {
    type Object = Step;

    fn name(&self) -> &'static str {
        "execution"
    }

    fn wants(&self, step: &Step) -> bool {
        step.status.status == StepState::Pending && !step.awaiting_audit() && self.scheduled_here(step)
    }

    fn on_update(&self, old: &Step, new: &Step) -> bool {
        if old.status.status == StepState::Running
            && new.status.status == StepState::Canceled
            && self.scheduled_here(new)
        {
            let engine = Arc::clone(&self.engine);
            let key = new.key();
            info!("Step {} was cancelled, stopping its workload", key);
            tokio::spawn(async move {
                if let Err(e) = engine.cancel(&key).await {
                    warn!("Failed to cancel step {}: {:#}", key, e);
                }
            });
        }

        old.resource_version != new.resource_version && self.wants(new)
    }

    fn on_delete(&self, _step: &Step) -> bool {
        false
    }

    async fn sync(&self, key: &str, obj: Arc<Step>) -> Result<()> {
        if !self.wants(&obj) {
            return Ok(());
        }

        let status = self.engine.execute(key).await?;
        debug!("Execution of step {} ended as {}", key, status);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeRunner, local_action};
    use chrono::Utc;
    use conduit_controller::{Controller, ControllerOptions};
    use conduit_core::StaticActionCatalog;
    use conduit_informer::PipelineInformer;
    use conduit_kv::MemoryKv;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn scheduled_on(id: &str, node: &str) -> Step {
        let mut step = Step::new(id, "make@v1");
        step.namespace = "default".to_string();
        step.pipeline_id = "adhoc".to_string();
        step.scheduler_node = Some("sched-1".to_string());
        step.status.scheduled_node = Some(node.to_string());
        step
    }

    async fn wait_for_status(steps: &StepInformer, key: &str, status: StepState) -> Step {
        for _ in 0..300 {
            if let Some(step) = steps.get(key).await.unwrap() {
                if step.status.status == status {
                    return step;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("step {} never reached {}", key, status);
    }

    #[tokio::test]
    async fn test_executes_own_steps_and_honours_cancel() {
        let kv = MemoryKv::new();
        let layout = KeyLayout::new("acme", "conduit");
        let runner = FakeRunner::holding();

        let steps = Arc::new(node_step_informer(kv.clone(), layout.clone(), "n1"));
        let engine = Arc::new(
            Engine::new(
                Arc::clone(&steps),
                Arc::new(PipelineInformer::new(kv.clone(), layout.clone())),
                Arc::new(StaticActionCatalog::new([local_action("make", "v1")])),
            )
            .with_runner(runner.clone()),
        );
        let controller = Arc::new(Controller::new(
            Arc::new(ExecutorReconciler::new(engine, "n1")),
            Arc::clone(&steps),
            ControllerOptions::default(),
        ));

        let cancel = CancellationToken::new();
        let run = {
            let controller = Arc::clone(&controller);
            let cancel = cancel.clone();
            tokio::spawn(async move { controller.run(cancel).await })
        };

        let recorder = StepInformer::new(kv.clone(), layout);
        let mut mine = scheduled_on("build", "n1");
        recorder.create(&mut mine).await.unwrap();
        let mut theirs = scheduled_on("lint", "n2");
        recorder.create(&mut theirs).await.unwrap();

        let mut running = wait_for_status(&recorder, &mine.key(), StepState::Running).await;
        for _ in 0..300 {
            if !running.status.response.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            running = recorder.get(&mine.key()).await.unwrap().unwrap();
        }

        running.finish(StepState::Canceled, Some("stopped".to_string()), Utc::now());
        recorder.update(&mut running).await.unwrap();

        for _ in 0..300 {
            if !runner.cancelled.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(runner.cancelled.lock().unwrap().len(), 1);

        let theirs = recorder.get(&theirs.key()).await.unwrap().unwrap();
        assert_eq!(theirs.status.status, StepState::Pending);
        assert_eq!(runner.runs(), 1);

        cancel.cancel();
        run.await.unwrap().unwrap();

        let mine = recorder.get(&mine.key()).await.unwrap().unwrap();
        assert_eq!(mine.status.status, StepState::Canceled);
    }
}
