//! Conduit Controller
//!
//! The reconciliation machinery of a scheduler instance.
//!
//! This crate contains:
//! - [`WorkQueue`]: deduplicating key queue with per-key exponential backoff
//! - [`Controller`]: generic informer-driven worker pool over a [`Reconciler`]
//! - [`Picker`]: round-robin node selection over the live node set
//! - Node, pipeline and step reconcilers
//! - [`WebhookDispatcher`]: step completion push to webhook sinks
//! - [`Scheduler`]: composition root wiring the three controllers together

pub mod controller;
pub mod nodes;
pub mod picker;
pub mod pipelines;
pub mod queue;
pub mod scheduler;
pub mod steps;
pub mod webhook;

pub use controller::{Controller, ControllerOptions, Reconciler};
pub use nodes::NodeReconciler;
pub use picker::{NodeSet, Picker, RoundRobin};
pub use pipelines::PipelineReconciler;
pub use queue::WorkQueue;
pub use scheduler::{Scheduler, SchedulerParams};
pub use steps::StepReconciler;
pub use webhook::{HookProvider, StaticHookProvider, WebhookDispatcher};
