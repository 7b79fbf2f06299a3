//! Conduit Runner
//!
//! The execution side of Conduit.
//!
//! This crate contains:
//! - [`Engine`]: resolves a scheduled step's action and parameters and drives
//!   it through a [`Runner`]
//! - Runner backends: [`DockerRunner`], [`K8sRunner`], [`LocalRunner`]
//! - [`HttpActionCatalog`]: client for the external action catalog
//! - [`ExecutionNode`]: composition root of an execution node

pub mod catalog;
pub mod docker;
pub mod engine;
pub mod error;
pub mod executor;
pub mod k8s;
pub mod local;
pub mod node;
pub mod runner;

#[cfg(test)]
mod testing;

pub use catalog::{ActionCatalog, CatalogError, HttpActionCatalog, StaticActionCatalog};
pub use docker::DockerRunner;
pub use engine::Engine;
pub use error::{Result, RunnerError};
pub use executor::ExecutorReconciler;
pub use k8s::K8sRunner;
pub use local::LocalRunner;
pub use node::{ExecutionNode, NodeParams};
pub use runner::{RunOutcome, RunRequest, Runner};
