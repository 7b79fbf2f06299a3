//! Conduit Core
//!
//! Core types and abstractions for the Conduit pipeline orchestrator.
//!
//! This crate contains:
//! - Domain types: Node, Pipeline, Stage, Step, Action, WebHook
//! - The pipeline/step state machine, including flow computation
//! - The key layout shared by every process talking to the store
//! - The action catalog contract

pub mod catalog;
pub mod domain;
pub mod error;
pub mod keys;

pub use catalog::{ActionCatalog, CatalogError, StaticActionCatalog};
pub use domain::Resource;
pub use error::{Error, Result};
pub use keys::KeyLayout;
