//! Conduit Informer
//!
//! Keeps a local, indexed mirror of one resource collection in sync with the
//! remote store and writes mutated objects back.
//!
//! This crate contains:
//! - [`Indexer`]: thread-safe keyed cache with secondary indexes
//! - [`Informer`]: generic Lister/Watcher/Recorder over one collection
//! - [`Registry`]: lease-bound node registration and heartbeat

pub mod error;
pub mod handler;
pub mod indexer;
pub mod informer;
pub mod registry;

pub use error::{InformerError, Result};
pub use handler::EventHandler;
pub use indexer::{IndexFunc, Indexer};
pub use informer::{Filter, Informer, NodeInformer, PipelineInformer, StepInformer};
pub use registry::{KeepAlive, Registry};
