#![forbid(unsafe_code)]
#![warn(clippy::all, rustdoc::broken_intra_doc_links)]

//! Configuration for the Rivulet processes.
//!
//! Layout: `model.rs` (typed configuration models with defaults and
//! validation), `loader.rs` (JSON file loading that materialises defaults on
//! first run), `error.rs` (typed failures). The worker reads a JSON file so
//! a node can be provisioned by dropping one file next to the binary; the
//! gateway reads its settings from the environment.

pub mod error;
pub mod loader;
pub mod model;

pub use error::{ConfigError, Result};
pub use loader::{load_worker_config, save_worker_config};
pub use model::{
    GatewayAppConfig, GatewaySettings, LimitSettings, NetworkSettings, NodeSettings,
    StorageSettings, TurnSettings, WorkerConfig,
};
