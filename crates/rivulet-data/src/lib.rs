#![forbid(unsafe_code)]
#![warn(clippy::all, rustdoc::broken_intra_doc_links)]

//! Persistence layer for worker task state.
//!
//! A single SQLite database (WAL mode) under the worker's state directory is
//! the source of truth for every task; the download loop and transcode
//! monitor serialise their writes per task id, and the store guarantees
//! atomic per-row updates.

pub mod error;
pub mod tasks;

pub use error::{DataError, Result as DataResult};
pub use tasks::{TaskRecord, TaskStore};
