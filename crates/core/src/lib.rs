//! Core library for the benchmark dispatcher
//!
//! This crate contains the pieces of the dispatch subsystem that do not touch
//! the network:
//! - Task and run data model
//! - The task queue and its ordering policy
//! - Collaborator interfaces (task persistence, result sink, archive provider)
//!   together with their file-backed implementations

pub mod archive;
pub mod error;
pub mod queue;
pub mod run;
pub mod task;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;
