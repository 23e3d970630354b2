//! Registry to registry replication: adapters for the common registry flavours,
//! a durable job store, and a worker pool running one state machine per job.

pub mod adapter;
pub mod config;
pub mod container_specs;
pub mod engine;
pub mod error;
pub mod glob;
pub mod job;
pub mod model;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod worker;

pub use error::{Error, Result};
