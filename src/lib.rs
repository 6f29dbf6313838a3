//! jobline: an asynchronous job queue that runs submitted payloads through a
//! chain of model-backed stages and reports results by polling.

pub mod anthropic;
pub mod config;
pub mod contract;
pub mod error;
pub mod executor;
pub mod fetch;
pub mod gate;
pub mod job;
pub mod pipeline;
pub mod queue;
pub mod server;
pub mod service;
pub mod stage;
pub mod store;
pub mod supervisor;
