//! Infrastructure layer: engine clients, broker adapters, job workers and the bridge.

pub mod bridge;
pub mod broker;
pub mod config;
pub mod engine;
pub mod jobs;
pub mod workers;
