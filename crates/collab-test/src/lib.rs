//! Collab Test Harness - In-process clusters and end-to-end scenarios
//!
//! This crate provides:
//! - A manager / worker / aggregator cluster wired to a local bus
//! - A probe observing the cluster's output channels
//! - Random portfolio generation
//! - End-to-end simulation scenarios

pub mod cluster;
pub mod scenario;

pub use cluster::*;
pub use scenario::*;
