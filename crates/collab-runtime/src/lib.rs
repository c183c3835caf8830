//! Collab Runtime - Nodes and their roles
//!
//! A node is one bus identity running one role:
//! - SimulationManager validates requests and forwards them to workers
//! - SimulationWorker runs the copula kernel and publishes partial results
//! - AggregationManager merges partial results until a run converges
//!
//! Every node processes inbound notifications through its scheduler,
//! reports failures on its error channels and periodically asks its load
//! balancer whether it should stop listening for a while.

pub mod config;
pub mod telemetry;
pub mod context;
pub mod load_balancer;
pub mod node;
pub mod roles;
pub mod admin;

pub use config::*;
pub use telemetry::*;
pub use context::*;
pub use load_balancer::*;
pub use node::*;
pub use roles::*;
pub use admin::*;
