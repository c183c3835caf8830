//! Collab Core - Fundamental types and primitives
//!
//! This crate defines the core types shared by every Collab node:
//! - Identifiers (RunId, NodeName)
//! - Run parameters and commands
//! - Portfolios (assets, issuers, factors)
//! - Distributions, progress and log records
//! - Protocol constants

pub mod id;
pub mod command;
pub mod params;
pub mod portfolio;
pub mod distributions;
pub mod logger;
pub mod error;

pub use id::*;
pub use command::*;
pub use params::*;
pub use portfolio::*;
pub use distributions::*;
pub use logger::*;
pub use error::*;

/// Namespace stamped on every simulation envelope
pub const COLLAB_NS: &str = "http://coshx.co.uk/protocols/collab/0.1";

/// Special output channel that is written to the local log instead of the bus
pub const LOG_CHANNEL: &str = "log";

/// Marker used to tell error channels apart from regular output channels
pub const ERROR_MARKER: &str = "error";

/// Name of the histogram carrying the number-of-defaults distribution
pub const DEFAULTS_HISTOGRAM: &str = "defaults";

pub const DEFAULT_BROADCAST_FREQ: u64 = 1000;
pub const DEFAULT_NUMBER_RUNS: u64 = 1_000_000;
pub const DEFAULT_MAX_RUNS: u64 = 5_000_000;
/// Seconds between two load-balancer checks
pub const DEFAULT_LOAD_BALANCER_FREQ: u64 = 5;
