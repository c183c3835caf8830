//! Collab Wire Format - Simulation envelope encoding
//!
//! Every message on the bus is an item whose payload is a namespaced
//! `simulation` element:
//! - parameters (run_id, output, number_runs, command, timestamp)
//! - optional portfolio
//! - optional distributions
//! - optional progress
//! - optional logger
//!
//! The element is encoded as JSON.

pub mod schema;
pub mod envelope;
pub mod message;
pub mod item;

pub use envelope::*;
pub use message::*;
pub use item::*;
