//! Collab State - Aggregation store
//!
//! Tracks, per run, the cumulative distributions merged from worker
//! results, the number of trials accounted for and whether the run has
//! already converged. Runs that were stopped are remembered for a while so
//! that results arriving late do not resurrect them.

pub mod tracker;
pub mod retired;

pub use tracker::*;
pub use retired::*;
