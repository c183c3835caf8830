//! Collab Transport - Publish/subscribe bus
//!
//! Nodes talk only through named channels:
//! - `publish` delivers items to every subscriber of a channel
//! - Publishing needs a publisher or owner affiliation on the channel
//! - Each attached node receives its notifications on one stream
//!
//! `LocalBus` is the in-process implementation, with fault injection for
//! exercising failure paths.

pub mod bus;
pub mod local;

pub use bus::*;
pub use local::*;
