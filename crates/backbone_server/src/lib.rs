//! Host process for the event backbone.
//!
//! Loads the node configuration, sets up logging and signal handling, and
//! runs a [`BackboneNode`] until shutdown.

pub mod config;
pub mod logging;
pub mod node;
pub mod shutdown;

pub use node::{BackboneNode, HeartbeatMonitor};
