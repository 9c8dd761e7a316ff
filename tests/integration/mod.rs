//! Integration test modules for conflux
//!
//! - mixer: process cycles, passthrough, empty output
//! - negotiation: formats, params, buffer capacity
//! - bridge: remote nodes over a socket pair

pub mod mixer;
pub mod negotiation;

#[cfg(feature = "bridge")]
pub mod bridge;
