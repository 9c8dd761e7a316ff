//! Integration tests for conflux
//!
//! Test categories:
//! - Mixer: end-to-end mixing through ports, pools and io cells
//! - Negotiation: format locking, param enumeration, capacity limits
//! - Bridge: a mixer hosted behind a client-node connection
//!
//! Run with:
//! ```bash
//! cargo test -p conflux --test integration_tests
//! ```

mod helpers;
mod integration;

pub use integration::*;
