//! edgepick
//!
//! Measures latency, loss and download throughput of CDN edge addresses,
//! ranks them, and keeps DNS records pointed at the best ones.
//! The `edgepick` binary wires these modules to the CLI and the health cycle.

pub mod config;
pub mod dns;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod probe;

pub use error::{Error, Result};
