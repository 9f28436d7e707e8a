//! Shared plumbing for the segment membership services.

pub mod logging;

/// Version reported by health endpoints.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
