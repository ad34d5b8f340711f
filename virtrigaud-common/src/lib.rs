//! # VirtRigaud Common
//!
//! Shared utilities for the VirtRigaud control plane and provider binaries.
//!
//! ## Logging
//!
//! ```rust
//! virtrigaud_common::init_logging("info").unwrap();
//! ```

pub mod logging;

// Re-export logging functions
pub use logging::{
    init_logging,
    init_logging_json,
    init_logging_production,
    TimedOperation,
};
