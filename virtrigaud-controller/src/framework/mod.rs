//! Shared reconciliation framework: work queue, rate limiting, controller
//! runner and the reconciler contract.

pub mod backoff;
pub mod controller;
pub mod queue;

pub use backoff::RateLimiter;
pub use controller::{Action, Controller, Reconciler, ResourceKey};
pub use queue::WorkQueue;
