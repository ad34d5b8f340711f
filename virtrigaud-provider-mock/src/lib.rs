//! # VirtRigaud Mock Provider
//!
//! The in-process reference provider: a full implementation of the
//! `virtrigaud.provider.v1.Provider` contract against an in-memory
//! hypervisor model. The control plane uses it to test the contract, and
//! the standalone binary serves it over gRPC for demo environments.

pub mod provider;

pub use provider::{resolve_storage_url, MockOptions, MockProvider};
