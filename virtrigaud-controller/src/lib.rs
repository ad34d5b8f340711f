//! # VirtRigaud Controller
//!
//! The control plane: a shared reconciliation framework (coalescing work
//! queue, rate limiting, watch-driven controllers), the cluster API-client
//! abstraction with an in-memory API server, the provider RPC client
//! plane, and the four reconcilers (VirtualMachine, VMSnapshot,
//! VMMigration and the Provider lifecycle manager).

pub mod cluster;
pub mod errors;
pub mod framework;
pub mod reconcile;
pub mod rpc;
pub mod storage;

pub use errors::ReconcileError;
