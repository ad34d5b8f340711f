//! Cluster access: the API-client abstraction the reconcilers are written
//! against, an in-memory API server implementing its semantics, and event
//! recording.

pub mod api;
pub mod events;
pub mod store;

pub use api::{ensure_finalizer, remove_finalizer, Api};
pub use events::EventRecorder;
pub use store::{ApiError, Cluster, WatchEvent};
