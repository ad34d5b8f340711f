//! Controller-level error type tying the API and provider taxonomies
//! together for the framework's error policy.

use thiserror::Error;

use crate::cluster::ApiError;
use crate::rpc::ProviderError;

/// Failure of one reconcile pass.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Unrecoverable for this spec; surfaced on the resource, not retried.
    #[error("{0}")]
    Terminal(String),
}

impl ReconcileError {
    /// Optimistic-concurrency losses are swallowed: the next reconcile
    /// starts from the fresh state.
    pub fn is_conflict(&self) -> bool {
        matches!(self, ReconcileError::Api(e) if e.is_conflict())
    }

    /// Terminal errors are not requeued; the reconciler has already
    /// surfaced them as conditions/events.
    pub fn is_terminal(&self) -> bool {
        match self {
            ReconcileError::Terminal(_) => true,
            ReconcileError::Provider(e) => e.is_terminal(),
            ReconcileError::Api(_) => false,
        }
    }
}
