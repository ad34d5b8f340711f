//! Provider error taxonomy.
//!
//! RPC failures are classified into kinds, not transported types: the
//! reconcilers branch on the kind (recreate on NotFound, surface
//! InvalidSpec, refresh credentials on Unauthorized, degrade on
//! NotSupported, back off on Retryable) and never on provider-specific
//! details.

use thiserror::Error;
use tonic::Code;

/// Classified failure from a provider RPC.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Target object does not exist at the hypervisor. Success on delete;
    /// triggers the recreate path elsewhere.
    #[error("not found: {0}")]
    NotFound(String),

    /// The spec can never be applied as written. Terminal; surfaced on the
    /// resource.
    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    /// Credential failure; retried after backoff, surfaced on the Provider
    /// when persistent.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Capability gap; degrades the relevant feature.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Transient (network, timeout, upstream 5xx); requeue with backoff.
    #[error("retryable: {0}")]
    Retryable(String),

    /// Unexpected invariant violation. Logged, marks the resource, never
    /// crashes the process.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl ProviderError {
    /// Classify a gRPC status into the taxonomy.
    pub fn from_status(status: tonic::Status) -> Self {
        let message = status.message().to_string();
        match status.code() {
            Code::NotFound => ProviderError::NotFound(message),
            Code::InvalidArgument | Code::FailedPrecondition | Code::OutOfRange => {
                ProviderError::InvalidSpec(message)
            }
            Code::Unauthenticated | Code::PermissionDenied => {
                ProviderError::Unauthorized(message)
            }
            Code::Unimplemented => ProviderError::NotSupported(message),
            Code::Unavailable
            | Code::DeadlineExceeded
            | Code::Aborted
            | Code::ResourceExhausted
            | Code::Cancelled
            | Code::Unknown => ProviderError::Retryable(message),
            _ => ProviderError::Fatal(message),
        }
    }

    /// Transport-level failure (connection refused, DNS, TLS).
    pub fn from_transport(err: tonic::transport::Error) -> Self {
        ProviderError::Retryable(err.to_string())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound(_))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Retryable(_) | ProviderError::Unauthorized(_)
        )
    }

    /// Terminal kinds are not requeued by the framework.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProviderError::InvalidSpec(_)
                | ProviderError::NotSupported(_)
                | ProviderError::Fatal(_)
        )
    }

    /// Condition reason string for this kind.
    pub fn reason(&self) -> &'static str {
        match self {
            ProviderError::NotFound(_) => "NotFound",
            ProviderError::InvalidSpec(_) => "InvalidSpec",
            ProviderError::Unauthorized(_) => "Unauthorized",
            ProviderError::NotSupported(_) => "NotSupported",
            ProviderError::Retryable(_) => "Retryable",
            ProviderError::Fatal(_) => "Fatal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        let cases = [
            (Code::NotFound, "NotFound"),
            (Code::InvalidArgument, "InvalidSpec"),
            (Code::FailedPrecondition, "InvalidSpec"),
            (Code::Unauthenticated, "Unauthorized"),
            (Code::PermissionDenied, "Unauthorized"),
            (Code::Unimplemented, "NotSupported"),
            (Code::Unavailable, "Retryable"),
            (Code::DeadlineExceeded, "Retryable"),
            (Code::Internal, "Fatal"),
        ];
        for (code, reason) in cases {
            let err = ProviderError::from_status(tonic::Status::new(code, "boom"));
            assert_eq!(err.reason(), reason, "code {:?}", code);
        }
    }

    #[test]
    fn test_terminal_and_retryable_partition() {
        assert!(ProviderError::InvalidSpec("x".into()).is_terminal());
        assert!(ProviderError::NotSupported("x".into()).is_terminal());
        assert!(ProviderError::Fatal("x".into()).is_terminal());
        assert!(!ProviderError::Retryable("x".into()).is_terminal());
        assert!(ProviderError::Retryable("x".into()).is_retryable());
        assert!(ProviderError::Unauthorized("x".into()).is_retryable());
        assert!(!ProviderError::NotFound("x".into()).is_terminal());
    }
}
