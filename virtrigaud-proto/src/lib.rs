//! # VirtRigaud Proto
//!
//! Generated Rust code from the protobuf definition of the Provider RPC
//! contract.
//!
//! This crate contains the gRPC service definition and message types for
//! communication between the control plane and remote provider processes.
//! Generated sources are checked in; enable the `codegen` feature to
//! regenerate from `proto/provider.proto` (requires `protoc`).

// Include generated code
pub mod generated {
    pub mod virtrigaud {
        pub mod provider {
            pub mod v1 {
                include!("generated/virtrigaud.provider.v1.rs");
            }
        }
    }
}

// =============================================================================
// Provider Protocol Re-exports
// =============================================================================

/// Provider RPC types and service definitions
pub mod provider {
    pub use crate::generated::virtrigaud::provider::v1::*;
    pub use crate::generated::virtrigaud::provider::v1::provider_server::{
        Provider, ProviderServer,
    };
    pub use crate::generated::virtrigaud::provider::v1::provider_client::ProviderClient;
}

// Re-export provider types at crate root
pub use generated::virtrigaud::provider::v1::*;
pub use generated::virtrigaud::provider::v1::provider_server::{Provider, ProviderServer};
pub use generated::virtrigaud::provider::v1::provider_client::ProviderClient;
