//! Provider RPC plane: typed client surface, error taxonomy, channel
//! cache, and the in-process wiring used by `--dev` mode and tests.

pub mod client;
pub mod error;
pub mod inprocess;

pub use client::{
    GrpcConnector, GrpcProvider, ProviderApi, ProviderConnector, SharedProvider,
    LONG_TIMEOUT, MEDIUM_TIMEOUT, VALIDATE_TIMEOUT,
};
pub use error::ProviderError;
pub use inprocess::{InProcessConnector, InProcessProvider};
