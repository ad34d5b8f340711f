//! # VirtRigaud Mock Provider Daemon
//!
//! Serves the provider RPC contract against the in-memory mock hypervisor.
//! Runs inside a provider pod the same way a real provider does: listening
//! on the fixed provider port, with migration PVCs mounted under
//! `/mnt/migration-storage`.
//!
//! ## Usage
//! ```bash
//! virtrigaud-provider-mock --listen 0.0.0.0:9443
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tonic::transport::Server;
use tracing::info;

use virtrigaud_provider_mock::{MockOptions, MockProvider};
use virtrigaud_proto::provider::ProviderServer;

/// VirtRigaud mock provider - reference RPC backend
#[derive(Parser, Debug)]
#[command(name = "virtrigaud-provider-mock")]
#[command(about = "VirtRigaud mock provider - reference RPC backend")]
#[command(version)]
struct Args {
    /// Listen address for the provider gRPC server
    #[arg(long, default_value = "0.0.0.0:9443")]
    listen: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Root directory where migration PVCs are mounted
    #[arg(long, default_value = "/mnt/migration-storage")]
    mount_root: PathBuf,

    /// Provider-native storage pool for imported disks
    #[arg(long, default_value = "/var/lib/virtrigaud/pool")]
    pool_root: PathBuf,

    /// Complete operations synchronously (no task refs)
    #[arg(long)]
    synchronous: bool,

    /// Simulated task latency in milliseconds
    #[arg(long, default_value_t = 0)]
    task_latency_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    virtrigaud_common::init_logging(&args.log_level)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting VirtRigaud mock provider"
    );

    let provider = MockProvider::with_options(MockOptions {
        synchronous: args.synchronous,
        task_latency: Duration::from_millis(args.task_latency_ms),
        mount_root: args.mount_root,
        pool_root: args.pool_root,
    });

    let addr: std::net::SocketAddr = args
        .listen
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid listen address: {}", e))?;

    info!(listen = %addr, "Starting provider gRPC server");

    Server::builder()
        .add_service(ProviderServer::new(provider))
        .serve_with_shutdown(addr, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
        .map_err(|e| anyhow::anyhow!("gRPC server error: {}", e))?;

    Ok(())
}
