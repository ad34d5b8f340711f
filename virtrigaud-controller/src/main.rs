//! # VirtRigaud Controller
//!
//! Runs the control plane: one controller per resource kind (Provider,
//! VirtualMachine, VMSnapshot, VMMigration) over the shared
//! reconciliation framework, talking to remote providers over gRPC.
//!
//! ## Usage
//! ```bash
//! virtrigaud-controller --config /etc/virtrigaud/controller.yaml
//! virtrigaud-controller --dev   # in-process mock providers
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use virtrigaud_api::provider::Provider as ProviderResource;
use virtrigaud_api::{VirtualMachine, VmMigration, VmSnapshot};
use virtrigaud_controller::cluster::{Cluster, EventRecorder};
use virtrigaud_controller::framework::Controller;
use virtrigaud_controller::reconcile::provider::VALIDATE_RESYNC;
use virtrigaud_controller::reconcile::snapshot::RETENTION_RESYNC;
use virtrigaud_controller::reconcile::{
    MigrationReconciler, ProviderReconciler, SnapshotReconciler, VmReconciler,
};
use virtrigaud_controller::rpc::{GrpcConnector, InProcessConnector, ProviderConnector};
use virtrigaud_controller::storage::Transport;
use virtrigaud_provider_mock::MockOptions;

mod cli;
mod config;

use cli::Args;
use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    if args.json_logs {
        virtrigaud_common::init_logging_json(&args.log_level)?;
    } else {
        virtrigaud_common::init_logging(&args.log_level)?;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting VirtRigaud Controller"
    );

    // Load configuration
    let config = match Config::load(&args.config) {
        Ok(cfg) => {
            info!(config_path = %args.config, "Configuration loaded");
            cfg
        }
        Err(_) if args.config == "/etc/virtrigaud/controller.yaml" => {
            info!("No config file found, using defaults");
            Config::default()
        }
        Err(e) => {
            error!(error = %e, path = %args.config, "Failed to load configuration");
            return Err(e);
        }
    };

    // Override config with CLI args
    let config = config.with_cli_overrides(&args);

    info!(
        workers = config.controller.workers,
        dev = config.dev.enabled,
        mount_root = %config.storage.mount_root,
        "Controller configured"
    );

    if let Err(e) = run(config).await {
        error!(error = %e, "Controller failed");
        return Err(e);
    }

    Ok(())
}

/// Assemble the cluster, connector and controllers, then run until ctrl-c.
async fn run(config: Config) -> Result<()> {
    let cluster = Cluster::new();

    let connector: Arc<dyn ProviderConnector> = if config.dev.enabled {
        let data_dir = PathBuf::from(&config.dev.data_dir);
        info!(data_dir = %data_dir.display(), "Development mode: in-process mock providers");
        Arc::new(InProcessConnector::new(MockOptions {
            synchronous: false,
            task_latency: Duration::ZERO,
            mount_root: data_dir.join("mounts"),
            pool_root: data_dir.join("pools"),
        }))
    } else {
        Arc::new(GrpcConnector::new())
    };

    let recorder = EventRecorder::new(cluster.api(), "virtrigaud-controller");
    let transport = Transport::new(&config.storage.mount_root);

    let provider_reconciler = Arc::new(ProviderReconciler::new(
        &cluster,
        connector.clone(),
        recorder.clone(),
    ));
    let vm_reconciler = Arc::new(VmReconciler::new(
        &cluster,
        connector.clone(),
        recorder.clone(),
    ));
    let snapshot_reconciler = Arc::new(SnapshotReconciler::new(
        &cluster,
        connector.clone(),
        recorder.clone(),
    ));
    let migration_reconciler = Arc::new(MigrationReconciler::new(
        &cluster,
        connector.clone(),
        recorder,
        transport,
    ));

    let workers = config.controller.workers;
    let vm_resync = Duration::from_secs(config.controller.resync_seconds);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut controllers = Vec::new();
    controllers.push(tokio::spawn(
        Controller::<ProviderResource>::new(cluster.api(), workers)
            .with_resync(VALIDATE_RESYNC)
            .run(provider_reconciler, shutdown_rx.clone()),
    ));
    controllers.push(tokio::spawn(
        Controller::<VirtualMachine>::new(cluster.api(), workers)
            .with_resync(vm_resync)
            .run(vm_reconciler, shutdown_rx.clone()),
    ));
    controllers.push(tokio::spawn(
        Controller::<VmSnapshot>::new(cluster.api(), workers)
            .with_resync(RETENTION_RESYNC)
            .run(snapshot_reconciler, shutdown_rx.clone()),
    ));
    controllers.push(tokio::spawn(
        Controller::<VmMigration>::new(cluster.api(), workers)
            .with_resync(Duration::from_secs(60))
            .run(migration_reconciler, shutdown_rx),
    ));

    info!("All controllers running");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, draining controllers");

    let _ = shutdown_tx.send(true);
    for controller in controllers {
        if let Err(e) = controller.await {
            error!(error = %e, "Controller task panicked");
        }
    }

    info!("Controller stopped");
    Ok(())
}
