//! Command-line argument parsing.

use clap::Parser;

/// VirtRigaud Controller - declarative multi-hypervisor VM manager
#[derive(Parser, Debug)]
#[command(name = "virtrigaud-controller")]
#[command(about = "VirtRigaud Controller - declarative multi-hypervisor VM manager")]
#[command(version)]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/virtrigaud/controller.yaml")]
    pub config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Emit JSON logs (for log aggregation)
    #[arg(long)]
    pub json_logs: bool,

    /// Worker count per controller
    #[arg(long)]
    pub workers: Option<usize>,

    /// Enable development mode (in-process mock providers)
    #[arg(long)]
    pub dev: bool,
}
