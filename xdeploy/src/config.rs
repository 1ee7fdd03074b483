use std::net::SocketAddr;
use std::time::Duration;

use clap::{Parser, Subcommand};
use xdeploy_controller::ControllerConfig;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Subcommand, Debug)]
pub enum Commands {
    /// Run the XDeployment controller
    Controller(ControllerArgs),
    /// Print the XDeployment CRD
    Crdgen,
}

#[derive(Parser, Debug, Clone)]
pub struct ControllerArgs {
    /// Metrics and readiness listener
    #[arg(long, env = "XDEPLOY_METRICS_ADDRESS", default_value = "0.0.0.0:9090")]
    pub metrics_address: SocketAddr,

    /// Number of reconcile workers
    #[arg(long, env = "XDEPLOY_WORKERS", default_value_t = 4)]
    pub workers: usize,

    /// Only watch XDeployments in this namespace
    #[arg(long, env = "XDEPLOY_NAMESPACE")]
    pub namespace: Option<String>,

    /// Timeout for every API and driver call
    #[arg(long, env = "XDEPLOY_DRIVER_TIMEOUT_SECS", default_value_t = 10)]
    pub driver_timeout_secs: u64,

    /// First retry delay after a transient failure
    #[arg(long, env = "XDEPLOY_BACKOFF_BASE_MILLIS", default_value_t = 1000)]
    pub backoff_base_millis: u64,

    /// Ceiling for the retry delay
    #[arg(long, env = "XDEPLOY_BACKOFF_MAX_SECS", default_value_t = 300)]
    pub backoff_max_secs: u64,

    /// Requeue interval for converged XDeployments
    #[arg(long, env = "XDEPLOY_RESYNC_SECS", default_value_t = 300)]
    pub resync_secs: u64,

    /// Requeue interval while a rollout is in progress
    #[arg(long, env = "XDEPLOY_ROLLOUT_POLL_SECS", default_value_t = 5)]
    pub rollout_poll_secs: u64,

    /// Requeue interval for XDeployments with an invalid spec
    #[arg(long, env = "XDEPLOY_INVALID_SPEC_RETRY_SECS", default_value_t = 300)]
    pub invalid_spec_retry_secs: u64,

    /// How long a new child may stay unready before the rollout moves on
    #[arg(long, env = "XDEPLOY_PROGRESS_DEADLINE_SECS", default_value_t = 600)]
    pub progress_deadline_secs: u64,
}

impl From<&ControllerArgs> for ControllerConfig {
    fn from(args: &ControllerArgs) -> Self {
        Self {
            workers: args.workers,
            driver_timeout: Duration::from_secs(args.driver_timeout_secs),
            backoff_base: Duration::from_millis(args.backoff_base_millis),
            backoff_max: Duration::from_secs(args.backoff_max_secs),
            resync_interval: Duration::from_secs(args.resync_secs),
            rollout_poll_interval: Duration::from_secs(args.rollout_poll_secs),
            invalid_spec_retry: Duration::from_secs(args.invalid_spec_retry_secs),
            progress_deadline: Duration::from_secs(args.progress_deadline_secs),
        }
    }
}
