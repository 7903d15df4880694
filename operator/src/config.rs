//! Operator wide configuration.
//!
//! Constructed once in `main` and injected into the controller context, so
//! there is no global mutable configuration state.
use std::time::Duration;

use clap::Parser;
use k8s_openapi::chrono;

/// Configuration for the experiment controller.
#[derive(Clone, Debug, Parser)]
pub struct OperatorConfig {
    /// Fixed interval for all condition poll waits.
    #[arg(long, env = "PIPEBENCH_POLL_INTERVAL_SECS", default_value_t = 10)]
    pub poll_interval_secs: u64,

    /// Backward adjustment applied to the end detector's completion time,
    /// accounting for the detector pod's own teardown lag.
    #[arg(long, env = "PIPEBENCH_POD_DETACH_ADJUSTMENT_SECS", default_value_t = 10)]
    pub pod_detach_adjustment_secs: u64,

    /// Volume size used when neither the endpoint nor its data set declare one.
    #[arg(long, env = "PIPEBENCH_DEFAULT_DATA_SIZE", default_value = "1Gi")]
    pub default_data_size: String,

    /// Image for the copier and end detector jobs created by an experiment.
    #[arg(
        long,
        env = "PIPEBENCH_RUNNER_IMAGE",
        default_value = "pipebench/runner:latest"
    )]
    pub runner_image: String,

    /// Pull policy for the runner image.
    #[arg(long, env = "PIPEBENCH_RUNNER_IMAGE_PULL_POLICY", default_value = "Always")]
    pub runner_image_pull_policy: String,

    /// Port the Prometheus scrape endpoint listens on.
    #[arg(long, env = "PIPEBENCH_METRICS_PORT", default_value_t = 9464)]
    pub metrics_port: u16,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            pod_detach_adjustment_secs: 10,
            default_data_size: "1Gi".to_owned(),
            runner_image: "pipebench/runner:latest".to_owned(),
            runner_image_pull_policy: "Always".to_owned(),
            metrics_port: 9464,
        }
    }
}

impl OperatorConfig {
    /// Fixed short poll interval for condition waits.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Pod detach adjustment as a chrono duration for timestamp arithmetic.
    pub fn pod_detach_adjustment(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.pod_detach_adjustment_secs as i64)
    }
}
