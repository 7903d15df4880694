//! Experiment is a k8s custom resource that runs one load experiment against
//! a pipeline, tracked as a crash-recoverable state machine.
pub(crate) mod controller;
pub(crate) mod resolve;
pub(crate) mod resources;
#[cfg(test)]
pub mod stub;

pub use controller::run;

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Primary CRD for creating and managing a load experiment.
#[derive(CustomResource, Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "pipebench.io",
    version = "v1alpha1",
    kind = "Experiment",
    plural = "experiments",
    status = "ExperimentStatus",
    derive = "PartialEq",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentSpec {
    /// Name of the pipeline under test.
    pub pipeline: String,
    /// Ordered list of endpoints to drive load against.
    pub endpoints: Vec<EndpointSpec>,
    /// Time before which the experiment must not start.
    pub scheduled_start_time: Option<Time>,
    /// Fixed post-run draining period, e.g. "30s". Ignored when end detection
    /// is enabled.
    pub draining_duration: Option<String>,
    /// Infer completion from the pipeline's metrics instead of a fixed timer.
    #[serde(default)]
    pub use_end_detection: bool,
}

/// One endpoint an experiment drives load against.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSpec {
    /// Name of the pipeline endpoint to target.
    pub endpoint: String,
    /// Data set holding generated payload data. Presence selects data set
    /// mode, absence plain text mode.
    pub dataset: Option<String>,
    /// Literal payload used in plain text mode.
    pub plain_text: Option<String>,
    /// Size of the staging volume, overriding the data set's own size.
    pub data_size: Option<String>,
    /// Load pattern shaping the traffic for this endpoint.
    pub load_pattern: String,
}

/// Current status of an experiment.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentStatus {
    /// State the experiment is in.
    #[serde(default)]
    pub job_status: JobStatus,
    /// Terminal error recorded when the experiment failed.
    pub error: Option<String>,
    /// Total load duration in seconds per endpoint, summed from each
    /// endpoint's load pattern stages.
    pub endpoint_durations: Option<BTreeMap<String, u64>>,
    /// When load generation started.
    pub start_time: Option<Time>,
    /// When all test runs finished and draining began.
    pub draining_started_time: Option<Time>,
    /// When the experiment completed.
    pub completion_time: Option<Time>,
    /// Cost accounting tags copied from the pipeline.
    pub tags: Option<BTreeMap<String, String>>,
    /// Cloud provider copied from the pipeline.
    pub cloud_provider: Option<String>,
    /// Cloud region copied from the pipeline.
    pub region: Option<String>,
}

/// States of the experiment, in forward order. The status only ever moves
/// forward along this order, except into the absorbing `Failed` state which
/// is reachable from any non-terminal state.
#[derive(
    Serialize, Deserialize, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub enum JobStatus {
    /// Newly created, nothing recorded yet.
    #[default]
    #[serde(rename = "")]
    Created,
    /// Validated, waiting for the scheduled start time.
    Scheduled,
    /// Waiting for every referenced data set to finish generating.
    WaitingDataSet,
    /// Waiting to acquire exclusive access to the pipeline.
    WaitingPipeline,
    /// Preparing per endpoint resources and starting the test runs.
    Initializing,
    /// Load generation in progress.
    Running,
    /// Load finished, waiting out the draining period.
    Draining,
    /// Terminal success.
    Completed,
    /// Terminal failure, see the status error field.
    Failed,
}

impl JobStatus {
    /// Terminal states are never left and reconcile as a no-op.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}
