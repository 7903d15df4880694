//! Lgen holds the types of the load generator's TestRun resource.
//!
//! The load generator itself is a separate controller; the experiment
//! controller only creates TestRuns, polls their reported stage and deletes
//! them once the run is over.
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// One running load generator instance for one endpoint.
#[derive(CustomResource, Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "lgen.pipebench.io",
    version = "v1alpha1",
    kind = "TestRun",
    plural = "testruns",
    status = "TestRunStatus",
    derive = "PartialEq",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct TestRunSpec {
    /// Script the load generator executes.
    pub script: ScriptRef,
    /// Number of load generator instances.
    pub parallelism: Option<i32>,
    /// Extra arguments passed to the load generator.
    pub arguments: Option<String>,
}

/// Reference to a script stored in a config map.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScriptRef {
    /// Name of the config map holding the script.
    pub config_map: String,
    /// File within the config map.
    pub file: String,
}

/// Current status of a test run.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TestRunStatus {
    /// Stage the run is in.
    #[serde(default)]
    pub stage: TestRunStage,
}

/// Stage of a test run as reported by the load generator.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq, Clone, Copy, JsonSchema)]
pub enum TestRunStage {
    /// Accepted but not yet started.
    #[default]
    Created,
    /// Load generation is running.
    Started,
    /// Load generation finished.
    Finished,
    /// The run failed.
    Error,
}

impl TestRun {
    /// Stage the run reports, `Created` until the load generator first writes
    /// a status.
    pub fn stage(&self) -> TestRunStage {
        self.status
            .as_ref()
            .map(|status| status.stage)
            .unwrap_or_default()
    }
}
