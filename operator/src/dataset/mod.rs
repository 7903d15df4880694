//! DataSet is a k8s custom resource referencing synthetically generated test
//! data. Generation itself is driven elsewhere; experiments only wait on the
//! data set's status and mount its generated-data volume.
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Primary CRD for generated test data sets.
#[derive(CustomResource, Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "pipebench.io",
    version = "v1alpha1",
    kind = "DataSet",
    plural = "datasets",
    status = "DataSetStatus",
    derive = "PartialEq",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct DataSetSpec {
    /// Size of the generated data volume, e.g. "10Gi".
    pub size: Option<String>,
}

/// Current status of data generation.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataSetStatus {
    /// State of the generation job.
    #[serde(default)]
    pub job_status: DataSetJobStatus,
}

/// State of a data set's generation job.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq, Clone, Copy, JsonSchema)]
pub enum DataSetJobStatus {
    /// Generation has not started.
    #[default]
    Pending,
    /// Generation is in progress.
    Running,
    /// Generated data is complete and safe to copy.
    Succeeded,
    /// Generation failed.
    Failed,
}

impl DataSet {
    /// Report whether the generated data is complete and safe to copy.
    pub fn is_ready(&self) -> bool {
        matches!(
            self.status.as_ref().map(|status| status.job_status),
            Some(DataSetJobStatus::Succeeded)
        )
    }
}

/// Name of the PVC holding a data set's generated data.
pub fn dataset_pvc_name(dataset: &str) -> String {
    format!("{dataset}-data")
}
