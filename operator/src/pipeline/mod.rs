//! Pipeline is a k8s custom resource describing a system under test.
//!
//! A Pipeline declares the endpoints load can be driven against, an optional
//! metrics endpoint backed by a Service, and an `availability` flag that acts
//! as an advisory lock granting one experiment at a time exclusive access.
pub mod health;
pub mod lock;

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Primary CRD for describing a pipeline under test.
#[derive(CustomResource, Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "pipebench.io",
    version = "v1alpha1",
    kind = "Pipeline",
    plural = "pipelines",
    derive = "PartialEq",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSpec {
    /// Whether the pipeline is free to be claimed by an experiment.
    #[serde(default)]
    pub availability: PipelineAvailability,
    /// Endpoints load can be driven against.
    pub endpoints: Vec<PipelineEndpoint>,
    /// Metrics endpoint of the pipeline, when it exposes one.
    pub metrics: Option<MetricsSpec>,
    /// Health check URLs probed before an experiment initializes.
    pub health_checks: Option<Vec<String>>,
    /// Cost accounting tags, copied into the status of every experiment run
    /// against this pipeline.
    pub tags: Option<BTreeMap<String, String>>,
    /// Cloud provider the pipeline runs on.
    pub cloud_provider: Option<String>,
    /// Cloud region the pipeline runs in.
    pub region: Option<String>,
}

/// The advisory lock over a pipeline. At most one experiment holds a pipeline
/// `InUse` at any time.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq, Clone, Copy, JsonSchema)]
pub enum PipelineAvailability {
    /// Free to be claimed by an experiment.
    #[default]
    Ready,
    /// Claimed by a running experiment.
    InUse,
}

/// One named entry point of the pipeline.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PipelineEndpoint {
    /// Name experiments reference the endpoint by.
    pub name: String,
    /// HTTP protocol definition of the endpoint.
    pub http: Option<HttpEndpoint>,
}

/// HTTP protocol definition of a pipeline endpoint.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HttpEndpoint {
    /// Full URL of the endpoint.
    pub url: String,
    /// HTTP method used against the endpoint.
    pub method: String,
}

/// Metrics endpoint of a pipeline.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSpec {
    /// Name of the Service backing the metrics endpoint. Its labels are
    /// mutated to scope scrapes to the currently running experiment.
    pub service: String,
}
