//! Resolves and validates the graph of resources an experiment references
//! before any state handler runs.
use std::sync::Arc;

use kube::Api;

use crate::{
    dataset::DataSet,
    experiment::{EndpointSpec, ExperimentSpec},
    loadpattern::LoadPattern,
    pipeline::{health::HealthChecker, HttpEndpoint, Pipeline, PipelineEndpoint},
    utils::{Clock, Context},
};

/// Fully resolved view of everything an experiment references.
#[derive(Debug)]
pub struct Related {
    /// The pipeline under test.
    pub pipeline: Pipeline,
    /// One entry per experiment endpoint, in spec order.
    pub endpoints: Vec<RelatedEndpoint>,
}

/// Fully resolved view of one endpoint.
#[derive(Debug)]
pub struct RelatedEndpoint {
    /// The endpoint as the experiment spec declares it.
    pub spec: EndpointSpec,
    /// The pipeline endpoint it targets.
    pub target: PipelineEndpoint,
    /// The target's protocol definition.
    pub http: HttpEndpoint,
    /// Payload data for the endpoint.
    pub data: RelatedData,
    /// The load pattern shaping its traffic.
    pub load_pattern: LoadPattern,
}

/// Resolved payload data of an endpoint.
#[derive(Debug)]
pub enum RelatedData {
    /// Literal payload from the experiment spec.
    PlainText,
    /// Generated data set to stage into a volume.
    DataSet(DataSet),
}

/// Errors resolving related resources. Invalid references are terminal for
/// the experiment, infrastructure errors are retried.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// A referenced resource is missing or invalid.
    #[error("{0}")]
    Validation(String),
    /// The API could not be reached or answered with an unexpected error.
    #[error("Kube error: {source}")]
    Kube {
        /// The underlying error.
        #[from]
        source: kube::Error,
    },
}

/// Fetch and validate the pipeline and, per endpoint, the targeted pipeline
/// endpoint, its protocol, its data set and its load pattern.
pub async fn resolve_related(
    cx: Arc<Context<impl HealthChecker, impl Clock>>,
    ns: &str,
    spec: &ExperimentSpec,
) -> Result<Related, ResolveError> {
    let pipelines: Api<Pipeline> = Api::namespaced(cx.k_client.clone(), ns);
    let datasets: Api<DataSet> = Api::namespaced(cx.k_client.clone(), ns);
    let load_patterns: Api<LoadPattern> = Api::namespaced(cx.k_client.clone(), ns);

    let pipeline = named(pipelines.get(&spec.pipeline).await, "pipeline", &spec.pipeline)?;

    let mut endpoints = Vec::with_capacity(spec.endpoints.len());
    for endpoint in &spec.endpoints {
        let target = pipeline
            .spec
            .endpoints
            .iter()
            .find(|candidate| candidate.name == endpoint.endpoint)
            .cloned()
            .ok_or_else(|| {
                ResolveError::Validation(format!(
                    "pipeline {:?} has no endpoint {:?}",
                    spec.pipeline, endpoint.endpoint
                ))
            })?;
        let http = target
            .http
            .clone()
            .filter(|http| !http.url.is_empty() && !http.method.is_empty())
            .ok_or_else(|| {
                ResolveError::Validation(format!(
                    "endpoint {:?} has no unambiguous protocol",
                    endpoint.endpoint
                ))
            })?;
        let data = match &endpoint.dataset {
            Some(name) => RelatedData::DataSet(named(datasets.get(name).await, "data set", name)?),
            None => RelatedData::PlainText,
        };
        let load_pattern = named(
            load_patterns.get(&endpoint.load_pattern).await,
            "load pattern",
            &endpoint.load_pattern,
        )?;
        endpoints.push(RelatedEndpoint {
            spec: endpoint.clone(),
            target,
            http,
            data,
            load_pattern,
        });
    }
    Ok(Related {
        pipeline,
        endpoints,
    })
}

// A missing reference is a terminal validation failure, everything else is
// infrastructure.
fn named<T>(result: Result<T, kube::Error>, kind: &str, name: &str) -> Result<T, ResolveError> {
    match result {
        Ok(value) => Ok(value),
        Err(kube::Error::Api(err)) if err.reason == "NotFound" => Err(ResolveError::Validation(
            format!("{kind} {name:?} not found"),
        )),
        Err(err) => Err(err.into()),
    }
}

impl RelatedEndpoint {
    /// The data set of the endpoint, when it runs in data set mode.
    pub fn dataset(&self) -> Option<&DataSet> {
        match &self.data {
            RelatedData::DataSet(dataset) => Some(dataset),
            RelatedData::PlainText => None,
        }
    }
}
