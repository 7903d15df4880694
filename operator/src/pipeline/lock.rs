//! Advisory lock over a pipeline's availability flag.
//!
//! Acquire and release are each invoked from exactly two call sites (forward
//! completion and deletion-triggered cleanup) to keep the "at most one
//! holder" invariant auditable.
use std::sync::Arc;

use k8s_openapi::api::core::v1::Service;
use kube::{
    api::{Patch, PatchParams, PostParams},
    Api, ResourceExt,
};
use serde_json::json;
use tracing::debug;

use crate::{
    labels::EXPERIMENT_LABEL,
    pipeline::{health::HealthChecker, Pipeline, PipelineAvailability},
    utils::{Clock, Context},
};

/// Annotation on the pipeline recording which experiment holds it, written
/// in the same conditional update that flips the availability flag.
pub const LOCKED_BY_ANNOTATION: &str = "pipebench.io/locked-by";

/// Report whether the named holder currently holds the pipeline lock.
pub fn held_by(pipeline: &Pipeline, holder: &str) -> bool {
    pipeline.spec.availability == PipelineAvailability::InUse
        && pipeline
            .annotations()
            .get(LOCKED_BY_ANNOTATION)
            .map(String::as_str)
            == Some(holder)
}

/// Acquire the pipeline for the named holder.
///
/// Precondition: the caller observed `availability == Ready`. The flip to
/// `InUse` and the holder annotation are written with a single update keyed
/// on the observed resource version, so two experiments that both observed
/// `Ready` cannot both succeed; the loser gets a conflict and retries its
/// whole pass.
pub async fn acquire(
    cx: Arc<Context<impl HealthChecker, impl Clock>>,
    ns: &str,
    pipeline: &Pipeline,
    holder: &str,
) -> Result<Pipeline, kube::error::Error> {
    let pipelines: Api<Pipeline> = Api::namespaced(cx.k_client.clone(), ns);
    let mut locked = pipeline.clone();
    locked.spec.availability = PipelineAvailability::InUse;
    locked
        .annotations_mut()
        .insert(LOCKED_BY_ANNOTATION.to_owned(), holder.to_owned());
    debug!(pipeline = %pipeline.name_any(), holder, "acquiring pipeline");
    pipelines
        .replace(&pipeline.name_any(), &PostParams::default(), &locked)
        .await
}

/// Release the pipeline if the named holder holds it.
///
/// A pipeline that is already `Ready`, or held by someone else, is left
/// untouched so a stale release can never break another experiment's lock.
pub async fn release(
    cx: Arc<Context<impl HealthChecker, impl Clock>>,
    ns: &str,
    pipeline: &Pipeline,
    holder: &str,
) -> Result<(), kube::error::Error> {
    if !held_by(pipeline, holder) {
        debug!(pipeline = %pipeline.name_any(), holder, "pipeline not held, nothing to release");
        return Ok(());
    }
    let pipelines: Api<Pipeline> = Api::namespaced(cx.k_client.clone(), ns);
    let mut unlocked = pipeline.clone();
    unlocked.spec.availability = PipelineAvailability::Ready;
    unlocked.annotations_mut().remove(LOCKED_BY_ANNOTATION);
    debug!(pipeline = %pipeline.name_any(), holder, "releasing pipeline");
    pipelines
        .replace(&pipeline.name_any(), &PostParams::default(), &unlocked)
        .await?;
    Ok(())
}

/// Scope the pipeline's metrics service to the named experiment.
///
/// The caller decides how to treat the service being absent; this propagates
/// the NotFound.
pub async fn label_metrics_service(
    cx: Arc<Context<impl HealthChecker, impl Clock>>,
    ns: &str,
    service: &str,
    experiment: &str,
) -> Result<(), kube::error::Error> {
    let services: Api<Service> = Api::namespaced(cx.k_client.clone(), ns);
    services
        .patch(
            service,
            &PatchParams::default(),
            &Patch::Merge(json!({
                "metadata": { "labels": { EXPERIMENT_LABEL: experiment } }
            })),
        )
        .await?;
    Ok(())
}

/// Remove the experiment label from the metrics service, tolerating the
/// service or the label being absent.
pub async fn unlabel_metrics_service(
    cx: Arc<Context<impl HealthChecker, impl Clock>>,
    ns: &str,
    service: &str,
) -> Result<(), kube::error::Error> {
    let services: Api<Service> = Api::namespaced(cx.k_client.clone(), ns);
    let patch = Patch::Merge(json!({
        "metadata": { "labels": { EXPERIMENT_LABEL: null } }
    }));
    match services.patch(service, &PatchParams::default(), &patch).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(err)) if err.reason == "NotFound" => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineSpec;

    fn pipeline(availability: PipelineAvailability, locked_by: Option<&str>) -> Pipeline {
        let mut pipeline = Pipeline::new(
            "pipeline",
            PipelineSpec {
                availability,
                ..Default::default()
            },
        );
        if let Some(holder) = locked_by {
            pipeline
                .annotations_mut()
                .insert(LOCKED_BY_ANNOTATION.to_owned(), holder.to_owned());
        }
        pipeline
    }

    #[test]
    fn ready_pipeline_is_held_by_nobody() {
        let p = pipeline(PipelineAvailability::Ready, None);
        assert!(!held_by(&p, "test/exp"));
    }

    #[test]
    fn in_use_pipeline_is_held_by_its_annotated_holder_only() {
        let p = pipeline(PipelineAvailability::InUse, Some("test/exp"));
        assert!(held_by(&p, "test/exp"));
        assert!(!held_by(&p, "test/other"));
    }

    #[test]
    fn in_use_pipeline_without_annotation_has_no_holder() {
        let p = pipeline(PipelineAvailability::InUse, None);
        assert!(!held_by(&p, "test/exp"));
    }
}
