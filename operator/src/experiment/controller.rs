//! Controller for the Experiment CRD: a level-triggered state machine that
//! drives one load experiment end to end.
//!
//! Every wait is expressed as a requeue duration, never as an in-process
//! block, so a crashed or restarted operator resumes any experiment from its
//! recorded state.
use std::{collections::BTreeMap, sync::Arc, time::Duration};

use anyhow::anyhow;
use futures::stream::StreamExt;
use k8s_openapi::{
    api::{
        batch::v1::Job,
        core::v1::{ConfigMap, PersistentVolumeClaim},
    },
    apimachinery::pkg::apis::meta::v1::{OwnerReference, Time},
    chrono,
};
use kube::{
    api::{Patch, PatchParams},
    client::Client,
    runtime::{
        controller::Action,
        watcher::{self, Config},
        Controller,
    },
    Api, Resource, ResourceExt,
};
use opentelemetry::{global, KeyValue};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::{
    config::OperatorConfig,
    dataset::dataset_pvc_name,
    experiment::{
        resolve::{resolve_related, Related, RelatedEndpoint, ResolveError},
        resources::{
            config_map_data, config_map_name, copy_job_name, copy_job_spec, data_pvc_name,
            detect_job_name, detect_job_spec, pvc_spec, test_run_name, test_run_spec,
            CopyJobConfig, DetectJobConfig,
        },
        Experiment, ExperimentStatus, JobStatus,
    },
    labels::MANAGED_BY_LABEL_SELECTOR,
    lgen::{TestRun, TestRunStage},
    pipeline::{
        health::{HealthChecker, HttpChecker},
        lock, Pipeline, PipelineAvailability,
    },
    utils::{
        create_config_map, create_job, create_pvc, create_test_run, delete_config_map,
        delete_job, delete_pvc, delete_test_run, get_job, get_test_run, job_completed, Clock,
        Context,
    },
};

/// Finalizer gating experiment deletion on lock release.
pub const EXPERIMENT_FINALIZER: &str = "pipebench.io/cleanup";

/// Handle errors during reconciliation.
fn on_error(
    _experiment: Arc<Experiment>,
    _error: &Error,
    _context: Arc<Context<impl HealthChecker, impl Clock>>,
) -> Action {
    Action::requeue(Duration::from_secs(5))
}

/// Errors produced by the reconcile function.
#[derive(Debug, thiserror::Error)]
enum Error {
    #[error("App error: {source}")]
    App {
        #[from]
        source: anyhow::Error,
    },
    #[error("Kube error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },
}

/// Start a controller for the Experiment CRD.
pub async fn run(config: OperatorConfig) {
    let k_client = Client::try_default()
        .await
        .expect("should be able to create kube client");
    let context = Arc::new(Context::new(k_client.clone(), HttpChecker, config));

    let experiments: Api<Experiment> = Api::all(k_client.clone());
    let config_maps = Api::<ConfigMap>::all(k_client.clone());
    let pvcs = Api::<PersistentVolumeClaim>::all(k_client.clone());
    let jobs = Api::<Job>::all(k_client.clone());
    let test_runs = Api::<TestRun>::all(k_client.clone());

    Controller::new(experiments.clone(), Config::default())
        .owns(
            config_maps,
            watcher::Config::default().labels(MANAGED_BY_LABEL_SELECTOR),
        )
        .owns(
            pvcs,
            watcher::Config::default().labels(MANAGED_BY_LABEL_SELECTOR),
        )
        .owns(
            jobs,
            watcher::Config::default().labels(MANAGED_BY_LABEL_SELECTOR),
        )
        .owns(
            test_runs,
            watcher::Config::default().labels(MANAGED_BY_LABEL_SELECTOR),
        )
        .run(reconcile, on_error, context)
        .for_each(|rec_res| async move {
            match rec_res {
                Ok((experiment, _)) => {
                    info!(experiment.name, "reconcile success");
                }
                Err(err) => {
                    error!(?err, "reconcile error")
                }
            }
        })
        .await;
}

/// Perform a reconcile pass for the Experiment CRD
async fn reconcile(
    experiment: Arc<Experiment>,
    cx: Arc<Context<impl HealthChecker, impl Clock>>,
) -> Result<Action, Error> {
    let meter = global::meter("pipebench");
    let runs = meter
        .u64_counter("experiment_reconcile_count")
        .with_description("Number of experiment reconciles")
        .init();

    match reconcile_(experiment, cx).await {
        Ok(action) => {
            runs.add(
                1,
                &[KeyValue {
                    key: "result".into(),
                    value: "ok".into(),
                }],
            );
            Ok(action)
        }
        Err(err) => {
            runs.add(
                1,
                &[KeyValue {
                    key: "result".into(),
                    value: "err".into(),
                }],
            );
            Err(err)
        }
    }
}

/// Perform a reconcile pass for the Experiment CRD
async fn reconcile_(
    experiment: Arc<Experiment>,
    cx: Arc<Context<impl HealthChecker, impl Clock>>,
) -> Result<Action, Error> {
    let ns = experiment
        .namespace()
        .ok_or_else(|| anyhow!("experiment should be namespaced"))?;
    let name = experiment.name_any();
    let mut status = experiment.status.clone().unwrap_or_default();
    debug!(name, ?status.job_status, "reconcile");

    // Deletion short-circuits all forward progress.
    if experiment.meta().deletion_timestamp.is_some() {
        return cleanup(cx, &experiment, &ns).await;
    }

    if status.job_status.is_terminal() {
        return Ok(Action::await_change());
    }

    ensure_finalizer(cx.clone(), &ns, &experiment).await?;

    let action = match resolve_related(cx.clone(), &ns, &experiment.spec).await {
        Ok(related) => match status.job_status {
            JobStatus::Created => handle_created(&related, &mut status),
            JobStatus::Scheduled => handle_scheduled(&cx, &experiment, &mut status),
            JobStatus::WaitingDataSet => handle_waiting_dataset(&cx, &related, &mut status),
            JobStatus::WaitingPipeline => {
                handle_waiting_pipeline(cx.clone(), &ns, &experiment, &related, &mut status)
                    .await?
            }
            JobStatus::Initializing => {
                handle_initializing(cx.clone(), &ns, &experiment, &related, &mut status).await?
            }
            JobStatus::Running => {
                handle_running(cx.clone(), &ns, &experiment, &related, &mut status).await?
            }
            JobStatus::Draining => {
                handle_draining(cx.clone(), &ns, &experiment, &related, &mut status).await?
            }
            JobStatus::Completed | JobStatus::Failed => Action::await_change(),
        },
        Err(ResolveError::Validation(message)) => fail(&mut status, message),
        Err(ResolveError::Kube { source }) => return Err(source.into()),
    };

    if experiment.status.as_ref() != Some(&status) {
        patch_status(cx, &ns, &name, &status).await?;
    }
    Ok(action)
}

/// Record a state transition and request an immediate pass so the next
/// handler runs against a fresh observation.
fn advance(status: &mut ExperimentStatus, next: JobStatus) -> Action {
    status.job_status = next;
    Action::requeue(Duration::ZERO)
}

/// Record a terminal validation failure.
fn fail(status: &mut ExperimentStatus, message: String) -> Action {
    warn!(%message, "experiment failed");
    status.error = Some(message);
    status.job_status = JobStatus::Failed;
    Action::await_change()
}

/// Copy pipeline metadata into the status and compute the per endpoint load
/// durations.
fn handle_created(related: &Related, status: &mut ExperimentStatus) -> Action {
    let pipeline = &related.pipeline.spec;
    status.tags = pipeline.tags.clone();
    status.cloud_provider = pipeline.cloud_provider.clone();
    status.region = pipeline.region.clone();

    let mut durations = BTreeMap::new();
    for endpoint in &related.endpoints {
        match endpoint.load_pattern.total_duration() {
            Ok(total) => {
                durations.insert(endpoint.spec.endpoint.clone(), total.as_secs());
            }
            Err(err) => return fail(status, format!("{err:#}")),
        }
    }
    status.endpoint_durations = Some(durations);
    advance(status, JobStatus::Scheduled)
}

/// Wait out the scheduled start time, computing the exact remaining wait
/// rather than polling.
fn handle_scheduled(
    cx: &Context<impl HealthChecker, impl Clock>,
    experiment: &Experiment,
    status: &mut ExperimentStatus,
) -> Action {
    if let Some(start) = &experiment.spec.scheduled_start_time {
        let remaining = start.0 - cx.clock.now();
        if remaining > chrono::Duration::zero() {
            debug!(?remaining, "waiting for scheduled start time");
            return Action::requeue(remaining.to_std().unwrap_or_default());
        }
    }
    advance(status, JobStatus::WaitingDataSet)
}

/// Wait until every referenced data set reports its generated data complete.
fn handle_waiting_dataset(
    cx: &Context<impl HealthChecker, impl Clock>,
    related: &Related,
    status: &mut ExperimentStatus,
) -> Action {
    let pending = related
        .endpoints
        .iter()
        .filter_map(RelatedEndpoint::dataset)
        .any(|dataset| !dataset.is_ready());
    if pending {
        return Action::requeue(cx.config.poll_interval());
    }
    advance(status, JobStatus::WaitingPipeline)
}

/// Acquire exclusive access to the pipeline and scope its metrics service to
/// this experiment.
async fn handle_waiting_pipeline(
    cx: Arc<Context<impl HealthChecker, impl Clock>>,
    ns: &str,
    experiment: &Experiment,
    related: &Related,
    status: &mut ExperimentStatus,
) -> Result<Action, Error> {
    let holder = format!("{ns}/{}", experiment.name_any());
    // An earlier pass may have acquired the lock and crashed before its
    // status write, so a lock we already hold counts as acquired.
    if !lock::held_by(&related.pipeline, &holder) {
        match related.pipeline.spec.availability {
            PipelineAvailability::Ready => {
                lock::acquire(cx.clone(), ns, &related.pipeline, &holder).await?;
            }
            PipelineAvailability::InUse => {
                debug!(pipeline = %related.pipeline.name_any(), "pipeline in use, waiting");
                return Ok(Action::requeue(cx.config.poll_interval()));
            }
        }
    }
    if let Some(metrics) = &related.pipeline.spec.metrics {
        // Metrics scoping is required for the cost and metrics queries run
        // against the experiment, so a missing service is terminal.
        match lock::label_metrics_service(cx.clone(), ns, &metrics.service, &experiment.name_any())
            .await
        {
            Ok(()) => {}
            Err(kube::Error::Api(err)) if err.reason == "NotFound" => {
                return Ok(fail(
                    status,
                    format!("metrics service {:?} not found", metrics.service),
                ));
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(advance(status, JobStatus::Initializing))
}

/// Readiness of one endpoint's preparatory resources.
enum EndpointReadiness {
    Ready,
    Pending,
    Failed(String),
}

/// Run the pipeline health checks, stage every endpoint's resources, and once
/// all endpoints are ready start the test runs.
async fn handle_initializing(
    cx: Arc<Context<impl HealthChecker, impl Clock>>,
    ns: &str,
    experiment: &Experiment,
    related: &Related,
    status: &mut ExperimentStatus,
) -> Result<Action, Error> {
    if let Some(checks) = &related.pipeline.spec.health_checks {
        for url in checks {
            if let Err(err) = cx.health_client.check(url).await {
                return Ok(fail(status, format!("health check failed: {err:#}")));
            }
        }
    }

    let name = experiment.name_any();
    let orefs = experiment
        .controller_owner_ref(&())
        .map(|oref| vec![oref])
        .unwrap_or_default();

    let mut ready = 0;
    for (index, endpoint) in related.endpoints.iter().enumerate() {
        match ensure_endpoint_resources(cx.clone(), ns, orefs.clone(), &name, index, endpoint)
            .await?
        {
            EndpointReadiness::Ready => ready += 1,
            EndpointReadiness::Pending => {}
            EndpointReadiness::Failed(message) => return Ok(fail(status, message)),
        }
    }
    if ready < related.endpoints.len() {
        debug!(ready, total = related.endpoints.len(), "endpoints not yet staged");
        return Ok(Action::requeue(cx.config.poll_interval()));
    }

    for (index, _) in related.endpoints.iter().enumerate() {
        create_test_run(
            cx.clone(),
            ns,
            orefs.clone(),
            &test_run_name(&name, index),
            test_run_spec(&name, index),
        )
        .await?;
    }

    if experiment.spec.use_end_detection {
        let Some(metrics) = &related.pipeline.spec.metrics else {
            return Ok(fail(
                status,
                format!(
                    "pipeline {:?} declares no metrics endpoint for end detection",
                    related.pipeline.name_any()
                ),
            ));
        };
        create_job(
            cx.clone(),
            ns,
            orefs.clone(),
            &detect_job_name(&name),
            detect_job_spec(DetectJobConfig {
                experiment: name.clone(),
                metrics_service: metrics.service.clone(),
                image: cx.config.runner_image.clone(),
                image_pull_policy: cx.config.runner_image_pull_policy.clone(),
            }),
        )
        .await?;
    }

    status.start_time = Some(Time(cx.clock.now()));
    Ok(advance(status, JobStatus::Running))
}

/// Stage one endpoint's preparatory resources, resumable across passes.
///
/// The copier job is fetched before it is created so two passes racing over
/// the same endpoint never create it twice; its completion condition decides
/// whether the endpoint is ready or the experiment has failed.
async fn ensure_endpoint_resources(
    cx: Arc<Context<impl HealthChecker, impl Clock>>,
    ns: &str,
    orefs: Vec<OwnerReference>,
    experiment: &str,
    index: usize,
    endpoint: &RelatedEndpoint,
) -> Result<EndpointReadiness, Error> {
    create_config_map(
        cx.clone(),
        ns,
        orefs.clone(),
        &config_map_name(experiment, index),
        config_map_data(endpoint)?,
    )
    .await?;

    let Some(dataset) = endpoint.dataset() else {
        // Plain text endpoints only need the config map.
        return Ok(EndpointReadiness::Ready);
    };

    let size = endpoint
        .spec
        .data_size
        .clone()
        .or_else(|| dataset.spec.size.clone())
        .unwrap_or_else(|| cx.config.default_data_size.clone());
    create_pvc(
        cx.clone(),
        ns,
        orefs.clone(),
        &data_pvc_name(experiment, index),
        pvc_spec(&size),
    )
    .await?;

    let job_name = copy_job_name(experiment, index);
    match get_job(cx.clone(), ns, &job_name).await? {
        Some(job) => match job_completed(&job) {
            Some(true) => Ok(EndpointReadiness::Ready),
            Some(false) => Ok(EndpointReadiness::Failed(format!(
                "copier job {job_name:?} failed"
            ))),
            None => Ok(EndpointReadiness::Pending),
        },
        None => {
            create_job(
                cx.clone(),
                ns,
                orefs,
                &job_name,
                copy_job_spec(CopyJobConfig {
                    config_map: config_map_name(experiment, index),
                    dataset_pvc: dataset_pvc_name(&dataset.name_any()),
                    data_pvc: data_pvc_name(experiment, index),
                    image: cx.config.runner_image.clone(),
                    image_pull_policy: cx.config.runner_image_pull_policy.clone(),
                }),
            )
            .await?;
            Ok(EndpointReadiness::Pending)
        }
    }
}

/// Poll the test runs and once all finished tear the endpoint resources down.
async fn handle_running(
    cx: Arc<Context<impl HealthChecker, impl Clock>>,
    ns: &str,
    experiment: &Experiment,
    related: &Related,
    status: &mut ExperimentStatus,
) -> Result<Action, Error> {
    let name = experiment.name_any();
    let mut finished = 0;
    for index in 0..related.endpoints.len() {
        let run_name = test_run_name(&name, index);
        // A run that no longer exists was torn down by an interrupted pass
        // that never got to record Draining; count it as finished so the
        // teardown resumes.
        let Some(run) = get_test_run(cx.clone(), ns, &run_name).await? else {
            finished += 1;
            continue;
        };
        match run.stage() {
            TestRunStage::Error => {
                return Ok(fail(status, format!("test run {run_name:?} failed")));
            }
            TestRunStage::Finished => finished += 1,
            TestRunStage::Created | TestRunStage::Started => {}
        }
    }
    if finished < related.endpoints.len() {
        return Ok(Action::requeue(cx.config.poll_interval()));
    }

    delete_endpoint_resources(cx.clone(), ns, &name, related).await?;
    status.draining_started_time = Some(Time(cx.clock.now()));
    Ok(advance(status, JobStatus::Draining))
}

/// Delete every per endpoint resource. Absence is not an error since an
/// earlier pass may already have deleted some of them.
async fn delete_endpoint_resources(
    cx: Arc<Context<impl HealthChecker, impl Clock>>,
    ns: &str,
    experiment: &str,
    related: &Related,
) -> Result<(), Error> {
    for (index, endpoint) in related.endpoints.iter().enumerate() {
        delete_test_run(cx.clone(), ns, &test_run_name(experiment, index)).await?;
        delete_config_map(cx.clone(), ns, &config_map_name(experiment, index)).await?;
        if endpoint.dataset().is_some() {
            delete_job(cx.clone(), ns, &copy_job_name(experiment, index)).await?;
            delete_pvc(cx.clone(), ns, &data_pvc_name(experiment, index)).await?;
        }
    }
    Ok(())
}

/// Wait out the draining period, then release the pipeline and complete.
///
/// With end detection the completion time comes from the detector job,
/// adjusted backward for the detector pod's own teardown lag; otherwise the
/// fixed draining duration is waited out from the recorded draining start.
async fn handle_draining(
    cx: Arc<Context<impl HealthChecker, impl Clock>>,
    ns: &str,
    experiment: &Experiment,
    related: &Related,
    status: &mut ExperimentStatus,
) -> Result<Action, Error> {
    let name = experiment.name_any();
    let completion = if experiment.spec.use_end_detection {
        let job_name = detect_job_name(&name);
        match get_job(cx.clone(), ns, &job_name).await? {
            Some(job) => match job_completed(&job) {
                Some(true) => {
                    let finished = job
                        .status
                        .as_ref()
                        .and_then(|job_status| job_status.completion_time.clone())
                        .map(|time| time.0)
                        .unwrap_or_else(|| cx.clock.now());
                    finished - cx.config.pod_detach_adjustment()
                }
                Some(false) => {
                    return Ok(fail(status, format!("end detector job {job_name:?} failed")));
                }
                None => return Ok(Action::requeue(cx.config.poll_interval())),
            },
            None => {
                return Ok(fail(status, format!("end detector job {job_name:?} not found")));
            }
        }
    } else {
        let wait = match &experiment.spec.draining_duration {
            Some(text) => match humantime::parse_duration(text) {
                Ok(duration) => duration,
                Err(err) => {
                    return Ok(fail(
                        status,
                        format!("malformed draining duration {text:?}: {err}"),
                    ));
                }
            },
            None => Duration::ZERO,
        };
        let started = status
            .draining_started_time
            .as_ref()
            .map(|time| time.0)
            .unwrap_or_else(|| cx.clock.now());
        let deadline = started
            + chrono::Duration::from_std(wait)
                .map_err(|err| anyhow!("draining duration out of range: {err}"))?;
        let remaining = deadline - cx.clock.now();
        if remaining > chrono::Duration::zero() {
            debug!(?remaining, "draining");
            return Ok(Action::requeue(remaining.to_std().unwrap_or_default()));
        }
        cx.clock.now()
    };

    let holder = format!("{ns}/{name}");
    lock::release(cx.clone(), ns, &related.pipeline, &holder).await?;
    if let Some(metrics) = &related.pipeline.spec.metrics {
        lock::unlabel_metrics_service(cx.clone(), ns, &metrics.service).await?;
    }
    status.completion_time = Some(Time(completion));
    status.job_status = JobStatus::Completed;
    Ok(Action::await_change())
}

/// Release everything a deleted experiment may hold, then drop the finalizer.
///
/// Runs regardless of which forward state the experiment was in, so the
/// pipeline lock is never stranded by deletion.
async fn cleanup(
    cx: Arc<Context<impl HealthChecker, impl Clock>>,
    experiment: &Experiment,
    ns: &str,
) -> Result<Action, Error> {
    if !experiment
        .finalizers()
        .iter()
        .any(|finalizer| finalizer == EXPERIMENT_FINALIZER)
    {
        return Ok(Action::await_change());
    }
    let name = experiment.name_any();
    info!(name, "cleaning up deleted experiment");

    let pipelines: Api<Pipeline> = Api::namespaced(cx.k_client.clone(), ns);
    match pipelines.get(&experiment.spec.pipeline).await {
        Ok(pipeline) => {
            let holder = format!("{ns}/{name}");
            // The metrics label belongs to whichever experiment holds the
            // lock; an experiment deleted while queued must leave it alone.
            if lock::held_by(&pipeline, &holder) {
                lock::release(cx.clone(), ns, &pipeline, &holder).await?;
                if let Some(metrics) = &pipeline.spec.metrics {
                    lock::unlabel_metrics_service(cx.clone(), ns, &metrics.service).await?;
                }
            }
        }
        Err(kube::Error::Api(err)) if err.reason == "NotFound" => {
            debug!(pipeline = experiment.spec.pipeline, "pipeline already gone");
        }
        Err(err) => return Err(err.into()),
    }

    remove_finalizer(cx, ns, experiment).await?;
    Ok(Action::await_change())
}

/// Add the cleanup finalizer before any forward progress is made.
async fn ensure_finalizer(
    cx: Arc<Context<impl HealthChecker, impl Clock>>,
    ns: &str,
    experiment: &Experiment,
) -> Result<(), kube::error::Error> {
    if experiment
        .finalizers()
        .iter()
        .any(|finalizer| finalizer == EXPERIMENT_FINALIZER)
    {
        return Ok(());
    }
    let mut finalizers = experiment.finalizers().to_vec();
    finalizers.push(EXPERIMENT_FINALIZER.to_owned());
    let experiments: Api<Experiment> = Api::namespaced(cx.k_client.clone(), ns);
    experiments
        .patch(
            &experiment.name_any(),
            &PatchParams::default(),
            &Patch::Merge(json!({ "metadata": { "finalizers": finalizers } })),
        )
        .await?;
    Ok(())
}

/// Remove the cleanup finalizer, letting the object be reclaimed.
async fn remove_finalizer(
    cx: Arc<Context<impl HealthChecker, impl Clock>>,
    ns: &str,
    experiment: &Experiment,
) -> Result<(), kube::error::Error> {
    let finalizers: Vec<&String> = experiment
        .finalizers()
        .iter()
        .filter(|finalizer| *finalizer != EXPERIMENT_FINALIZER)
        .collect();
    let experiments: Api<Experiment> = Api::namespaced(cx.k_client.clone(), ns);
    experiments
        .patch(
            &experiment.name_any(),
            &PatchParams::default(),
            &Patch::Merge(json!({ "metadata": { "finalizers": finalizers } })),
        )
        .await?;
    Ok(())
}

/// Persist the status via the status subresource.
async fn patch_status(
    cx: Arc<Context<impl HealthChecker, impl Clock>>,
    ns: &str,
    name: &str,
    status: &ExperimentStatus,
) -> Result<(), kube::error::Error> {
    let experiments: Api<Experiment> = Api::namespaced(cx.k_client.clone(), ns);
    let _patched = experiments
        .patch_status(
            name,
            &PatchParams::default(),
            &Patch::Merge(json!({ "status": status })),
        )
        .await?;
    Ok(())
}
