//! Canned resources for experiment controller tests.
use std::collections::BTreeMap;

use k8s_openapi::{
    api::batch::v1::{Job, JobCondition, JobStatus as K8sJobStatus},
    apimachinery::pkg::apis::meta::v1::Time,
    chrono::{DateTime, Utc},
};
use kube::core::ObjectMeta;

use crate::{
    dataset::{DataSet, DataSetJobStatus, DataSetSpec, DataSetStatus},
    experiment::{
        controller::EXPERIMENT_FINALIZER, EndpointSpec, Experiment, ExperimentSpec,
        ExperimentStatus, JobStatus,
    },
    lgen::{TestRun, TestRunSpec, TestRunStage, TestRunStatus},
    loadpattern::{LoadPattern, LoadPatternSpec, Stage},
    pipeline::{
        lock::LOCKED_BY_ANNOTATION, HttpEndpoint, MetricsSpec, Pipeline, PipelineAvailability,
        PipelineEndpoint, PipelineSpec,
    },
    utils::test::WithStatus,
};

impl WithStatus for Experiment {
    type Status = ExperimentStatus;

    fn with_status(mut self, status: Self::Status) -> Self {
        self.status = Some(status);
        self
    }
}

/// Experiment "test" in namespace "test" with one plain text endpoint, a 30s
/// draining duration and the cleanup finalizer already present.
pub fn plain_experiment() -> Experiment {
    let mut experiment = Experiment::new(
        "test",
        ExperimentSpec {
            pipeline: "pipeline".to_owned(),
            endpoints: vec![EndpointSpec {
                endpoint: "ingest".to_owned(),
                plain_text: Some("hello".to_owned()),
                load_pattern: "pattern".to_owned(),
                ..Default::default()
            }],
            draining_duration: Some("30s".to_owned()),
            ..Default::default()
        },
    );
    experiment.metadata = ObjectMeta {
        name: Some("test".to_owned()),
        namespace: Some("test".to_owned()),
        uid: Some("uid-test".to_owned()),
        finalizers: Some(vec![EXPERIMENT_FINALIZER.to_owned()]),
        ..Default::default()
    };
    experiment
}

/// Same experiment, but driving its endpoint from the "corpus" data set.
pub fn dataset_experiment() -> Experiment {
    let mut experiment = plain_experiment();
    experiment.spec.endpoints[0].plain_text = None;
    experiment.spec.endpoints[0].dataset = Some("corpus".to_owned());
    experiment
}

/// Remove the cleanup finalizer.
pub fn without_finalizer(mut experiment: Experiment) -> Experiment {
    experiment.metadata.finalizers = None;
    experiment
}

/// Mark the experiment as being deleted.
pub fn deleted(mut experiment: Experiment) -> Experiment {
    experiment.metadata.deletion_timestamp = Some(Time(Utc::now()));
    experiment
}

/// Attach a status.
pub fn with_status(mut experiment: Experiment, status: ExperimentStatus) -> Experiment {
    experiment.status = Some(status);
    experiment
}

/// Status as the Created handler leaves it, parked in the given state.
pub fn status_in(job_status: JobStatus) -> ExperimentStatus {
    ExperimentStatus {
        job_status,
        endpoint_durations: Some(BTreeMap::from_iter(vec![("ingest".to_owned(), 30)])),
        tags: Some(BTreeMap::from_iter(vec![(
            "team".to_owned(),
            "data".to_owned(),
        )])),
        cloud_provider: Some("aws".to_owned()),
        region: Some("us-east-1".to_owned()),
        ..Default::default()
    }
}

/// Pipeline "pipeline" with one HTTP endpoint, a metrics service, a health
/// check and cost tags, ready to be claimed.
pub fn test_pipeline() -> Pipeline {
    let mut pipeline = Pipeline::new(
        "pipeline",
        PipelineSpec {
            availability: PipelineAvailability::Ready,
            endpoints: vec![PipelineEndpoint {
                name: "ingest".to_owned(),
                http: Some(HttpEndpoint {
                    url: "http://pipeline/ingest".to_owned(),
                    method: "POST".to_owned(),
                }),
            }],
            metrics: Some(MetricsSpec {
                service: "metrics".to_owned(),
            }),
            health_checks: Some(vec!["http://pipeline/health".to_owned()]),
            tags: Some(BTreeMap::from_iter(vec![(
                "team".to_owned(),
                "data".to_owned(),
            )])),
            cloud_provider: Some("aws".to_owned()),
            region: Some("us-east-1".to_owned()),
        },
    );
    pipeline.metadata.namespace = Some("test".to_owned());
    pipeline
}

/// The pipeline, claimed by the given holder.
pub fn locked_pipeline(holder: &str) -> Pipeline {
    let mut pipeline = test_pipeline();
    pipeline.spec.availability = PipelineAvailability::InUse;
    pipeline.metadata.annotations = Some(BTreeMap::from_iter(vec![(
        LOCKED_BY_ANNOTATION.to_owned(),
        holder.to_owned(),
    )]));
    pipeline
}

/// Data set "corpus" in the given generation state.
pub fn dataset(job_status: DataSetJobStatus) -> DataSet {
    let mut dataset = DataSet::new(
        "corpus",
        DataSetSpec {
            size: Some("5Gi".to_owned()),
        },
    );
    dataset.status = Some(DataSetStatus { job_status });
    dataset
}

/// Load pattern "pattern" with a single 30s stage.
pub fn test_load_pattern() -> LoadPattern {
    LoadPattern::new(
        "pattern",
        LoadPatternSpec {
            stages: vec![Stage {
                duration: "30s".to_owned(),
                target: 10,
            }],
        },
    )
}

fn job_with_condition(type_: &str, completion_time: Option<DateTime<Utc>>) -> Job {
    Job {
        status: Some(K8sJobStatus {
            conditions: Some(vec![JobCondition {
                type_: type_.to_owned(),
                status: "True".to_owned(),
                ..Default::default()
            }]),
            completion_time: completion_time.map(Time),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Job that completed successfully at the given time.
pub fn completed_job(completion_time: DateTime<Utc>) -> Job {
    job_with_condition("Complete", Some(completion_time))
}

/// Job that failed.
pub fn failed_job() -> Job {
    job_with_condition("Failed", None)
}

/// Test run in the given stage.
pub fn test_run(stage: TestRunStage) -> TestRun {
    let mut run = TestRun::new("test-0-run", TestRunSpec::default());
    run.status = Some(TestRunStatus { stage });
    run
}
