//! Utils is shared functions and constants for the controller
#[cfg(test)]
pub mod test;

use std::{collections::BTreeMap, sync::Arc};

use k8s_openapi::{
    api::{
        batch::v1::{Job, JobSpec},
        core::v1::{ConfigMap, PersistentVolumeClaim, PersistentVolumeClaimSpec},
    },
    apimachinery::pkg::apis::meta::v1::OwnerReference,
    chrono::{DateTime, Utc},
};
use kube::{
    api::{DeleteParams, PostParams},
    client::Client,
    core::ObjectMeta,
    Api,
};

use crate::{
    config::OperatorConfig,
    labels::managed_labels,
    lgen::{TestRun, TestRunSpec},
    pipeline::health::HealthChecker,
};

/// Operator Context
pub struct Context<H, C> {
    /// Kube client
    pub k_client: Client,
    /// Health check client
    pub health_client: H,
    /// Clock that provides the current time
    pub clock: C,
    /// Operator configuration
    pub config: OperatorConfig,
}

impl<H> Context<H, UtcClock> {
    /// Create new context
    pub fn new(k_client: Client, health_client: H, config: OperatorConfig) -> Self
    where
        H: HealthChecker,
    {
        Context {
            k_client,
            health_client,
            clock: UtcClock,
            config,
        }
    }
}

/// Provides the current time.
pub trait Clock {
    /// Report the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Provides the current time using real time.
pub struct UtcClock;
impl Clock for UtcClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Create a config map, tolerating it already existing from an earlier pass.
pub async fn create_config_map(
    cx: Arc<Context<impl HealthChecker, impl Clock>>,
    ns: &str,
    orefs: Vec<OwnerReference>,
    name: &str,
    data: BTreeMap<String, String>,
) -> Result<(), kube::error::Error> {
    let config_maps: Api<ConfigMap> = Api::namespaced(cx.k_client.clone(), ns);
    let config_map = ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            owner_references: Some(orefs),
            labels: managed_labels(),
            ..ObjectMeta::default()
        },
        data: Some(data),
        ..Default::default()
    };
    match config_maps.create(&PostParams::default(), &config_map).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(err)) if err.reason == "AlreadyExists" => Ok(()),
        Err(e) => Err(e),
    }
}

/// Delete a config map, tolerating it being absent.
pub async fn delete_config_map(
    cx: Arc<Context<impl HealthChecker, impl Clock>>,
    ns: &str,
    name: &str,
) -> Result<(), kube::error::Error> {
    let config_maps: Api<ConfigMap> = Api::namespaced(cx.k_client.clone(), ns);
    match config_maps.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(err)) if err.reason == "NotFound" => Ok(()),
        Err(e) => Err(e),
    }
}

/// Create a persistent volume claim, tolerating it already existing.
pub async fn create_pvc(
    cx: Arc<Context<impl HealthChecker, impl Clock>>,
    ns: &str,
    orefs: Vec<OwnerReference>,
    name: &str,
    spec: PersistentVolumeClaimSpec,
) -> Result<(), kube::error::Error> {
    let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(cx.k_client.clone(), ns);
    let pvc = PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            owner_references: Some(orefs),
            labels: managed_labels(),
            ..ObjectMeta::default()
        },
        spec: Some(spec),
        ..Default::default()
    };
    match pvcs.create(&PostParams::default(), &pvc).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(err)) if err.reason == "AlreadyExists" => Ok(()),
        Err(e) => Err(e),
    }
}

/// Delete a persistent volume claim, tolerating it being absent.
pub async fn delete_pvc(
    cx: Arc<Context<impl HealthChecker, impl Clock>>,
    ns: &str,
    name: &str,
) -> Result<(), kube::error::Error> {
    let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(cx.k_client.clone(), ns);
    match pvcs.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(err)) if err.reason == "NotFound" => Ok(()),
        Err(e) => Err(e),
    }
}

/// Create a job, tolerating it already existing.
pub async fn create_job(
    cx: Arc<Context<impl HealthChecker, impl Clock>>,
    ns: &str,
    orefs: Vec<OwnerReference>,
    name: &str,
    spec: JobSpec,
) -> Result<(), kube::error::Error> {
    let jobs: Api<Job> = Api::namespaced(cx.k_client.clone(), ns);
    let job = Job {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            owner_references: Some(orefs),
            labels: managed_labels(),
            ..ObjectMeta::default()
        },
        spec: Some(spec),
        ..Default::default()
    };
    match jobs.create(&PostParams::default(), &job).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(err)) if err.reason == "AlreadyExists" => Ok(()),
        Err(e) => Err(e),
    }
}

/// Fetch a job, reporting its absence as None.
pub async fn get_job(
    cx: Arc<Context<impl HealthChecker, impl Clock>>,
    ns: &str,
    name: &str,
) -> Result<Option<Job>, kube::error::Error> {
    let jobs: Api<Job> = Api::namespaced(cx.k_client.clone(), ns);
    match jobs.get(name).await {
        Ok(job) => Ok(Some(job)),
        Err(kube::Error::Api(err)) if err.reason == "NotFound" => Ok(None),
        Err(e) => Err(e),
    }
}

/// Delete a job with background propagation so its pods are reclaimed,
/// tolerating it being absent.
pub async fn delete_job(
    cx: Arc<Context<impl HealthChecker, impl Clock>>,
    ns: &str,
    name: &str,
) -> Result<(), kube::error::Error> {
    let jobs: Api<Job> = Api::namespaced(cx.k_client.clone(), ns);
    match jobs.delete(name, &DeleteParams::background()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(err)) if err.reason == "NotFound" => Ok(()),
        Err(e) => Err(e),
    }
}

/// Report whether a job has finished: Some(true) on success, Some(false) on
/// failure, None while it is still running.
pub fn job_completed(job: &Job) -> Option<bool> {
    let conditions = job.status.as_ref()?.conditions.as_ref()?;
    for condition in conditions {
        if condition.status == "True" {
            match condition.type_.as_str() {
                "Complete" => return Some(true),
                "Failed" => return Some(false),
                _ => {}
            }
        }
    }
    None
}

/// Create a test run, tolerating it already existing.
pub async fn create_test_run(
    cx: Arc<Context<impl HealthChecker, impl Clock>>,
    ns: &str,
    orefs: Vec<OwnerReference>,
    name: &str,
    spec: TestRunSpec,
) -> Result<(), kube::error::Error> {
    let test_runs: Api<TestRun> = Api::namespaced(cx.k_client.clone(), ns);
    let mut test_run = TestRun::new(name, spec);
    test_run.metadata.owner_references = Some(orefs);
    test_run.metadata.labels = managed_labels();
    match test_runs.create(&PostParams::default(), &test_run).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(err)) if err.reason == "AlreadyExists" => Ok(()),
        Err(e) => Err(e),
    }
}

/// Delete a test run, tolerating it being absent.
pub async fn delete_test_run(
    cx: Arc<Context<impl HealthChecker, impl Clock>>,
    ns: &str,
    name: &str,
) -> Result<(), kube::error::Error> {
    let test_runs: Api<TestRun> = Api::namespaced(cx.k_client.clone(), ns);
    match test_runs.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(err)) if err.reason == "NotFound" => Ok(()),
        Err(e) => Err(e),
    }
}

/// Get a test run by name, tolerating it being absent.
pub async fn get_test_run(
    cx: Arc<Context<impl HealthChecker, impl Clock>>,
    ns: &str,
    name: &str,
) -> Result<Option<TestRun>, kube::error::Error> {
    let test_runs: Api<TestRun> = Api::namespaced(cx.k_client.clone(), ns);
    match test_runs.get(name).await {
        Ok(run) => Ok(Some(run)),
        Err(kube::Error::Api(err)) if err.reason == "NotFound" => Ok(None),
        Err(e) => Err(e),
    }
}
