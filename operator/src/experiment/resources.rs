//! Builders for the ephemeral resources an experiment owns.
//!
//! All names are derived deterministically from the experiment name and the
//! endpoint index so a resumed reconcile pass can always re-locate what an
//! earlier pass created.
use std::collections::BTreeMap;

use anyhow::Result;
use k8s_openapi::{
    api::{
        batch::v1::JobSpec,
        core::v1::{
            ConfigMapVolumeSource, Container, EnvVar, PersistentVolumeClaimSpec,
            PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, ResourceRequirements,
            Volume, VolumeMount,
        },
    },
    apimachinery::pkg::api::resource::Quantity,
};
use kube::ResourceExt;
use serde_json::json;

use crate::{
    dataset::dataset_pvc_name,
    experiment::resolve::{RelatedData, RelatedEndpoint},
    lgen::{ScriptRef, TestRunSpec},
};

/// File within the endpoint config map holding the load generator script.
pub const SCRIPT_FILE: &str = "script.js";

/// Name of the config map for one endpoint.
pub fn config_map_name(experiment: &str, index: usize) -> String {
    format!("{experiment}-{index}-config")
}

/// Name of the staging volume claim for one endpoint.
pub fn data_pvc_name(experiment: &str, index: usize) -> String {
    format!("{experiment}-{index}-data")
}

/// Name of the copier job for one endpoint.
pub fn copy_job_name(experiment: &str, index: usize) -> String {
    format!("{experiment}-{index}-copy")
}

/// Name of the test run for one endpoint.
pub fn test_run_name(experiment: &str, index: usize) -> String {
    format!("{experiment}-{index}-run")
}

/// Name of the end detector job of an experiment.
pub fn detect_job_name(experiment: &str) -> String {
    format!("{experiment}-detect")
}

/// Data of the endpoint config map consumed by the load generator: the
/// rendered script, the serialized endpoint and load pattern, and either the
/// literal payload or the data set reference.
pub fn config_map_data(endpoint: &RelatedEndpoint) -> Result<BTreeMap<String, String>> {
    let mut data = BTreeMap::new();
    data.insert(SCRIPT_FILE.to_owned(), render_script(endpoint));
    data.insert(
        "endpoint.json".to_owned(),
        serde_json::to_string(&endpoint.target)?,
    );
    data.insert(
        "pattern.json".to_owned(),
        serde_json::to_string(&endpoint.load_pattern.spec)?,
    );
    match &endpoint.data {
        RelatedData::PlainText => {
            data.insert(
                "payload.txt".to_owned(),
                endpoint.spec.plain_text.clone().unwrap_or_default(),
            );
        }
        RelatedData::DataSet(dataset) => {
            data.insert(
                "dataset.json".to_owned(),
                serde_json::to_string(&json!({
                    "name": dataset.name_any(),
                    "volume": dataset_pvc_name(&dataset.name_any()),
                }))?,
            );
        }
    }
    Ok(data)
}

// Minimal script driving the endpoint with the pattern mounted next to it.
fn render_script(endpoint: &RelatedEndpoint) -> String {
    let payload = match &endpoint.data {
        RelatedData::PlainText => "open('./payload.txt')",
        RelatedData::DataSet(_) => "open('/data/payload')",
    };
    format!(
        r#"import http from 'k6/http';

const pattern = JSON.parse(open('./pattern.json'));
export const options = {{ stages: pattern.stages }};

export default function () {{
  http.request('{method}', '{url}', {payload});
}}
"#,
        method = endpoint.http.method,
        url = endpoint.http.url,
    )
}

/// Spec of an endpoint's staging volume claim.
pub fn pvc_spec(size: &str) -> PersistentVolumeClaimSpec {
    PersistentVolumeClaimSpec {
        access_modes: Some(vec!["ReadWriteOnce".to_owned()]),
        resources: Some(ResourceRequirements {
            requests: Some(BTreeMap::from_iter(vec![(
                "storage".to_owned(),
                Quantity(size.to_owned()),
            )])),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// CopyJobConfig defines which properties of the copier job can be customized.
pub struct CopyJobConfig {
    /// Endpoint config map to copy from.
    pub config_map: String,
    /// Volume holding the data set's generated data.
    pub dataset_pvc: String,
    /// Staging volume consumed by the test run.
    pub data_pvc: String,
    /// Image of the copier container.
    pub image: String,
    /// Pull policy for the image.
    pub image_pull_policy: String,
}

/// Job that stages the config map and the generated data into the endpoint's
/// staging volume.
pub fn copy_job_spec(config: CopyJobConfig) -> JobSpec {
    JobSpec {
        backoff_limit: Some(4),
        template: PodTemplateSpec {
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "copy".to_owned(),
                    image: Some(config.image),
                    image_pull_policy: Some(config.image_pull_policy),
                    command: Some(vec![
                        "/bin/sh".to_owned(),
                        "-c".to_owned(),
                        "cp -r /config/. /data/ && cp -r /dataset/. /data/".to_owned(),
                    ]),
                    volume_mounts: Some(vec![
                        VolumeMount {
                            name: "config".to_owned(),
                            mount_path: "/config".to_owned(),
                            read_only: Some(true),
                            ..Default::default()
                        },
                        VolumeMount {
                            name: "dataset".to_owned(),
                            mount_path: "/dataset".to_owned(),
                            read_only: Some(true),
                            ..Default::default()
                        },
                        VolumeMount {
                            name: "data".to_owned(),
                            mount_path: "/data".to_owned(),
                            ..Default::default()
                        },
                    ]),
                    ..Default::default()
                }],
                volumes: Some(vec![
                    Volume {
                        name: "config".to_owned(),
                        config_map: Some(ConfigMapVolumeSource {
                            name: Some(config.config_map),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    Volume {
                        name: "dataset".to_owned(),
                        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                            claim_name: config.dataset_pvc,
                            read_only: Some(true),
                        }),
                        ..Default::default()
                    },
                    Volume {
                        name: "data".to_owned(),
                        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                            claim_name: config.data_pvc,
                            read_only: None,
                        }),
                        ..Default::default()
                    },
                ]),
                restart_policy: Some("Never".to_owned()),
                ..Default::default()
            }),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// DetectJobConfig defines which properties of the end detector job can be
/// customized.
pub struct DetectJobConfig {
    /// Name of the experiment the detector watches.
    pub experiment: String,
    /// Service backing the pipeline's metrics endpoint.
    pub metrics_service: String,
    /// Image of the detector container.
    pub image: String,
    /// Pull policy for the image.
    pub image_pull_policy: String,
}

/// Job that polls the pipeline's metrics to infer natural completion.
pub fn detect_job_spec(config: DetectJobConfig) -> JobSpec {
    JobSpec {
        backoff_limit: Some(4),
        template: PodTemplateSpec {
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "detect".to_owned(),
                    image: Some(config.image),
                    image_pull_policy: Some(config.image_pull_policy),
                    command: Some(vec![
                        "/usr/bin/pipebench-runner".to_owned(),
                        "detect".to_owned(),
                    ]),
                    env: Some(vec![
                        EnvVar {
                            name: "DETECT_EXPERIMENT".to_owned(),
                            value: Some(config.experiment),
                            ..Default::default()
                        },
                        EnvVar {
                            name: "DETECT_METRICS_SERVICE".to_owned(),
                            value: Some(config.metrics_service),
                            ..Default::default()
                        },
                        EnvVar {
                            name: "RUST_LOG".to_owned(),
                            value: Some("info".to_owned()),
                            ..Default::default()
                        },
                    ]),
                    ..Default::default()
                }],
                restart_policy: Some("Never".to_owned()),
                ..Default::default()
            }),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Spec of the test run executing the endpoint's script.
pub fn test_run_spec(experiment: &str, index: usize) -> TestRunSpec {
    TestRunSpec {
        script: ScriptRef {
            config_map: config_map_name(experiment, index),
            file: SCRIPT_FILE.to_owned(),
        },
        parallelism: Some(1),
        arguments: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dataset::{DataSet, DataSetSpec},
        experiment::EndpointSpec,
        loadpattern::{LoadPattern, LoadPatternSpec, Stage},
        pipeline::{HttpEndpoint, PipelineEndpoint},
    };

    fn endpoint(data: RelatedData) -> RelatedEndpoint {
        RelatedEndpoint {
            spec: EndpointSpec {
                endpoint: "ingest".to_owned(),
                plain_text: Some("hello".to_owned()),
                ..Default::default()
            },
            target: PipelineEndpoint {
                name: "ingest".to_owned(),
                http: Some(HttpEndpoint {
                    url: "http://pipeline/ingest".to_owned(),
                    method: "POST".to_owned(),
                }),
            },
            http: HttpEndpoint {
                url: "http://pipeline/ingest".to_owned(),
                method: "POST".to_owned(),
            },
            data,
            load_pattern: LoadPattern::new(
                "pattern",
                LoadPatternSpec {
                    stages: vec![Stage {
                        duration: "30s".to_owned(),
                        target: 10,
                    }],
                },
            ),
        }
    }

    #[test]
    fn names_are_deterministic() {
        assert_eq!(config_map_name("exp", 0), "exp-0-config");
        assert_eq!(data_pvc_name("exp", 1), "exp-1-data");
        assert_eq!(copy_job_name("exp", 2), "exp-2-copy");
        assert_eq!(test_run_name("exp", 0), "exp-0-run");
        assert_eq!(detect_job_name("exp"), "exp-detect");
    }

    #[test]
    fn plain_text_config_map_carries_the_payload() {
        let data = config_map_data(&endpoint(RelatedData::PlainText)).unwrap();
        assert_eq!(data.get("payload.txt").map(String::as_str), Some("hello"));
        assert!(data.get(SCRIPT_FILE).unwrap().contains("http://pipeline/ingest"));
        assert!(data.get(SCRIPT_FILE).unwrap().contains("'POST'"));
        assert!(data.get("pattern.json").unwrap().contains("30s"));
        assert!(!data.contains_key("dataset.json"));
    }

    #[test]
    fn dataset_config_map_references_the_generated_volume() {
        let dataset = DataSet::new("corpus", DataSetSpec::default());
        let data = config_map_data(&endpoint(RelatedData::DataSet(dataset))).unwrap();
        let reference = data.get("dataset.json").unwrap();
        assert!(reference.contains(r#""volume":"corpus-data""#), "{reference}");
        assert!(!data.contains_key("payload.txt"));
    }

    #[test]
    fn pvc_spec_requests_the_given_size() {
        let spec = pvc_spec("5Gi");
        let requests = spec.resources.unwrap().requests.unwrap();
        assert_eq!(requests.get("storage"), Some(&Quantity("5Gi".to_owned())));
    }

    #[test]
    fn copy_job_mounts_all_three_volumes() {
        let spec = copy_job_spec(CopyJobConfig {
            config_map: "exp-0-config".to_owned(),
            dataset_pvc: "corpus-data".to_owned(),
            data_pvc: "exp-0-data".to_owned(),
            image: "pipebench/runner:latest".to_owned(),
            image_pull_policy: "Always".to_owned(),
        });
        let pod = spec.template.spec.unwrap();
        let volumes = pod.volumes.unwrap();
        assert_eq!(volumes.len(), 3);
        assert_eq!(
            volumes[1].persistent_volume_claim.as_ref().unwrap().claim_name,
            "corpus-data"
        );
        let mounts = pod.containers[0].volume_mounts.as_ref().unwrap();
        assert_eq!(mounts.len(), 3);
    }
}
