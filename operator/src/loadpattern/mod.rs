//! LoadPattern is a k8s custom resource describing a traffic shape as an
//! ordered list of stages the load generator ramps through.
use std::time::Duration;

use anyhow::{anyhow, Result};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Primary CRD for traffic shapes.
#[derive(CustomResource, Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "pipebench.io",
    version = "v1alpha1",
    kind = "LoadPattern",
    plural = "loadpatterns",
    derive = "PartialEq",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct LoadPatternSpec {
    /// Ordered stages of the pattern.
    pub stages: Vec<Stage>,
}

/// One stage of a load pattern.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    /// How long the stage lasts, e.g. "30s" or "5m".
    pub duration: String,
    /// Request rate targeted at the end of the stage.
    pub target: u32,
}

impl LoadPattern {
    /// Total run time of the pattern, the sum of its stage durations.
    pub fn total_duration(&self) -> Result<Duration> {
        let mut total = Duration::ZERO;
        for stage in &self.spec.stages {
            total += humantime::parse_duration(&stage.duration).map_err(|err| {
                anyhow!("malformed stage duration {:?}: {err}", stage.duration)
            })?;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(durations: &[&str]) -> LoadPattern {
        LoadPattern::new(
            "pattern",
            LoadPatternSpec {
                stages: durations
                    .iter()
                    .map(|duration| Stage {
                        duration: duration.to_string(),
                        target: 10,
                    })
                    .collect(),
            },
        )
    }

    #[test]
    fn total_duration_sums_stages() {
        let total = pattern(&["30s", "1m", "1m 30s"]).total_duration().unwrap();
        assert_eq!(total, Duration::from_secs(180));
    }

    #[test]
    fn total_duration_of_empty_pattern_is_zero() {
        assert_eq!(pattern(&[]).total_duration().unwrap(), Duration::ZERO);
    }

    #[test]
    fn malformed_stage_duration_is_an_error() {
        let err = pattern(&["30s", "bogus"]).total_duration().unwrap_err();
        assert!(err.to_string().contains("bogus"), "{err}");
    }
}
