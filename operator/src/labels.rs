use std::collections::BTreeMap;

/// Manage by label
pub const MANAGED_BY_LABEL_SELECTOR: &str = "managed-by=pipebench";

/// Label key naming the experiment that currently owns a metrics service.
pub const EXPERIMENT_LABEL: &str = "pipebench.io/experiment";

/// Labels that indicate the resource is managed by the pipebench operator.
pub fn managed_labels() -> Option<BTreeMap<String, String>> {
    Some(BTreeMap::from_iter(vec![(
        "managed-by".to_owned(),
        "pipebench".to_owned(),
    )]))
}
