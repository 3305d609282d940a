#[cfg(test)]
use mockall::automock;
use serde::Serialize;

use crate::{
    Error, Result,
    api::ClusterConfig,
    cluster::LiveState,
};

/// Non-fatal notice surfaced to the operator after provisioning
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Advisory {
    pub nodegroup: Option<String>,
    pub message: String,
}

impl Advisory {
    pub fn new(nodegroup: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            nodegroup: nodegroup.map(str::to_string),
            message: message.into(),
        }
    }

    pub fn gpu(nodegroup: &str) -> Self {
        Self::new(
            Some(nodegroup),
            "as you are using a GPU optimized instance type you will need to install the NVIDIA \
             Kubernetes device plugin, see https://github.com/NVIDIA/k8s-device-plugin",
        )
    }
}

/// Checks the requested configuration against the live cluster
#[cfg_attr(test, automock)]
pub trait CompatibilityValidator: Send + Sync {
    /// Gate run before anything is created; an error aborts provisioning
    fn validate_cluster(&self, spec: &ClusterConfig, live: &LiveState) -> Result<()>;

    /// Trailing check once provisioning is done, only ever advisory
    fn validate(&self, spec: &ClusterConfig, live: &LiveState) -> Result<Vec<Advisory>>;
}

/// Flags kubelets that drift too far from the control plane version
#[derive(Clone, Copy, Debug)]
pub struct VersionSkewValidator {
    pub max_minor_skew: u32,
}

impl Default for VersionSkewValidator {
    fn default() -> Self {
        Self { max_minor_skew: 2 }
    }
}

fn minor(version: &str) -> Option<u32> {
    version.split('.').nth(1)?.parse().ok()
}

fn control_plane_minor(live: &LiveState) -> Result<u32> {
    minor(&live.control_plane_version).ok_or_else(|| {
        Error::validation(format!(
            "cannot parse control plane version {:?}",
            live.control_plane_version
        ))
    })
}

impl CompatibilityValidator for VersionSkewValidator {
    fn validate_cluster(&self, spec: &ClusterConfig, live: &LiveState) -> Result<()> {
        control_plane_minor(live)?;

        let existing: Vec<_> = spec
            .node_groups
            .iter()
            .filter(|ng| live.node_groups.contains_key(&ng.name))
            .map(|ng| ng.name.as_str())
            .collect();
        if !existing.is_empty() {
            return Err(Error::validation(format!(
                "nodegroup(s) {} already have nodes in cluster {:?}",
                existing.join(", "),
                spec.metadata.name
            )));
        }
        Ok(())
    }

    fn validate(&self, spec: &ClusterConfig, live: &LiveState) -> Result<Vec<Advisory>> {
        let control_plane = control_plane_minor(live)?;

        let mut advisories = vec![];

        for ng in &spec.node_groups {
            if !live.node_groups.contains_key(&ng.name) {
                advisories.push(Advisory::new(
                    Some(&ng.name),
                    "no nodes have joined the cluster for this nodegroup",
                ));
            }
        }

        for (name, group) in &live.node_groups {
            for version in &group.kubelet_versions {
                let Some(kubelet) = minor(version) else {
                    continue;
                };
                if kubelet > control_plane {
                    advisories.push(Advisory::new(
                        Some(name),
                        format!(
                            "kubelet version {version} is newer than control plane version {}",
                            live.control_plane_version
                        ),
                    ));
                } else if control_plane - kubelet > self.max_minor_skew {
                    advisories.push(Advisory::new(
                        Some(name),
                        format!(
                            "kubelet version {version} is more than {} minor versions behind \
                             control plane version {}",
                            self.max_minor_skew, live.control_plane_version
                        ),
                    ));
                }
            }
        }

        Ok(advisories)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{api::NodeGroup, cluster::LiveNodeGroup};

    fn live(groups: &[(&str, &[&str])]) -> LiveState {
        LiveState {
            control_plane_version: "1.14".to_string(),
            node_groups: groups
                .iter()
                .map(|(name, versions)| {
                    (
                        name.to_string(),
                        LiveNodeGroup {
                            nodes: 1,
                            ready_nodes: 1,
                            kubelet_versions: versions.iter().map(|v| v.to_string()).collect(),
                        },
                    )
                })
                .collect(),
        }
    }

    fn spec(names: &[&str]) -> ClusterConfig {
        ClusterConfig {
            node_groups: names
                .iter()
                .map(|name| NodeGroup {
                    name: name.to_string(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn compatible_cluster_has_no_advisories() {
        let advisories = VersionSkewValidator::default()
            .validate(&spec(&["ng-1"]), &live(&[("ng-1", &["1.14", "1.13"])]))
            .unwrap();
        assert!(advisories.is_empty());
    }

    #[test]
    fn reports_skew_and_missing_nodegroups() {
        let advisories = VersionSkewValidator::default()
            .validate(
                &spec(&["ng-1", "ng-2"]),
                &live(&[("ng-1", &["1.14"]), ("old", &["1.11"]), ("new", &["1.15"])]),
            )
            .unwrap();

        let by_group: Vec<_> = advisories
            .iter()
            .map(|a| a.nodegroup.as_deref().unwrap())
            .collect();
        assert_eq!(by_group, vec!["ng-2", "new", "old"]);
        assert!(advisories[1].message.contains("newer"));
        assert!(advisories[2].message.contains("behind"));
    }

    #[test]
    fn unparsable_control_plane_version_fails() {
        let mut state = live(&[]);
        state.control_plane_version = "unknown".to_string();
        let validator = VersionSkewValidator::default();
        assert!(validator.validate(&spec(&[]), &state).is_err());
        assert!(matches!(
            validator.validate_cluster(&spec(&["ng-1"]), &state),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn new_nodegroups_pass_the_gate() {
        VersionSkewValidator::default()
            .validate_cluster(&spec(&["ng-2"]), &live(&[("ng-1", &["1.14"])]))
            .unwrap();
    }

    #[test]
    fn gate_rejects_nodegroups_that_already_have_nodes() {
        let mut spec = spec(&["ng-1", "ng-2", "ng-3"]);
        spec.metadata.name = "prod".to_string();

        let err = VersionSkewValidator::default()
            .validate_cluster(&spec, &live(&[("ng-1", &["1.14"]), ("ng-3", &["1.14"])]))
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(
            err.to_string(),
            "nodegroup(s) ng-1, ng-3 already have nodes in cluster \"prod\""
        );
    }
}
