use std::{
    collections::{BTreeMap, BTreeSet},
    time::Duration,
};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Node};
use kube::{
    Api, Client,
    api::{ListParams, ObjectMeta, Patch, PatchParams},
};
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use tracing::{Level, instrument};

use crate::{
    Error, Result,
    api::{NODEGROUP_NAME_LABEL, NodeGroup},
    backend::UnitStack,
};

const MANAGER_NAME: &str = "ngctl";

const AUTH_CONFIGMAP_NAMESPACE: &str = "kube-system";
const AUTH_CONFIGMAP_NAME: &str = "aws-auth";
const MAP_ROLES_KEY: &str = "mapRoles";
const NODE_USERNAME: &str = "system:node:{{EC2PrivateDNSName}}";
const NODE_GROUPS: [&str; 2] = ["system:bootstrappers", "system:nodes"];

const READY_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Live control plane operations the provisioning pipeline depends on
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Kubernetes version of the control plane, as `major.minor`
    async fn current_version(&self) -> Result<String>;

    /// Authorise the nodegroup's machines to join the cluster
    async fn register_unit(&self, unit: &NodeGroup, stack: &UnitStack) -> Result<()>;

    /// Block until the nodegroup's expected nodes are ready or the deadline passes
    async fn await_ready(&self, unit: &NodeGroup, deadline: Duration) -> Result<()>;

    /// Snapshot of nodegroups currently joined to the cluster
    async fn live_state(&self) -> Result<LiveState>;
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LiveState {
    pub control_plane_version: String,
    pub node_groups: BTreeMap<String, LiveNodeGroup>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LiveNodeGroup {
    pub nodes: u32,
    pub ready_nodes: u32,
    /// Distinct `major.minor` kubelet versions reported by the nodes
    pub kubelet_versions: BTreeSet<String>,
}

/// Entry of the `mapRoles` list in the `aws-auth` ConfigMap
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct MapRole {
    pub rolearn: String,
    pub username: String,
    pub groups: Vec<String>,
}

impl MapRole {
    pub fn for_nodes(role_arn: &str) -> Self {
        Self {
            rolearn: role_arn.to_string(),
            username: NODE_USERNAME.to_string(),
            groups: NODE_GROUPS.iter().map(|g| g.to_string()).collect(),
        }
    }
}

/// [`ControlPlane`] backed by the cluster's Kubernetes API
pub struct KubeControlPlane {
    client: Client,
}

impl KubeControlPlane {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ControlPlane for KubeControlPlane {
    #[instrument(level = Level::DEBUG, skip(self))]
    async fn current_version(&self) -> Result<String> {
        let info = self
            .client
            .apiserver_version()
            .await
            .map_err(|e| Error::connectivity(format!("unable to get control plane version: {e}")))?;

        normalize_version(&info.major, &info.minor)
    }

    #[instrument(level = Level::DEBUG, skip(self, unit, stack), fields(nodegroup = %unit.name))]
    async fn register_unit(&self, unit: &NodeGroup, stack: &UnitStack) -> Result<()> {
        let Some(role_arn) = stack.instance_role_arn.as_deref() else {
            return Err(Error::registration(
                &unit.name,
                "stack did not report a node instance role",
            ));
        };

        let configmaps =
            Api::<ConfigMap>::namespaced(self.client.clone(), AUTH_CONFIGMAP_NAMESPACE);
        let existing = configmaps
            .get_opt(AUTH_CONFIGMAP_NAME)
            .await
            .map_err(|e| Error::registration(&unit.name, e))?;

        let current = existing
            .as_ref()
            .and_then(|cm| cm.data.as_ref())
            .and_then(|data| data.get(MAP_ROLES_KEY))
            .map(String::as_str)
            .unwrap_or_default();

        let Some(map_roles) = add_node_role(current, role_arn)
            .map_err(|e| Error::registration(&unit.name, e))?
        else {
            tracing::info!("role {role_arn:?} is already authorised to join");
            return Ok(());
        };

        configmaps
            .patch(
                AUTH_CONFIGMAP_NAME,
                &PatchParams::apply(MANAGER_NAME).force(),
                &Patch::Apply(ConfigMap {
                    metadata: ObjectMeta {
                        name: Some(AUTH_CONFIGMAP_NAME.to_string()),
                        namespace: Some(AUTH_CONFIGMAP_NAMESPACE.to_string()),
                        ..Default::default()
                    },
                    data: Some([(MAP_ROLES_KEY.to_string(), map_roles)].into()),
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| Error::registration(&unit.name, e))?;

        tracing::info!("added nodegroup {:?} to auth ConfigMap", unit.name);
        Ok(())
    }

    #[instrument(level = Level::DEBUG, skip(self, unit), fields(nodegroup = %unit.name))]
    async fn await_ready(&self, unit: &NodeGroup, deadline: Duration) -> Result<()> {
        let expected = unit.expected_ready_nodes();
        if expected == 0 {
            return Ok(());
        }

        let nodes = Api::<Node>::all(self.client.clone());
        let params = ListParams::default().labels(&format!("{NODEGROUP_NAME_LABEL}={}", unit.name));

        tracing::info!(
            "waiting for at least {expected} node(s) of nodegroup {:?} to become ready",
            unit.name
        );

        let wait = async {
            loop {
                let ready = nodes
                    .list(&params)
                    .await?
                    .items
                    .iter()
                    .filter(|node| is_node_ready(node))
                    .count() as u32;

                if ready >= expected {
                    tracing::info!("nodegroup {:?} has {ready} node(s) ready", unit.name);
                    return Ok::<_, Error>(());
                }

                tracing::debug!("{ready}/{expected} node(s) ready");
                tokio::time::sleep(READY_POLL_INTERVAL).await;
            }
        };

        tokio::time::timeout(deadline, wait)
            .await
            .map_err(|_| Error::Timeout {
                unit: unit.name.clone(),
                waited: deadline,
            })?
    }

    #[instrument(level = Level::DEBUG, skip(self))]
    async fn live_state(&self) -> Result<LiveState> {
        let control_plane_version = self.current_version().await?;

        let nodes = Api::<Node>::all(self.client.clone())
            .list(&ListParams::default().labels(NODEGROUP_NAME_LABEL))
            .await?;

        Ok(LiveState {
            control_plane_version,
            node_groups: group_nodes(&nodes.items),
        })
    }
}

/// `major`/`minor` as reported by the API server, e.g. `"1"`/`"14+"`, to `"1.14"`
pub fn normalize_version(major: &str, minor: &str) -> Result<String> {
    let digits = |s: &str| s.chars().filter(char::is_ascii_digit).collect::<String>();
    let (major, minor) = (digits(major), digits(minor));

    if major.is_empty() || minor.is_empty() {
        return Err(Error::connectivity("unable to get control plane version"));
    }

    Ok(format!("{major}.{minor}"))
}

/// Kubelet version such as `v1.14.7-eks-1861c5` to `1.14`
pub fn kubelet_minor_version(kubelet_version: &str) -> Option<String> {
    let mut parts = kubelet_version.trim_start_matches('v').split('.');
    let major = parts.next()?;
    let minor = parts.next()?;
    Some(format!("{major}.{minor}"))
}

pub fn is_node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

fn group_nodes(nodes: &[Node]) -> BTreeMap<String, LiveNodeGroup> {
    let mut groups = BTreeMap::<String, LiveNodeGroup>::new();

    for node in nodes {
        let Some(name) = node
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(NODEGROUP_NAME_LABEL))
        else {
            continue;
        };

        let group = groups.entry(name.clone()).or_default();
        group.nodes += 1;
        if is_node_ready(node) {
            group.ready_nodes += 1;
        }
        if let Some(version) = node
            .status
            .as_ref()
            .and_then(|s| s.node_info.as_ref())
            .and_then(|info| kubelet_minor_version(&info.kubelet_version))
        {
            group.kubelet_versions.insert(version);
        }
    }

    groups
}

/// Append the node role to a serialised `mapRoles` list.
///
/// Existing entries are carried over untouched, including fields this tool
/// doesn't know about. Returns `None` when the role is already present.
pub fn add_node_role(map_roles: &str, role_arn: &str) -> Result<Option<String>> {
    let mut roles: Vec<serde_yaml_ng::Value> = if map_roles.trim().is_empty() {
        vec![]
    } else {
        serde_yaml_ng::from_str(map_roles)?
    };

    if roles
        .iter()
        .any(|r| r.get("rolearn").and_then(serde_yaml_ng::Value::as_str) == Some(role_arn))
    {
        return Ok(None);
    }

    roles.push(serde_yaml_ng::to_value(MapRole::for_nodes(role_arn))?);
    Ok(Some(serde_yaml_ng::to_string(&roles)?))
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{NodeCondition, NodeStatus, NodeSystemInfo};

    use super::*;

    fn make_node(name: &str, nodegroup: Option<&str>, ready: bool, kubelet: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: nodegroup
                    .map(|ng| [(NODEGROUP_NAME_LABEL.to_string(), ng.to_string())].into()),
                ..Default::default()
            },
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..Default::default()
                }]),
                node_info: Some(NodeSystemInfo {
                    kubelet_version: kubelet.to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn normalizes_api_server_versions() {
        assert_eq!(normalize_version("1", "14+").unwrap(), "1.14");
        assert_eq!(normalize_version("1", "13").unwrap(), "1.13");
        assert!(matches!(
            normalize_version("", ""),
            Err(Error::Connectivity(_))
        ));
    }

    #[test]
    fn kubelet_versions() {
        assert_eq!(
            kubelet_minor_version("v1.14.7-eks-1861c5").as_deref(),
            Some("1.14")
        );
        assert_eq!(kubelet_minor_version("garbage"), None);
    }

    #[test]
    fn groups_nodes_by_nodegroup_label() {
        let nodes = vec![
            make_node("a", Some("ng-1"), true, "v1.14.7"),
            make_node("b", Some("ng-1"), false, "v1.13.2"),
            make_node("c", Some("ng-2"), true, "v1.14.1"),
            make_node("d", None, true, "v1.14.1"),
        ];

        let groups = group_nodes(&nodes);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups["ng-1"].nodes, 2);
        assert_eq!(groups["ng-1"].ready_nodes, 1);
        assert_eq!(
            groups["ng-1"].kubelet_versions,
            ["1.13".to_string(), "1.14".to_string()].into()
        );
        assert_eq!(groups["ng-2"].ready_nodes, 1);
    }

    #[test]
    fn adds_node_role_once() {
        let arn = "arn:aws:iam::123456789012:role/ng-1-NodeInstanceRole";

        let first = add_node_role("", arn).unwrap().unwrap();
        let roles: Vec<MapRole> = serde_yaml_ng::from_str(&first).unwrap();
        assert_eq!(roles, vec![MapRole::for_nodes(arn)]);

        assert_eq!(add_node_role(&first, arn).unwrap(), None);

        let second = add_node_role(&first, "arn:aws:iam::123456789012:role/other")
            .unwrap()
            .unwrap();
        let roles: Vec<MapRole> = serde_yaml_ng::from_str(&second).unwrap();
        assert_eq!(roles.len(), 2);
        assert_eq!(roles[0].rolearn, arn);
    }

    #[test]
    fn keeps_entries_owned_by_others_intact() {
        let existing = "\
- rolearn: arn:aws:iam::123456789012:role/admin
  username: admin
  groups: [system:masters]
  extra: keep-me
- rolearn: arn:aws:iam::123456789012:role/readonly
  username: readonly
";
        let arn = "arn:aws:iam::123456789012:role/ng-1-NodeInstanceRole";

        let updated = add_node_role(existing, arn).unwrap().unwrap();
        let roles: Vec<serde_yaml_ng::Value> = serde_yaml_ng::from_str(&updated).unwrap();

        assert_eq!(roles.len(), 3);
        assert_eq!(roles[0]["extra"].as_str(), Some("keep-me"));
        assert_eq!(roles[0]["groups"][0].as_str(), Some("system:masters"));
        assert_eq!(roles[1]["username"].as_str(), Some("readonly"));
        assert!(roles[1].get("groups").is_none());
        assert_eq!(
            serde_yaml_ng::from_value::<MapRole>(roles[2].clone()).unwrap(),
            MapRole::for_nodes(arn)
        );

        let readonly = "arn:aws:iam::123456789012:role/readonly";
        assert_eq!(add_node_role(&updated, readonly).unwrap(), None);
    }
}
