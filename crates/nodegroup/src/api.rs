use std::{collections::BTreeMap, fmt};

use garde::Validate;
use rand::Rng;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::keys::KeyHandle;

pub const API_VERSION: &str = "ngctl.io/v1alpha4";
pub const CLUSTER_CONFIG_KIND: &str = "ClusterConfig";

/// Kubernetes versions new nodegroups can be created with
pub const SUPPORTED_VERSIONS: &[&str] = &["1.12", "1.13", "1.14"];
pub const LATEST_VERSION: &str = "1.14";

/// Requested version that inherits the control plane version
pub const AUTO_VERSION: &str = "auto";
/// Requested version that forces [`LATEST_VERSION`]
pub const LATEST_VERSION_ALIAS: &str = "latest";

pub const DEFAULT_INSTANCE_TYPE: &str = "m5.large";
pub const DEFAULT_NODE_COUNT: u32 = 2;
pub const DEFAULT_VOLUME_TYPE: &str = "gp2";
pub const DEFAULT_SSH_PUBLIC_KEY_PATH: &str = "~/.ssh/id_rsa.pub";

pub const CLUSTER_NAME_LABEL: &str = "ngctl.io/cluster-name";
pub const NODEGROUP_NAME_LABEL: &str = "ngctl.io/nodegroup-name";
pub const CAPACITY_TYPE_LABEL: &str = "ngctl.io/capacity-type";

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    pub metadata: ClusterMeta,
    #[serde(default)]
    pub node_groups: Vec<NodeGroup>,
}

fn default_api_version() -> String {
    API_VERSION.to_string()
}

fn default_kind() -> String {
    CLUSTER_CONFIG_KIND.to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            api_version: default_api_version(),
            kind: default_kind(),
            metadata: ClusterMeta::default(),
            node_groups: vec![],
        }
    }
}

impl ClusterConfig {
    /// Append a nodegroup with defaults applied and return it for further setup
    pub fn new_node_group(&mut self) -> &mut NodeGroup {
        self.node_groups.push(NodeGroup::default());
        let last = self.node_groups.len() - 1;
        &mut self.node_groups[last]
    }

    pub fn node_group_names(&self) -> Vec<&str> {
        self.node_groups.iter().map(|ng| ng.name.as_str()).collect()
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct ClusterMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub region: String,
    /// `auto`, `latest` or one of [`SUPPORTED_VERSIONS`]
    #[serde(default)]
    pub version: String,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash, JsonSchema)]
pub enum AmiFamily {
    #[default]
    AmazonLinux2,
    Ubuntu1804,
}

impl fmt::Display for AmiFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AmazonLinux2 => f.write_str("AmazonLinux2"),
            Self::Ubuntu1804 => f.write_str("Ubuntu1804"),
        }
    }
}

impl std::str::FromStr for AmiFamily {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "AmazonLinux2" => Ok(Self::AmazonLinux2),
            "Ubuntu1804" => Ok(Self::Ubuntu1804),
            other => Err(crate::Error::validation(format!(
                "unsupported AMI family {other:?}, supported values: AmazonLinux2, Ubuntu1804"
            ))),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Validate, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroup {
    #[garde(length(min = 1))]
    #[serde(default)]
    pub name: String,
    #[garde(length(min = 1))]
    #[serde(default = "default_instance_type")]
    pub instance_type: String,
    #[garde(custom(within_scaling_bounds(self.min_size, self.max_size)))]
    #[serde(default = "default_node_count")]
    pub desired_capacity: u32,
    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_size: Option<u32>,
    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_size: Option<u32>,
    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_size: Option<u32>,
    #[garde(skip)]
    #[serde(default = "default_volume_type")]
    pub volume_type: String,
    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pods_per_node: Option<u32>,
    /// Explicit image reference, resolved from the catalog when empty
    #[garde(skip)]
    #[serde(default)]
    pub ami: String,
    #[garde(skip)]
    #[serde(default)]
    pub ami_family: AmiFamily,
    #[garde(skip)]
    #[serde(default, rename = "allowSSH")]
    pub allow_ssh: bool,
    #[garde(custom(required_with_ssh(self.allow_ssh)))]
    #[serde(default = "default_ssh_public_key_path")]
    pub ssh_public_key_path: String,
    #[garde(skip)]
    #[serde(default)]
    pub private_networking: bool,
    #[garde(custom(supported_security_groups))]
    #[serde(default)]
    pub security_groups: NodeGroupSecurityGroups,
    #[garde(skip)]
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// A machine deployment has a single failure domain
    #[garde(custom(at_most_one_zone))]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub availability_zones: Vec<String>,
    #[garde(skip)]
    #[serde(default)]
    pub iam: NodeGroupIam,
    /// Key material handle filled in during resolution
    #[garde(skip)]
    #[serde(skip)]
    pub ssh_key: Option<KeyHandle>,
}

fn default_instance_type() -> String {
    DEFAULT_INSTANCE_TYPE.to_string()
}

fn default_node_count() -> u32 {
    DEFAULT_NODE_COUNT
}

fn default_volume_type() -> String {
    DEFAULT_VOLUME_TYPE.to_string()
}

fn default_ssh_public_key_path() -> String {
    DEFAULT_SSH_PUBLIC_KEY_PATH.to_string()
}

impl Default for NodeGroup {
    fn default() -> Self {
        Self {
            name: String::new(),
            instance_type: default_instance_type(),
            desired_capacity: DEFAULT_NODE_COUNT,
            min_size: None,
            max_size: None,
            volume_size: None,
            volume_type: default_volume_type(),
            max_pods_per_node: None,
            ami: String::new(),
            ami_family: AmiFamily::default(),
            allow_ssh: false,
            ssh_public_key_path: default_ssh_public_key_path(),
            private_networking: false,
            security_groups: NodeGroupSecurityGroups::default(),
            labels: BTreeMap::new(),
            availability_zones: vec![],
            iam: NodeGroupIam::default(),
            ssh_key: None,
        }
    }
}

impl NodeGroup {
    /// Number of nodes that must report ready before the nodegroup is considered joined
    pub fn expected_ready_nodes(&self) -> u32 {
        self.min_size.unwrap_or(self.desired_capacity)
    }
}

fn within_scaling_bounds(
    min: Option<u32>,
    max: Option<u32>,
) -> impl FnOnce(&u32, &()) -> garde::Result {
    move |desired, _| {
        if let Some(min) = min {
            if min > *desired {
                return Err(garde::Error::new(format!(
                    "minimum size {min} is greater than desired capacity {desired}"
                )));
            }
        }
        if let Some(max) = max {
            if max < *desired {
                return Err(garde::Error::new(format!(
                    "maximum size {max} is less than desired capacity {desired}"
                )));
            }
        }
        Ok(())
    }
}

fn required_with_ssh(allow_ssh: bool) -> impl FnOnce(&String, &()) -> garde::Result {
    move |path, _| {
        if allow_ssh && path.is_empty() {
            return Err(garde::Error::new(
                "a public key path is required when SSH access is allowed",
            ));
        }
        Ok(())
    }
}

#[allow(clippy::ptr_arg)]
fn at_most_one_zone(zones: &Vec<String>, _: &()) -> garde::Result {
    if zones.len() > 1 {
        return Err(garde::Error::new(format!(
            "nodes can be placed in at most one availability zone, got {}",
            zones.join(", ")
        )));
    }
    Ok(())
}

// Cluster API always attaches the cluster's node security group and never
// creates one per nodegroup.
fn supported_security_groups(groups: &NodeGroupSecurityGroups, _: &()) -> garde::Result {
    if groups.with_shared == Some(false) {
        return Err(garde::Error::new(
            "withShared: false is not supported, nodes always join the shared security group",
        ));
    }
    if groups.with_local == Some(true) {
        return Err(garde::Error::new(
            "withLocal: true is not supported, attach existing groups via attachIDs instead",
        ));
    }
    Ok(())
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroupSecurityGroups {
    #[serde(default, rename = "attachIDs", skip_serializing_if = "Vec::is_empty")]
    pub attach_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with_shared: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with_local: Option<bool>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroupIam {
    /// Role the nodes run as, required for registration with the control plane
    #[serde(default, rename = "instanceRoleARN", skip_serializing_if = "Option::is_none")]
    pub instance_role_arn: Option<String>,
    #[serde(default)]
    pub with_addon_policies: AddonPolicies,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AddonPolicies {
    #[serde(default)]
    pub auto_scaler: bool,
    #[serde(default, rename = "externalDNS")]
    pub external_dns: bool,
    #[serde(default)]
    pub image_builder: bool,
}

impl AddonPolicies {
    pub fn enabled(&self) -> Vec<&'static str> {
        [
            (self.auto_scaler, "auto-scaler"),
            (self.external_dns, "external-dns"),
            (self.image_builder, "image-builder"),
        ]
        .into_iter()
        .filter_map(|(on, name)| on.then_some(name))
        .collect()
    }
}

/// Resolve a nodegroup name from the `--name` flag and the positional argument.
///
/// Returns `None` when both are given and disagree. When neither is given a
/// name of the form `ng-xxxxxxxx` is generated.
pub fn node_group_name(flag: &str, arg: &str) -> Option<String> {
    match (flag.is_empty(), arg.is_empty()) {
        (false, false) if flag != arg => None,
        (false, _) => Some(flag.to_string()),
        (true, false) => Some(arg.to_string()),
        (true, true) => Some(generate_node_group_name()),
    }
}

pub fn generate_node_group_name() -> String {
    format!("ng-{:08x}", rand::rng().random::<u32>())
}

/// Whether the instance type carries GPUs that need a device plugin
pub fn is_gpu_instance_type(instance_type: &str) -> bool {
    ["p2", "p3", "g3", "g4"]
        .iter()
        .any(|family| instance_type.starts_with(family))
}
