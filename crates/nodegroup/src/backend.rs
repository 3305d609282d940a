use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::future::join_all;
use kube::{
    Api, Client,
    api::{DynamicObject, Patch, PatchParams},
    discovery::ApiResource,
};
#[cfg(test)]
use mockall::automock;
use serde_json::{Value, json};
use tracing::{Level, instrument};

use crate::{
    Error, Result,
    api::{ClusterMeta, NodeGroup},
    maxpods::max_pods,
    provision::dispatch::OutcomeSet,
};

const MANAGER_NAME: &str = "ngctl";

const DEFAULT_NODE_INSTANCE_PROFILE: &str = "nodes.cluster-api-provider-aws.sigs.k8s.io";
const AUTOSCALER_MIN_SIZE: &str = "cluster.x-k8s.io/cluster-api-autoscaler-node-group-min-size";
const AUTOSCALER_MAX_SIZE: &str = "cluster.x-k8s.io/cluster-api-autoscaler-node-group-max-size";
const ADDON_POLICIES_ANNOTATION: &str = "ngctl.io/addon-policies";
pub const STACK_NAME_LABEL: &str = "ngctl.io/stack-name";

/// What the backend reports for a nodegroup it created
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnitStack {
    pub stack_name: String,
    /// Role the nodes run as, needed to authorise them to join
    pub instance_role_arn: Option<String>,
}

/// Materialises nodegroups into infrastructure.
///
/// Each unit is attempted independently. Individual failures are reported in
/// the returned [`OutcomeSet`]; `Err` is reserved for failures of the whole call.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StackBackend: Send + Sync {
    async fn submit_batch(&self, cluster: &ClusterMeta, units: &[NodeGroup]) -> Result<OutcomeSet>;
}

pub fn stack_name(cluster: &str, nodegroup: &str) -> String {
    format!("ngctl-{cluster}-nodegroup-{nodegroup}")
}

/// One Cluster API object belonging to a nodegroup stack
#[derive(Clone, Debug)]
pub struct StackObject {
    pub resource: ApiResource,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub spec: Value,
}

impl StackObject {
    fn to_dynamic(&self, namespace: &str) -> Result<DynamicObject> {
        Ok(serde_json::from_value(json!({
            "apiVersion": self.resource.api_version,
            "kind": self.resource.kind,
            "metadata": {
                "name": self.name,
                "namespace": namespace,
                "labels": self.labels,
                "annotations": self.annotations,
            },
            "spec": self.spec,
        }))?)
    }
}

fn resource(group: &str, version: &str, kind: &str, plural: &str) -> ApiResource {
    ApiResource {
        group: group.to_string(),
        version: version.to_string(),
        api_version: format!("{group}/{version}"),
        kind: kind.to_string(),
        plural: plural.to_string(),
    }
}

fn machine_deployment_resource() -> ApiResource {
    resource("cluster.x-k8s.io", "v1beta1", "MachineDeployment", "machinedeployments")
}

fn machine_template_resource() -> ApiResource {
    resource(
        "infrastructure.cluster.x-k8s.io",
        "v1beta2",
        "AWSMachineTemplate",
        "awsmachinetemplates",
    )
}

fn bootstrap_template_resource() -> ApiResource {
    resource(
        "bootstrap.cluster.x-k8s.io",
        "v1beta1",
        "KubeadmConfigTemplate",
        "kubeadmconfigtemplates",
    )
}

/// Build the Cluster API objects for one nodegroup, dependencies first
pub fn stack_objects(cluster: &ClusterMeta, ng: &NodeGroup) -> Vec<StackObject> {
    let name = stack_name(&cluster.name, &ng.name);
    let labels = BTreeMap::from([
        ("cluster.x-k8s.io/cluster-name".to_string(), cluster.name.clone()),
        (STACK_NAME_LABEL.to_string(), name.clone()),
    ]);

    let mut machine = json!({
        "instanceType": ng.instance_type,
        "ami": { "id": ng.ami },
        "iamInstanceProfile": DEFAULT_NODE_INSTANCE_PROFILE,
        "publicIP": !ng.private_networking,
        "rootVolume": {
            "size": ng.volume_size.unwrap_or(20),
            "type": ng.volume_type,
        },
    });
    if let Some(key) = &ng.ssh_key {
        machine["sshKeyName"] = json!(key.name);
    }
    if !ng.security_groups.attach_ids.is_empty() {
        machine["additionalSecurityGroups"] = ng
            .security_groups
            .attach_ids
            .iter()
            .map(|id| json!({ "id": id }))
            .collect();
    }

    let mut template_annotations = BTreeMap::new();
    let addons = ng.iam.with_addon_policies.enabled();
    if !addons.is_empty() {
        template_annotations.insert(ADDON_POLICIES_ANNOTATION.to_string(), addons.join(","));
    }

    let mut kubelet_args = BTreeMap::new();
    if !ng.labels.is_empty() {
        kubelet_args.insert(
            "node-labels".to_string(),
            ng.labels
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(","),
        );
    }
    if let Some(pods) = ng.max_pods_per_node.or_else(|| max_pods(&ng.instance_type)) {
        kubelet_args.insert("max-pods".to_string(), pods.to_string());
    }

    let mut deployment_annotations = BTreeMap::new();
    if ng.iam.with_addon_policies.auto_scaler {
        deployment_annotations.insert(
            AUTOSCALER_MIN_SIZE.to_string(),
            ng.min_size.unwrap_or(ng.desired_capacity).to_string(),
        );
        deployment_annotations.insert(
            AUTOSCALER_MAX_SIZE.to_string(),
            ng.max_size.unwrap_or(ng.desired_capacity).to_string(),
        );
    }

    let mut machine_spec = json!({
        "clusterName": cluster.name,
        "version": format!("v{}.0", cluster.version),
        "bootstrap": {
            "configRef": {
                "apiVersion": bootstrap_template_resource().api_version,
                "kind": "KubeadmConfigTemplate",
                "name": name,
            }
        },
        "infrastructureRef": {
            "apiVersion": machine_template_resource().api_version,
            "kind": "AWSMachineTemplate",
            "name": name,
        },
    });
    if let [zone] = ng.availability_zones.as_slice() {
        machine_spec["failureDomain"] = json!(zone);
    }

    vec![
        StackObject {
            resource: machine_template_resource(),
            name: name.clone(),
            labels: labels.clone(),
            annotations: template_annotations,
            spec: json!({ "template": { "spec": machine } }),
        },
        StackObject {
            resource: bootstrap_template_resource(),
            name: name.clone(),
            labels: labels.clone(),
            annotations: BTreeMap::new(),
            spec: json!({
                "template": {
                    "spec": {
                        "joinConfiguration": {
                            "nodeRegistration": {
                                "name": "{{ ds.meta_data.local_hostname }}",
                                "kubeletExtraArgs": kubelet_args,
                            }
                        }
                    }
                }
            }),
        },
        StackObject {
            resource: machine_deployment_resource(),
            name: name.clone(),
            labels,
            annotations: deployment_annotations,
            spec: json!({
                "clusterName": cluster.name,
                "replicas": ng.desired_capacity,
                "selector": { "matchLabels": { STACK_NAME_LABEL: name } },
                "template": {
                    "metadata": { "labels": { STACK_NAME_LABEL: name } },
                    "spec": machine_spec,
                },
            }),
        },
    ]
}

/// [`StackBackend`] that server-side applies Cluster API objects to a management cluster
pub struct CapiStackBackend {
    client: Client,
    namespace: String,
}

impl CapiStackBackend {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    #[instrument(level = Level::DEBUG, skip(self, cluster, ng), fields(nodegroup = %ng.name))]
    async fn create_stack(&self, cluster: &ClusterMeta, ng: &NodeGroup) -> Result<UnitStack> {
        let pp = PatchParams::apply(MANAGER_NAME).force();
        let name = stack_name(&cluster.name, &ng.name);

        tracing::info!("creating stack {name:?} for nodegroup {:?}", ng.name);

        for object in stack_objects(cluster, ng) {
            let api = Api::<DynamicObject>::namespaced_with(
                self.client.clone(),
                &self.namespace,
                &object.resource,
            );
            api.patch(
                &object.name,
                &pp,
                &Patch::Apply(&object.to_dynamic(&self.namespace)?),
            )
            .await
            .map_err(|e| {
                Error::provisioning(&ng.name, format!("applying {}: {e}", object.resource.kind))
            })?;
        }

        Ok(UnitStack {
            stack_name: name,
            instance_role_arn: ng.iam.instance_role_arn.clone(),
        })
    }
}

#[async_trait]
impl StackBackend for CapiStackBackend {
    async fn submit_batch(&self, cluster: &ClusterMeta, units: &[NodeGroup]) -> Result<OutcomeSet> {
        let results = join_all(units.iter().map(|ng| self.create_stack(cluster, ng))).await;

        let mut outcomes = OutcomeSet::new();
        for (ng, result) in units.iter().zip(results) {
            outcomes.insert(&ng.name, result);
        }
        Ok(outcomes)
    }
}
