use tracing::{Level, instrument};

use crate::{
    Error, Result,
    api::{
        CAPACITY_TYPE_LABEL, CLUSTER_NAME_LABEL, ClusterConfig, ClusterMeta, NODEGROUP_NAME_LABEL,
        NodeGroup,
    },
    images::ImageResolver,
    keys::KeyProvider,
    maxpods::max_pods,
};

/// Resolve every nodegroup in order, stopping at the first failure.
///
/// Nothing has been created when this runs, so any failure leaves the
/// infrastructure untouched.
pub async fn resolve_units(
    spec: &mut ClusterConfig,
    images: &dyn ImageResolver,
    keys: &dyn KeyProvider,
) -> Result<()> {
    let meta = spec.metadata.clone();
    for ng in &mut spec.node_groups {
        resolve_unit(&meta, ng, images, keys).await?;
    }
    Ok(())
}

#[instrument(level = Level::DEBUG, skip_all, fields(nodegroup = %ng.name))]
pub async fn resolve_unit(
    meta: &ClusterMeta,
    ng: &mut NodeGroup,
    images: &dyn ImageResolver,
    keys: &dyn KeyProvider,
) -> Result<()> {
    if ng.ami.is_empty() {
        ng.ami = images
            .resolve_image(&ng.instance_type, ng.ami_family, &meta.version)
            .await
            .map_err(|e| attribute(&ng.name, e))?;
    }
    tracing::info!(
        "nodegroup {:?} will use {:?} [{}/{}]",
        ng.name,
        ng.ami,
        ng.ami_family,
        meta.version
    );

    check_max_pods(ng)?;
    add_derived_labels(meta, ng);

    if ng.allow_ssh {
        let key = keys
            .ensure_key(&meta.name, ng)
            .await
            .map_err(|e| attribute(&ng.name, e))?;
        ng.ssh_key = Some(key);
    }

    Ok(())
}

/// Labels every node of the nodegroup carries; operator supplied values win
pub fn add_derived_labels(meta: &ClusterMeta, ng: &mut NodeGroup) {
    for (key, value) in [
        (CLUSTER_NAME_LABEL, meta.name.as_str()),
        (NODEGROUP_NAME_LABEL, ng.name.as_str()),
        (CAPACITY_TYPE_LABEL, "on-demand"),
    ] {
        ng.labels
            .entry(key.to_string())
            .or_insert_with(|| value.to_string());
    }
}

fn check_max_pods(ng: &NodeGroup) -> Result<()> {
    let (Some(requested), Some(limit)) = (ng.max_pods_per_node, max_pods(&ng.instance_type)) else {
        return Ok(());
    };

    if requested > limit {
        return Err(Error::resolution(
            &ng.name,
            format!(
                "max pods per node {requested} exceeds the {limit} supported by instance type {}",
                ng.instance_type
            ),
        ));
    }
    Ok(())
}

fn attribute(unit: &str, err: Error) -> Error {
    match err {
        err @ Error::Resolution { .. } => err,
        err => Error::resolution(unit, err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{images::MockImageResolver, keys::KeyHandle, keys::MockKeyProvider};

    fn spec(units: &[(&str, &str)]) -> ClusterConfig {
        ClusterConfig {
            metadata: ClusterMeta {
                name: "prod".to_string(),
                region: "us-west-2".to_string(),
                version: "1.14".to_string(),
            },
            node_groups: units
                .iter()
                .map(|(name, instance_type)| NodeGroup {
                    name: name.to_string(),
                    instance_type: instance_type.to_string(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn resolves_images_and_labels() {
        let mut spec = spec(&[("ng-1", "m5.large")]);
        spec.node_groups[0]
            .labels
            .insert(CAPACITY_TYPE_LABEL.to_string(), "reserved".to_string());

        let mut images = MockImageResolver::new();
        images
            .expect_resolve_image()
            .withf(|t, _, v| t == "m5.large" && v == "1.14")
            .returning(|_, _, _| Ok("ami-123".to_string()));
        let mut keys = MockKeyProvider::new();
        keys.expect_ensure_key().never();

        resolve_units(&mut spec, &images, &keys).await.unwrap();

        let ng = &spec.node_groups[0];
        assert_eq!(ng.ami, "ami-123");
        assert_eq!(ng.labels[CLUSTER_NAME_LABEL], "prod");
        assert_eq!(ng.labels[NODEGROUP_NAME_LABEL], "ng-1");
        assert_eq!(ng.labels[CAPACITY_TYPE_LABEL], "reserved");
        assert_eq!(ng.ssh_key, None);
    }

    #[tokio::test]
    async fn explicit_image_is_kept() {
        let mut spec = spec(&[("ng-1", "m5.large")]);
        spec.node_groups[0].ami = "ami-explicit".to_string();

        let mut images = MockImageResolver::new();
        images.expect_resolve_image().never();

        resolve_units(&mut spec, &images, &MockKeyProvider::new())
            .await
            .unwrap();
        assert_eq!(spec.node_groups[0].ami, "ami-explicit");
    }

    #[tokio::test]
    async fn loads_keys_when_ssh_is_allowed() {
        let mut spec = spec(&[("ng-1", "m5.large")]);
        spec.node_groups[0].allow_ssh = true;
        spec.node_groups[0].ami = "ami-1".to_string();

        let mut keys = MockKeyProvider::new();
        keys.expect_ensure_key()
            .withf(|cluster, unit| cluster == "prod" && unit.name == "ng-1")
            .times(1)
            .returning(|_, _| {
                Ok(KeyHandle {
                    name: "ngctl-prod-ab".to_string(),
                    fingerprint: "ab".to_string(),
                })
            });

        resolve_units(&mut spec, &MockImageResolver::new(), &keys)
            .await
            .unwrap();
        assert_eq!(
            spec.node_groups[0].ssh_key.as_ref().map(|k| k.name.as_str()),
            Some("ngctl-prod-ab")
        );
    }

    #[tokio::test]
    async fn stops_at_first_failing_unit() {
        let mut spec = spec(&[("ng-1", "m5.large"), ("ng-2", "x1.weird"), ("ng-3", "m5.large")]);

        let mut images = MockImageResolver::new();
        images
            .expect_resolve_image()
            .withf(|t, _, _| t == "x1.weird")
            .times(1)
            .returning(|_, _, _| Err(Error::validation("no image")));
        images
            .expect_resolve_image()
            .withf(|t, _, _| t == "m5.large")
            .times(1)
            .returning(|_, _, _| Ok("ami-1".to_string()));

        let err = resolve_units(&mut spec, &images, &MockKeyProvider::new())
            .await
            .unwrap_err();
        assert_eq!(err.unit(), Some("ng-2"));
        assert!(matches!(err, Error::Resolution { .. }));
        assert!(spec.node_groups[2].ami.is_empty());
    }

    #[tokio::test]
    async fn rejects_pod_density_above_instance_limit() {
        let mut spec = spec(&[("ng-1", "t3.micro")]);
        spec.node_groups[0].ami = "ami-1".to_string();
        spec.node_groups[0].max_pods_per_node = Some(10);

        let err = resolve_units(&mut spec, &MockImageResolver::new(), &MockKeyProvider::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exceeds the 4 supported"));
    }
}
