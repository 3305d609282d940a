use std::{collections::BTreeSet, path::PathBuf};

use garde::Validate;

use crate::{
    Error, Result,
    api::{ClusterConfig, NodeGroup, node_group_name},
    loader::SpecLoader,
};

use super::{ProviderConfig, ProvisionOptions};

/// Flags that describe the cluster or nodegroup and so can't be combined with a document
pub const DOCUMENT_INCOMPATIBLE_FLAGS: &[&str] = &[
    "name",
    "cluster",
    "version",
    "region",
    "nodes",
    "nodes-min",
    "nodes-max",
    "node-type",
    "node-volume-size",
    "node-volume-type",
    "max-pods-per-node",
    "node-ami",
    "node-ami-family",
    "ssh-access",
    "ssh-public-key",
    "node-private-networking",
    "node-security-groups",
    "node-labels",
    "node-zones",
    "asg-access",
    "external-dns-access",
    "full-ecr-access",
    "node-instance-role-arn",
];

/// Where the configuration came from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigSource {
    Document(PathBuf),
    Flags,
}

impl ConfigSource {
    /// How the operator asks for the control plane version in this source
    pub fn version_hint(&self) -> &'static str {
        match self {
            Self::Document(_) => "metadata.version: auto",
            Self::Flags => "--version=auto",
        }
    }
}

#[derive(Debug)]
pub struct Arbitrated {
    pub spec: ClusterConfig,
    pub source: ConfigSource,
    pub provider: ProviderConfig,
}

/// Settle the configuration source and validate the configuration it produced
pub fn arbitrate(
    spec: ClusterConfig,
    options: &ProvisionOptions,
    loader: &dyn SpecLoader,
) -> Result<Arbitrated> {
    if options.config_file.is_empty() {
        from_flags(spec, options)
    } else {
        from_document(options, loader)
    }
}

fn from_document(options: &ProvisionOptions, loader: &dyn SpecLoader) -> Result<Arbitrated> {
    let path = PathBuf::from(&options.config_file);
    let spec = loader.load(&path)?;

    if spec.metadata.name.is_empty() {
        return Err(Error::validation("metadata.name must be set"));
    }
    if spec.metadata.region.is_empty() {
        return Err(Error::validation("metadata.region must be set"));
    }

    let provider = ProviderConfig {
        region: spec.metadata.region.clone(),
    };

    if let Some(flag) = DOCUMENT_INCOMPATIBLE_FLAGS
        .iter()
        .find(|f| options.changed_flags.contains(**f))
    {
        return Err(Error::validation(format!(
            "cannot use --{flag} when --config-file/-f is set"
        )));
    }

    if spec.node_groups.is_empty() {
        return Err(Error::validation(format!(
            "no nodegroups defined in {}",
            path.display()
        )));
    }
    check_node_groups(&spec.node_groups)?;

    Ok(Arbitrated {
        spec,
        source: ConfigSource::Document(path),
        provider,
    })
}

fn from_flags(mut spec: ClusterConfig, options: &ProvisionOptions) -> Result<Arbitrated> {
    if spec.metadata.name.is_empty() {
        return Err(Error::validation("--cluster must be set"));
    }
    if !options.only.is_empty() {
        return Err(Error::validation(
            "cannot use --only unless a config file is specified via --config-file/-f",
        ));
    }

    if spec.metadata.region.is_empty() {
        spec.metadata.region = options.provider.region.clone();
    }
    if spec.metadata.region.is_empty() {
        return Err(Error::validation("--region must be set"));
    }

    if spec.node_groups.is_empty() {
        spec.new_node_group();
    }

    for ng in &mut spec.node_groups {
        if ng.allow_ssh && ng.ssh_public_key_path.is_empty() {
            return Err(Error::validation("--ssh-public-key must be non-empty string"));
        }

        ng.name = node_group_name(&ng.name, &options.name_arg).ok_or_else(|| {
            Error::validation(format!(
                "--name={} and argument {} cannot be used at the same time",
                ng.name, options.name_arg
            ))
        })?;
    }
    check_node_groups(&spec.node_groups)?;

    let provider = ProviderConfig {
        region: spec.metadata.region.clone(),
    };

    Ok(Arbitrated {
        spec,
        source: ConfigSource::Flags,
        provider,
    })
}

/// Field rules of every nodegroup, and name uniqueness across them
fn check_node_groups(node_groups: &[NodeGroup]) -> Result<()> {
    let mut seen = BTreeSet::new();

    for ng in node_groups {
        ng.validate()
            .map_err(|report| Error::validation(format!("nodegroup {:?}: {report}", ng.name)))?;

        if !seen.insert(ng.name.as_str()) {
            return Err(Error::validation(format!(
                "nodegroup name {:?} is used more than once",
                ng.name
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{api::ClusterMeta, loader::MockSpecLoader};

    fn document(name: &str, region: &str, node_groups: &[&str]) -> ClusterConfig {
        ClusterConfig {
            metadata: ClusterMeta {
                name: name.to_string(),
                region: region.to_string(),
                version: "auto".to_string(),
            },
            node_groups: node_groups
                .iter()
                .map(|ng| NodeGroup {
                    name: ng.to_string(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    fn document_options() -> ProvisionOptions {
        ProvisionOptions {
            config_file: "cluster.yaml".to_string(),
            ..Default::default()
        }
    }

    fn loader_returning(config: ClusterConfig) -> MockSpecLoader {
        let mut loader = MockSpecLoader::new();
        loader
            .expect_load()
            .times(1)
            .returning(move |_| Ok(config.clone()));
        loader
    }

    fn flag_spec(cluster: &str) -> ClusterConfig {
        let mut spec = ClusterConfig {
            metadata: ClusterMeta {
                name: cluster.to_string(),
                region: "us-west-2".to_string(),
                version: "auto".to_string(),
            },
            ..Default::default()
        };
        spec.new_node_group();
        spec
    }

    #[test]
    fn document_replaces_flag_values_and_sets_region() {
        let loader = loader_returning(document("prod", "eu-west-1", &["ng-1"]));

        let arbitrated = arbitrate(flag_spec("ignored"), &document_options(), &loader).unwrap();
        assert_eq!(arbitrated.spec.metadata.name, "prod");
        assert_eq!(arbitrated.provider.region, "eu-west-1");
        assert_eq!(
            arbitrated.source,
            ConfigSource::Document(PathBuf::from("cluster.yaml"))
        );
    }

    #[test]
    fn document_requires_name_and_region() {
        let loader = loader_returning(document("", "eu-west-1", &["ng-1"]));
        let err = arbitrate(ClusterConfig::default(), &document_options(), &loader).unwrap_err();
        assert_eq!(err.to_string(), "metadata.name must be set");

        let loader = loader_returning(document("prod", "", &["ng-1"]));
        let err = arbitrate(ClusterConfig::default(), &document_options(), &loader).unwrap_err();
        assert_eq!(err.to_string(), "metadata.region must be set");
    }

    #[test]
    fn document_rejects_discrete_flags() {
        let loader = loader_returning(document("prod", "eu-west-1", &["ng-1"]));
        let options = ProvisionOptions {
            changed_flags: ["node-type".to_string(), "only".to_string()].into(),
            ..document_options()
        };

        let err = arbitrate(ClusterConfig::default(), &options, &loader).unwrap_err();
        assert_eq!(
            err.to_string(),
            "cannot use --node-type when --config-file/-f is set"
        );
    }

    #[test]
    fn document_rejects_duplicate_names() {
        let loader = loader_returning(document("prod", "eu-west-1", &["ng-1", "ng-1"]));
        let err = arbitrate(ClusterConfig::default(), &document_options(), &loader).unwrap_err();
        assert!(err.to_string().contains("used more than once"));
    }

    #[test]
    fn flags_require_cluster_and_forbid_filter() {
        let loader = MockSpecLoader::new();

        let err = arbitrate(flag_spec(""), &ProvisionOptions::default(), &loader).unwrap_err();
        assert_eq!(err.to_string(), "--cluster must be set");

        let options = ProvisionOptions {
            only: "ng-*".to_string(),
            ..Default::default()
        };
        let err = arbitrate(flag_spec("prod"), &options, &loader).unwrap_err();
        assert!(err.to_string().starts_with("cannot use --only"));
    }

    #[test]
    fn flags_require_key_with_ssh() {
        let mut spec = flag_spec("prod");
        spec.node_groups[0].allow_ssh = true;
        spec.node_groups[0].ssh_public_key_path = String::new();

        let err =
            arbitrate(spec, &ProvisionOptions::default(), &MockSpecLoader::new()).unwrap_err();
        assert_eq!(err.to_string(), "--ssh-public-key must be non-empty string");
    }

    #[test]
    fn flags_resolve_nodegroup_name() {
        let loader = MockSpecLoader::new();
        let options = ProvisionOptions {
            name_arg: "workers".to_string(),
            ..Default::default()
        };

        let arbitrated = arbitrate(flag_spec("prod"), &options, &loader).unwrap();
        assert_eq!(arbitrated.spec.node_group_names(), vec!["workers"]);
        assert_eq!(arbitrated.source, ConfigSource::Flags);

        let mut spec = flag_spec("prod");
        spec.node_groups[0].name = "other".to_string();
        let err = arbitrate(spec, &options, &loader).unwrap_err();
        assert!(err.to_string().contains("cannot be used at the same time"));

        let arbitrated =
            arbitrate(flag_spec("prod"), &ProvisionOptions::default(), &loader).unwrap();
        assert!(arbitrated.spec.node_groups[0].name.starts_with("ng-"));
    }

    #[test]
    fn flags_take_region_from_provider() {
        let mut spec = flag_spec("prod");
        spec.metadata.region = String::new();

        let err = arbitrate(spec.clone(), &ProvisionOptions::default(), &MockSpecLoader::new())
            .unwrap_err();
        assert_eq!(err.to_string(), "--region must be set");

        let options = ProvisionOptions {
            provider: ProviderConfig {
                region: "ap-south-1".to_string(),
            },
            ..Default::default()
        };
        let arbitrated = arbitrate(spec, &options, &MockSpecLoader::new()).unwrap();
        assert_eq!(arbitrated.spec.metadata.region, "ap-south-1");
    }
}
