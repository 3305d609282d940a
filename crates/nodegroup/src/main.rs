use std::{collections::BTreeSet, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use clap::{
    ArgAction, ArgMatches, CommandFactory, FromArgMatches, Parser, Subcommand,
    parser::ValueSource,
};
use kube::Client;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use nodegroup::{
    api::{
        AUTO_VERSION, AmiFamily, ClusterConfig, DEFAULT_INSTANCE_TYPE, DEFAULT_NODE_COUNT,
        DEFAULT_SSH_PUBLIC_KEY_PATH, DEFAULT_VOLUME_TYPE,
    },
    backend::CapiStackBackend,
    cluster::KubeControlPlane,
    compat::VersionSkewValidator,
    images::ImageCatalog,
    keys::{KeyStore, SecretKeyRegistry},
    loader::FileLoader,
    provision::{
        Collaborators, ProviderConfig, ProvisionOptions, ProvisionReport, provision,
        source::DOCUMENT_INCOMPATIBLE_FLAGS,
    },
};

#[derive(Debug, Clone, Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Subcommand)]
enum Commands {
    /// Create a resource
    #[command(subcommand)]
    Create(CreateTarget),
    /// Output the JSON schema of the cluster configuration document
    Schema,
}

#[derive(Debug, Clone, Subcommand)]
enum CreateTarget {
    /// Create one or more nodegroups in an existing cluster
    #[command(alias = "ng")]
    Nodegroup(NodeGroupArgs),
}

#[derive(Debug, Clone, clap::Args)]
struct NodeGroupArgs {
    /// Nodegroup name, generated when unset
    #[arg(value_name = "NAME")]
    name_arg: Option<String>,

    /// Load configuration from a file, or stdin if set to '-'
    #[arg(short = 'f', long, default_value = "")]
    config_file: String,

    /// Select a subset of nodegroups via comma separated glob patterns, e.g. 'ng-*,ng-[ab]'
    #[arg(long, default_value = "")]
    only: String,

    /// Add the nodegroup role to the aws-auth ConfigMap and wait for nodes to join
    #[arg(long, action = ArgAction::Set, default_value_t = true)]
    update_auth_configmap: bool,

    /// How long to wait for nodes of each nodegroup to become ready
    #[arg(long, default_value = "25m", value_parser = humantime::parse_duration)]
    timeout: Duration,

    /// YAML image catalog used when --node-ami is not set
    #[arg(long, env = "NGCTL_IMAGE_CATALOG")]
    image_catalog: Option<PathBuf>,

    /// Namespace of the Cluster API objects and imported keys in the management cluster
    #[arg(long, env = "NGCTL_CAPI_NAMESPACE", default_value = "default")]
    capi_namespace: String,

    /// Name of the nodegroup
    #[arg(short, long, default_value = "")]
    name: String,

    /// Name of the cluster
    #[arg(long, default_value = "")]
    cluster: String,

    /// Kubernetes version, 'auto' to match the control plane or 'latest'
    #[arg(long, default_value = AUTO_VERSION)]
    version: String,

    /// Region to use
    #[arg(short, long, env = "AWS_REGION", default_value = "")]
    region: String,

    /// Total number of nodes (desired capacity)
    #[arg(short = 'N', long, default_value_t = DEFAULT_NODE_COUNT)]
    nodes: u32,

    /// Minimum nodes in the autoscaling group
    #[arg(short = 'm', long)]
    nodes_min: Option<u32>,

    /// Maximum nodes in the autoscaling group
    #[arg(short = 'M', long)]
    nodes_max: Option<u32>,

    /// Node instance type
    #[arg(short = 't', long, default_value = DEFAULT_INSTANCE_TYPE)]
    node_type: String,

    /// Node volume size in GB
    #[arg(long)]
    node_volume_size: Option<u32>,

    /// Node volume type
    #[arg(long, default_value = DEFAULT_VOLUME_TYPE)]
    node_volume_type: String,

    /// Maximum number of pods per node, set automatically when unset
    #[arg(long)]
    max_pods_per_node: Option<u32>,

    /// Explicit image reference, resolved from the image catalog when unset
    #[arg(long, default_value = "")]
    node_ami: String,

    /// Image family: AmazonLinux2 or Ubuntu1804
    #[arg(long, default_value = "AmazonLinux2")]
    node_ami_family: AmiFamily,

    /// Allow SSH access to nodes
    #[arg(long)]
    ssh_access: bool,

    /// Public key to import for SSH access
    #[arg(long, default_value = DEFAULT_SSH_PUBLIC_KEY_PATH)]
    ssh_public_key: String,

    /// Make nodegroup networking private
    #[arg(short = 'P', long)]
    node_private_networking: bool,

    /// Attach additional security groups to nodes
    #[arg(long, value_delimiter = ',')]
    node_security_groups: Vec<String>,

    /// Extra labels to add when registering the nodes, e.g. 'partition=backend,nodeclass=gpu'
    #[arg(long, value_delimiter = ',')]
    node_labels: Vec<String>,

    /// Availability zones where the nodes are placed
    #[arg(long, value_delimiter = ',')]
    node_zones: Vec<String>,

    /// Enable IAM policy for cluster-autoscaler
    #[arg(long)]
    asg_access: bool,

    /// Enable IAM policy for external-dns
    #[arg(long)]
    external_dns_access: bool,

    /// Enable full access to ECR
    #[arg(long)]
    full_ecr_access: bool,

    /// IAM role the nodes run as, added to the aws-auth ConfigMap
    #[arg(long, env = "NGCTL_NODE_INSTANCE_ROLE_ARN")]
    node_instance_role_arn: Option<String>,
}

impl NodeGroupArgs {
    fn cluster_config(&self) -> anyhow::Result<ClusterConfig> {
        let mut cfg = ClusterConfig::default();
        cfg.metadata.name = self.cluster.clone();
        cfg.metadata.region = self.region.clone();
        cfg.metadata.version = self.version.clone();

        let ng = cfg.new_node_group();
        ng.name = self.name.clone();
        ng.instance_type = self.node_type.clone();
        ng.desired_capacity = self.nodes;
        ng.min_size = self.nodes_min;
        ng.max_size = self.nodes_max;
        ng.volume_size = self.node_volume_size;
        ng.volume_type = self.node_volume_type.clone();
        ng.max_pods_per_node = self.max_pods_per_node;
        ng.ami = self.node_ami.clone();
        ng.ami_family = self.node_ami_family;
        ng.allow_ssh = self.ssh_access;
        ng.ssh_public_key_path = self.ssh_public_key.clone();
        ng.private_networking = self.node_private_networking;
        ng.security_groups.attach_ids = self.node_security_groups.clone();
        ng.availability_zones = self.node_zones.clone();
        ng.iam.with_addon_policies.auto_scaler = self.asg_access;
        ng.iam.with_addon_policies.external_dns = self.external_dns_access;
        ng.iam.with_addon_policies.image_builder = self.full_ecr_access;
        ng.iam.instance_role_arn = self.node_instance_role_arn.clone();

        for label in &self.node_labels {
            let (key, value) = label
                .split_once('=')
                .with_context(|| format!("invalid node label {label:?}, expected key=value"))?;
            ng.labels.insert(key.to_string(), value.to_string());
        }

        Ok(cfg)
    }

    fn options(&self, changed_flags: BTreeSet<String>) -> ProvisionOptions {
        ProvisionOptions {
            config_file: self.config_file.clone(),
            only: self.only.clone(),
            update_auth_configmap: self.update_auth_configmap,
            name_arg: self.name_arg.clone().unwrap_or_default(),
            changed_flags,
            provider: ProviderConfig {
                region: self.region.clone(),
            },
            ready_timeout: self.timeout,
        }
    }
}

/// Long names of the document-incompatible flags given on the command line
fn changed_flags(matches: &ArgMatches) -> BTreeSet<String> {
    DOCUMENT_INCOMPATIBLE_FLAGS
        .iter()
        .filter(|flag| {
            matches.value_source(&flag.replace('-', "_")) == Some(ValueSource::CommandLine)
        })
        .map(|flag| flag.to_string())
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_file(true)
                .with_line_number(true),
        )
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init()?;

    let matches = Cli::command().get_matches();
    let cli = Cli::from_arg_matches(&matches)?;

    match cli.command {
        Some(Commands::Create(CreateTarget::Nodegroup(args))) => {
            let changed = matches
                .subcommand_matches("create")
                .and_then(|m| m.subcommand_matches("nodegroup"))
                .map(changed_flags)
                .unwrap_or_default();
            create_node_groups(args, changed).await?
        }
        Some(Commands::Schema) => {
            let schema = schemars::schema_for!(ClusterConfig);
            println!("{}", serde_yaml_ng::to_string(&schema)?);
        }
        None => {}
    }

    Ok(())
}

async fn create_node_groups(
    args: NodeGroupArgs,
    changed: BTreeSet<String>,
) -> anyhow::Result<()> {
    let spec = args.cluster_config()?;
    let options = args.options(changed);

    let client = Client::try_default()
        .await
        .context("connecting to the cluster")?;

    let images = match &args.image_catalog {
        Some(path) => ImageCatalog::load(path)
            .with_context(|| format!("loading image catalog {}", path.display()))?,
        None => ImageCatalog::default(),
    };

    let collaborators = Collaborators {
        loader: Arc::new(FileLoader),
        control_plane: Arc::new(KubeControlPlane::new(client.clone())),
        images: Arc::new(images),
        keys: Arc::new(KeyStore::new(SecretKeyRegistry::new(
            client.clone(),
            &args.capi_namespace,
        ))),
        backend: Arc::new(CapiStackBackend::new(client, &args.capi_namespace)),
        compatibility: Arc::new(VersionSkewValidator::default()),
    };

    let report = provision(spec, &options, &collaborators).await?;
    print_report(&report)?;

    if !report.is_success() {
        anyhow::bail!(
            "failed to create {} of {} nodegroup(s)",
            report.failed_units(),
            report.units.len()
        );
    }
    Ok(())
}

fn print_report(report: &ProvisionReport) -> anyhow::Result<()> {
    println!("{}", serde_yaml_ng::to_string(report)?);
    Ok(())
}
