//! Nodegroup provisioning pipeline.
//!
//! Phases run in a fixed order and each one is a gate for the next:
//!
//! 1. [`source`] decides between a configuration document and discrete flags
//! 2. [`filter`] narrows the document's nodegroups to the `--only` selection
//! 3. [`version`] fixes the Kubernetes version against the control plane
//! 4. [`resolve`] resolves images, labels and keys for every unit, fail-fast
//! 5. the compatibility gate checks the resolved units against the live cluster
//! 6. [`dispatch`] submits all units as one batch and collects per-unit outcomes
//! 7. [`post_create`] registers and waits for every unit that was created
//!
//! Everything up to and including phase 5 aborts on the first error. From
//! phase 6 on, failures are isolated per unit and only aggregated into the
//! final [`ProvisionReport`].

pub mod dispatch;
pub mod filter;
pub mod post_create;
pub mod resolve;
pub mod source;
pub mod version;

use std::{collections::BTreeSet, fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{Level, instrument};

use crate::{
    Error, Result,
    api::ClusterConfig,
    backend::StackBackend,
    cluster::ControlPlane,
    compat::{Advisory, CompatibilityValidator},
    images::ImageResolver,
    keys::KeyProvider,
    loader::SpecLoader,
};

use self::{dispatch::OutcomeSet, source::ConfigSource, version::VersionDisposition};

pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(25 * 60);

/// Settings the backend needs to address the provider
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProviderConfig {
    pub region: String,
}

/// Caller options for one [`provision`] invocation
#[derive(Clone, Debug)]
pub struct ProvisionOptions {
    /// Configuration document path, empty when flags are used
    pub config_file: String,
    /// Comma separated nodegroup name globs, empty for all
    pub only: String,
    /// Authorise nodes to join and wait for them after creation
    pub update_auth_configmap: bool,
    /// Positional nodegroup name argument
    pub name_arg: String,
    /// Long names of the discrete flags the caller set explicitly
    pub changed_flags: BTreeSet<String>,
    pub provider: ProviderConfig,
    pub ready_timeout: Duration,
}

impl Default for ProvisionOptions {
    fn default() -> Self {
        Self {
            config_file: String::new(),
            only: String::new(),
            update_auth_configmap: true,
            name_arg: String::new(),
            changed_flags: BTreeSet::new(),
            provider: ProviderConfig::default(),
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }
}

/// External systems the pipeline drives
#[derive(Clone)]
pub struct Collaborators {
    pub loader: Arc<dyn SpecLoader>,
    pub control_plane: Arc<dyn ControlPlane>,
    pub images: Arc<dyn ImageResolver>,
    pub keys: Arc<dyn KeyProvider>,
    pub backend: Arc<dyn StackBackend>,
    pub compatibility: Arc<dyn CompatibilityValidator>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Phase {
    Arbitrate,
    Filter,
    ReconcileVersion,
    ResolveUnits,
    CheckCompatibility,
    Dispatch,
    ReconcilePostCreate,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Arbitrate => "arbitrate",
            Self::Filter => "filter",
            Self::ReconcileVersion => "reconcile-version",
            Self::ResolveUnits => "resolve-units",
            Self::CheckCompatibility => "check-compatibility",
            Self::Dispatch => "dispatch",
            Self::ReconcilePostCreate => "reconcile-post-create",
        };
        f.write_str(name)
    }
}

fn enter(phase: Phase) {
    tracing::debug!(%phase, "entering phase");
}

#[derive(Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct UnitReport {
    pub name: String,
    pub stack: Option<String>,
    pub created: bool,
    pub registered: bool,
    pub ready: bool,
    pub error: Option<String>,
}

/// Result of a provisioning run that got past the pre-creation gates
#[derive(Serialize, Clone, Debug)]
pub struct ProvisionReport {
    pub cluster: String,
    pub region: String,
    pub disposition: VersionDisposition,
    pub units: Vec<UnitReport>,
    pub advisories: Vec<Advisory>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ProvisionReport {
    fn new(
        spec: &ClusterConfig,
        disposition: VersionDisposition,
        outcomes: &OutcomeSet,
        started_at: DateTime<Utc>,
    ) -> Self {
        let units = outcomes
            .iter()
            .map(|(name, outcome)| UnitReport {
                name: name.to_string(),
                stack: outcome.as_ref().ok().map(|s| s.stack_name.clone()),
                created: outcome.is_ok(),
                error: outcome.as_ref().err().map(ToString::to_string),
                ..Default::default()
            })
            .collect();

        Self {
            cluster: spec.metadata.name.clone(),
            region: spec.metadata.region.clone(),
            disposition,
            units,
            advisories: vec![],
            started_at,
            finished_at: None,
        }
    }

    pub fn unit(&self, name: &str) -> Option<&UnitReport> {
        self.units.iter().find(|u| u.name == name)
    }

    pub(crate) fn unit_mut(&mut self, name: &str) -> Option<&mut UnitReport> {
        self.units.iter_mut().find(|u| u.name == name)
    }

    pub fn failed_units(&self) -> usize {
        self.units.iter().filter(|u| u.error.is_some()).count()
    }

    /// Advisories never affect success
    pub fn is_success(&self) -> bool {
        self.failed_units() == 0
    }
}

/// Drive a cluster configuration to created, registered nodegroups.
///
/// `Err` means a gate failed before any infrastructure was touched (or the
/// backend could not be reached at all). Per-unit creation, registration and
/// readiness failures are reported through [`ProvisionReport::is_success`].
#[instrument(level = Level::DEBUG, skip_all, fields(cluster = %spec.metadata.name))]
pub async fn provision(
    spec: ClusterConfig,
    options: &ProvisionOptions,
    collaborators: &Collaborators,
) -> Result<ProvisionReport> {
    let started_at = Utc::now();

    enter(Phase::Arbitrate);
    let source::Arbitrated {
        mut spec,
        source,
        provider,
    } = source::arbitrate(spec, options, collaborators.loader.as_ref())?;
    tracing::info!("using region {}", provider.region);

    if let ConfigSource::Document(_) = &source {
        enter(Phase::Filter);
        spec.node_groups = filter::filter_node_groups(&options.only, spec.node_groups)?;
    }

    enter(Phase::ReconcileVersion);
    let disposition = version::reconcile(
        &mut spec.metadata,
        collaborators.control_plane.as_ref(),
        &source,
    )
    .await?;

    enter(Phase::ResolveUnits);
    resolve::resolve_units(
        &mut spec,
        collaborators.images.as_ref(),
        collaborators.keys.as_ref(),
    )
    .await?;
    tracing::debug!("cfg.json = {}", serde_json::to_string_pretty(&spec)?);

    enter(Phase::CheckCompatibility);
    check_compatibility(&spec, collaborators).await?;

    enter(Phase::Dispatch);
    let outcomes = dispatch::dispatch(&spec, collaborators.backend.as_ref()).await?;

    let mut report = ProvisionReport::new(&spec, disposition, &outcomes, started_at);

    enter(Phase::ReconcilePostCreate);
    post_create::reconcile(&spec, &outcomes, options, collaborators, &mut report).await;

    report.finished_at = Some(Utc::now());
    if !report.is_success() {
        tracing::error!(
            "{} of {} nodegroup(s) in cluster {:?} failed",
            report.failed_units(),
            report.units.len(),
            report.cluster
        );
    }

    Ok(report)
}

/// Refuse to create anything the live cluster can't take
async fn check_compatibility(spec: &ClusterConfig, collaborators: &Collaborators) -> Result<()> {
    let live = collaborators.control_plane.live_state().await?;
    collaborators
        .compatibility
        .validate_cluster(spec, &live)
        .map_err(|e| match e {
            Error::Validation(msg) => {
                Error::validation(format!("cluster compatibility check failed: {msg}"))
            }
            e => e,
        })
}
