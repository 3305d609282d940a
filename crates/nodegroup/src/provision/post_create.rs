use tracing::{Level, instrument};

use crate::{
    Result,
    api::{ClusterConfig, NodeGroup, is_gpu_instance_type},
    backend::UnitStack,
    compat::Advisory,
};

use super::{Collaborators, ProvisionOptions, ProvisionReport, dispatch::OutcomeSet};

/// Bring every created nodegroup into the cluster and run the trailing checks.
///
/// Units are handled one at a time in configuration order. Registration and
/// readiness failures are recorded on the unit's report and the remaining
/// units are still processed. The compatibility check never fails the run.
#[instrument(level = Level::DEBUG, skip_all, fields(cluster = %spec.metadata.name))]
pub async fn reconcile(
    spec: &ClusterConfig,
    outcomes: &OutcomeSet,
    options: &ProvisionOptions,
    collaborators: &Collaborators,
    report: &mut ProvisionReport,
) {
    let mut created = 0;

    for ng in &spec.node_groups {
        let Some(Ok(stack)) = outcomes.get(&ng.name) else {
            continue;
        };
        created += 1;

        if options.update_auth_configmap {
            if let Err(e) = join_unit(ng, stack, options, collaborators, report).await {
                tracing::error!("{e}");
                if let Some(unit) = report.unit_mut(&ng.name) {
                    unit.error = Some(e.to_string());
                }
            }
        }

        if is_gpu_instance_type(&ng.instance_type) {
            let advisory = Advisory::gpu(&ng.name);
            tracing::info!("{}", advisory.message);
            report.advisories.push(advisory);
        }
    }

    if created == 0 {
        return;
    }

    match check_compatibility(spec, collaborators).await {
        Ok(advisories) => {
            for advisory in &advisories {
                match &advisory.nodegroup {
                    Some(ng) => tracing::warn!("nodegroup {ng:?}: {}", advisory.message),
                    None => tracing::warn!("{}", advisory.message),
                }
            }
            report.advisories.extend(advisories);
        }
        Err(e) => tracing::error!(critical = true, "failed checking nodegroups: {e}"),
    }

    if report.is_success() {
        tracing::info!(
            "created {created} nodegroup(s) in cluster {:?}",
            spec.metadata.name
        );
    }
}

async fn join_unit(
    ng: &NodeGroup,
    stack: &UnitStack,
    options: &ProvisionOptions,
    collaborators: &Collaborators,
    report: &mut ProvisionReport,
) -> Result<()> {
    collaborators.control_plane.register_unit(ng, stack).await?;
    if let Some(unit) = report.unit_mut(&ng.name) {
        unit.registered = true;
    }

    collaborators
        .control_plane
        .await_ready(ng, options.ready_timeout)
        .await?;
    if let Some(unit) = report.unit_mut(&ng.name) {
        unit.ready = true;
    }

    Ok(())
}

async fn check_compatibility(
    spec: &ClusterConfig,
    collaborators: &Collaborators,
) -> Result<Vec<Advisory>> {
    let live = collaborators.control_plane.live_state().await?;
    collaborators.compatibility.validate(spec, &live)
}
