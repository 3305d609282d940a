use std::collections::BTreeMap;

use tracing::{Level, instrument};

use crate::{
    Error, Result,
    api::{ClusterConfig, NodeGroup},
    backend::{STACK_NAME_LABEL, StackBackend, UnitStack, stack_name},
};

pub type Outcome = Result<UnitStack, Error>;

/// Per-nodegroup creation outcomes, in submission order
#[derive(Debug, Default)]
pub struct OutcomeSet {
    order: Vec<String>,
    outcomes: BTreeMap<String, Outcome>,
}

impl OutcomeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome for `name`, replacing any earlier one
    pub fn insert(&mut self, name: impl Into<String>, outcome: Outcome) {
        let name = name.into();
        if self.outcomes.insert(name.clone(), outcome).is_none() {
            self.order.push(name);
        }
    }

    pub fn get(&self, name: &str) -> Option<&Outcome> {
        self.outcomes.get(name)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Outcome)> {
        self.order
            .iter()
            .filter_map(|name| Some((name.as_str(), self.outcomes.get(name)?)))
    }

    /// Nodegroups whose stack was created, with what the backend reported
    pub fn succeeded(&self) -> impl Iterator<Item = (&str, &UnitStack)> {
        self.iter()
            .filter_map(|(name, outcome)| Some((name, outcome.as_ref().ok()?)))
    }

    pub fn failed_count(&self) -> usize {
        self.iter().filter(|(_, outcome)| outcome.is_err()).count()
    }

    /// Exactly one outcome per unit, in unit order.
    ///
    /// Units the backend said nothing about count as failed; outcomes for
    /// names that were never submitted are dropped.
    pub fn complete_for(mut self, units: &[NodeGroup]) -> Self {
        let mut complete = Self::new();
        for ng in units {
            let outcome = self.outcomes.remove(&ng.name).unwrap_or_else(|| {
                Err(Error::provisioning(&ng.name, "backend reported no outcome"))
            });
            complete.insert(&ng.name, outcome);
        }

        for name in self.outcomes.keys() {
            tracing::warn!("ignoring outcome for unknown nodegroup {name:?}");
        }
        complete
    }
}

/// Submit every resolved nodegroup to the backend in a single batch.
///
/// `Err` only when the batch could not be submitted at all.
#[instrument(level = Level::DEBUG, skip_all, fields(cluster = %spec.metadata.name))]
pub async fn dispatch(spec: &ClusterConfig, backend: &dyn StackBackend) -> Result<OutcomeSet> {
    tracing::info!(
        "will create a stack for each of {} nodegroup(s) in cluster {:?}",
        spec.node_groups.len(),
        spec.metadata.name
    );

    let outcomes = backend
        .submit_batch(&spec.metadata, &spec.node_groups)
        .await?
        .complete_for(&spec.node_groups);

    let failed = outcomes.failed_count();
    if failed > 0 {
        tracing::info!(
            "{failed} error(s) occurred and nodegroups haven't been created properly, \
             you may wish to check the Cluster API objects in the management cluster"
        );
        tracing::info!(
            "to cleanup resources in region {}, delete the objects labelled \
             {STACK_NAME_LABEL}={} for each of the failed nodegroups",
            spec.metadata.region,
            stack_name(&spec.metadata.name, "<name>")
        );
        for (_, outcome) in outcomes.iter() {
            if let Err(e) = outcome {
                tracing::error!("{e}");
            }
        }
    }

    Ok(outcomes)
}
