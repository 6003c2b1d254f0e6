//! Whole-cluster actions that bypass role handlers.
//!
//! Both operate on every node tagged with the cluster name, so they work
//! from a spec that names no instance templates at all.

use std::collections::BTreeSet;
use std::time::Instant;

use cluster_compute::{ComputeError, ComputeService, NodeSelector};
use tracing::{info, warn, Instrument};

use crate::action::ActionContext;
use crate::cluster::{Cluster, InstanceState};
use crate::error::{ClusterError, Result};
use crate::obs::{emit_phase_finished, emit_phase_started, ActionSpan};
use crate::phase::Phase;
use crate::spec::ClusterSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direct {
    Stop,
    Destroy,
}

/// Stop or destroy a cluster through the provider in one call.
#[derive(Debug)]
pub struct DirectAction {
    direct: Direct,
    context: ActionContext,
}

impl DirectAction {
    pub fn stop(context: ActionContext) -> Self {
        Self {
            direct: Direct::Stop,
            context,
        }
    }

    pub fn destroy(context: ActionContext) -> Self {
        Self {
            direct: Direct::Destroy,
            context,
        }
    }

    pub fn phase(&self) -> Phase {
        match self.direct {
            Direct::Stop => Phase::Stop,
            Direct::Destroy => Phase::Destroy,
        }
    }

    pub async fn execute(
        &self,
        spec: &ClusterSpec,
        cluster: Option<&Cluster>,
    ) -> Result<Option<Cluster>> {
        let span = ActionSpan::child_of(self.context.span(), self.phase(), spec.cluster_name());
        self.run(spec, cluster).instrument(span).await
    }

    async fn run(&self, spec: &ClusterSpec, cluster: Option<&Cluster>) -> Result<Option<Cluster>> {
        let phase = self.phase();
        spec.validate_target()?;

        let started = Instant::now();
        emit_phase_started(phase, spec.cluster_name(), &spec.digest(), spec.roles().len());

        let compute = self.context.compute_for(phase, spec, cluster)?;
        let selector = NodeSelector::with_tag(spec.cluster_name());

        let outcome = match self.direct {
            Direct::Destroy => self.destroy_all(compute.as_ref(), &selector, cluster).await,
            Direct::Stop => self.stop_all(compute.as_ref(), &selector, cluster).await,
        };

        let elapsed = started.elapsed().as_millis() as u64;
        let remaining = match &outcome {
            Ok(Some(c)) => c.len(),
            _ => 0,
        };
        emit_phase_finished(phase, spec.cluster_name(), elapsed, remaining, outcome.is_ok());
        outcome
    }

    async fn destroy_all(
        &self,
        compute: &dyn ComputeService,
        selector: &NodeSelector,
        cluster: Option<&Cluster>,
    ) -> Result<Option<Cluster>> {
        let destroyed = self
            .guarded(compute.destroy_nodes_matching(selector), cluster)
            .await?;
        info!(tag = %selector.tag, destroyed, "cluster destroyed");
        Ok(None)
    }

    async fn stop_all(
        &self,
        compute: &dyn ComputeService,
        selector: &NodeSelector,
        cluster: Option<&Cluster>,
    ) -> Result<Option<Cluster>> {
        let suspended = self
            .guarded(compute.suspend_nodes_matching(selector), cluster)
            .await?;
        info!(tag = %selector.tag, suspended = suspended.len(), "cluster stopped");

        let ids: BTreeSet<String> = suspended.into_iter().map(|node| node.id).collect();
        let Some(cluster) = cluster else {
            return Ok(None);
        };

        // Every recorded instance must have been suspended, or the returned
        // cluster would claim states the provider never reached.
        let missing: Vec<String> = cluster
            .instances()
            .iter()
            .filter(|i| !ids.contains(&i.id))
            .map(|i| i.id.clone())
            .collect();
        if !missing.is_empty() {
            warn!(
                tag = %selector.tag,
                missing = missing.len(),
                "recorded instances were not suspended"
            );
            return Err(ClusterError::Provider {
                phase: self.phase(),
                source: ComputeError::NodesMissing {
                    tag: selector.tag.clone(),
                    node_ids: missing,
                },
                partial: Some(Box::new(cluster.with_state(&ids, InstanceState::Stopped))),
            });
        }
        Ok(Some(cluster.with_state(&ids, InstanceState::Stopped)))
    }

    /// Await a provider call, mapping cancellation and provider errors to
    /// cluster errors that carry the prior cluster.
    async fn guarded<F, T>(&self, call: F, cluster: Option<&Cluster>) -> Result<T>
    where
        F: std::future::Future<Output = cluster_compute::ComputeResult<T>>,
    {
        let phase = self.phase();
        let partial = || cluster.cloned().map(Box::new);
        match self.context.cancellation().guard(call).await {
            None => Err(ClusterError::Interrupted {
                phase,
                partial: partial(),
            }),
            Some(Err(source)) => Err(ClusterError::Provider {
                phase,
                source,
                partial: partial(),
            }),
            Some(Ok(value)) => Ok(value),
        }
    }
}
