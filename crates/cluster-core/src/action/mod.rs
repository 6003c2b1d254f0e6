//! Phase actions: what runs when a cluster moves through a lifecycle phase.
//!
//! [`ClusterAction::for_phase`] picks the strategy for a phase. Role-dispatch
//! phases fan out to registered handlers per role and realize the merged
//! result through the compute provider; direct phases operate on the whole
//! cluster through the provider without consulting handlers.

mod direct;
mod dispatch;
mod merge;

use std::fmt;
use std::sync::Arc;

use cluster_compute::{ComputeService, ComputeServiceContextBuilder};
use tracing::Span;

use crate::cancel::CancellationSignal;
use crate::cluster::Cluster;
use crate::config::ActionConfig;
use crate::error::{ClusterError, Result};
use crate::handler::HandlerRegistry;
use crate::phase::{Phase, Strategy};
use crate::spec::ClusterSpec;

pub use direct::DirectAction;
pub use dispatch::RoleDispatchAction;

/// Collaborators shared by every action run: the provider factory, tuning,
/// the parent tracing span and a cancellation signal.
#[derive(Clone)]
pub struct ActionContext {
    compute: Arc<dyn ComputeServiceContextBuilder>,
    config: Option<ActionConfig>,
    span: Span,
    cancel: CancellationSignal,
}

impl ActionContext {
    pub fn new(compute: Arc<dyn ComputeServiceContextBuilder>) -> Self {
        Self {
            compute,
            config: None,
            span: tracing::info_span!("cluster.action"),
            cancel: CancellationSignal::never(),
        }
    }

    /// Override the tuning otherwise read from spec properties.
    pub fn with_config(mut self, config: ActionConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Nest every action span under `span`.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationSignal) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation(&self) -> &CancellationSignal {
        &self.cancel
    }

    pub(crate) fn span(&self) -> &Span {
        &self.span
    }

    pub(crate) fn config_for(&self, spec: &ClusterSpec) -> Result<ActionConfig> {
        match &self.config {
            Some(config) => Ok(config.clone()),
            None => ActionConfig::from_properties(spec.properties()),
        }
    }

    /// Provider session for `spec`; failures carry `partial` back to the caller.
    pub(crate) fn compute_for(
        &self,
        phase: Phase,
        spec: &ClusterSpec,
        partial: Option<&Cluster>,
    ) -> Result<Arc<dyn ComputeService>> {
        self.compute
            .build(&spec.provider_settings())
            .map_err(|source| ClusterError::Provider {
                phase,
                source,
                partial: partial.cloned().map(Box::new),
            })
    }
}

impl fmt::Debug for ActionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionContext")
            .field("config", &self.config)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// The action for one lifecycle phase.
#[derive(Debug)]
pub enum ClusterAction {
    RoleDispatch(RoleDispatchAction),
    Direct(DirectAction),
}

impl ClusterAction {
    /// Build the action for `phase` using the phase's strategy.
    ///
    /// `registry` is only consulted by role-dispatch phases.
    pub fn for_phase(
        phase: Phase,
        context: ActionContext,
        registry: Arc<HandlerRegistry>,
    ) -> Self {
        match (phase.strategy(), phase) {
            (Strategy::Direct, Phase::Stop) => ClusterAction::Direct(DirectAction::stop(context)),
            (Strategy::Direct, _) => ClusterAction::Direct(DirectAction::destroy(context)),
            (Strategy::RoleDispatch, Phase::Configure) => {
                ClusterAction::RoleDispatch(RoleDispatchAction::configure(context, registry))
            }
            (Strategy::RoleDispatch, Phase::Start) => {
                ClusterAction::RoleDispatch(RoleDispatchAction::start(context, registry))
            }
            (Strategy::RoleDispatch, _) => {
                ClusterAction::RoleDispatch(RoleDispatchAction::bootstrap(context, registry))
            }
        }
    }

    pub fn phase(&self) -> Phase {
        match self {
            ClusterAction::RoleDispatch(action) => action.phase(),
            ClusterAction::Direct(action) => action.phase(),
        }
    }

    /// Run the phase against `spec` and the cluster left by the previous phase.
    ///
    /// Returns the resulting cluster, or `None` once it no longer exists.
    pub async fn execute(
        &self,
        spec: &ClusterSpec,
        cluster: Option<&Cluster>,
    ) -> Result<Option<Cluster>> {
        match self {
            ClusterAction::RoleDispatch(action) => action.execute(spec, cluster).await,
            ClusterAction::Direct(action) => action.execute(spec, cluster).await,
        }
    }
}
