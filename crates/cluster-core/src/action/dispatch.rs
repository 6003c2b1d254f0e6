//! Role-dispatch execution for bootstrap, configure and start.
//!
//! A run has three stages separated by join barriers:
//!
//! 1. every (template, role) occurrence runs its handlers' `before_action`
//!    and `action` hooks on a bounded worker pool;
//! 2. the completed events are merged per role group and each group without
//!    a failed role is realized through the compute provider;
//! 3. `after_action` hooks run with the realized instances attached.
//!
//! A failing role never stops its siblings. Failures are collected and
//! reported together once every worker has finished.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use cluster_compute::{ComputeService, NodeSelector, NodeState};
use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn, Instrument, Span};

use crate::action::merge::{self, GroupPlan};
use crate::action::ActionContext;
use crate::cancel::CancellationSignal;
use crate::cluster::{Cluster, Instance, InstanceState};
use crate::error::{ClusterError, FailureStage, Result, RoleFailure};
use crate::event::ClusterActionEvent;
use crate::handler::{ClusterActionHandler, HandlerRegistry};
use crate::obs::{
    emit_group_realized, emit_phase_finished, emit_phase_started, emit_role_failed, ActionSpan,
};
use crate::phase::Phase;
use crate::spec::ClusterSpec;

/// Phases driven through role handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatch {
    Bootstrap,
    Configure,
    Start,
}

impl Dispatch {
    fn phase(self) -> Phase {
        match self {
            Dispatch::Bootstrap => Phase::Bootstrap,
            Dispatch::Configure => Phase::Configure,
            Dispatch::Start => Phase::Start,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Hooks {
    /// `before_action` then `action`.
    Prepare,
    /// `after_action`.
    Finish,
}

/// One (template, role) occurrence and the handlers it dispatches to.
struct RoleUnit {
    event: ClusterActionEvent,
    handlers: Vec<Arc<dyn ClusterActionHandler>>,
}

impl RoleUnit {
    fn run(&mut self, hooks: Hooks) -> std::result::Result<(), RoleFailure> {
        match hooks {
            Hooks::Prepare => {
                for handler in &self.handlers {
                    if let Err(e) = handler.before_action(&mut self.event) {
                        return Err(self.failure(FailureStage::BeforeAction, format!("{e:#}")));
                    }
                }
                for handler in &self.handlers {
                    if let Err(e) = handler.action(&mut self.event) {
                        return Err(self.failure(FailureStage::Action, format!("{e:#}")));
                    }
                }
            }
            Hooks::Finish => {
                for handler in &self.handlers {
                    if let Err(e) = handler.after_action(&mut self.event) {
                        return Err(self.failure(FailureStage::AfterAction, format!("{e:#}")));
                    }
                }
            }
        }
        Ok(())
    }

    fn failure(&self, stage: FailureStage, reason: impl Into<String>) -> RoleFailure {
        RoleFailure {
            role: self.event.role().to_string(),
            template_index: self.event.template_index(),
            stage,
            reason: reason.into(),
        }
    }
}

/// Action that fans a phase out to the handlers registered for each role.
#[derive(Debug)]
pub struct RoleDispatchAction {
    dispatch: Dispatch,
    context: ActionContext,
    registry: Arc<HandlerRegistry>,
}

impl RoleDispatchAction {
    pub fn bootstrap(context: ActionContext, registry: Arc<HandlerRegistry>) -> Self {
        Self::new(Dispatch::Bootstrap, context, registry)
    }

    pub fn configure(context: ActionContext, registry: Arc<HandlerRegistry>) -> Self {
        Self::new(Dispatch::Configure, context, registry)
    }

    pub fn start(context: ActionContext, registry: Arc<HandlerRegistry>) -> Self {
        Self::new(Dispatch::Start, context, registry)
    }

    fn new(dispatch: Dispatch, context: ActionContext, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            dispatch,
            context,
            registry,
        }
    }

    pub fn phase(&self) -> Phase {
        self.dispatch.phase()
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

        spec.validate()?;
        if phase.requires_cluster() && cluster.is_none() {
            return Err(ClusterError::Configuration(format!(
                "{phase} requires an existing cluster; run bootstrap first"
            )));
        }
        let config = self.context.config_for(spec)?;

        let digest = spec.digest();
        if let Some(prior) = cluster {
            if prior.spec_digest() != digest {
                warn!(
                    cluster = %spec.cluster_name(),
                    "cluster spec changed since the cluster was last updated"
                );
            }
        }

        let started = Instant::now();
        let distinct_roles = spec.roles().len();
        emit_phase_started(phase, spec.cluster_name(), &digest, distinct_roles);

        let compute = self.context.compute_for(phase, spec, None)?;
        let pool = Arc::new(Semaphore::new(config.pool_size(distinct_roles)));
        let shared_spec = Arc::new(spec.clone());
        let prior = cluster.cloned().map(Arc::new);

        // Stage 1: handler hooks per role occurrence.
        let units = self.plan_units(&shared_spec, prior.as_ref());
        let (prepared, mut failures) = self.run_hooks(units, Hooks::Prepare, &pool).await;
        self.ensure_not_cancelled()?;

        // Stage 2: merge per group and realize through the provider.
        let failed: BTreeSet<usize> = failures.iter().map(|f| f.template_index).collect();
        let mut groups = merge::plan_groups(phase, spec);
        merge::fold(&mut groups, prepared.iter().map(|unit| &unit.event));
        let (ready, blocked): (Vec<GroupPlan>, Vec<GroupPlan>) = groups
            .into_iter()
            .partition(|g| !g.template_indices.iter().any(|i| failed.contains(i)));
        for group in &blocked {
            debug!(roles = %group.label(), "skipping realization after role failure");
        }

        let realized = self
            .realize_groups(&compute, spec.cluster_name(), prior.as_ref(), ready, &pool)
            .await;
        self.ensure_not_cancelled()?;

        let mut instances: Vec<Instance> = Vec::new();
        let mut attached: BTreeMap<usize, Vec<Instance>> = BTreeMap::new();
        for (group, outcome) in realized {
            match outcome {
                Ok(group_instances) => {
                    emit_group_realized(
                        phase,
                        &group.label(),
                        group_instances.len(),
                        group.firewall_rules.len(),
                    );
                    for index in &group.template_indices {
                        attached.insert(*index, group_instances.clone());
                    }
                    instances.extend(group_instances);
                }
                Err(reason) => {
                    for unit in prepared
                        .iter()
                        .filter(|u| group.contains_template(u.event.template_index()))
                    {
                        let failure = unit.failure(FailureStage::Realize, reason.clone());
                        emit_role_failed(phase, &failure);
                        failures.push(failure);
                    }
                }
            }
        }

        // Stage 3: after hooks for occurrences whose group was realized.
        let finishing: Vec<RoleUnit> = prepared
            .into_iter()
            .filter_map(|mut unit| {
                let group_instances = attached.get(&unit.event.template_index())?;
                unit.event.set_instances(group_instances.clone());
                Some(unit)
            })
            .collect();
        let (_, after_failures) = self.run_hooks(finishing, Hooks::Finish, &pool).await;
        failures.extend(after_failures);
        self.ensure_not_cancelled()?;

        let elapsed = started.elapsed().as_millis() as u64;
        if !failures.is_empty() {
            emit_phase_finished(phase, spec.cluster_name(), elapsed, instances.len(), false);
            return Err(ClusterError::Provisioning {
                phase,
                failures,
                partial: None,
            });
        }

        let next = match cluster {
            Some(prior) => prior.merged_with(instances, digest),
            None => Cluster::new(instances, digest),
        };
        emit_phase_finished(phase, spec.cluster_name(), elapsed, next.len(), true);
        Ok(Some(next))
    }

    fn plan_units(&self, spec: &Arc<ClusterSpec>, prior: Option<&Arc<Cluster>>) -> Vec<RoleUnit> {
        let mut units = Vec::new();
        for (index, template) in spec.instance_templates().iter().enumerate() {
            for role in template.roles() {
                let handlers = self.registry.handlers_for(role).to_vec();
                if handlers.is_empty() {
                    debug!(role = %role, "no handlers registered for role");
                }
                units.push(RoleUnit {
                    event: ClusterActionEvent::new(
                        self.phase(),
                        role.clone(),
                        index,
                        Arc::clone(spec),
                        prior.cloned(),
                    ),
                    handlers,
                });
            }
        }
        units
    }

    /// Run `hooks` for every unit on the pool; returns the units that
    /// succeeded and the failures of the rest.
    async fn run_hooks(
        &self,
        units: Vec<RoleUnit>,
        hooks: Hooks,
        pool: &Arc<Semaphore>,
    ) -> (Vec<RoleUnit>, Vec<RoleFailure>) {
        let mut keys = Vec::with_capacity(units.len());
        let mut tasks = Vec::with_capacity(units.len());

        for mut unit in units {
            keys.push((unit.event.role().to_string(), unit.event.template_index()));
            let pool = Arc::clone(pool);
            let cancel = self.context.cancellation().clone();

            let task = tokio::spawn(
                async move {
                    let _permit = pool.acquire_owned().await.ok();
                    if cancel.is_cancelled() {
                        return Err(unit.failure(FailureStage::Worker, "cancelled before start"));
                    }
                    unit.run(hooks).map(|()| unit)
                }
                .instrument(Span::current()),
            );
            tasks.push(task);
        }

        let mut done = Vec::new();
        let mut failures = Vec::new();
        for ((role, template_index), joined) in keys.into_iter().zip(join_all(tasks).await) {
            let failure = match joined {
                Ok(Ok(unit)) => {
                    done.push(unit);
                    continue;
                }
                Ok(Err(failure)) => failure,
                Err(e) => RoleFailure {
                    role,
                    template_index,
                    stage: FailureStage::Worker,
                    reason: format!("role worker aborted: {e}"),
                },
            };
            emit_role_failed(self.phase(), &failure);
            failures.push(failure);
        }
        (done, failures)
    }

    /// Realize every ready group concurrently, keeping group order.
    async fn realize_groups(
        &self,
        compute: &Arc<dyn ComputeService>,
        tag: &str,
        prior: Option<&Arc<Cluster>>,
        groups: Vec<GroupPlan>,
        pool: &Arc<Semaphore>,
    ) -> Vec<(GroupPlan, std::result::Result<Vec<Instance>, String>)> {
        let mut tasks = Vec::with_capacity(groups.len());
        for group in &groups {
            let pool = Arc::clone(pool);
            let realizer = Realizer {
                dispatch: self.dispatch,
                compute: Arc::clone(compute),
                tag: tag.to_string(),
                prior: prior.cloned(),
                cancel: self.context.cancellation().clone(),
            };
            let group = group.clone();
            tasks.push(tokio::spawn(
                async move {
                    let _permit = pool.acquire_owned().await.ok();
                    realizer.realize(&group).await
                }
                .instrument(Span::current()),
            ));
        }

        groups
            .into_iter()
            .zip(join_all(tasks).await)
            .map(|(group, joined)| {
                let outcome =
                    joined.unwrap_or_else(|e| Err(format!("realization worker aborted: {e}")));
                (group, outcome)
            })
            .collect()
    }

    fn ensure_not_cancelled(&self) -> Result<()> {
        if self.context.cancellation().is_cancelled() {
            info!(phase = %self.phase(), "action cancelled");
            return Err(ClusterError::Interrupted {
                phase: self.phase(),
                partial: None,
            });
        }
        Ok(())
    }
}

/// Owned state one realization worker needs.
struct Realizer {
    dispatch: Dispatch,
    compute: Arc<dyn ComputeService>,
    tag: String,
    prior: Option<Arc<Cluster>>,
    cancel: CancellationSignal,
}

const CANCELLED: &str = "cancelled while waiting on the provider";

impl Realizer {
    async fn realize(&self, group: &GroupPlan) -> std::result::Result<Vec<Instance>, String> {
        match self.dispatch {
            Dispatch::Bootstrap => self.create(group).await,
            Dispatch::Configure | Dispatch::Start => self.reconfigure(group).await,
        }
    }

    async fn create(&self, group: &GroupPlan) -> std::result::Result<Vec<Instance>, String> {
        let request = group.node_request(&self.tag);
        if request.count == 0 {
            return Ok(Vec::new());
        }
        let nodes = self
            .cancel
            .guard(self.compute.create_nodes(&request))
            .await
            .ok_or(CANCELLED)?
            .map_err(|e| e.to_string())?;
        if nodes.len() != request.count as usize {
            return Err(format!(
                "provider created {} of {} requested instances",
                nodes.len(),
                request.count
            ));
        }
        Ok(nodes.into_iter().map(Instance::from).collect())
    }

    async fn reconfigure(&self, group: &GroupPlan) -> std::result::Result<Vec<Instance>, String> {
        let mut targets: Vec<Instance> = self
            .prior
            .as_deref()
            .map(|c| c.instances_in_group(&group.roles).cloned().collect())
            .unwrap_or_default();
        if targets.is_empty() {
            warn!(roles = %group.label(), "no instances in role group");
            return Ok(targets);
        }

        if self.dispatch == Dispatch::Start {
            self.resume_stopped(group, &mut targets).await?;
        }

        if !group.firewall_rules.is_empty() {
            let selector = NodeSelector::with_tag(&self.tag)
                .in_role_group(group.roles.clone())
                .with_ids(targets.iter().map(|i| i.id.clone()));
            let rules: Vec<_> = group.firewall_rules.iter().cloned().collect();
            self.cancel
                .guard(self.compute.authorize_ingress(&selector, &rules))
                .await
                .ok_or(CANCELLED)?
                .map_err(|e| e.to_string())?;
        }

        let scripts = group.scripts_by_instance(&targets);
        let runs = scripts.iter().map(|(id, script)| async move {
            let response = self
                .cancel
                .guard(self.compute.run_script(id, script))
                .await
                .ok_or_else(|| CANCELLED.to_string())?
                .map_err(|e| e.to_string())?;
            if !response.succeeded() {
                return Err(format!(
                    "script exited with status {} on instance {id}",
                    response.exit_code
                ));
            }
            Ok::<(), String>(())
        });
        let errors: Vec<String> = join_all(runs)
            .await
            .into_iter()
            .filter_map(|r| r.err())
            .collect();
        if !errors.is_empty() {
            return Err(errors.join("; "));
        }
        Ok(targets)
    }

    /// Resume the group's stopped instances through the provider. An instance
    /// is only reported running once the provider says it is.
    async fn resume_stopped(
        &self,
        group: &GroupPlan,
        targets: &mut [Instance],
    ) -> std::result::Result<(), String> {
        let stopped: Vec<String> = targets
            .iter()
            .filter(|i| i.state == InstanceState::Stopped)
            .map(|i| i.id.clone())
            .collect();
        if stopped.is_empty() {
            return Ok(());
        }

        let selector = NodeSelector::with_tag(&self.tag)
            .in_role_group(group.roles.clone())
            .with_ids(stopped.iter().cloned());
        let running: BTreeSet<String> = self
            .cancel
            .guard(self.compute.resume_nodes_matching(&selector))
            .await
            .ok_or(CANCELLED)?
            .map_err(|e| e.to_string())?
            .into_iter()
            .filter(|node| node.state == NodeState::Running)
            .map(|node| node.id)
            .collect();

        let missing: Vec<&str> = stopped
            .iter()
            .filter(|id| !running.contains(*id))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(format!(
                "provider did not resume instances {}",
                missing.join(", ")
            ));
        }

        for instance in targets.iter_mut().filter(|i| running.contains(&i.id)) {
            instance.state = InstanceState::Running;
        }
        debug!(roles = %group.label(), resumed = running.len(), "resumed stopped instances");
        Ok(())
    }
}
