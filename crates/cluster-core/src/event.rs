//! Per-role scratch state threaded through one phase.

use std::collections::BTreeSet;
use std::sync::Arc;

use cluster_compute::{FirewallRule, Statement};

use crate::cluster::{Cluster, Instance};
use crate::phase::Phase;
use crate::spec::{ClusterSpec, InstanceTemplate};

/// Execution context for one (role, template occurrence) within a phase.
///
/// Each event is owned by exactly one worker. Handlers append firewall rules
/// and statements to it; the orchestrator folds it into the phase result only
/// after the worker hands it back at the join.
#[derive(Debug, Clone)]
pub struct ClusterActionEvent {
    phase: Phase,
    role: String,
    template_index: usize,
    spec: Arc<ClusterSpec>,
    cluster: Option<Arc<Cluster>>,
    firewall_rules: BTreeSet<FirewallRule>,
    statements: Vec<Statement>,
    instances: Vec<Instance>,
}

impl ClusterActionEvent {
    pub fn new(
        phase: Phase,
        role: impl Into<String>,
        template_index: usize,
        spec: Arc<ClusterSpec>,
        cluster: Option<Arc<Cluster>>,
    ) -> Self {
        Self {
            phase,
            role: role.into(),
            template_index,
            spec,
            cluster,
            firewall_rules: BTreeSet::new(),
            statements: Vec::new(),
            instances: Vec::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn template_index(&self) -> usize {
        self.template_index
    }

    /// The template this role occurrence came from.
    pub fn template(&self) -> Option<&InstanceTemplate> {
        self.spec.instance_templates().get(self.template_index)
    }

    pub fn spec(&self) -> &ClusterSpec {
        &self.spec
    }

    /// Cluster snapshot from before this phase; the only source of
    /// cross-role information.
    pub fn cluster(&self) -> Option<&Cluster> {
        self.cluster.as_deref()
    }

    pub fn firewall_rules(&self) -> &BTreeSet<FirewallRule> {
        &self.firewall_rules
    }

    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    /// Instances realized for this role's group; empty until realization.
    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    pub fn open_port(&mut self, rule: FirewallRule) {
        self.firewall_rules.insert(rule);
    }

    pub fn add_statement(&mut self, statement: Statement) {
        self.statements.push(statement);
    }

    pub(crate) fn set_instances(&mut self, instances: Vec<Instance>) {
        self.instances = instances;
    }
}
