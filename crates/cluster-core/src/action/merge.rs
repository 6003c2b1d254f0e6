//! Fold per-role events into one realization request per role group.
//!
//! Runs only after the join barrier, so every event it sees is complete.
//! Bootstrap keeps each instance template as its own group because each is
//! an independent allocation request. Configure and start act on instances
//! that already exist and cannot tell apart templates with the same role set,
//! so those templates share one group and their statements are deduplicated.

use std::collections::{BTreeMap, BTreeSet};

use cluster_compute::{FirewallRule, NodeRequest, Script, Statement};

use crate::cluster::Instance;
use crate::event::ClusterActionEvent;
use crate::phase::Phase;
use crate::spec::ClusterSpec;

/// Accumulated intent for one role group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct GroupPlan {
    /// Templates folded into this group, ascending.
    pub template_indices: Vec<usize>,
    pub roles: BTreeSet<String>,
    /// Instances requested across the group's templates.
    pub count: u32,
    pub firewall_rules: BTreeSet<FirewallRule>,
    pub statements: BTreeMap<String, Vec<Statement>>,
}

impl GroupPlan {
    fn new(index: usize, roles: BTreeSet<String>, count: u32) -> Self {
        Self {
            template_indices: vec![index],
            roles,
            count,
            firewall_rules: BTreeSet::new(),
            statements: BTreeMap::new(),
        }
    }

    pub fn contains_template(&self, index: usize) -> bool {
        self.template_indices.contains(&index)
    }

    /// `a+b` style label for logs and errors.
    pub fn label(&self) -> String {
        self.roles
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("+")
    }

    /// Union this event's rules and append its statements under its role.
    pub fn absorb(&mut self, event: &ClusterActionEvent) {
        self.firewall_rules
            .extend(event.firewall_rules().iter().cloned());

        let shared = self.template_indices.len() > 1;
        let lines = self.statements.entry(event.role().to_string()).or_default();
        for statement in event.statements() {
            if shared && lines.contains(statement) {
                continue;
            }
            lines.push(statement.clone());
        }
    }

    /// Statements for an instance playing `roles`, ordered by role name.
    pub fn script_for(&self, roles: &BTreeSet<String>) -> Script {
        Script::new(
            self.statements
                .iter()
                .filter(|(role, _)| roles.contains(*role))
                .flat_map(|(_, lines)| lines.iter().cloned())
                .collect(),
        )
    }

    /// Statements grouped by target instance; instances with nothing to run
    /// are left out.
    pub fn scripts_by_instance(&self, targets: &[Instance]) -> BTreeMap<String, Script> {
        targets
            .iter()
            .map(|i| (i.id.clone(), self.script_for(&i.roles)))
            .filter(|(_, script)| !script.is_empty())
            .collect()
    }

    pub fn node_request(&self, tag: &str) -> NodeRequest {
        NodeRequest {
            tag: tag.to_string(),
            roles: self.roles.clone(),
            count: self.count,
            firewall_rules: self.firewall_rules.iter().cloned().collect(),
            script: self.script_for(&self.roles),
        }
    }
}

/// Empty group plans for every template of `spec`, in template order.
pub(crate) fn plan_groups(phase: Phase, spec: &ClusterSpec) -> Vec<GroupPlan> {
    let mut groups: Vec<GroupPlan> = Vec::new();
    for (index, template) in spec.instance_templates().iter().enumerate() {
        let shared = if phase == Phase::Bootstrap {
            None
        } else {
            groups.iter_mut().find(|g| &g.roles == template.roles())
        };
        match shared {
            Some(group) => {
                group.template_indices.push(index);
                group.count += template.count();
            }
            None => groups.push(GroupPlan::new(
                index,
                template.roles().clone(),
                template.count(),
            )),
        }
    }
    groups
}

/// Fold completed events into the group owning their template.
pub(crate) fn fold<'a>(
    groups: &mut [GroupPlan],
    events: impl IntoIterator<Item = &'a ClusterActionEvent>,
) {
    for event in events {
        if let Some(group) = groups
            .iter_mut()
            .find(|g| g.contains_template(event.template_index()))
        {
            group.absorb(event);
        }
    }
}
