//! Observed cluster state: the instances a phase produced.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cluster_compute::{NodeMetadata, NodeState};

/// Lifecycle state of an instance as last observed by an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Running,
    Stopped,
}

/// A provisioned instance tagged with the roles it plays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Opaque provider id
    pub id: String,
    pub roles: BTreeSet<String>,
    pub public_address: Option<String>,
    pub private_address: Option<String>,
    pub state: InstanceState,
}

impl Instance {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }
}

impl From<NodeMetadata> for Instance {
    fn from(node: NodeMetadata) -> Self {
        let state = match node.state {
            NodeState::Running => InstanceState::Running,
            NodeState::Suspended | NodeState::Terminated => InstanceState::Stopped,
        };
        Self {
            id: node.id,
            roles: node.roles,
            public_address: node.public_address,
            private_address: node.private_address,
            state,
        }
    }
}

/// Result of a successful action and input to the next one.
///
/// `Option<Cluster>` is the nullable state: `None` before bootstrap and after
/// destroy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    instances: Vec<Instance>,
    /// Layout digest of the spec the cluster was produced from.
    spec_digest: String,
    updated_at: DateTime<Utc>,
}

impl Cluster {
    pub fn new(instances: Vec<Instance>, spec_digest: impl Into<String>) -> Self {
        Self {
            instances,
            spec_digest: spec_digest.into(),
            updated_at: Utc::now(),
        }
    }

    pub fn empty(spec_digest: impl Into<String>) -> Self {
        Self::new(Vec::new(), spec_digest)
    }

    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    pub fn spec_digest(&self) -> &str {
        &self.spec_digest
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn instance(&self, id: &str) -> Option<&Instance> {
        self.instances.iter().find(|i| i.id == id)
    }

    /// Instances that play `role`, alone or alongside other roles.
    pub fn instances_with_role<'a>(&'a self, role: &'a str) -> impl Iterator<Item = &'a Instance> {
        self.instances.iter().filter(move |i| i.has_role(role))
    }

    /// Instances whose role set is exactly `roles`.
    pub fn instances_in_group<'a>(
        &'a self,
        roles: &'a BTreeSet<String>,
    ) -> impl Iterator<Item = &'a Instance> {
        self.instances.iter().filter(move |i| &i.roles == roles)
    }

    /// Copy of this cluster with every instance in `ids` moved to `state`.
    pub fn with_state(&self, ids: &BTreeSet<String>, state: InstanceState) -> Self {
        let instances = self
            .instances
            .iter()
            .cloned()
            .map(|mut i| {
                if ids.contains(&i.id) {
                    i.state = state;
                }
                i
            })
            .collect();
        Self::new(instances, self.spec_digest.clone())
    }

    /// Fold `updates` into this cluster's instances.
    ///
    /// Instances with a known id are replaced in place; new ids are appended in
    /// the order given. Untouched instances are kept as they were.
    pub fn merged_with(&self, updates: Vec<Instance>, spec_digest: impl Into<String>) -> Self {
        let mut instances = self.instances.clone();
        for update in updates {
            match instances.iter_mut().find(|i| i.id == update.id) {
                Some(existing) => *existing = update,
                None => instances.push(update),
            }
        }
        Self::new(instances, spec_digest)
    }

    /// Provider descriptors for the recorded instances, tagged with `tag`.
    ///
    /// Lets a provider that keeps no state of its own pick up a cluster
    /// recorded by an earlier run.
    pub fn node_descriptors(&self, tag: &str) -> Vec<NodeMetadata> {
        self.instances
            .iter()
            .map(|i| NodeMetadata {
                id: i.id.clone(),
                tag: tag.to_string(),
                roles: i.roles.clone(),
                public_address: i.public_address.clone(),
                private_address: i.private_address.clone(),
                state: match i.state {
                    InstanceState::Running => NodeState::Running,
                    InstanceState::Stopped => NodeState::Suspended,
                },
                created_at: self.updated_at,
            })
            .collect()
    }
}
