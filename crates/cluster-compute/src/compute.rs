//! Compute provider trait definitions
//!
//! These traits define the boundary between the cluster-action core and a
//! cloud provider:
//! - `ComputeServiceContextBuilder`: turns provider settings into a live handle
//! - `ComputeService`: creates, lists, suspends, resumes and destroys nodes,
//!   opens ingress and runs scripts on nodes
//!
//! All traits are async and provider-agnostic. An in-memory implementation is
//! provided for testing via the `fakes` module.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ComputeError;

/// Result type for compute operations
pub type ComputeResult<T> = std::result::Result<T, ComputeError>;

// ---------------------------------------------------------------------------
// Provider settings
// ---------------------------------------------------------------------------

/// Everything a context builder needs to reach a provider.
#[derive(Clone, Default)]
pub struct ProviderSettings {
    /// Provider identifier (e.g. "stub", "ec2")
    pub provider: String,
    /// Account identity
    pub identity: String,
    /// Account secret; never printed
    pub credential: String,
    /// Provider-specific overrides
    pub properties: BTreeMap<String, String>,
}

impl std::fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSettings")
            .field("provider", &self.provider)
            .field("identity", &self.identity)
            .field("credential", &"<redacted>")
            .field("properties", &self.properties)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Firewall rules and remote statements
// ---------------------------------------------------------------------------

/// Transport protocol of an ingress rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "icmp" => Ok(Protocol::Icmp),
            other => Err(format!("unknown protocol: {other}")),
        }
    }
}

/// Source range used when a rule does not name one.
pub const ANY_SOURCE: &str = "0.0.0.0/0";

/// An ingress rule to open on a group of nodes.
///
/// Ordered so that rule sets have set semantics and a stable iteration order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FirewallRule {
    pub protocol: Protocol,
    pub port: u16,
    /// CIDR block allowed to connect
    pub source: String,
}

impl FirewallRule {
    /// A TCP rule open to any source.
    pub fn tcp(port: u16) -> Self {
        Self {
            protocol: Protocol::Tcp,
            port,
            source: ANY_SOURCE.to_string(),
        }
    }

    /// A UDP rule open to any source.
    pub fn udp(port: u16) -> Self {
        Self {
            protocol: Protocol::Udp,
            port,
            source: ANY_SOURCE.to_string(),
        }
    }

    /// Restrict the rule to a source CIDR block.
    pub fn from_source(mut self, cidr: impl Into<String>) -> Self {
        self.source = cidr.into();
        self
    }
}

impl std::fmt::Display for FirewallRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} from {}", self.protocol, self.port, self.source)
    }
}

/// A single command line to run on a remote node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Statement(String);

impl Statement {
    pub fn new(line: impl Into<String>) -> Self {
        Statement(line.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Statement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ordered statements delivered to a node in one execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Script {
    pub statements: Vec<Statement>,
}

impl Script {
    pub fn new(statements: Vec<Statement>) -> Self {
        Self { statements }
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// Newline-joined form handed to the remote shell.
    pub fn render(&self) -> String {
        self.statements
            .iter()
            .map(Statement::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// Provider-side lifecycle state of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Running,
    Suspended,
    Terminated,
}

/// Raw node descriptor returned by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMetadata {
    /// Opaque provider id
    pub id: String,
    /// Cluster tag the node was created under
    pub tag: String,
    pub roles: BTreeSet<String>,
    pub public_address: Option<String>,
    pub private_address: Option<String>,
    pub state: NodeState,
    pub created_at: DateTime<Utc>,
}

/// Request to create `count` nodes for one role group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRequest {
    /// Cluster tag applied to every created node
    pub tag: String,
    pub roles: BTreeSet<String>,
    pub count: u32,
    /// Ingress to open on the new nodes
    pub firewall_rules: Vec<FirewallRule>,
    /// Script run on each node once it boots
    pub script: Script,
}

/// Predicate over nodes: tag match plus optional role-group and id filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSelector {
    pub tag: String,
    /// Exact role set a node must carry
    pub roles: Option<BTreeSet<String>>,
    pub ids: Option<BTreeSet<String>>,
}

impl NodeSelector {
    /// Match every node created under `tag`.
    pub fn with_tag(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            roles: None,
            ids: None,
        }
    }

    pub fn in_role_group(mut self, roles: BTreeSet<String>) -> Self {
        self.roles = Some(roles);
        self
    }

    pub fn with_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn matches(&self, node: &NodeMetadata) -> bool {
        if node.tag != self.tag {
            return false;
        }
        if let Some(roles) = &self.roles {
            if &node.roles != roles {
                return false;
            }
        }
        if let Some(ids) = &self.ids {
            if !ids.contains(&node.id) {
                return false;
            }
        }
        true
    }
}

/// Outcome of running a script on one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResponse {
    pub node_id: String,
    pub exit_code: i32,
    pub output: String,
}

impl ExecResponse {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Live handle to a compute provider.
///
/// Guarantees:
/// - `create_nodes` either returns descriptors for the created nodes or fails;
///   partially created nodes remain tagged and are reclaimed by a later destroy.
/// - `destroy_nodes_matching` is idempotent: destroying nothing is success.
/// - Calls are never retried by the caller.
#[async_trait]
pub trait ComputeService: Send + Sync {
    /// Create nodes for one role group.
    async fn create_nodes(&self, request: &NodeRequest) -> ComputeResult<Vec<NodeMetadata>>;

    /// List live nodes matching the selector.
    async fn list_nodes_matching(&self, selector: &NodeSelector)
        -> ComputeResult<Vec<NodeMetadata>>;

    /// Open ingress rules on the matching nodes.
    async fn authorize_ingress(
        &self,
        selector: &NodeSelector,
        rules: &[FirewallRule],
    ) -> ComputeResult<()>;

    /// Run a script on a single node.
    async fn run_script(&self, node_id: &str, script: &Script) -> ComputeResult<ExecResponse>;

    /// Suspend matching nodes, returning their updated descriptors.
    async fn suspend_nodes_matching(
        &self,
        selector: &NodeSelector,
    ) -> ComputeResult<Vec<NodeMetadata>>;

    /// Resume suspended nodes matching the selector, returning their updated
    /// descriptors. Nodes that are already running are returned unchanged.
    async fn resume_nodes_matching(
        &self,
        selector: &NodeSelector,
    ) -> ComputeResult<Vec<NodeMetadata>>;

    /// Destroy matching nodes, returning how many were destroyed.
    async fn destroy_nodes_matching(&self, selector: &NodeSelector) -> ComputeResult<usize>;
}

/// Builds a [`ComputeService`] handle for the provider named in the settings.
pub trait ComputeServiceContextBuilder: Send + Sync {
    fn build(&self, settings: &ProviderSettings) -> ComputeResult<Arc<dyn ComputeService>>;
}
