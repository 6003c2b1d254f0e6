//! Error types for the compute provider boundary

use thiserror::Error;

/// Errors surfaced by a compute provider.
///
/// The orchestrator never retries these; they are reported to the caller
/// together with the roles whose realization they interrupted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ComputeError {
    /// No context builder is registered for the requested provider id
    #[error("unknown compute provider: {provider}")]
    UnknownProvider { provider: String },

    /// Credentials were refused by the provider
    #[error("authentication failed for provider {provider}: {reason}")]
    Authentication { provider: String, reason: String },

    /// The provider accepted the call but refused to carry it out
    #[error("provider rejected request: {reason}")]
    Rejected { reason: String },

    /// The provider endpoint could not be reached
    #[error("provider unreachable: {0}")]
    Unreachable(String),

    /// A node id did not resolve to a live node
    #[error("node not found: {node_id}")]
    NodeNotFound { node_id: String },

    /// Recorded nodes the provider no longer holds under the cluster tag
    #[error("provider holds no node under tag {tag} for: {}", .node_ids.join(", "))]
    NodesMissing { tag: String, node_ids: Vec<String> },
}
