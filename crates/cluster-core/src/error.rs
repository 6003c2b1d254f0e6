//! Error taxonomy for cluster actions.

use cluster_compute::ComputeError;

use crate::cluster::Cluster;
use crate::phase::Phase;

/// Where inside a role unit a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    BeforeAction,
    Action,
    Realize,
    AfterAction,
    /// The worker running the unit panicked or was torn down.
    Worker,
}

impl std::fmt::Display for FailureStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureStage::BeforeAction => "before-action",
            FailureStage::Action => "action",
            FailureStage::Realize => "realize",
            FailureStage::AfterAction => "after-action",
            FailureStage::Worker => "worker",
        };
        write!(f, "{s}")
    }
}

/// One role occurrence that failed during a phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleFailure {
    pub role: String,
    /// Index of the instance template the role occurrence belongs to.
    pub template_index: usize,
    pub stage: FailureStage,
    pub reason: String,
}

impl std::fmt::Display for RoleFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (template {}, {}): {}",
            self.role, self.template_index, self.stage, self.reason
        )
    }
}

/// Errors produced by cluster actions.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// Malformed spec or settings; raised before any provider call.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// One or more roles failed; siblings were allowed to finish first.
    #[error("{phase} failed for roles [{}]: {}", role_list(.failures), failure_list(.failures))]
    Provisioning {
        phase: Phase,
        failures: Vec<RoleFailure>,
        /// Best-effort state, only kept for idempotent phases.
        partial: Option<Box<Cluster>>,
    },

    /// The action was cancelled while work was in flight.
    #[error("{phase} interrupted before completion")]
    Interrupted {
        phase: Phase,
        partial: Option<Box<Cluster>>,
    },

    /// The provider failed outside any single role's work.
    #[error("compute provider error during {phase}: {source}")]
    Provider {
        phase: Phase,
        source: ComputeError,
        partial: Option<Box<Cluster>>,
    },
}

fn role_list(failures: &[RoleFailure]) -> String {
    let mut roles: Vec<&str> = failures.iter().map(|f| f.role.as_str()).collect();
    roles.sort_unstable();
    roles.dedup();
    roles.join(", ")
}

fn failure_list(failures: &[RoleFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ClusterError {
    /// Distinct names of the roles that failed, sorted.
    pub fn failed_roles(&self) -> Vec<&str> {
        match self {
            ClusterError::Provisioning { failures, .. } => {
                let mut roles: Vec<&str> = failures.iter().map(|f| f.role.as_str()).collect();
                roles.sort_unstable();
                roles.dedup();
                roles
            }
            _ => Vec::new(),
        }
    }

    /// The best-effort cluster carried by the error, if any.
    pub fn partial_cluster(&self) -> Option<&Cluster> {
        match self {
            ClusterError::Provisioning { partial, .. }
            | ClusterError::Interrupted { partial, .. }
            | ClusterError::Provider { partial, .. } => partial.as_deref(),
            ClusterError::Configuration(_) => None,
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, ClusterError::Configuration(_))
    }
}

/// Result type for cluster actions.
pub type Result<T> = std::result::Result<T, ClusterError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(role: &str, stage: FailureStage) -> RoleFailure {
        RoleFailure {
            role: role.to_string(),
            template_index: 0,
            stage,
            reason: "boom".to_string(),
        }
    }

    #[test]
    fn test_provisioning_error_names_every_failing_role() {
        let err = ClusterError::Provisioning {
            phase: Phase::Bootstrap,
            failures: vec![
                failure("datanode", FailureStage::Realize),
                failure("namenode", FailureStage::BeforeAction),
                failure("datanode", FailureStage::AfterAction),
            ],
            partial: None,
        };
        let msg = err.to_string();
        assert!(msg.starts_with("bootstrap failed for roles [datanode, namenode]"));
        assert!(msg.contains("before-action"));
        assert_eq!(err.failed_roles(), vec!["datanode", "namenode"]);
    }

    #[test]
    fn test_provider_error_wraps_compute_error() {
        let err = ClusterError::Provider {
            phase: Phase::Destroy,
            source: ComputeError::Unreachable("timeout".to_string()),
            partial: None,
        };
        assert!(err.to_string().contains("destroy"));
        assert!(err.to_string().contains("timeout"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_partial_cluster_is_exposed() {
        let err = ClusterError::Interrupted {
            phase: Phase::Stop,
            partial: Some(Box::new(Cluster::empty("abc"))),
        };
        assert!(err.partial_cluster().is_some());
        assert!(ClusterError::Configuration("x".into())
            .partial_cluster()
            .is_none());
    }
}
