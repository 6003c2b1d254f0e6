//! Lifecycle phases and the orchestration strategy each one uses.

use serde::{Deserialize, Serialize};

use crate::error::ClusterError;

/// One named lifecycle step of a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Bootstrap,
    Configure,
    Start,
    Stop,
    Destroy,
}

/// How a phase is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Per-role handler dispatch, merged into one realization per role group.
    RoleDispatch,
    /// One provider call against every node tagged with the cluster name.
    Direct,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Bootstrap,
        Phase::Configure,
        Phase::Start,
        Phase::Stop,
        Phase::Destroy,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Phase::Bootstrap => "bootstrap",
            Phase::Configure => "configure",
            Phase::Start => "start",
            Phase::Stop => "stop",
            Phase::Destroy => "destroy",
        }
    }

    pub fn strategy(&self) -> Strategy {
        match self {
            Phase::Bootstrap | Phase::Configure | Phase::Start => Strategy::RoleDispatch,
            Phase::Stop | Phase::Destroy => Strategy::Direct,
        }
    }

    /// Idempotent phases keep their best-effort partial state on failure.
    pub fn is_idempotent(&self) -> bool {
        matches!(self, Phase::Stop | Phase::Destroy)
    }

    /// Phases that act on instances a previous bootstrap created.
    pub fn requires_cluster(&self) -> bool {
        matches!(self, Phase::Configure | Phase::Start)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for Phase {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .iter()
            .copied()
            .find(|p| p.name() == s.trim().to_ascii_lowercase())
            .ok_or_else(|| ClusterError::Configuration(format!("unknown phase: {s}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_names_round_trip_through_from_str() {
        for phase in Phase::ALL {
            assert_eq!(phase.name().parse::<Phase>().unwrap(), phase);
        }
        assert_eq!(" Bootstrap ".parse::<Phase>().unwrap(), Phase::Bootstrap);
    }

    #[test]
    fn test_unknown_phase_is_configuration_error() {
        let err = "reboot".parse::<Phase>().unwrap_err();
        assert!(matches!(err, ClusterError::Configuration(_)));
        assert!(err.to_string().contains("reboot"));
    }

    #[test]
    fn test_strategy_split() {
        assert_eq!(Phase::Bootstrap.strategy(), Strategy::RoleDispatch);
        assert_eq!(Phase::Configure.strategy(), Strategy::RoleDispatch);
        assert_eq!(Phase::Start.strategy(), Strategy::RoleDispatch);
        assert_eq!(Phase::Stop.strategy(), Strategy::Direct);
        assert_eq!(Phase::Destroy.strategy(), Strategy::Direct);
    }

    #[test]
    fn test_only_stop_and_destroy_are_idempotent() {
        let idempotent: Vec<Phase> = Phase::ALL
            .into_iter()
            .filter(|p| p.is_idempotent())
            .collect();
        assert_eq!(idempotent, vec![Phase::Stop, Phase::Destroy]);
    }
}
