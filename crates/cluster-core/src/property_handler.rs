//! Handlers declared through `cluster.role.*` properties.
//!
//! ```text
//! cluster.role.web.ports     = tcp:80,tcp:443,tcp:8080@10.0.0.0/8
//! cluster.role.web.bootstrap = apt-get install -y nginx
//! cluster.role.web.start     = systemctl start nginx; systemctl enable nginx
//! ```
//!
//! Ports are opened when the role's instances are created; statements are
//! added during the `action` hook of the named phase.

use std::collections::BTreeMap;

use cluster_compute::{FirewallRule, Protocol, Statement, ANY_SOURCE};

use crate::error::{ClusterError, Result};
use crate::event::ClusterActionEvent;
use crate::handler::{ClusterActionHandler, HandlerRegistry};
use crate::phase::Phase;

const ROLE_PREFIX: &str = "cluster.role.";
const PORTS_SUFFIX: &str = "ports";

/// A handler whose rules and statements come from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyRoleHandler {
    role: String,
    ports: Vec<FirewallRule>,
    statements: BTreeMap<Phase, Vec<Statement>>,
}

impl PropertyRoleHandler {
    pub fn new(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            ..Default::default()
        }
    }

    pub fn ports(&self) -> &[FirewallRule] {
        &self.ports
    }

    pub fn statements_for(&self, phase: Phase) -> &[Statement] {
        self.statements.get(&phase).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Collect one handler per role mentioned under `cluster.role.`.
    pub fn from_properties(properties: &BTreeMap<String, String>) -> Result<Vec<Self>> {
        let mut handlers: BTreeMap<String, PropertyRoleHandler> = BTreeMap::new();

        for (key, value) in properties {
            let Some(rest) = key.strip_prefix(ROLE_PREFIX) else {
                continue;
            };
            let (role, suffix) = rest.rsplit_once('.').ok_or_else(|| {
                ClusterError::Configuration(format!(
                    "property '{key}' must look like {ROLE_PREFIX}<role>.<ports|phase>"
                ))
            })?;
            let handler = handlers
                .entry(role.to_string())
                .or_insert_with(|| PropertyRoleHandler::new(role));

            if suffix == PORTS_SUFFIX {
                for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
                    handler.ports.push(parse_rule(entry)?);
                }
            } else {
                let phase: Phase = suffix.parse()?;
                handler.statements.entry(phase).or_default().extend(
                    value
                        .split(';')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(Statement::new),
                );
            }
        }

        Ok(handlers.into_values().collect())
    }
}

/// Parse `<protocol>:<port>[@<cidr>]`.
fn parse_rule(entry: &str) -> Result<FirewallRule> {
    let invalid = || ClusterError::Configuration(format!("invalid port rule '{entry}'"));

    let (target, source) = match entry.split_once('@') {
        Some((target, source)) => (target, source.trim().to_string()),
        None => (entry, ANY_SOURCE.to_string()),
    };
    let (protocol, port) = target.split_once(':').ok_or_else(invalid)?;
    let protocol: Protocol = protocol.trim().parse().map_err(|_| invalid())?;
    let port: u16 = port.trim().parse().map_err(|_| invalid())?;

    Ok(FirewallRule {
        protocol,
        port,
        source,
    })
}

impl ClusterActionHandler for PropertyRoleHandler {
    fn role(&self) -> &str {
        &self.role
    }

    fn before_action(&self, event: &mut ClusterActionEvent) -> anyhow::Result<()> {
        if event.phase() == Phase::Bootstrap {
            for rule in &self.ports {
                event.open_port(rule.clone());
            }
        }
        Ok(())
    }

    fn action(&self, event: &mut ClusterActionEvent) -> anyhow::Result<()> {
        for statement in self.statements_for(event.phase()) {
            event.add_statement(statement.clone());
        }
        Ok(())
    }
}

impl HandlerRegistry {
    /// Registry holding one [`PropertyRoleHandler`] per configured role.
    pub fn from_properties(properties: &BTreeMap<String, String>) -> Result<Self> {
        let mut registry = HandlerRegistry::new();
        for handler in PropertyRoleHandler::from_properties(properties)? {
            registry.register(std::sync::Arc::new(handler));
        }
        Ok(registry)
    }
}
