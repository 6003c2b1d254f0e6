//! Role-scoped handlers and the registry that resolves them.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::event::ClusterActionEvent;

/// Role-specific logic reacting to a phase.
///
/// For every role occurrence the orchestrator calls, in order,
/// `before_action`, `action` and, once the role group is realized,
/// `after_action`. A hook may only touch the event it is given; anything it
/// needs from other roles must come from [`ClusterActionEvent::cluster`].
/// An error aborts the remaining hooks of that role occurrence.
pub trait ClusterActionHandler: Send + Sync {
    /// Name of the role this handler serves.
    fn role(&self) -> &str;

    fn before_action(&self, _event: &mut ClusterActionEvent) -> anyhow::Result<()> {
        Ok(())
    }

    fn action(&self, _event: &mut ClusterActionEvent) -> anyhow::Result<()> {
        Ok(())
    }

    fn after_action(&self, _event: &mut ClusterActionEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Role name → handlers, in registration order.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, Vec<Arc<dyn ClusterActionHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its own role name.
    pub fn register(&mut self, handler: Arc<dyn ClusterActionHandler>) -> &mut Self {
        self.handlers
            .entry(handler.role().to_string())
            .or_default()
            .push(handler);
        self
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<H>(mut self, handler: H) -> Self
    where
        H: ClusterActionHandler + 'static,
    {
        self.register(Arc::new(handler));
        self
    }

    /// Handlers for `role`; empty for roles nobody registered.
    pub fn handlers_for(&self, role: &str) -> &[Arc<dyn ClusterActionHandler>] {
        self.handlers.get(role).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: BTreeMap<&str, usize> = self
            .handlers
            .iter()
            .map(|(role, hs)| (role.as_str(), hs.len()))
            .collect();
        f.debug_struct("HandlerRegistry")
            .field("handlers", &counts)
            .finish()
    }
}
