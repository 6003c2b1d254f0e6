//! In-memory fakes for the compute traits (testing and dry runs)
//!
//! Provides `MemoryComputeService` and `MemoryContextBuilder`, which satisfy
//! the trait contracts without reaching any cloud provider. The service keeps
//! a call log, tracks how many calls overlap, and supports failure and
//! latency injection.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use crate::compute::*;
use crate::error::ComputeError;

/// Provider id answered by [`MemoryContextBuilder`].
pub const STUB_PROVIDER: &str = "stub";

/// One recorded call against a [`MemoryComputeService`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComputeCall {
    CreateNodes {
        tag: String,
        roles: BTreeSet<String>,
        count: u32,
    },
    ListNodes {
        tag: String,
    },
    AuthorizeIngress {
        tag: String,
        rules: Vec<FirewallRule>,
    },
    RunScript {
        node_id: String,
    },
    SuspendNodes {
        tag: String,
    },
    ResumeNodes {
        tag: String,
    },
    DestroyNodes {
        tag: String,
    },
}

#[derive(Debug, Default)]
struct FakeState {
    nodes: BTreeMap<String, NodeMetadata>,
    ingress: Vec<(String, FirewallRule)>,
    scripts: Vec<(String, Script)>,
    calls: Vec<ComputeCall>,
    next_address: u32,
}

#[derive(Debug, Default)]
struct Faults {
    reject_create_roles: BTreeSet<String>,
    failing_script_roles: BTreeMap<String, i32>,
    destroy_error: Option<ComputeError>,
    suspend_error: Option<ComputeError>,
    latency: Option<Duration>,
}

// ---------------------------------------------------------------------------
// MemoryComputeService
// ---------------------------------------------------------------------------

/// In-memory compute provider backed by a `BTreeMap<node id, NodeMetadata>`.
#[derive(Debug, Default)]
pub struct MemoryComputeService {
    state: Mutex<FakeState>,
    faults: Mutex<Faults>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// Counts one call as in flight until dropped, even when the caller abandons it.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryComputeService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every `create_nodes` call whose role group contains `role`.
    pub fn reject_create_for_role(&self, role: impl Into<String>) {
        self.faults
            .lock()
            .unwrap()
            .reject_create_roles
            .insert(role.into());
    }

    /// Scripts on nodes carrying `role` exit with `exit_code`.
    pub fn fail_scripts_for_role(&self, role: impl Into<String>, exit_code: i32) {
        self.faults
            .lock()
            .unwrap()
            .failing_script_roles
            .insert(role.into(), exit_code);
    }

    /// Every destroy call fails with `err`.
    pub fn fail_destroy_with(&self, err: ComputeError) {
        self.faults.lock().unwrap().destroy_error = Some(err);
    }

    /// Every suspend call fails with `err`.
    pub fn fail_suspend_with(&self, err: ComputeError) {
        self.faults.lock().unwrap().suspend_error = Some(err);
    }

    /// Delay every call by `latency` before it touches state.
    pub fn set_latency(&self, latency: Duration) {
        self.faults.lock().unwrap().latency = Some(latency);
    }

    /// Put a node under the service's control, e.g. one recorded by an
    /// earlier process. An existing node with the same id is replaced.
    pub fn restore_node(&self, node: NodeMetadata) {
        self.state
            .lock()
            .unwrap()
            .nodes
            .insert(node.id.clone(), node);
    }

    /// Most calls that were ever in flight at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Snapshot of every call made so far, in order.
    pub fn calls(&self) -> Vec<ComputeCall> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Live (non-terminated) nodes.
    pub fn nodes(&self) -> Vec<NodeMetadata> {
        self.state.lock().unwrap().nodes.values().cloned().collect()
    }

    /// Scripts delivered to `node_id`, at creation or later.
    pub fn scripts_for(&self, node_id: &str) -> Vec<Script> {
        self.state
            .lock()
            .unwrap()
            .scripts
            .iter()
            .filter(|(id, _)| id == node_id)
            .map(|(_, script)| script.clone())
            .collect()
    }

    /// Ingress rules opened on `node_id`.
    pub fn ingress_for(&self, node_id: &str) -> Vec<FirewallRule> {
        self.state
            .lock()
            .unwrap()
            .ingress
            .iter()
            .filter(|(id, _)| id == node_id)
            .map(|(_, rule)| rule.clone())
            .collect()
    }

    async fn delay(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _in_flight = InFlight(&self.in_flight);
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        let latency = self.faults.lock().unwrap().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn record(&self, call: ComputeCall) {
        self.state.lock().unwrap().calls.push(call);
    }
}

#[async_trait]
impl ComputeService for MemoryComputeService {
    async fn create_nodes(&self, request: &NodeRequest) -> ComputeResult<Vec<NodeMetadata>> {
        self.record(ComputeCall::CreateNodes {
            tag: request.tag.clone(),
            roles: request.roles.clone(),
            count: request.count,
        });
        self.delay().await;

        {
            let faults = self.faults.lock().unwrap();
            if let Some(role) = request
                .roles
                .iter()
                .find(|r| faults.reject_create_roles.contains(*r))
            {
                return Err(ComputeError::Rejected {
                    reason: format!("cannot place nodes for role {role}"),
                });
            }
        }

        let mut state = self.state.lock().unwrap();
        let mut created = Vec::with_capacity(request.count as usize);
        for _ in 0..request.count {
            state.next_address += 1;
            let n = state.next_address;
            let node = NodeMetadata {
                id: format!("{STUB_PROVIDER}-{}", Uuid::new_v4()),
                tag: request.tag.clone(),
                roles: request.roles.clone(),
                public_address: Some(format!("203.0.113.{}", n % 250 + 1)),
                private_address: Some(format!("10.0.{}.{}", n / 250, n % 250 + 1)),
                state: NodeState::Running,
                created_at: Utc::now(),
            };
            for rule in &request.firewall_rules {
                state.ingress.push((node.id.clone(), rule.clone()));
            }
            if !request.script.is_empty() {
                state.scripts.push((node.id.clone(), request.script.clone()));
            }
            state.nodes.insert(node.id.clone(), node.clone());
            created.push(node);
        }
        debug!(tag = %request.tag, count = created.len(), "created stub nodes");
        Ok(created)
    }

    async fn list_nodes_matching(
        &self,
        selector: &NodeSelector,
    ) -> ComputeResult<Vec<NodeMetadata>> {
        self.record(ComputeCall::ListNodes {
            tag: selector.tag.clone(),
        });
        self.delay().await;
        let state = self.state.lock().unwrap();
        Ok(state
            .nodes
            .values()
            .filter(|n| selector.matches(n))
            .cloned()
            .collect())
    }

    async fn authorize_ingress(
        &self,
        selector: &NodeSelector,
        rules: &[FirewallRule],
    ) -> ComputeResult<()> {
        self.record(ComputeCall::AuthorizeIngress {
            tag: selector.tag.clone(),
            rules: rules.to_vec(),
        });
        self.delay().await;
        let mut state = self.state.lock().unwrap();
        let targets: Vec<String> = state
            .nodes
            .values()
            .filter(|n| selector.matches(n))
            .map(|n| n.id.clone())
            .collect();
        for id in targets {
            for rule in rules {
                state.ingress.push((id.clone(), rule.clone()));
            }
        }
        Ok(())
    }

    async fn run_script(&self, node_id: &str, script: &Script) -> ComputeResult<ExecResponse> {
        self.record(ComputeCall::RunScript {
            node_id: node_id.to_string(),
        });
        self.delay().await;

        let roles = {
            let state = self.state.lock().unwrap();
            let node = state
                .nodes
                .get(node_id)
                .ok_or_else(|| ComputeError::NodeNotFound {
                    node_id: node_id.to_string(),
                })?;
            if node.state != NodeState::Running {
                return Err(ComputeError::Rejected {
                    reason: format!("node {node_id} is not running"),
                });
            }
            node.roles.clone()
        };

        let exit_code = {
            let faults = self.faults.lock().unwrap();
            roles
                .iter()
                .find_map(|r| faults.failing_script_roles.get(r).copied())
                .unwrap_or(0)
        };

        self.state
            .lock()
            .unwrap()
            .scripts
            .push((node_id.to_string(), script.clone()));

        Ok(ExecResponse {
            node_id: node_id.to_string(),
            exit_code,
            output: script.render(),
        })
    }

    async fn suspend_nodes_matching(
        &self,
        selector: &NodeSelector,
    ) -> ComputeResult<Vec<NodeMetadata>> {
        self.record(ComputeCall::SuspendNodes {
            tag: selector.tag.clone(),
        });
        self.delay().await;
        if let Some(err) = self.faults.lock().unwrap().suspend_error.clone() {
            return Err(err);
        }
        let mut state = self.state.lock().unwrap();
        let mut suspended = Vec::new();
        for node in state.nodes.values_mut().filter(|n| selector.matches(n)) {
            node.state = NodeState::Suspended;
            suspended.push(node.clone());
        }
        Ok(suspended)
    }

    async fn resume_nodes_matching(
        &self,
        selector: &NodeSelector,
    ) -> ComputeResult<Vec<NodeMetadata>> {
        self.record(ComputeCall::ResumeNodes {
            tag: selector.tag.clone(),
        });
        self.delay().await;
        let mut state = self.state.lock().unwrap();
        let mut resumed = Vec::new();
        for node in state.nodes.values_mut().filter(|n| selector.matches(n)) {
            node.state = NodeState::Running;
            resumed.push(node.clone());
        }
        Ok(resumed)
    }

    async fn destroy_nodes_matching(&self, selector: &NodeSelector) -> ComputeResult<usize> {
        self.record(ComputeCall::DestroyNodes {
            tag: selector.tag.clone(),
        });
        self.delay().await;
        if let Some(err) = self.faults.lock().unwrap().destroy_error.clone() {
            return Err(err);
        }
        let mut state = self.state.lock().unwrap();
        let before = state.nodes.len();
        state.nodes.retain(|_, n| !selector.matches(n));
        Ok(before - state.nodes.len())
    }
}

// ---------------------------------------------------------------------------
// MemoryContextBuilder
// ---------------------------------------------------------------------------

/// Context builder that hands out one shared [`MemoryComputeService`] for the
/// `stub` provider and rejects every other provider id.
#[derive(Debug, Clone, Default)]
pub struct MemoryContextBuilder {
    service: Arc<MemoryComputeService>,
}

impl MemoryContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(service: Arc<MemoryComputeService>) -> Self {
        Self { service }
    }

    /// The shared service, for assertions.
    pub fn service(&self) -> Arc<MemoryComputeService> {
        Arc::clone(&self.service)
    }
}

impl ComputeServiceContextBuilder for MemoryContextBuilder {
    fn build(&self, settings: &ProviderSettings) -> ComputeResult<Arc<dyn ComputeService>> {
        if settings.provider != STUB_PROVIDER {
            return Err(ComputeError::UnknownProvider {
                provider: settings.provider.clone(),
            });
        }
        Ok(Arc::clone(&self.service) as Arc<dyn ComputeService>)
    }
}
