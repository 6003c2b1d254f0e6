//! Cluster Core Library
//!
//! Lifecycle actions for a cluster of compute instances: the cluster data
//! model, role handlers and the phase actions that drive them.

pub mod action;
pub mod cancel;
pub mod cluster;
pub mod config;
pub mod error;
pub mod event;
pub mod handler;
pub mod obs;
pub mod phase;
pub mod property_handler;
pub mod spec;
pub mod telemetry;

pub use action::{ActionContext, ClusterAction, DirectAction, RoleDispatchAction};
pub use cancel::{cancellation, CancellationHandle, CancellationSignal};
pub use cluster::{Cluster, Instance, InstanceState};
pub use config::{ActionConfig, MAX_CONCURRENCY_KEY};
pub use error::{ClusterError, FailureStage, Result, RoleFailure};
pub use event::ClusterActionEvent;
pub use handler::{ClusterActionHandler, HandlerRegistry};
pub use phase::{Phase, Strategy};
pub use property_handler::PropertyRoleHandler;
pub use spec::{keys, ClusterSpec, ClusterSpecBuilder, InstanceTemplate, KeyMaterial};

pub use cluster_compute::{
    ComputeError, ComputeService, ComputeServiceContextBuilder, FirewallRule, NodeMetadata,
    NodeSelector, ProviderSettings, Script, Statement,
};

pub use obs::{
    emit_group_realized, emit_phase_finished, emit_phase_started, emit_role_failed, ActionSpan,
};
pub use telemetry::init_tracing;

/// Cluster core version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
