//! Cluster-Compute: provider boundary for cluster actions
//!
//! This crate defines what the cluster-action core asks of a cloud provider
//! and nothing more. A real provider SDK lives behind
//! [`ComputeServiceContextBuilder`]; the core only sees the opaque
//! [`ComputeService`] handle it returns.
//!
//! ## Key Components
//!
//! - `ComputeService`: node creation, listing, ingress, scripts, suspend, resume, destroy
//! - `NodeRequest` / `NodeSelector` / `NodeMetadata`: boundary value types
//! - `FirewallRule` / `Statement` / `Script`: accumulated intent realized per role group
//! - `fakes`: in-memory provider used by tests and the `stub` provider id

pub mod compute;
mod error;
pub mod fakes;

pub use compute::{
    ComputeResult, ComputeService, ComputeServiceContextBuilder, ExecResponse, FirewallRule,
    NodeMetadata, NodeRequest, NodeSelector, NodeState, Protocol, ProviderSettings, Script,
    Statement, ANY_SOURCE,
};
pub use error::ComputeError;
