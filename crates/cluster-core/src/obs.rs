//! Structured observability hooks for cluster action lifecycle events.
//!
//! This module provides:
//! - Phase-scoped tracing spans via `ActionSpan`
//! - Emission functions for key lifecycle events: phase start/finish, role
//!   failure, role-group realization
//!
//! Events are emitted at `info!` level (`warn!` for failures); filtering and
//! JSON output are configured through [`crate::init_tracing`].

use tracing::{info, warn, Span};

use crate::error::RoleFailure;
use crate::phase::Phase;

/// Span factory for one action run, nested under an injected parent span.
pub struct ActionSpan;

impl ActionSpan {
    /// Child span of `parent` tagged with the phase, cluster and run id.
    pub fn child_of(parent: &Span, phase: Phase, cluster_name: &str) -> Span {
        tracing::info_span!(
            parent: parent,
            "cluster.phase",
            phase = %phase,
            cluster = %cluster_name,
            action_id = %uuid::Uuid::new_v4(),
        )
    }
}

/// Emit event: phase started.
pub fn emit_phase_started(phase: Phase, cluster_name: &str, spec_digest: &str, roles: usize) {
    let short = &spec_digest[..12.min(spec_digest.len())];
    info!(
        event = "phase.started",
        phase = %phase,
        cluster = %cluster_name,
        spec_digest = %short,
        roles = roles,
    );
}

/// Emit event: phase finished with duration, instance count and outcome.
pub fn emit_phase_finished(
    phase: Phase,
    cluster_name: &str,
    duration_ms: u64,
    instances: usize,
    success: bool,
) {
    info!(
        event = "phase.finished",
        phase = %phase,
        cluster = %cluster_name,
        duration_ms = duration_ms,
        instances = instances,
        success = success,
    );
}

/// Emit event: a role occurrence failed (warning level).
pub fn emit_role_failed(phase: Phase, failure: &RoleFailure) {
    warn!(
        event = "role.failed",
        phase = %phase,
        role = %failure.role,
        template_index = failure.template_index,
        stage = %failure.stage,
        reason = %failure.reason,
    );
}

/// Emit event: one role group realized by the provider.
pub fn emit_group_realized(phase: Phase, roles: &str, instances: usize, rules: usize) {
    info!(
        event = "group.realized",
        phase = %phase,
        roles = %roles,
        instances = instances,
        firewall_rules = rules,
    );
}
