//! Structured observability hooks for detcheck sessions.
//!
//! This module provides:
//! - Session-scoped tracing spans via the `CheckSpan` RAII guard
//! - Emission functions for lifecycle events: check start, run start,
//!   downgrades, capability rejections, environment drift and verdicts
//!
//! Every event carries a stable `event = "..."` field. Verbosity follows
//! `RUST_LOG`; see [`crate::telemetry::init_tracing`].

use tracing::{info, warn};

use crate::diff::{Category, Status};
use crate::domain::{Mode, Tier};

/// RAII guard that enters a session-scoped tracing span.
///
/// # Example
///
/// ```ignore
/// let _span = CheckSpan::enter(&session_id.to_string());
/// // tracing calls inside the check carry session_id
/// ```
pub struct CheckSpan {
    _span: tracing::span::EnteredSpan,
}

impl CheckSpan {
    pub fn enter(session_id: &str) -> Self {
        let span = tracing::info_span!("detcheck.session", session_id = %session_id);
        Self {
            _span: span.entered(),
        }
    }
}

/// Emit event: a check or run session started.
///
/// ```ignore
/// emit_check_started("scripted", 3, 4);
/// // logs: event=check.started backend=scripted runs=3 prompts=4
/// ```
pub fn emit_check_started(backend: &str, runs: usize, prompts: usize) {
    info!(event = "check.started", backend = %backend, runs, prompts);
}

/// Emit event: one generation pass started.
pub fn emit_run_started(run_index: usize, batch_size: usize, tier_effective: Tier) {
    info!(
        event = "run.started",
        run_index,
        batch_size,
        tier_effective = %tier_effective,
    );
}

/// Emit event: the effective tier was lowered (warning level).
pub fn emit_session_downgraded(from: Tier, to: Tier, reason: &str) {
    warn!(
        event = "session.downgraded",
        from = %from,
        to = %to,
        reason = %reason,
    );
}

/// Emit event: the backend failed a tier requirement (warning level).
pub fn emit_capability_rejected(requirement: &str, reason: &str, mode: Mode) {
    warn!(
        event = "capability.rejected",
        requirement = %requirement,
        reason = %reason,
        mode = %mode,
    );
}

/// Emit event: a run's environment fingerprint differs from the baseline (warning level).
pub fn emit_env_mismatch(run_index: usize, baseline: &str, current: &str) {
    warn!(
        event = "env.mismatch",
        run_index,
        baseline = %baseline,
        current = %current,
    );
}

/// Emit event: a final verdict was computed.
pub fn emit_verdict_computed(status: Status, category: Category) {
    info!(event = "verdict.computed", status = %status, category = %category);
}
