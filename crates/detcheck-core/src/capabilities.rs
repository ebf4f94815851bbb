//! Capability negotiation between a determinism request and a backend.

use serde::{Deserialize, Serialize};

use crate::backend::BackendCapabilities;
use crate::domain::{Mode, Tier};
use crate::obs;
use crate::session::DeterminismApplied;

/// Reason recorded when capability limits lower the effective tier.
pub const CAPABILITY_DOWNGRADE_REASON: &str = "capability limits";

/// A tier requirement the backend does not meet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityFailure {
    pub requirement: String,
    pub reason: String,
}

impl CapabilityFailure {
    fn new(requirement: &str, reason: &str) -> Self {
        Self {
            requirement: requirement.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Outcome of [`evaluate_capabilities`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityDecision {
    pub supported: bool,
    pub tier_effective: Tier,
    pub capability_failures: Vec<CapabilityFailure>,
    pub notes: Vec<String>,
}

/// Reconcile `tier_requested` with what the backend declares.
///
/// Requirements are checked in a fixed order and independently of each other:
///
/// 1. tier ≥ 1 needs deterministic framework execution (`torch_deterministic`, floor 0)
/// 2. tier ≥ 1 needs fixed-batch repeatability (`tier1_fixed_batch`, floor 0)
/// 3. tier ≥ 2 needs score capture (`scores`, floor 1)
///
/// Failures are always appended to `applied.capability_failures`. In strict
/// mode any failure makes the request unsupported and leaves the effective
/// tier of `applied` untouched. In best-effort mode the effective tier drops
/// to the lowest floor, recording one downgrade if it actually decreases.
pub fn evaluate_capabilities(
    applied: &mut DeterminismApplied,
    capabilities: &BackendCapabilities,
    tier_requested: Tier,
    mode: Mode,
) -> CapabilityDecision {
    let mut failures = Vec::new();
    let mut floor = tier_requested;

    if tier_requested >= Tier::FIXED_BATCH && !capabilities.supports_torch_deterministic {
        failures.push(CapabilityFailure::new(
            "torch_deterministic",
            "backend does not support deterministic framework controls",
        ));
        floor = floor.min(Tier::NONE);
    }

    if tier_requested >= Tier::FIXED_BATCH && !capabilities.supports_tier1_fixed_batch {
        failures.push(CapabilityFailure::new(
            "tier1_fixed_batch",
            "backend does not support fixed-batch repeatability",
        ));
        floor = floor.min(Tier::NONE);
    }

    if tier_requested >= Tier::SCORES && !capabilities.supports_scores {
        failures.push(CapabilityFailure::new(
            "scores",
            "backend does not support score/logprob capture",
        ));
        floor = floor.min(Tier::FIXED_BATCH);
    }

    let notes = capabilities.notes.clone();
    if failures.is_empty() {
        return CapabilityDecision {
            supported: true,
            tier_effective: applied.tier_effective,
            capability_failures: failures,
            notes,
        };
    }

    applied.capability_failures.extend(failures.iter().cloned());
    for failure in &failures {
        obs::emit_capability_rejected(&failure.requirement, &failure.reason, mode);
    }

    match mode {
        Mode::Strict => CapabilityDecision {
            supported: false,
            tier_effective: floor,
            capability_failures: failures,
            notes,
        },
        Mode::BestEffort => {
            applied.downgrade(floor, CAPABILITY_DOWNGRADE_REASON);
            CapabilityDecision {
                supported: true,
                tier_effective: applied.tier_effective,
                capability_failures: failures,
                notes,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DeterminismRequest;

    fn applied(tier: Tier, mode: Mode) -> DeterminismApplied {
        DeterminismApplied::new(&DeterminismRequest::new(tier, mode, Some(0)))
    }

    fn caps(torch: bool, fixed_batch: bool, scores: bool) -> BackendCapabilities {
        BackendCapabilities {
            supports_tier1_fixed_batch: fixed_batch,
            supports_scores: scores,
            supports_torch_deterministic: torch,
            notes: vec!["note".to_string()],
        }
    }

    #[test]
    fn test_tier2_without_scores_best_effort_downgrades_to_1() {
        let mut record = applied(Tier::SCORES, Mode::BestEffort);
        let decision = evaluate_capabilities(
            &mut record,
            &caps(true, true, false),
            Tier::SCORES,
            Mode::BestEffort,
        );
        assert!(decision.supported);
        assert_eq!(decision.tier_effective, Tier::FIXED_BATCH);
        assert_eq!(record.tier_effective, Tier::FIXED_BATCH);
        assert_eq!(record.downgrades.len(), 1);
        assert_eq!(record.downgrades[0].from, Tier::SCORES);
        assert_eq!(record.downgrades[0].to, Tier::FIXED_BATCH);
        assert_eq!(record.downgrades[0].reason, CAPABILITY_DOWNGRADE_REASON);
        assert_eq!(record.capability_failures.len(), 1);
        assert_eq!(record.capability_failures[0].requirement, "scores");
    }

    #[test]
    fn test_tier2_without_scores_strict_is_unsupported() {
        let mut record = applied(Tier::SCORES, Mode::Strict);
        let decision = evaluate_capabilities(
            &mut record,
            &caps(true, true, false),
            Tier::SCORES,
            Mode::Strict,
        );
        assert!(!decision.supported);
        assert_eq!(decision.tier_effective, Tier::FIXED_BATCH);
        assert_eq!(record.tier_effective, Tier::SCORES);
        assert!(record.downgrades.is_empty());
        assert_eq!(record.capability_failures.len(), 1);
    }

    #[test]
    fn test_all_failures_are_evaluated_in_order() {
        let mut record = applied(Tier::SCORES, Mode::BestEffort);
        let decision = evaluate_capabilities(
            &mut record,
            &caps(false, false, false),
            Tier::SCORES,
            Mode::BestEffort,
        );
        let requirements: Vec<&str> = decision
            .capability_failures
            .iter()
            .map(|f| f.requirement.as_str())
            .collect();
        assert_eq!(
            requirements,
            vec!["torch_deterministic", "tier1_fixed_batch", "scores"]
        );
        assert_eq!(decision.tier_effective, Tier::NONE);
        assert_eq!(record.downgrades.len(), 1);
        assert_eq!(decision.notes, vec!["note".to_string()]);
    }

    #[test]
    fn test_no_failures_keeps_session_tier() {
        let mut record = applied(Tier::SCORES, Mode::BestEffort);
        record.downgrade(Tier::NONE, "framework controls failed");
        let decision = evaluate_capabilities(
            &mut record,
            &caps(true, true, true),
            Tier::SCORES,
            Mode::BestEffort,
        );
        assert!(decision.supported);
        assert_eq!(decision.tier_effective, Tier::NONE);
        assert!(decision.capability_failures.is_empty());
    }

    #[test]
    fn test_floor_above_session_tier_records_no_downgrade() {
        let mut record = applied(Tier::SCORES, Mode::BestEffort);
        record.downgrade(Tier::NONE, "framework controls failed");
        let decision = evaluate_capabilities(
            &mut record,
            &caps(true, true, false),
            Tier::SCORES,
            Mode::BestEffort,
        );
        assert!(decision.supported);
        assert_eq!(decision.tier_effective, Tier::NONE);
        assert_eq!(record.downgrades.len(), 1);
        assert_eq!(record.capability_failures.len(), 1);
    }

    #[test]
    fn test_tier0_has_no_requirements() {
        let mut record = applied(Tier::NONE, Mode::Strict);
        let decision =
            evaluate_capabilities(&mut record, &caps(false, false, false), Tier::NONE, Mode::Strict);
        assert!(decision.supported);
        assert!(record.capability_failures.is_empty());
    }
}
