//! Observability tests for detcheck session lifecycle tracing.

use detcheck_core::obs::{
    emit_capability_rejected, emit_check_started, emit_env_mismatch, emit_run_started,
    emit_session_downgraded, emit_verdict_computed, CheckSpan,
};
use detcheck_core::{
    evaluate_capabilities, BackendCapabilities, Category, DeterminismRequest, DeterminismRuntime,
    DeterminismSession, Mode, Status, Tier, UnavailableFramework,
};
use tracing_test::traced_test;

#[traced_test]
#[test]
fn test_lifecycle_events_carry_event_names() {
    let _span = CheckSpan::enter("session-obs-1");
    emit_check_started("scripted", 3, 2);
    emit_run_started(0, 1, Tier::FIXED_BATCH);
    emit_env_mismatch(1, "aaaa", "bbbb");
    emit_verdict_computed(Status::Fail, Category::EnvMismatch);

    assert!(logs_contain("check.started"));
    assert!(logs_contain("run.started"));
    assert!(logs_contain("env.mismatch"));
    assert!(logs_contain("verdict.computed"));
    assert!(logs_contain("session-obs-1"));
}

#[traced_test]
#[test]
fn test_downgrade_and_rejection_are_warnings() {
    emit_session_downgraded(Tier::SCORES, Tier::FIXED_BATCH, "capability limits");
    emit_capability_rejected("scores", "no logprobs", Mode::Strict);
    assert!(logs_contain("session.downgraded"));
    assert!(logs_contain("capability.rejected"));
    assert!(logs_contain("WARN"));
}

#[traced_test]
#[test]
fn test_best_effort_session_logs_its_downgrade() {
    let mut runtime = DeterminismRuntime::new(Box::new(UnavailableFramework::new("no library")));
    let mut session = DeterminismSession::open(
        &mut runtime,
        DeterminismRequest::new(Tier::SCORES, Mode::BestEffort, None),
    )
    .expect("best-effort open");
    let caps = BackendCapabilities {
        supports_scores: false,
        ..BackendCapabilities::full()
    };
    evaluate_capabilities(session.applied_mut(), &caps, Tier::SCORES, Mode::BestEffort);
    let applied = session.close();

    assert_eq!(applied.tier_effective, Tier::NONE);
    assert_eq!(applied.downgrades.len(), 1);
    assert!(logs_contain("session.downgraded"));
    assert!(logs_contain("capability.rejected"));
}
