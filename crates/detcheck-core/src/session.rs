//! Scoped determinism sessions.
//!
//! A [`DeterminismSession`] borrows a [`DeterminismRuntime`] exclusively for its
//! lifetime. On open it captures the generator state, seeds the process and
//! framework generators and asks the framework for deterministic algorithms.
//! On close (or drop, on any exit path) it puts the captured generator state
//! back. What was requested versus applied is recorded in
//! [`DeterminismApplied`], which is frozen once the session closes.

use std::collections::BTreeMap;
use std::fmt;

use rand::{RngCore, SeedableRng};
use rand_pcg::Pcg64;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::capabilities::CapabilityFailure;
use crate::domain::{ControlError, DetError, DeterminismRequest, Mode, Result, Tier};
use crate::obs;

/// Pseudo-random generator state that a session seeds and later restores.
#[derive(Debug, Clone)]
pub struct RandomState {
    rng: Pcg64,
}

impl RandomState {
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Pcg64::seed_from_u64(seed),
        }
    }

    pub fn from_entropy() -> Self {
        Self {
            rng: Pcg64::from_entropy(),
        }
    }

    pub fn reseed(&mut self, seed: u64) {
        self.rng = Pcg64::seed_from_u64(seed);
    }

    pub fn next_u64(&mut self) -> u64 {
        self.rng.next_u64()
    }
}

impl Default for RandomState {
    fn default() -> Self {
        Self::from_entropy()
    }
}

/// Determinism switches of the inference library the backend runs on.
pub trait FrameworkControls {
    fn name(&self) -> &str;

    /// The framework's own generator.
    fn rng(&mut self) -> std::result::Result<&mut RandomState, ControlError>;

    fn use_deterministic_algorithms(
        &mut self,
        enabled: bool,
    ) -> std::result::Result<(), ControlError>;

    /// Environment variables whose values are recorded while the session is open.
    fn control_env_vars(&self) -> Vec<&'static str> {
        vec!["CUBLAS_WORKSPACE_CONFIG"]
    }
}

/// In-process framework with its own generator.
#[derive(Debug, Clone)]
pub struct SeededFramework {
    rng: RandomState,
    deterministic: bool,
    refuse_deterministic: bool,
}

impl SeededFramework {
    pub fn new() -> Self {
        Self {
            rng: RandomState::from_entropy(),
            deterministic: false,
            refuse_deterministic: false,
        }
    }

    /// A framework whose configuration cannot enable deterministic algorithms.
    pub fn refusing_deterministic_algorithms() -> Self {
        Self {
            refuse_deterministic: true,
            ..Self::new()
        }
    }

    pub fn deterministic_algorithms(&self) -> bool {
        self.deterministic
    }
}

impl Default for SeededFramework {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameworkControls for SeededFramework {
    fn name(&self) -> &str {
        "seeded"
    }

    fn rng(&mut self) -> std::result::Result<&mut RandomState, ControlError> {
        Ok(&mut self.rng)
    }

    fn use_deterministic_algorithms(
        &mut self,
        enabled: bool,
    ) -> std::result::Result<(), ControlError> {
        if enabled && self.refuse_deterministic {
            return Err(ControlError::Rejected {
                control: "use_deterministic_algorithms".to_string(),
                reason: "deterministic algorithms unsupported in this configuration".to_string(),
            });
        }
        self.deterministic = enabled;
        Ok(())
    }
}

/// Stand-in for an absent inference library: every control fails.
#[derive(Debug, Clone)]
pub struct UnavailableFramework {
    reason: String,
}

impl UnavailableFramework {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl FrameworkControls for UnavailableFramework {
    fn name(&self) -> &str {
        "unavailable"
    }

    fn rng(&mut self) -> std::result::Result<&mut RandomState, ControlError> {
        Err(ControlError::Unavailable(self.reason.clone()))
    }

    fn use_deterministic_algorithms(
        &mut self,
        _enabled: bool,
    ) -> std::result::Result<(), ControlError> {
        Err(ControlError::Unavailable(self.reason.clone()))
    }
}

/// Randomness and framework handles owned by whoever drives the sessions.
///
/// Only one session can hold the runtime at a time.
pub struct DeterminismRuntime {
    rng: RandomState,
    framework: Box<dyn FrameworkControls>,
}

impl DeterminismRuntime {
    pub fn new(framework: Box<dyn FrameworkControls>) -> Self {
        Self::with_rng(RandomState::from_entropy(), framework)
    }

    pub fn with_rng(rng: RandomState, framework: Box<dyn FrameworkControls>) -> Self {
        Self { rng, framework }
    }

    /// Runtime backed by [`SeededFramework`].
    pub fn in_process() -> Self {
        Self::new(Box::new(SeededFramework::new()))
    }

    /// The process-level generator.
    pub fn rng(&mut self) -> &mut RandomState {
        &mut self.rng
    }

    pub fn framework_mut(&mut self) -> &mut dyn FrameworkControls {
        self.framework.as_mut()
    }
}

impl fmt::Debug for DeterminismRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeterminismRuntime")
            .field("framework", &self.framework.name())
            .finish_non_exhaustive()
    }
}

/// One recorded decrease of the effective tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Downgrade {
    pub from: Tier,
    pub to: Tier,
    pub reason: String,
}

/// What a session was asked for and what it actually achieved.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeterminismApplied {
    pub tier_requested: Tier,
    pub tier_effective: Tier,
    pub mode: Mode,
    pub seed: Option<u64>,
    pub seed_controls: BTreeMap<String, bool>,
    pub framework_controls: BTreeMap<String, bool>,
    pub env_controls: BTreeMap<String, Option<String>>,
    pub downgrades: Vec<Downgrade>,
    pub warnings: Vec<String>,
    pub capability_failures: Vec<CapabilityFailure>,
}

impl DeterminismApplied {
    pub fn new(request: &DeterminismRequest) -> Self {
        Self {
            tier_requested: request.tier,
            tier_effective: request.tier,
            mode: request.mode,
            seed: request.seed,
            ..Self::default()
        }
    }

    /// Lower the effective tier to `to`, appending exactly one downgrade entry.
    ///
    /// Returns `false` and records nothing when `to` is not below the current
    /// effective tier; the tier is never raised.
    pub fn downgrade(&mut self, to: Tier, reason: impl Into<String>) -> bool {
        if to >= self.tier_effective {
            return false;
        }
        let entry = Downgrade {
            from: self.tier_effective,
            to,
            reason: reason.into(),
        };
        obs::emit_session_downgraded(entry.from, entry.to, &entry.reason);
        self.tier_effective = to;
        self.downgrades.push(entry);
        true
    }
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    ControlsApplied,
    Downgraded,
    Closed,
    Aborted,
}

/// Scoped application of determinism controls over a borrowed runtime.
#[derive(Debug)]
pub struct DeterminismSession<'rt> {
    runtime: &'rt mut DeterminismRuntime,
    applied: DeterminismApplied,
    state: SessionState,
    saved_rng: Option<RandomState>,
    saved_framework_rng: Option<RandomState>,
}

impl<'rt> DeterminismSession<'rt> {
    /// Open a session and apply seed and framework controls.
    ///
    /// In strict mode a framework control failure aborts the session: the
    /// captured generator state is restored and
    /// [`DetError::ControlApplication`] is returned. In best-effort mode the
    /// failure downgrades the effective tier to 0 and is kept as a warning.
    pub fn open(runtime: &'rt mut DeterminismRuntime, request: DeterminismRequest) -> Result<Self> {
        let saved_rng = Some(runtime.rng.clone());
        let mut session = Self {
            runtime,
            applied: DeterminismApplied::new(&request),
            state: SessionState::Init,
            saved_rng,
            saved_framework_rng: None,
        };

        session.runtime.rng.reseed(request.effective_seed());
        session
            .applied
            .seed_controls
            .insert("process_rng".to_string(), true);

        match session.apply_framework_controls(&request) {
            Ok(()) => session.state = SessionState::ControlsApplied,
            Err((control, err)) => match request.mode {
                Mode::Strict => {
                    session.state = SessionState::Aborted;
                    warn!(
                        framework = session.runtime.framework.name(),
                        control, error = %err, "strict session aborted"
                    );
                    return Err(DetError::ControlApplication {
                        control: control.to_string(),
                        reason: err.to_string(),
                    });
                }
                Mode::BestEffort => {
                    session.applied.downgrade(
                        Tier::NONE,
                        format!("failed to apply framework controls: {err}"),
                    );
                    session.applied.warnings.push(err.to_string());
                    session.state = SessionState::Downgraded;
                }
            },
        }

        debug!(
            tier_requested = %session.applied.tier_requested,
            tier_effective = %session.applied.tier_effective,
            state = ?session.state,
            "determinism session opened"
        );
        Ok(session)
    }

    fn apply_framework_controls(
        &mut self,
        request: &DeterminismRequest,
    ) -> std::result::Result<(), (&'static str, ControlError)> {
        let framework = self.runtime.framework.as_mut();

        let rng = framework.rng().map_err(|e| ("framework_rng", e))?;
        self.saved_framework_rng = Some(rng.clone());
        if let Some(seed) = request.seed {
            rng.reseed(seed);
            self.applied
                .seed_controls
                .insert("framework_manual_seed".to_string(), true);
        }

        let switched = framework.use_deterministic_algorithms(true);
        self.applied
            .framework_controls
            .insert("use_deterministic_algorithms".to_string(), switched.is_ok());
        switched.map_err(|e| ("use_deterministic_algorithms", e))?;

        for name in framework.control_env_vars() {
            self.applied
                .env_controls
                .insert(name.to_string(), std::env::var(name).ok());
        }
        Ok(())
    }

    pub fn applied(&self) -> &DeterminismApplied {
        &self.applied
    }

    /// Mutable record for the capability negotiator.
    pub fn applied_mut(&mut self) -> &mut DeterminismApplied {
        &mut self.applied
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Process generator, seeded for the lifetime of the session.
    pub fn rng(&mut self) -> &mut RandomState {
        &mut self.runtime.rng
    }

    /// Restore generator state and return the frozen record.
    pub fn close(mut self) -> DeterminismApplied {
        self.restore();
        self.state = SessionState::Closed;
        std::mem::take(&mut self.applied)
    }

    fn restore(&mut self) {
        if let Some(saved) = self.saved_rng.take() {
            self.runtime.rng = saved;
        }
        if let Some(saved) = self.saved_framework_rng.take() {
            match self.runtime.framework.rng() {
                Ok(rng) => *rng = saved,
                Err(e) => debug!(error = %e, "framework generator not restored"),
            }
        }
    }
}

impl Drop for DeterminismSession<'_> {
    fn drop(&mut self) {
        self.restore();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(tier: Tier, mode: Mode, seed: Option<u64>) -> DeterminismRequest {
        DeterminismRequest::new(tier, mode, seed)
    }

    #[test]
    fn test_controls_applied_keep_requested_tier() {
        let mut runtime = DeterminismRuntime::in_process();
        let session =
            DeterminismSession::open(&mut runtime, request(Tier::SCORES, Mode::Strict, Some(7)))
                .expect("open");
        assert_eq!(session.state(), SessionState::ControlsApplied);
        let applied = session.close();
        assert_eq!(applied.tier_effective, Tier::SCORES);
        assert!(applied.downgrades.is_empty());
        assert_eq!(applied.seed_controls.get("process_rng"), Some(&true));
        assert_eq!(applied.seed_controls.get("framework_manual_seed"), Some(&true));
        assert_eq!(
            applied.framework_controls.get("use_deterministic_algorithms"),
            Some(&true)
        );
        assert!(applied.env_controls.contains_key("CUBLAS_WORKSPACE_CONFIG"));
    }

    #[test]
    fn test_unavailable_framework_best_effort_downgrades_to_zero() {
        let mut runtime =
            DeterminismRuntime::new(Box::new(UnavailableFramework::new("no torch")));
        let session = DeterminismSession::open(
            &mut runtime,
            request(Tier::FIXED_BATCH, Mode::BestEffort, None),
        )
        .expect("best-effort never fails on controls");
        assert_eq!(session.state(), SessionState::Downgraded);
        let applied = session.close();
        assert_eq!(applied.tier_effective, Tier::NONE);
        assert_eq!(applied.downgrades.len(), 1);
        assert_eq!(applied.downgrades[0].from, Tier::FIXED_BATCH);
        assert_eq!(applied.downgrades[0].to, Tier::NONE);
        assert!(applied.downgrades[0].reason.contains("no torch"));
        assert_eq!(applied.warnings, vec!["framework not available: no torch"]);
    }

    #[test]
    fn test_unavailable_framework_strict_aborts() {
        let mut runtime =
            DeterminismRuntime::new(Box::new(UnavailableFramework::new("no torch")));
        let err = DeterminismSession::open(&mut runtime, request(Tier::FIXED_BATCH, Mode::Strict, None))
            .unwrap_err();
        match err {
            DetError::ControlApplication { control, reason } => {
                assert_eq!(control, "framework_rng");
                assert!(reason.contains("no torch"));
            }
            other => panic!("expected ControlApplication, got {other:?}"),
        }
    }

    #[test]
    fn test_refused_deterministic_switch_is_recorded() {
        let mut runtime =
            DeterminismRuntime::new(Box::new(SeededFramework::refusing_deterministic_algorithms()));
        let applied = DeterminismSession::open(
            &mut runtime,
            request(Tier::SCORES, Mode::BestEffort, Some(1)),
        )
        .expect("open")
        .close();
        assert_eq!(
            applied.framework_controls.get("use_deterministic_algorithms"),
            Some(&false)
        );
        assert_eq!(applied.tier_effective, Tier::NONE);
        assert_eq!(applied.downgrades[0].from, Tier::SCORES);
    }

    #[test]
    fn test_tier_zero_failure_records_warning_without_downgrade() {
        let mut runtime = DeterminismRuntime::new(Box::new(UnavailableFramework::new("absent")));
        let applied =
            DeterminismSession::open(&mut runtime, request(Tier::NONE, Mode::BestEffort, None))
                .expect("open")
                .close();
        assert_eq!(applied.tier_effective, Tier::NONE);
        assert!(applied.downgrades.is_empty());
        assert_eq!(applied.warnings.len(), 1);
    }

    #[test]
    fn test_close_restores_process_generator() {
        let mut runtime = DeterminismRuntime::in_process();
        let mut before = runtime.rng().clone();

        let mut session =
            DeterminismSession::open(&mut runtime, request(Tier::FIXED_BATCH, Mode::Strict, Some(42)))
                .expect("open");
        session.rng().next_u64();
        session.rng().next_u64();
        session.close();

        assert_eq!(runtime.rng().next_u64(), before.next_u64());
    }

    #[test]
    fn test_strict_abort_restores_process_generator() {
        let mut runtime = DeterminismRuntime::new(Box::new(UnavailableFramework::new("absent")));
        let mut before = runtime.rng().clone();
        assert!(
            DeterminismSession::open(&mut runtime, request(Tier::SCORES, Mode::Strict, Some(9)))
                .is_err()
        );
        assert_eq!(runtime.rng().next_u64(), before.next_u64());
    }

    #[test]
    fn test_drop_restores_framework_generator() {
        let mut runtime = DeterminismRuntime::in_process();
        let mut before = runtime
            .framework_mut()
            .rng()
            .expect("seeded framework has a generator")
            .clone();
        {
            let _session = DeterminismSession::open(
                &mut runtime,
                request(Tier::FIXED_BATCH, Mode::BestEffort, Some(3)),
            )
            .expect("open");
        }
        let after = runtime.framework_mut().rng().expect("rng").next_u64();
        assert_eq!(after, before.next_u64());
    }

    #[test]
    fn test_same_seed_gives_same_draws() {
        fn draw(runtime: &mut DeterminismRuntime) -> u64 {
            let mut session =
                DeterminismSession::open(runtime, request(Tier::FIXED_BATCH, Mode::Strict, Some(11)))
                    .expect("open");
            let value = session.rng().next_u64();
            value
        }
        let mut runtime = DeterminismRuntime::in_process();
        let first = draw(&mut runtime);
        let second = draw(&mut runtime);
        assert_eq!(first, second);
    }

    #[test]
    fn test_downgrade_never_raises_tier() {
        let mut applied = DeterminismApplied::new(&request(Tier::FIXED_BATCH, Mode::BestEffort, None));
        assert!(!applied.downgrade(Tier::SCORES, "raise"));
        assert!(!applied.downgrade(Tier::FIXED_BATCH, "same"));
        assert!(applied.downgrade(Tier::NONE, "lower"));
        assert_eq!(applied.downgrades.len(), 1);
        assert!(applied.tier_effective <= applied.tier_requested);
    }

    #[test]
    fn test_applied_serializes_downgrade_fields() {
        let mut applied = DeterminismApplied::new(&request(Tier::SCORES, Mode::BestEffort, Some(0)));
        applied.downgrade(Tier::FIXED_BATCH, "capability limits");
        let value = serde_json::to_value(&applied).expect("to_value");
        assert_eq!(value["mode"], "best-effort");
        assert_eq!(value["tier_requested"], 2);
        assert_eq!(value["downgrades"][0]["from"], 2);
        assert_eq!(value["downgrades"][0]["to"], 1);
        assert_eq!(value["downgrades"][0]["reason"], "capability limits");
    }
}
