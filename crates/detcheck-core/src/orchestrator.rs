//! Check and single-run orchestration.
//!
//! A check captures a baseline environment, then for each run re-captures the
//! environment (failing fast on drift), opens a determinism session,
//! negotiates capabilities and generates a trace. Every run is diffed against
//! run 0. When that verdict passes and batch sizes were requested, one extra
//! pass per batch size is diffed against run 0 as well. Run variance always
//! takes precedence over batch variance in the final report.

use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use crate::backend::{check_outputs, Backend, GenerationRequest};
use crate::capabilities::{evaluate_capabilities, CapabilityDecision};
use crate::config::{CheckConfig, DecodingParams, RunConfig};
use crate::diff::{aggregate, diff_traces, Category, DiffResult, Divergence, Status};
use crate::domain::{Result, Tier};
use crate::env::EnvironmentProbe;
use crate::obs::{self, CheckSpan};
use crate::report::{divergence_value, Report};
use crate::session::{DeterminismApplied, DeterminismRuntime, DeterminismSession};
use crate::sink::{ArtifactSink, EnvSlot, TraceSlot};
use crate::trace::{TokenTraceRow, Trace};

/// Result of [`Orchestrator::check`].
#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub session_id: Uuid,
    pub report: Report,
    /// Run-variance verdict; absent when the check aborted before diffing.
    pub run_verdict: Option<DiffResult>,
    /// Batch-variance verdicts in request order.
    pub batch_verdicts: Vec<(usize, DiffResult)>,
    pub determinism: Vec<DeterminismApplied>,
    pub traces: Vec<Trace>,
}

/// Result of [`Orchestrator::run_once`].
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub session_id: Uuid,
    pub report: Report,
    pub applied: DeterminismApplied,
    pub trace: Option<Trace>,
}

/// What a single negotiated generation pass produced.
enum Pass {
    Generated {
        applied: DeterminismApplied,
        trace: Trace,
    },
    Unsupported {
        applied: DeterminismApplied,
        decision: CapabilityDecision,
    },
}

/// Drives checks against one backend, environment probe and randomness runtime.
pub struct Orchestrator<'a> {
    backend: &'a mut dyn Backend,
    probe: &'a dyn EnvironmentProbe,
    runtime: &'a mut DeterminismRuntime,
    sink: &'a mut dyn ArtifactSink,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        backend: &'a mut dyn Backend,
        probe: &'a dyn EnvironmentProbe,
        runtime: &'a mut DeterminismRuntime,
        sink: &'a mut dyn ArtifactSink,
    ) -> Self {
        Self {
            backend,
            probe,
            runtime,
            sink,
        }
    }

    /// Repeat the configured runs and compute the run- and batch-variance verdict.
    pub fn check(&mut self, config: &CheckConfig) -> Result<CheckOutcome> {
        config.validate()?;
        let session_id = Uuid::new_v4();
        let _span = CheckSpan::enter(&session_id.to_string());

        let descriptor = self.backend.descriptor();
        obs::emit_check_started(&descriptor.name, config.runs, config.prompts.len());

        let baseline = self.probe.capture(&descriptor)?;
        self.sink.env_snapshot(EnvSlot::Baseline, &baseline)?;

        let mut run_config = RunConfig::new(session_id, config, &descriptor)?;
        self.sink.run_config(&run_config)?;

        let mut outcome = CheckOutcome {
            session_id,
            report: Report::new(Status::Pass, Category::Pass),
            run_verdict: None,
            batch_verdicts: Vec::new(),
            determinism: Vec::new(),
            traces: Vec::new(),
        };

        for run_idx in 0..config.runs {
            let env = self.probe.capture(&descriptor)?;
            self.sink.env_snapshot(EnvSlot::Run(run_idx), &env)?;
            if !env.same_environment(&baseline) {
                obs::emit_env_mismatch(run_idx, &baseline.fingerprint, &env.fingerprint);
                let report = Report::env_mismatch(
                    config.runs,
                    run_idx,
                    &baseline.fingerprint,
                    &env.fingerprint,
                );
                return self.finish_aborted(outcome, report);
            }

            match self.negotiated_pass(config, config.batch_size, run_idx)? {
                Pass::Generated { applied, trace } => {
                    self.sink.trace(TraceSlot::Run(run_idx), &trace)?;
                    outcome.determinism.push(applied);
                    outcome.traces.push(trace);
                }
                Pass::Unsupported { applied, decision } => {
                    self.sink.determinism_applied(&applied)?;
                    outcome.determinism.push(applied);
                    let report = Report::unsupported(config.runs, &decision);
                    return self.finish_aborted(outcome, report);
                }
            }
        }

        // Controls are expected to be identical across runs; the first run is recorded.
        if let Some(first) = outcome.determinism.first() {
            self.sink.determinism_applied(first)?;
            run_config.tier_effective = first.tier_effective;
            self.sink.run_config(&run_config)?;
        }

        let baseline_trace = outcome.traces.first().cloned().unwrap_or_default();
        let run_verdict = aggregate(
            outcome
                .traces
                .iter()
                .skip(1)
                .map(|trace| diff_traces(&baseline_trace, trace)),
        );

        let mut batch_verdicts = Vec::new();
        if run_verdict.is_pass() {
            for &batch_size in &config.vary_batch {
                match self.negotiated_pass(config, batch_size, config.runs)? {
                    Pass::Generated { trace, .. } => {
                        self.sink.trace(TraceSlot::Batch(batch_size), &trace)?;
                        batch_verdicts.push((batch_size, diff_traces(&baseline_trace, &trace)));
                    }
                    Pass::Unsupported { decision, .. } => {
                        let report = Report::unsupported(config.runs, &decision);
                        outcome.run_verdict = Some(run_verdict);
                        return self.finish_aborted(outcome, report);
                    }
                }
            }
        }

        let report = final_report(config, &run_verdict, &batch_verdicts);
        self.sink.report(&report)?;
        if let Some(divergence) = report_divergence(&run_verdict, &batch_verdicts) {
            self.sink.first_divergence(divergence)?;
        }
        obs::emit_verdict_computed(report.status, report.category);

        outcome.report = report;
        outcome.run_verdict = Some(run_verdict);
        outcome.batch_verdicts = batch_verdicts;
        Ok(outcome)
    }

    /// Execute one negotiated generation pass and record its artifacts.
    pub fn run_once(&mut self, config: &CheckConfig) -> Result<RunOutcome> {
        config.validate()?;
        let session_id = Uuid::new_v4();
        let _span = CheckSpan::enter(&session_id.to_string());

        let descriptor = self.backend.descriptor();
        obs::emit_check_started(&descriptor.name, 1, config.prompts.len());

        let env = self.probe.capture(&descriptor)?;
        self.sink.env_snapshot(EnvSlot::Baseline, &env)?;

        match self.negotiated_pass(config, config.batch_size, 0)? {
            Pass::Unsupported { applied, decision } => {
                self.sink.determinism_applied(&applied)?;
                let report = Report::unsupported(1, &decision);
                self.sink.report(&report)?;
                obs::emit_verdict_computed(report.status, report.category);
                Ok(RunOutcome {
                    session_id,
                    report,
                    applied,
                    trace: None,
                })
            }
            Pass::Generated { applied, trace } => {
                self.sink.determinism_applied(&applied)?;
                let mut run_config = RunConfig::new(session_id, config, &descriptor)?;
                run_config.runs = 1;
                run_config.vary_batch = Vec::new();
                run_config.tier_effective = applied.tier_effective;
                self.sink.run_config(&run_config)?;
                self.sink.trace(TraceSlot::Single, &trace)?;
                Ok(RunOutcome {
                    session_id,
                    report: Report::new(Status::Pass, Category::Pass),
                    applied,
                    trace: Some(trace),
                })
            }
        }
    }

    /// Open a session, negotiate, and generate unless the request is rejected.
    ///
    /// The session closes, restoring generator state, before this returns,
    /// including when generation fails.
    fn negotiated_pass(
        &mut self,
        config: &CheckConfig,
        batch_size: usize,
        run_index: usize,
    ) -> Result<Pass> {
        let capabilities = self.backend.capabilities();
        let mut session = DeterminismSession::open(self.runtime, config.request)?;
        let decision = evaluate_capabilities(
            session.applied_mut(),
            &capabilities,
            config.request.tier,
            config.request.mode,
        );
        if !decision.supported {
            return Ok(Pass::Unsupported {
                applied: session.close(),
                decision,
            });
        }

        let tier_effective = session.applied().tier_effective;
        obs::emit_run_started(run_index, batch_size, tier_effective);
        let trace = run_generation(
            &mut *self.backend,
            &config.prompts,
            batch_size,
            &config.decoding,
            tier_effective >= Tier::SCORES,
        )?;
        Ok(Pass::Generated {
            applied: session.close(),
            trace,
        })
    }

    fn finish_aborted(&mut self, mut outcome: CheckOutcome, report: Report) -> Result<CheckOutcome> {
        self.sink.report(&report)?;
        obs::emit_verdict_computed(report.status, report.category);
        outcome.report = report;
        Ok(outcome)
    }
}

/// Generate over `prompts` in consecutive batches of `batch_size`.
pub fn run_generation(
    backend: &mut dyn Backend,
    prompts: &[String],
    batch_size: usize,
    decoding: &DecodingParams,
    capture_scores: bool,
) -> Result<Trace> {
    let mut rows = Vec::with_capacity(prompts.len());
    for (batch_idx, batch) in prompts.chunks(batch_size.max(1)).enumerate() {
        debug!(batch_idx, batch_len = batch.len(), capture_scores, "generating batch");
        let request = GenerationRequest {
            prompts: batch,
            max_new_tokens: decoding.max_new_tokens,
            deterministic_decoding: !decoding.do_sample,
            capture_scores,
        };
        let outputs = backend.generate(&request)?;
        check_outputs(&request, &outputs)?;
        rows.extend(
            outputs
                .into_iter()
                .map(|output| TokenTraceRow::from_output(output, decoding)),
        );
    }
    Ok(rows)
}

fn first_failing_batch(batch_verdicts: &[(usize, DiffResult)]) -> Option<(usize, &DiffResult)> {
    batch_verdicts
        .iter()
        .find(|(_, diff)| !diff.is_pass())
        .map(|(size, diff)| (*size, diff))
}

fn report_divergence<'v>(
    run_verdict: &'v DiffResult,
    batch_verdicts: &'v [(usize, DiffResult)],
) -> Option<&'v Divergence> {
    if !run_verdict.is_pass() {
        return run_verdict.first_divergence.as_ref();
    }
    first_failing_batch(batch_verdicts).and_then(|(_, diff)| diff.first_divergence.as_ref())
}

fn final_report(
    config: &CheckConfig,
    run_verdict: &DiffResult,
    batch_verdicts: &[(usize, DiffResult)],
) -> Report {
    let failing_batch = first_failing_batch(batch_verdicts);
    let (status, category) = if !run_verdict.is_pass() {
        (run_verdict.status, run_verdict.category)
    } else if failing_batch.is_some() {
        (Status::Fail, Category::BatchVariance)
    } else {
        (Status::Pass, Category::Pass)
    };

    let batch_divergence = match failing_batch {
        Some((batch_size, diff)) if run_verdict.is_pass() => json!({
            "batch_size": batch_size,
            "first_divergence": divergence_value(diff.first_divergence.as_ref()),
        }),
        _ => Value::Null,
    };

    Report::new(status, category)
        .with_detail("runs", json!(config.runs))
        .with_detail("batch_sizes", json!(config.vary_batch))
        .with_detail(
            "first_divergence",
            divergence_value(report_divergence(run_verdict, batch_verdicts)),
        )
        .with_detail("batch_divergence", batch_divergence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendCapabilities, ScriptedBackend, ScriptedOutput};
    use crate::domain::{DetError, DeterminismRequest, Mode};
    use crate::env::{EnvironmentSnapshot, PlatformInfo, RuntimeInfo};
    use crate::session::UnavailableFramework;
    use crate::sink::NullSink;
    use std::cell::Cell;
    use std::collections::BTreeMap;

    /// Probe whose snapshots change after `stable_captures` calls.
    struct DriftingProbe {
        captures: Cell<usize>,
        stable_captures: usize,
    }

    impl DriftingProbe {
        fn stable() -> Self {
            Self::drifting_after(usize::MAX)
        }

        fn drifting_after(stable_captures: usize) -> Self {
            Self {
                captures: Cell::new(0),
                stable_captures,
            }
        }
    }

    impl EnvironmentProbe for DriftingProbe {
        fn capture(&self, _backend: &crate::backend::BackendDescriptor) -> Result<EnvironmentSnapshot> {
            let n = self.captures.get();
            self.captures.set(n + 1);
            let mut env_vars = BTreeMap::new();
            let value = if n < self.stable_captures { "1" } else { "2" };
            env_vars.insert("OMP_NUM_THREADS".to_string(), Some(value.to_string()));
            EnvironmentSnapshot::from_parts(
                RuntimeInfo {
                    tool: "detcheck".to_string(),
                    version: "test".to_string(),
                    executable: None,
                },
                PlatformInfo {
                    os: "linux".to_string(),
                    family: "unix".to_string(),
                    arch: "x86_64".to_string(),
                    cpu_count: 4,
                },
                BTreeMap::new(),
                None,
                env_vars,
            )
        }
    }

    fn backend(caps: BackendCapabilities) -> ScriptedBackend {
        ScriptedBackend::new(caps)
            .with_response("a", ScriptedOutput::tokens(vec![1, 2]).with_scores(vec![-0.5, -0.25]))
            .with_response("b", ScriptedOutput::tokens(vec![3, 4]).with_scores(vec![-1.0, -2.0]))
            .with_response("c", ScriptedOutput::tokens(vec![5]).with_scores(vec![-0.125]))
    }

    fn config(tier: Tier, mode: Mode) -> CheckConfig {
        CheckConfig::new(vec!["a".to_string(), "b".to_string(), "c".to_string()])
            .with_request(DeterminismRequest::new(tier, mode, Some(0)))
    }

    fn check(
        backend: &mut ScriptedBackend,
        probe: &DriftingProbe,
        config: &CheckConfig,
    ) -> Result<CheckOutcome> {
        let mut runtime = DeterminismRuntime::in_process();
        let mut sink = NullSink;
        let outcome = Orchestrator::new(backend, probe, &mut runtime, &mut sink).check(config);
        outcome
    }

    #[test]
    fn test_stable_backend_passes() {
        let mut backend = backend(BackendCapabilities::full());
        let outcome = check(&mut backend, &DriftingProbe::stable(), &config(Tier::FIXED_BATCH, Mode::Strict))
            .expect("check");
        assert_eq!(outcome.report.status, Status::Pass);
        assert_eq!(outcome.report.category, Category::Pass);
        assert_eq!(outcome.traces.len(), 3);
        assert_eq!(backend.calls().len(), 9);
        assert!(backend.calls().iter().all(|c| c.batch_len == 1 && !c.capture_scores));
    }

    #[test]
    fn test_run_variance_reports_first_token_index() {
        let mut backend = backend(BackendCapabilities::full())
            .with_call_override(4, "b", ScriptedOutput::tokens(vec![3, 9]));
        let outcome = check(&mut backend, &DriftingProbe::stable(), &config(Tier::FIXED_BATCH, Mode::Strict))
            .expect("check");
        assert_eq!(outcome.report.category, Category::RunVarianceFixedBatch);
        assert_eq!(outcome.report.details["first_divergence"]["index"], 1);
        assert_eq!(outcome.report.details["first_divergence"]["token_index"], 1);
        assert_eq!(outcome.report.details["batch_divergence"], Value::Null);
        assert_eq!(outcome.report.exit_code(), 3);
    }

    #[test]
    fn test_env_drift_stops_remaining_runs() {
        let mut backend = backend(BackendCapabilities::full());
        // Baseline and run 0 match; run 1 drifts.
        let probe = DriftingProbe::drifting_after(2);
        let outcome = check(&mut backend, &probe, &config(Tier::FIXED_BATCH, Mode::Strict))
            .expect("check");
        assert_eq!(outcome.report.category, Category::EnvMismatch);
        assert_eq!(outcome.report.details["run_index"], 1);
        assert_eq!(outcome.traces.len(), 1);
        assert_eq!(backend.calls().len(), 3);
        assert_eq!(probe.captures.get(), 3);
    }

    #[test]
    fn test_strict_unsupported_request_generates_nothing() {
        let mut caps = BackendCapabilities::full();
        caps.supports_scores = false;
        let mut backend = backend(caps);
        let outcome = check(&mut backend, &DriftingProbe::stable(), &config(Tier::SCORES, Mode::Strict))
            .expect("check");
        assert_eq!(outcome.report.category, Category::UnsupportedRequest);
        assert_eq!(outcome.report.exit_code(), 2);
        assert!(backend.calls().is_empty());
        assert_eq!(outcome.determinism[0].capability_failures.len(), 1);
    }

    #[test]
    fn test_best_effort_downgrade_disables_score_capture() {
        let mut caps = BackendCapabilities::full();
        caps.supports_scores = false;
        let mut backend = backend(caps);
        let outcome = check(&mut backend, &DriftingProbe::stable(), &config(Tier::SCORES, Mode::BestEffort))
            .expect("check");
        assert!(outcome.report.is_pass());
        assert_eq!(outcome.determinism[0].tier_effective, Tier::FIXED_BATCH);
        assert!(backend.calls().iter().all(|c| !c.capture_scores));
        assert!(outcome.traces[0].iter().all(|row| row.scores.is_none()));
    }

    #[test]
    fn test_tier2_captures_scores() {
        let mut backend = backend(BackendCapabilities::full())
            .with_call_override(3, "a", ScriptedOutput::tokens(vec![1, 2]).with_scores(vec![-0.5, -0.3]));
        let outcome = check(&mut backend, &DriftingProbe::stable(), &config(Tier::SCORES, Mode::Strict))
            .expect("check");
        assert!(backend.calls().iter().all(|c| c.capture_scores));
        assert_eq!(outcome.report.category, Category::ScoreVariance);
        assert_eq!(outcome.report.details["first_divergence"]["score_index"], 1);
    }

    #[test]
    fn test_batch_variance_names_batch_size() {
        let mut backend = backend(BackendCapabilities::full())
            .with_batch_override(3, "c", ScriptedOutput::tokens(vec![6]));
        let config = config(Tier::FIXED_BATCH, Mode::Strict).with_vary_batch(vec![2, 3]);
        let outcome = check(&mut backend, &DriftingProbe::stable(), &config).expect("check");
        assert_eq!(outcome.report.category, Category::BatchVariance);
        assert_eq!(outcome.report.details["batch_divergence"]["batch_size"], 3);
        assert_eq!(
            outcome.report.details["batch_divergence"]["first_divergence"]["index"],
            2
        );
        assert_eq!(outcome.batch_verdicts.len(), 2);
        assert!(outcome.batch_verdicts[0].1.is_pass());
    }

    #[test]
    fn test_run_variance_takes_precedence_over_batch_variance() {
        let mut backend = backend(BackendCapabilities::full())
            .with_call_override(3, "a", ScriptedOutput::tokens(vec![1, 7]))
            .with_batch_override(3, "c", ScriptedOutput::tokens(vec![6]));
        let config = config(Tier::FIXED_BATCH, Mode::Strict).with_vary_batch(vec![3]);
        let outcome = check(&mut backend, &DriftingProbe::stable(), &config).expect("check");
        assert_eq!(outcome.report.category, Category::RunVarianceFixedBatch);
        assert!(outcome.batch_verdicts.is_empty());
        assert!(backend.calls().iter().all(|c| c.batch_len == 1));
    }

    #[test]
    fn test_strict_control_failure_is_fatal() {
        let mut backend = backend(BackendCapabilities::full());
        let mut runtime = DeterminismRuntime::new(Box::new(UnavailableFramework::new("absent")));
        let mut sink = NullSink;
        let probe = DriftingProbe::stable();
        let err = Orchestrator::new(&mut backend, &probe, &mut runtime, &mut sink)
            .check(&config(Tier::FIXED_BATCH, Mode::Strict))
            .unwrap_err();
        assert!(matches!(err, DetError::ControlApplication { .. }));
        assert!(backend.calls().is_empty());
    }

    /// Backend whose generation always fails.
    struct FailingBackend;

    impl Backend for FailingBackend {
        fn descriptor(&self) -> crate::backend::BackendDescriptor {
            crate::backend::BackendDescriptor {
                name: "failing".to_string(),
                ..Default::default()
            }
        }

        fn capabilities(&self) -> BackendCapabilities {
            BackendCapabilities::full()
        }

        fn generate(
            &mut self,
            _request: &GenerationRequest<'_>,
        ) -> Result<Vec<crate::backend::GenerationOutput>> {
            Err(DetError::Backend("device lost".to_string()))
        }
    }

    #[test]
    fn test_generation_failure_restores_generator_state() {
        use crate::session::{RandomState, SeededFramework};

        let mut runtime = DeterminismRuntime::with_rng(
            RandomState::seeded(7),
            Box::new(SeededFramework::new()),
        );
        let mut expected_process = runtime.rng().clone();
        let mut expected_framework = runtime.framework_mut().rng().unwrap().clone();

        let mut backend = FailingBackend;
        let mut sink = NullSink;
        let probe = DriftingProbe::stable();
        let err = Orchestrator::new(&mut backend, &probe, &mut runtime, &mut sink)
            .check(&config(Tier::FIXED_BATCH, Mode::Strict))
            .unwrap_err();
        assert!(matches!(err, DetError::Backend(_)));

        assert_eq!(runtime.rng().next_u64(), expected_process.next_u64());
        assert_eq!(
            runtime.framework_mut().rng().unwrap().next_u64(),
            expected_framework.next_u64()
        );
    }

    #[test]
    fn test_run_once_records_effective_tier() {
        let mut backend = backend(BackendCapabilities::full());
        let mut runtime = DeterminismRuntime::new(Box::new(UnavailableFramework::new("absent")));
        let mut sink = NullSink;
        let probe = DriftingProbe::stable();
        let outcome = Orchestrator::new(&mut backend, &probe, &mut runtime, &mut sink)
            .run_once(&config(Tier::FIXED_BATCH, Mode::BestEffort).with_batch_size(2))
            .expect("run");
        assert!(outcome.report.is_pass());
        assert_eq!(outcome.applied.tier_effective, Tier::NONE);
        assert_eq!(outcome.trace.expect("trace").len(), 3);
        let sizes: Vec<usize> = backend.calls().iter().map(|c| c.batch_len).collect();
        assert_eq!(sizes, vec![2, 1]);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut backend = backend(BackendCapabilities::full());
        let err = check(
            &mut backend,
            &DriftingProbe::stable(),
            &config(Tier::FIXED_BATCH, Mode::Strict).with_runs(0),
        )
        .unwrap_err();
        assert!(matches!(err, DetError::InvalidRequest(_)));
    }
}
