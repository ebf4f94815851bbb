//! detcheck Core Library
//!
//! Determinism negotiation and trace comparison for inference backends:
//! scoped determinism sessions, capability negotiation, trace diffing with
//! ordered divergence categories, and the run orchestrator that turns them
//! into one verdict.

pub mod artifacts;
pub mod backend;
pub mod capabilities;
pub mod config;
pub mod diff;
pub mod domain;
pub mod env;
pub mod obs;
pub mod orchestrator;
pub mod report;
pub mod session;
pub mod sink;
pub mod telemetry;
pub mod trace;

/// Version written into every artifact header.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use domain::{ControlError, DetError, DeterminismRequest, Mode, Result, Tier};

pub use artifacts::{
    dump_json, load_artifact, load_json, validate_artifact, validate_trace_row, wrap_artifact,
    ArtifactHeader, ArtifactType, SCHEMA_VERSION,
};
pub use backend::{
    Backend, BackendCapabilities, BackendDescriptor, CommandBackend, DeviceInfo,
    GenerationOutput, GenerationRequest, ScriptedBackend, ScriptedFixture, ScriptedOutput,
};
pub use capabilities::{evaluate_capabilities, CapabilityDecision, CapabilityFailure};
pub use config::{CheckConfig, DecodingParams, RunConfig};
pub use diff::{aggregate, diff_traces, first_token_divergence, Category, DiffResult, Divergence, Status};
pub use env::{capture_environment, EnvironmentProbe, EnvironmentSnapshot, Redaction, SystemProbe};
pub use orchestrator::{run_generation, CheckOutcome, Orchestrator, RunOutcome};
pub use report::Report;
pub use session::{
    DeterminismApplied, DeterminismRuntime, DeterminismSession, Downgrade, FrameworkControls,
    RandomState, SeededFramework, SessionState, UnavailableFramework,
};
pub use sink::{ArtifactSink, DirectorySink, EnvSlot, NullSink, TraceSlot};
pub use telemetry::init_tracing;
pub use trace::{read_trace, write_trace, TokenTraceRow, Trace};
