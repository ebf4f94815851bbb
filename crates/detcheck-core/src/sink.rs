//! Destinations for the artifacts a check or run produces.
//!
//! [`DirectorySink`] lays artifacts out under one output directory:
//!
//! ```text
//! env.json                       baseline environment
//! envs/run_N.json                per-run environment
//! trace.jsonl                    single-run trace
//! traces/run_N.jsonl             per-run trace
//! traces/batch_B.jsonl           batch-variance trace at batch size B
//! determinism_applied.json
//! run_config.json
//! report.json, report.txt
//! diffs/first_divergence.json
//! ```

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::artifacts::{dump_json, validate_artifact, wrap_artifact, ArtifactType};
use crate::config::RunConfig;
use crate::diff::Divergence;
use crate::domain::Result;
use crate::env::EnvironmentSnapshot;
use crate::report::Report;
use crate::session::DeterminismApplied;
use crate::trace::{write_trace, TokenTraceRow};

/// Which environment snapshot is being stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvSlot {
    Baseline,
    Run(usize),
}

/// Which trace is being stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceSlot {
    Single,
    Run(usize),
    Batch(usize),
}

/// Receives every artifact the orchestrator produces.
pub trait ArtifactSink {
    fn env_snapshot(&mut self, slot: EnvSlot, snapshot: &EnvironmentSnapshot) -> Result<()>;

    fn trace(&mut self, slot: TraceSlot, rows: &[TokenTraceRow]) -> Result<()>;

    fn determinism_applied(&mut self, applied: &DeterminismApplied) -> Result<()>;

    fn run_config(&mut self, config: &RunConfig) -> Result<()>;

    fn report(&mut self, report: &Report) -> Result<()>;

    fn first_divergence(&mut self, divergence: &Divergence) -> Result<()>;
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl ArtifactSink for NullSink {
    fn env_snapshot(&mut self, _slot: EnvSlot, _snapshot: &EnvironmentSnapshot) -> Result<()> {
        Ok(())
    }

    fn trace(&mut self, _slot: TraceSlot, _rows: &[TokenTraceRow]) -> Result<()> {
        Ok(())
    }

    fn determinism_applied(&mut self, _applied: &DeterminismApplied) -> Result<()> {
        Ok(())
    }

    fn run_config(&mut self, _config: &RunConfig) -> Result<()> {
        Ok(())
    }

    fn report(&mut self, _report: &Report) -> Result<()> {
        Ok(())
    }

    fn first_divergence(&mut self, _divergence: &Divergence) -> Result<()> {
        Ok(())
    }
}

/// Writes artifacts under a root directory.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    root: PathBuf,
    validate_schema: bool,
}

impl DirectorySink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            validate_schema: false,
        }
    }

    /// Check every artifact against its schema before writing it.
    pub fn with_schema_validation(mut self, validate: bool) -> Self {
        self.validate_schema = validate;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn write_artifact(&self, relative: &str, value: &serde_json::Value) -> Result<()> {
        if self.validate_schema {
            validate_artifact(value)?;
        }
        let path = self.root.join(relative);
        debug!(path = %path.display(), "writing artifact");
        dump_json(&path, value)
    }
}

impl ArtifactSink for DirectorySink {
    fn env_snapshot(&mut self, slot: EnvSlot, snapshot: &EnvironmentSnapshot) -> Result<()> {
        let relative = match slot {
            EnvSlot::Baseline => "env.json".to_string(),
            EnvSlot::Run(idx) => format!("envs/run_{idx}.json"),
        };
        self.write_artifact(&relative, &serde_json::to_value(snapshot)?)
    }

    fn trace(&mut self, slot: TraceSlot, rows: &[TokenTraceRow]) -> Result<()> {
        let relative = match slot {
            TraceSlot::Single => "trace.jsonl".to_string(),
            TraceSlot::Run(idx) => format!("traces/run_{idx}.jsonl"),
            TraceSlot::Batch(size) => format!("traces/batch_{size}.jsonl"),
        };
        write_trace(&self.root.join(relative), rows, self.validate_schema)
    }

    fn determinism_applied(&mut self, applied: &DeterminismApplied) -> Result<()> {
        self.write_artifact(
            "determinism_applied.json",
            &wrap_artifact(ArtifactType::DeterminismApplied, applied)?,
        )
    }

    fn run_config(&mut self, config: &RunConfig) -> Result<()> {
        self.write_artifact(
            "run_config.json",
            &wrap_artifact(ArtifactType::RunConfig, config)?,
        )
    }

    fn report(&mut self, report: &Report) -> Result<()> {
        self.write_artifact("report.json", &report.to_artifact()?)?;
        let text_path = self.root.join("report.txt");
        std::fs::create_dir_all(&self.root)?;
        std::fs::write(text_path, report.render_text())?;
        Ok(())
    }

    fn first_divergence(&mut self, divergence: &Divergence) -> Result<()> {
        self.write_artifact(
            "diffs/first_divergence.json",
            &wrap_artifact(ArtifactType::FirstDivergence, divergence)?,
        )
    }
}
