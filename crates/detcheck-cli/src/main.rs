//! detcheck - determinism checks for inference backends
//!
//! ## Commands
//!
//! - `env`: Capture a fingerprinted environment snapshot
//! - `run`: Execute one negotiated generation pass and record its trace
//! - `check`: Repeat runs and report run- and batch-variance verdicts
//! - `diff`: Compare two trace files
//! - `report`: Render a stored report as text
//!
//! Exit codes: 0 pass, 1 fatal error, 2 unsupported request, 3 any other failure.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{info, Level};

use detcheck_core::{
    capture_environment, diff_traces, dump_json, load_artifact, read_trace, validate_artifact,
    ArtifactType, Backend, BackendDescriptor, CheckConfig, CommandBackend, DecodingParams,
    DeterminismRequest, DeterminismRuntime, DirectorySink, Mode, Orchestrator, Redaction, Report,
    ScriptedBackend, SystemProbe, Tier,
};

#[derive(Parser)]
#[command(name = "detcheck")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Determinism checks for LLM inference backends", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true, env = "DETCHECK_LOG_JSON")]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture a fingerprinted environment snapshot
    Env {
        /// Output path for the snapshot
        #[arg(short, long, default_value = "artifacts/env.json")]
        out: PathBuf,

        #[command(flatten)]
        backend: BackendArgs,

        #[command(flatten)]
        redaction: RedactionArgs,

        /// Validate the snapshot against its schema before writing
        #[arg(long)]
        validate_schema: bool,
    },

    /// Execute one negotiated generation pass
    Run {
        #[command(flatten)]
        backend: BackendArgs,

        #[command(flatten)]
        generation: GenerationArgs,

        /// Output directory for artifacts
        #[arg(short, long, env = "DETCHECK_OUT", default_value = "artifacts/run")]
        out: PathBuf,

        #[command(flatten)]
        redaction: RedactionArgs,

        /// Validate artifacts against their schemas before writing
        #[arg(long)]
        validate_schema: bool,
    },

    /// Repeat runs and compute run- and batch-variance verdicts
    Check {
        #[command(flatten)]
        backend: BackendArgs,

        #[command(flatten)]
        generation: GenerationArgs,

        /// Number of repeated runs
        #[arg(long, default_value_t = detcheck_core::config::DEFAULT_RUNS)]
        runs: usize,

        /// Comma-separated batch sizes to compare against the baseline run
        #[arg(long, value_delimiter = ',')]
        vary_batch: Vec<usize>,

        /// Output directory for artifacts
        #[arg(short, long, env = "DETCHECK_OUT", default_value = "artifacts/check")]
        out: PathBuf,

        #[command(flatten)]
        redaction: RedactionArgs,

        /// Validate artifacts against their schemas before writing
        #[arg(long)]
        validate_schema: bool,
    },

    /// Compare two trace files
    Diff {
        /// Baseline trace (JSONL)
        #[arg(long)]
        left: PathBuf,

        /// Candidate trace (JSONL)
        #[arg(long)]
        right: PathBuf,

        /// Output directory for the report
        #[arg(short, long, default_value = "artifacts/diff")]
        out: PathBuf,
    },

    /// Render a stored report.json as text
    Report {
        /// Path to report.json
        #[arg(long = "in")]
        input: PathBuf,

        /// Output path for the rendered text
        #[arg(short, long, default_value = "artifacts/report.txt")]
        out: PathBuf,
    },
}

#[derive(Args, Debug, Clone, Default)]
struct BackendArgs {
    /// Scripted backend fixture (JSON)
    #[arg(long, conflicts_with = "backend_cmd")]
    fixture: Option<PathBuf>,

    /// External generator command speaking the detcheck JSON protocol
    #[arg(long, env = "DETCHECK_BACKEND_CMD")]
    backend_cmd: Option<String>,
}

#[derive(Args, Debug, Clone, Default)]
struct RedactionArgs {
    /// Redact path-bearing fields before fingerprinting
    #[arg(long)]
    redact_env: bool,

    /// Redact the value of this environment variable (repeatable)
    #[arg(long = "redact-env-var", value_name = "NAME")]
    redact_env_vars: Vec<String>,
}

impl RedactionArgs {
    fn to_redaction(&self) -> Redaction {
        Redaction {
            redact_paths: self.redact_env,
            env_vars: self.redact_env_vars.iter().cloned().collect::<BTreeSet<_>>(),
        }
    }
}

#[derive(Args, Debug, Clone)]
struct GenerationArgs {
    /// Prompt text (repeatable)
    #[arg(long = "prompt", conflicts_with = "prompt_file")]
    prompts: Vec<String>,

    /// JSONL file of prompts (strings or objects with `prompt` or `text`)
    #[arg(long)]
    prompt_file: Option<PathBuf>,

    /// Requested determinism tier (0, 1 or 2)
    #[arg(long, default_value = "1")]
    tier: Tier,

    /// Strict rejects unmet requirements; best-effort downgrades
    #[arg(long, default_value = "best-effort")]
    mode: Mode,

    /// Seed for process and framework generators
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Prompts per backend call
    #[arg(long, default_value_t = detcheck_core::config::DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// Tokens to generate per prompt
    #[arg(long, default_value_t = detcheck_core::config::DEFAULT_MAX_NEW_TOKENS)]
    max_new_tokens: u32,
}

impl GenerationArgs {
    fn to_config(&self) -> Result<CheckConfig> {
        let prompts = match &self.prompt_file {
            Some(path) => load_prompts(path)?,
            None => self.prompts.clone(),
        };
        if prompts.is_empty() {
            anyhow::bail!("No prompts given: pass --prompt or --prompt-file");
        }
        Ok(CheckConfig::new(prompts)
            .with_request(DeterminismRequest::new(self.tier, self.mode, Some(self.seed)))
            .with_batch_size(self.batch_size)
            .with_decoding(DecodingParams {
                max_new_tokens: self.max_new_tokens,
                ..DecodingParams::default()
            }))
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else if cli.quiet {
        Level::WARN
    } else {
        Level::INFO
    };
    detcheck_core::init_tracing(cli.json, level);

    match dispatch(cli.command) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn dispatch(command: Commands) -> Result<u8> {
    match command {
        Commands::Env {
            out,
            backend,
            redaction,
            validate_schema,
        } => cmd_env(&out, &backend, &redaction.to_redaction(), validate_schema),
        Commands::Run {
            backend,
            generation,
            out,
            redaction,
            validate_schema,
        } => {
            let config = generation.to_config()?;
            cmd_run(&backend, &config, &out, &redaction.to_redaction(), validate_schema)
        }
        Commands::Check {
            backend,
            generation,
            runs,
            vary_batch,
            out,
            redaction,
            validate_schema,
        } => {
            let config = generation
                .to_config()?
                .with_runs(runs)
                .with_vary_batch(vary_batch);
            cmd_check(&backend, &config, &out, &redaction.to_redaction(), validate_schema)
        }
        Commands::Diff { left, right, out } => cmd_diff(&left, &right, &out),
        Commands::Report { input, out } => cmd_report(&input, &out),
    }
}

fn open_backend(args: &BackendArgs) -> Result<Box<dyn Backend>> {
    if let Some(path) = &args.fixture {
        let backend = ScriptedBackend::from_path(path)
            .with_context(|| format!("Failed to load backend fixture: {:?}", path))?;
        return Ok(Box::new(backend));
    }
    if let Some(command_line) = &args.backend_cmd {
        let backend = CommandBackend::from_command_line(command_line)
            .with_context(|| format!("Failed to start backend command: {command_line}"))?;
        return Ok(Box::new(backend));
    }
    anyhow::bail!("No backend selected: pass --fixture or --backend-cmd")
}

fn cmd_env(
    out: &Path,
    backend: &BackendArgs,
    redaction: &Redaction,
    validate_schema: bool,
) -> Result<u8> {
    let descriptor = if backend.fixture.is_some() || backend.backend_cmd.is_some() {
        open_backend(backend)?.descriptor()
    } else {
        BackendDescriptor {
            name: "none".to_string(),
            ..BackendDescriptor::default()
        }
    };

    let snapshot =
        capture_environment(&descriptor, redaction).context("Failed to capture environment")?;
    let value = serde_json::to_value(&snapshot)?;
    if validate_schema {
        validate_artifact(&value).context("Environment snapshot failed schema validation")?;
    }
    dump_json(out, &value).with_context(|| format!("Failed to write snapshot: {:?}", out))?;

    info!(path = %out.display(), fingerprint = %snapshot.fingerprint, "environment captured");
    println!("{}", snapshot.fingerprint);
    Ok(0)
}

fn cmd_run(
    backend_args: &BackendArgs,
    config: &CheckConfig,
    out: &Path,
    redaction: &Redaction,
    validate_schema: bool,
) -> Result<u8> {
    let mut backend = open_backend(backend_args)?;
    let probe = SystemProbe::new(redaction.clone());
    let mut runtime = DeterminismRuntime::in_process();
    let mut sink = DirectorySink::new(out).with_schema_validation(validate_schema);

    let outcome = Orchestrator::new(backend.as_mut(), &probe, &mut runtime, &mut sink)
        .run_once(config)
        .context("Run failed")?;

    info!(
        session_id = %outcome.session_id,
        tier_effective = %outcome.applied.tier_effective,
        out = %out.display(),
        "run finished"
    );
    print!("{}", outcome.report.render_text());
    Ok(exit_code(&outcome.report))
}

fn cmd_check(
    backend_args: &BackendArgs,
    config: &CheckConfig,
    out: &Path,
    redaction: &Redaction,
    validate_schema: bool,
) -> Result<u8> {
    let mut backend = open_backend(backend_args)?;
    let probe = SystemProbe::new(redaction.clone());
    let mut runtime = DeterminismRuntime::in_process();
    let mut sink = DirectorySink::new(out).with_schema_validation(validate_schema);

    let outcome = Orchestrator::new(backend.as_mut(), &probe, &mut runtime, &mut sink)
        .check(config)
        .context("Check failed")?;

    info!(
        session_id = %outcome.session_id,
        status = %outcome.report.status,
        category = %outcome.report.category,
        out = %out.display(),
        "check finished"
    );
    print!("{}", outcome.report.render_text());
    Ok(exit_code(&outcome.report))
}

fn cmd_diff(left: &Path, right: &Path, out: &Path) -> Result<u8> {
    let left_rows =
        read_trace(left).with_context(|| format!("Failed to read trace: {:?}", left))?;
    let right_rows =
        read_trace(right).with_context(|| format!("Failed to read trace: {:?}", right))?;

    let result = diff_traces(&left_rows, &right_rows);
    let report = Report::from_diff(&result);

    let mut sink = DirectorySink::new(out);
    write_diff_artifacts(&mut sink, &report, &result)
        .with_context(|| format!("Failed to write diff artifacts under {:?}", out))?;

    print!("{}", report.render_text());
    Ok(exit_code(&report))
}

fn write_diff_artifacts(
    sink: &mut DirectorySink,
    report: &Report,
    result: &detcheck_core::DiffResult,
) -> detcheck_core::Result<()> {
    use detcheck_core::ArtifactSink;

    sink.report(report)?;
    if let Some(divergence) = &result.first_divergence {
        sink.first_divergence(divergence)?;
    }
    Ok(())
}

fn cmd_report(input: &Path, out: &Path) -> Result<u8> {
    let report: Report = load_artifact(input, ArtifactType::Report)
        .with_context(|| format!("Failed to load report: {:?}", input))?;
    let text = report.render_text();

    if let Some(parent) = out.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {:?}", parent))?;
    }
    std::fs::write(out, &text).with_context(|| format!("Failed to write report: {:?}", out))?;

    print!("{text}");
    Ok(exit_code(&report))
}

fn exit_code(report: &Report) -> u8 {
    u8::try_from(report.exit_code()).unwrap_or(1)
}

/// Read a JSONL prompt file. Each line is a JSON string or an object with a
/// `prompt` or `text` field; blank lines are skipped.
fn load_prompts(path: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read prompt file: {:?}", path))?;

    let mut prompts = Vec::new();
    for (idx, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(line)
            .with_context(|| format!("{:?} line {}: invalid JSON", path, idx + 1))?;
        let prompt = match &value {
            Value::String(s) => Some(s.clone()),
            Value::Object(map) => map
                .get("prompt")
                .or_else(|| map.get("text"))
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        };
        match prompt {
            Some(prompt) => prompts.push(prompt),
            None => anyhow::bail!(
                "{:?} line {}: expected a string or an object with \"prompt\" or \"text\"",
                path,
                idx + 1
            ),
        }
    }
    Ok(prompts)
}
