//! External generator process adapter.
//!
//! The generator is any executable that understands three subcommands,
//! appended after the configured arguments:
//!
//! - `capabilities`: print a `BackendCapabilities` JSON object
//! - `describe`: print a `BackendDescriptor` JSON object (optional)
//! - `generate`: read a generation request JSON object on stdin and print
//!   `{"results": [...]}` with one `GenerationOutput` per prompt
//!
//! Capabilities and the descriptor are queried once when the adapter is built.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{
    check_outputs, Backend, BackendCapabilities, BackendDescriptor, GenerationOutput,
    GenerationRequest,
};
use crate::domain::{DetError, Result};

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    results: Vec<GenerationOutput>,
}

/// Backend that delegates generation to an external process.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    program: PathBuf,
    args: Vec<String>,
    capabilities: BackendCapabilities,
    descriptor: BackendDescriptor,
}

impl CommandBackend {
    /// Build the adapter and query the generator's capabilities and descriptor.
    pub fn spawn(program: impl Into<PathBuf>, args: Vec<String>) -> Result<Self> {
        let program = program.into();
        let capabilities: BackendCapabilities = invoke(&program, &args, "capabilities", None)?;

        let descriptor = match invoke::<BackendDescriptor>(&program, &args, "describe", None) {
            Ok(mut descriptor) => {
                if descriptor.name.is_empty() {
                    descriptor.name = program.display().to_string();
                }
                descriptor
            }
            Err(e) => {
                warn!(program = %program.display(), error = %e, "generator has no usable describe output");
                BackendDescriptor {
                    name: program.display().to_string(),
                    ..BackendDescriptor::default()
                }
            }
        };

        Ok(Self {
            program,
            args,
            capabilities,
            descriptor,
        })
    }

    /// Build the adapter from a whitespace-separated command line.
    pub fn from_command_line(command_line: &str) -> Result<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| DetError::InvalidRequest("backend command is empty".to_string()))?;
        Self::spawn(program, parts.collect())
    }
}

impl Backend for CommandBackend {
    fn descriptor(&self) -> BackendDescriptor {
        self.descriptor.clone()
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.capabilities.clone()
    }

    fn generate(&mut self, request: &GenerationRequest<'_>) -> Result<Vec<GenerationOutput>> {
        let payload = serde_json::to_vec(request)?;
        let response: GenerateResponse =
            invoke(&self.program, &self.args, "generate", Some(&payload))?;
        check_outputs(request, &response.results)?;
        Ok(response.results)
    }
}

/// Run `<program> <args..> <subcommand>`, optionally feeding `stdin`, and
/// parse its stdout as JSON.
fn invoke<T: DeserializeOwned>(
    program: &Path,
    args: &[String],
    subcommand: &str,
    stdin: Option<&[u8]>,
) -> Result<T> {
    debug!(program = %program.display(), subcommand, "invoking generator");
    let mut child = Command::new(program)
        .args(args)
        .arg(subcommand)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            DetError::Backend(format!("failed to start {}: {e}", program.display()))
        })?;

    // The request is fed from its own thread while this one drains stdout and
    // stderr, so a generator that logs before reading its input cannot stall.
    let stdin_pipe = child.stdin.take();
    let (output, written) = std::thread::scope(|scope| {
        let writer = match (stdin, stdin_pipe) {
            (Some(bytes), Some(mut pipe)) => Some(scope.spawn(move || pipe.write_all(bytes))),
            _ => None,
        };
        let output = child.wait_with_output();
        let written = match writer {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                Err(io::Error::new(io::ErrorKind::Other, "stdin writer panicked"))
            }),
            None => Ok(()),
        };
        (output, written)
    });

    let output = output?;
    if !output.status.success() {
        return Err(DetError::Backend(format!(
            "{} {subcommand} exited with {}: {}",
            program.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    if let Err(e) = written {
        return Err(DetError::Backend(format!(
            "{} {subcommand} did not accept its request: {e}: {}",
            program.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    serde_json::from_slice(&output.stdout).map_err(|e| {
        DetError::Backend(format!(
            "{} {subcommand} produced invalid JSON: {e}",
            program.display()
        ))
    })
}
