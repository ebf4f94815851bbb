//! Inference backends as capability-declaring black boxes.
//!
//! The negotiator and orchestrator only see the [`Backend`] trait:
//!
//! - [`scripted`]: fixture-driven backend replaying canned generations
//! - [`command`]: external generator process speaking JSON over stdio

pub mod command;
pub mod scripted;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::{DetError, Result};

pub use command::CommandBackend;
pub use scripted::{ScriptedBackend, ScriptedFixture, ScriptedOutput};

/// Capabilities a backend instance declares once.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BackendCapabilities {
    pub supports_tier1_fixed_batch: bool,
    pub supports_scores: bool,
    pub supports_torch_deterministic: bool,
    #[serde(default)]
    pub notes: Vec<String>,
}

impl BackendCapabilities {
    /// A backend that meets every tier.
    pub fn full() -> Self {
        Self {
            supports_tier1_fixed_batch: true,
            supports_scores: true,
            supports_torch_deterministic: true,
            notes: Vec::new(),
        }
    }
}

/// Accelerator summary reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_type: String,
    #[serde(default)]
    pub devices: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_version: Option<String>,
}

/// Self-description of a backend, folded into environment snapshots and run configs.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BackendDescriptor {
    pub name: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub libraries: BTreeMap<String, Option<String>>,
    #[serde(default)]
    pub device: Option<DeviceInfo>,
}

/// One batched generation call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationRequest<'a> {
    pub prompts: &'a [String],
    pub max_new_tokens: u32,
    pub deterministic_decoding: bool,
    pub capture_scores: bool,
}

/// Result for one prompt of a generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOutput {
    pub prompt: String,
    pub input_token_ids: Vec<u32>,
    pub output_token_ids: Vec<u32>,
    #[serde(default)]
    pub scores: Option<Vec<f64>>,
    #[serde(default)]
    pub tokenizer_id: Option<String>,
}

/// Token-generation backend.
///
/// `generate` is blocking and returns one output per prompt, in prompt order.
pub trait Backend {
    fn descriptor(&self) -> BackendDescriptor;

    fn capabilities(&self) -> BackendCapabilities;

    fn generate(&mut self, request: &GenerationRequest<'_>) -> Result<Vec<GenerationOutput>>;
}

/// Reject results whose count or order does not match the request.
pub(crate) fn check_outputs(
    request: &GenerationRequest<'_>,
    outputs: &[GenerationOutput],
) -> Result<()> {
    if outputs.len() != request.prompts.len() {
        return Err(DetError::BackendShape {
            expected: request.prompts.len(),
            actual: outputs.len(),
        });
    }
    for (idx, (prompt, output)) in request.prompts.iter().zip(outputs).enumerate() {
        if *prompt != output.prompt {
            return Err(DetError::Backend(format!(
                "result {idx} answers a different prompt than was submitted"
            )));
        }
    }
    Ok(())
}
