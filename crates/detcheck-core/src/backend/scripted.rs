//! Fixture-driven backend.
//!
//! Replays canned generations keyed by prompt text. Overrides keyed by call
//! index or by the number of prompts in a call reproduce run variance and
//! batch variance without a model. Lookup order for a prompt is call override,
//! then batch override, then the base response.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{
    check_outputs, Backend, BackendCapabilities, BackendDescriptor, GenerationOutput,
    GenerationRequest,
};
use crate::domain::{DetError, Result};

/// Canned generation for one prompt.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ScriptedOutput {
    /// Input ids; the prompt's UTF-8 bytes when absent.
    #[serde(default)]
    pub input_token_ids: Option<Vec<u32>>,
    pub output_token_ids: Vec<u32>,
    #[serde(default)]
    pub scores: Option<Vec<f64>>,
}

impl ScriptedOutput {
    pub fn tokens(output_token_ids: Vec<u32>) -> Self {
        Self {
            input_token_ids: None,
            output_token_ids,
            scores: None,
        }
    }

    pub fn with_scores(mut self, scores: Vec<f64>) -> Self {
        self.scores = Some(scores);
        self
    }
}

/// Serializable description of a scripted backend.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ScriptedFixture {
    #[serde(default)]
    pub descriptor: BackendDescriptor,
    pub capabilities: BackendCapabilities,
    #[serde(default)]
    pub tokenizer_id: Option<String>,
    pub responses: BTreeMap<String, ScriptedOutput>,
    /// Overrides applied to the N-th `generate` call (0-based).
    #[serde(default)]
    pub call_overrides: BTreeMap<usize, BTreeMap<String, ScriptedOutput>>,
    /// Overrides applied to calls carrying exactly N prompts.
    #[serde(default)]
    pub batch_overrides: BTreeMap<usize, BTreeMap<String, ScriptedOutput>>,
}

/// What the backend saw on one `generate` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub batch_len: usize,
    pub max_new_tokens: u32,
    pub capture_scores: bool,
}

/// In-memory backend driven by a [`ScriptedFixture`].
#[derive(Debug, Clone)]
pub struct ScriptedBackend {
    fixture: ScriptedFixture,
    calls: Vec<RecordedCall>,
}

impl ScriptedBackend {
    pub fn new(capabilities: BackendCapabilities) -> Self {
        Self::from_fixture(ScriptedFixture {
            capabilities,
            ..ScriptedFixture::default()
        })
    }

    pub fn from_fixture(mut fixture: ScriptedFixture) -> Self {
        if fixture.descriptor.name.is_empty() {
            fixture.descriptor.name = "scripted".to_string();
        }
        Self {
            fixture,
            calls: Vec::new(),
        }
    }

    /// Load a fixture from a JSON file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)?;
        let fixture: ScriptedFixture = serde_json::from_slice(&raw)?;
        Ok(Self::from_fixture(fixture))
    }

    pub fn with_tokenizer(mut self, tokenizer_id: impl Into<String>) -> Self {
        self.fixture.tokenizer_id = Some(tokenizer_id.into());
        self
    }

    pub fn with_response(mut self, prompt: impl Into<String>, output: ScriptedOutput) -> Self {
        self.fixture.responses.insert(prompt.into(), output);
        self
    }

    pub fn with_call_override(
        mut self,
        call_index: usize,
        prompt: impl Into<String>,
        output: ScriptedOutput,
    ) -> Self {
        self.fixture
            .call_overrides
            .entry(call_index)
            .or_default()
            .insert(prompt.into(), output);
        self
    }

    pub fn with_batch_override(
        mut self,
        batch_len: usize,
        prompt: impl Into<String>,
        output: ScriptedOutput,
    ) -> Self {
        self.fixture
            .batch_overrides
            .entry(batch_len)
            .or_default()
            .insert(prompt.into(), output);
        self
    }

    /// Calls observed so far, in order.
    pub fn calls(&self) -> &[RecordedCall] {
        &self.calls
    }

    fn lookup(&self, call_index: usize, batch_len: usize, prompt: &str) -> Option<&ScriptedOutput> {
        self.fixture
            .call_overrides
            .get(&call_index)
            .and_then(|m| m.get(prompt))
            .or_else(|| {
                self.fixture
                    .batch_overrides
                    .get(&batch_len)
                    .and_then(|m| m.get(prompt))
            })
            .or_else(|| self.fixture.responses.get(prompt))
    }
}

impl Backend for ScriptedBackend {
    fn descriptor(&self) -> BackendDescriptor {
        self.fixture.descriptor.clone()
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.fixture.capabilities.clone()
    }

    fn generate(&mut self, request: &GenerationRequest<'_>) -> Result<Vec<GenerationOutput>> {
        let call_index = self.calls.len();
        let batch_len = request.prompts.len();
        self.calls.push(RecordedCall {
            batch_len,
            max_new_tokens: request.max_new_tokens,
            capture_scores: request.capture_scores,
        });

        let mut outputs = Vec::with_capacity(batch_len);
        for prompt in request.prompts {
            let scripted = self.lookup(call_index, batch_len, prompt).ok_or_else(|| {
                DetError::Backend(format!("no scripted response for prompt {prompt:?}"))
            })?;
            let mut output_token_ids = scripted.output_token_ids.clone();
            output_token_ids.truncate(request.max_new_tokens as usize);
            outputs.push(GenerationOutput {
                prompt: prompt.clone(),
                input_token_ids: scripted
                    .input_token_ids
                    .clone()
                    .unwrap_or_else(|| prompt.bytes().map(u32::from).collect()),
                output_token_ids,
                scores: if request.capture_scores {
                    scripted.scores.clone()
                } else {
                    None
                },
                tokenizer_id: self.fixture.tokenizer_id.clone(),
            });
        }

        check_outputs(request, &outputs)?;
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request<'a>(prompts: &'a [String], capture_scores: bool) -> GenerationRequest<'a> {
        GenerationRequest {
            prompts,
            max_new_tokens: 8,
            deterministic_decoding: true,
            capture_scores,
        }
    }

    #[test]
    fn test_replays_base_response() {
        let mut backend = ScriptedBackend::new(BackendCapabilities::full())
            .with_tokenizer("tok-v1")
            .with_response("hi", ScriptedOutput::tokens(vec![1, 2]));
        let prompts = vec!["hi".to_string()];
        let out = backend.generate(&request(&prompts, false)).expect("generate");
        assert_eq!(out[0].output_token_ids, vec![1, 2]);
        assert_eq!(out[0].input_token_ids, vec![104, 105]);
        assert_eq!(out[0].tokenizer_id.as_deref(), Some("tok-v1"));
    }

    #[test]
    fn test_scores_only_when_requested() {
        let mut backend = ScriptedBackend::new(BackendCapabilities::full()).with_response(
            "hi",
            ScriptedOutput::tokens(vec![1]).with_scores(vec![-0.5]),
        );
        let prompts = vec!["hi".to_string()];
        assert!(backend.generate(&request(&prompts, false)).unwrap()[0]
            .scores
            .is_none());
        assert_eq!(
            backend.generate(&request(&prompts, true)).unwrap()[0].scores,
            Some(vec![-0.5])
        );
        assert_eq!(backend.calls().len(), 2);
        assert!(backend.calls()[1].capture_scores);
    }

    #[test]
    fn test_call_override_wins_over_batch_override() {
        let mut backend = ScriptedBackend::new(BackendCapabilities::full())
            .with_response("p", ScriptedOutput::tokens(vec![1]))
            .with_batch_override(1, "p", ScriptedOutput::tokens(vec![2]))
            .with_call_override(1, "p", ScriptedOutput::tokens(vec![3]));
        let prompts = vec!["p".to_string()];
        let first = backend.generate(&request(&prompts, false)).unwrap();
        let second = backend.generate(&request(&prompts, false)).unwrap();
        assert_eq!(first[0].output_token_ids, vec![2]);
        assert_eq!(second[0].output_token_ids, vec![3]);
    }

    #[test]
    fn test_unknown_prompt_is_backend_error() {
        let mut backend = ScriptedBackend::new(BackendCapabilities::full());
        let prompts = vec!["missing".to_string()];
        let err = backend.generate(&request(&prompts, false)).unwrap_err();
        assert!(matches!(err, DetError::Backend(_)));
    }

    #[test]
    fn test_fixture_parses_integer_override_keys() {
        let fixture: ScriptedFixture = serde_json::from_str(
            r#"{
                "capabilities": {
                    "supports_tier1_fixed_batch": true,
                    "supports_scores": false,
                    "supports_torch_deterministic": true
                },
                "responses": { "a": { "output_token_ids": [1, 2] } },
                "batch_overrides": { "4": { "a": { "output_token_ids": [1, 9] } } }
            }"#,
        )
        .expect("parse fixture");
        let backend = ScriptedBackend::from_fixture(fixture);
        assert_eq!(backend.descriptor().name, "scripted");
        assert!(backend.lookup(0, 4, "a").is_some());
        assert_eq!(backend.lookup(0, 4, "a").unwrap().output_token_ids, vec![1, 9]);
    }
}
