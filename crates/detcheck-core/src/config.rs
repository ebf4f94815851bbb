//! Check configuration and the run-config artifact.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::{BackendDescriptor, DeviceInfo};
use crate::domain::digest::compute_digest;
use crate::domain::{DetError, DeterminismRequest, Mode, Result, Tier};

pub const DEFAULT_RUNS: usize = 3;
pub const DEFAULT_BATCH_SIZE: usize = 1;
pub const DEFAULT_MAX_NEW_TOKENS: u32 = 32;

/// Decoding parameters sent to the backend and recorded on every trace row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodingParams {
    pub max_new_tokens: u32,
    pub do_sample: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
}

impl Default for DecodingParams {
    fn default() -> Self {
        Self {
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
            do_sample: false,
            temperature: None,
            top_p: None,
            top_k: None,
        }
    }
}

/// Everything a check or single run needs besides its collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckConfig {
    pub prompts: Vec<String>,
    pub request: DeterminismRequest,
    pub runs: usize,
    pub batch_size: usize,
    #[serde(default)]
    pub vary_batch: Vec<usize>,
    #[serde(default)]
    pub decoding: DecodingParams,
}

impl CheckConfig {
    pub fn new(prompts: Vec<String>) -> Self {
        Self {
            prompts,
            request: DeterminismRequest::new(Tier::default(), Mode::default(), Some(0)),
            runs: DEFAULT_RUNS,
            batch_size: DEFAULT_BATCH_SIZE,
            vary_batch: Vec::new(),
            decoding: DecodingParams::default(),
        }
    }

    pub fn with_request(mut self, request: DeterminismRequest) -> Self {
        self.request = request;
        self
    }

    pub fn with_runs(mut self, runs: usize) -> Self {
        self.runs = runs;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_vary_batch(mut self, sizes: Vec<usize>) -> Self {
        self.vary_batch = sizes;
        self
    }

    pub fn with_decoding(mut self, decoding: DecodingParams) -> Self {
        self.decoding = decoding;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.prompts.is_empty() {
            return Err(DetError::InvalidRequest("prompts must be non-empty".to_string()));
        }
        if self.runs == 0 {
            return Err(DetError::InvalidRequest("runs must be at least 1".to_string()));
        }
        if self.batch_size == 0 {
            return Err(DetError::InvalidRequest(
                "batch size must be a positive integer".to_string(),
            ));
        }
        if self.vary_batch.iter().any(|size| *size == 0) {
            return Err(DetError::InvalidRequest(
                "batch sizes must be positive integers".to_string(),
            ));
        }
        if self.decoding.max_new_tokens == 0 {
            return Err(DetError::InvalidRequest(
                "max_new_tokens must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Digest of the ordered prompt list.
    pub fn prompts_digest(&self) -> Result<String> {
        compute_digest(&serde_json::to_value(&self.prompts)?)
    }
}

/// Parameters of one check or run session, persisted as `run_config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub session_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub backend: String,
    pub model: Option<String>,
    pub device: Option<DeviceInfo>,
    pub tier_requested: Tier,
    pub tier_effective: Tier,
    pub mode: Mode,
    pub seed: Option<u64>,
    pub decoding: DecodingParams,
    pub batch_size: usize,
    pub vary_batch: Vec<usize>,
    pub runs: usize,
    pub prompt_count: usize,
    pub prompts_digest: String,
}

impl RunConfig {
    /// Record `config` as run against `backend`; the effective tier starts at
    /// the requested one.
    pub fn new(session_id: Uuid, config: &CheckConfig, backend: &BackendDescriptor) -> Result<Self> {
        Ok(Self {
            session_id,
            generated_at: Utc::now(),
            backend: backend.name.clone(),
            model: backend.model.clone(),
            device: backend.device.clone(),
            tier_requested: config.request.tier,
            tier_effective: config.request.tier,
            mode: config.request.mode,
            seed: config.request.seed,
            decoding: config.decoding.clone(),
            batch_size: config.batch_size,
            vary_batch: config.vary_batch.clone(),
            runs: config.runs,
            prompt_count: config.prompts.len(),
            prompts_digest: config.prompts_digest()?,
        })
    }
}
