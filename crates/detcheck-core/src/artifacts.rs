//! JSON artifact envelopes, persistence and schema checks.
//!
//! Every artifact carries a header of `schema_version`, `tool_version` and
//! `artifact_type`, flattened next to the payload fields. Artifacts are written
//! as pretty JSON with sorted keys and a trailing newline.

use std::fmt;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::{DetError, Result};

/// Artifact schema version written into every header.
pub const SCHEMA_VERSION: &str = "1.0";

/// Header field names every artifact must carry.
pub const REQUIRED_HEADER_FIELDS: [&str; 3] = ["schema_version", "tool_version", "artifact_type"];

/// Kinds of artifact produced by detcheck.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    EnvSnapshot,
    RunConfig,
    DeterminismApplied,
    Report,
    FirstDivergence,
}

impl ArtifactType {
    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactType::EnvSnapshot => "env_snapshot",
            ArtifactType::RunConfig => "run_config",
            ArtifactType::DeterminismApplied => "determinism_applied",
            ArtifactType::Report => "report",
            ArtifactType::FirstDivergence => "first_divergence",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "env_snapshot" => Some(ArtifactType::EnvSnapshot),
            "run_config" => Some(ArtifactType::RunConfig),
            "determinism_applied" => Some(ArtifactType::DeterminismApplied),
            "report" => Some(ArtifactType::Report),
            "first_divergence" => Some(ArtifactType::FirstDivergence),
            _ => None,
        }
    }

    /// Payload fields the schema check requires for this artifact type.
    fn required_fields(self) -> &'static [&'static str] {
        match self {
            ArtifactType::EnvSnapshot => &[
                "runtime",
                "platform",
                "libraries",
                "device",
                "env_vars",
                "fingerprint",
            ],
            ArtifactType::RunConfig => &[
                "session_id",
                "backend",
                "tier_requested",
                "tier_effective",
                "mode",
                "seed",
                "decoding",
                "batch_size",
                "vary_batch",
                "runs",
                "prompt_count",
            ],
            ArtifactType::DeterminismApplied => &[
                "tier_requested",
                "tier_effective",
                "mode",
                "seed",
                "seed_controls",
                "framework_controls",
                "env_controls",
                "downgrades",
                "warnings",
                "capability_failures",
            ],
            ArtifactType::Report => &["status", "category", "details"],
            ArtifactType::FirstDivergence => &["reason"],
        }
    }
}

impl fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Common header of every artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactHeader {
    pub schema_version: String,
    pub tool_version: String,
    pub artifact_type: ArtifactType,
}

impl ArtifactHeader {
    pub fn new(artifact_type: ArtifactType) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            tool_version: crate::VERSION.to_string(),
            artifact_type,
        }
    }
}

/// Serialize `payload` and merge the artifact header into it.
///
/// The payload must serialize to a JSON object.
pub fn wrap_artifact<T: Serialize>(artifact_type: ArtifactType, payload: &T) -> Result<Value> {
    let mut object = match serde_json::to_value(payload)? {
        Value::Object(map) => map,
        other => {
            return Err(DetError::Schema(format!(
                "{artifact_type} payload must be an object, got {}",
                json_kind(&other)
            )))
        }
    };
    let header = ArtifactHeader::new(artifact_type);
    object.insert(
        "schema_version".to_string(),
        Value::String(header.schema_version),
    );
    object.insert("tool_version".to_string(), Value::String(header.tool_version));
    object.insert(
        "artifact_type".to_string(),
        Value::String(artifact_type.as_str().to_string()),
    );
    Ok(Value::Object(object))
}

/// Write a JSON value to `path` (pretty, sorted keys, trailing newline),
/// creating parent directories as needed.
pub fn dump_json(path: &Path, value: &Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut content = serde_json::to_string_pretty(value)?;
    content.push('\n');
    std::fs::write(path, content)?;
    Ok(())
}

/// Read a JSON artifact and check that all header fields are present.
pub fn load_json(path: &Path) -> Result<Value> {
    let raw = std::fs::read(path)?;
    let value: Value = serde_json::from_slice(&raw)?;
    let object = value.as_object().ok_or_else(|| {
        DetError::Schema(format!("{} is not a JSON object", path.display()))
    })?;

    let missing: Vec<String> = REQUIRED_HEADER_FIELDS
        .iter()
        .filter(|field| !object.contains_key(**field))
        .map(|field| field.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(DetError::MissingHeader(missing));
    }
    Ok(value)
}

/// Read a JSON artifact of the expected type and deserialize its payload.
pub fn load_artifact<T: DeserializeOwned>(path: &Path, expected: ArtifactType) -> Result<T> {
    let value = load_json(path)?;
    let actual = value
        .get("artifact_type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if actual != expected.as_str() {
        return Err(DetError::ArtifactType {
            expected: expected.as_str().to_string(),
            actual,
        });
    }
    Ok(serde_json::from_value(value)?)
}

/// Check an artifact against the required-field table of its type.
pub fn validate_artifact(value: &Value) -> Result<()> {
    let object = value
        .as_object()
        .ok_or_else(|| DetError::Schema("artifact must be a JSON object".to_string()))?;

    for field in REQUIRED_HEADER_FIELDS {
        if !object.contains_key(field) {
            return Err(DetError::MissingHeader(vec![field.to_string()]));
        }
    }
    if object.get("schema_version").and_then(Value::as_str) != Some(SCHEMA_VERSION) {
        return Err(DetError::Schema(format!(
            "unsupported schema_version {}",
            object["schema_version"]
        )));
    }
    let type_name = object
        .get("artifact_type")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let artifact_type = ArtifactType::parse(type_name)
        .ok_or_else(|| DetError::Schema(format!("unknown artifact_type {type_name:?}")))?;

    require_fields(object, artifact_type.required_fields(), type_name)
}

/// Required fields of a serialized trace row.
const TRACE_ROW_FIELDS: [&str; 5] = [
    "prompt_id",
    "input_token_ids",
    "input_token_ids_hash",
    "generated_token_ids",
    "scores",
];

/// Check one serialized trace row against the trace-row schema.
pub fn validate_trace_row(value: &Value) -> Result<()> {
    let object = value
        .as_object()
        .ok_or_else(|| DetError::Schema("trace row must be a JSON object".to_string()))?;
    require_fields(object, &TRACE_ROW_FIELDS, "trace row")?;
    for list in ["input_token_ids", "generated_token_ids"] {
        if !object[list].is_array() {
            return Err(DetError::Schema(format!("trace row field {list} must be an array")));
        }
    }
    if !(object["scores"].is_null() || object["scores"].is_array()) {
        return Err(DetError::Schema(
            "trace row field scores must be an array or null".to_string(),
        ));
    }
    Ok(())
}

fn require_fields(object: &Map<String, Value>, fields: &[&str], what: &str) -> Result<()> {
    let missing: Vec<&str> = fields
        .iter()
        .copied()
        .filter(|field| !object.contains_key(*field))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(DetError::Schema(format!(
            "{what} is missing required fields: {}",
            missing.join(", ")
        )))
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
