//! Domain-level error taxonomy for detcheck.

/// Failure raised while applying a framework-level determinism control.
///
/// The session decides what to do with it: strict mode turns it into
/// [`DetError::ControlApplication`], best-effort mode records a downgrade.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    #[error("framework not available: {0}")]
    Unavailable(String),

    #[error("control {control} rejected: {reason}")]
    Rejected { control: String, reason: String },
}

/// detcheck domain errors.
#[derive(Debug, thiserror::Error)]
pub enum DetError {
    #[error("failed to apply determinism control {control}: {reason}")]
    ControlApplication { control: String, reason: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("backend returned {actual} results for {expected} prompts")]
    BackendShape { expected: usize, actual: usize },

    #[error("artifact is missing required header fields: {0:?}")]
    MissingHeader(Vec<String>),

    #[error("unexpected artifact type: expected {expected}, got {actual}")]
    ArtifactType { expected: String, actual: String },

    #[error("schema violation: {0}")]
    Schema(String),

    #[error("trace line {line}: {reason}")]
    TraceParse { line: usize, reason: String },

    #[error("canonicalization error: {0}")]
    Canonicalization(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for detcheck domain operations.
pub type Result<T> = std::result::Result<T, DetError>;
