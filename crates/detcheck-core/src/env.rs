//! Environment snapshots and fingerprints.
//!
//! An [`EnvironmentSnapshot`] groups the facts that can change the numerics of
//! an inference run: tool runtime, platform, inference-library versions, the
//! device summary reported by the backend and an allowlist of control
//! environment variables. Its `fingerprint` is the SHA-256 of the canonical
//! JSON of every other field, so two snapshots are compared by fingerprint
//! equality only.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::artifacts::{ArtifactHeader, ArtifactType};
use crate::backend::{BackendDescriptor, DeviceInfo};
use crate::domain::digest::compute_digest;
use crate::domain::Result;

/// Environment variables that influence determinism of common inference stacks.
pub const CONTROL_ENV_VARS: [&str; 7] = [
    "CUBLAS_WORKSPACE_CONFIG",
    "CUDNN_DETERMINISTIC",
    "CUDNN_BENCHMARK",
    "CUDA_VISIBLE_DEVICES",
    "OMP_NUM_THREADS",
    "MKL_NUM_THREADS",
    "PYTHONHASHSEED",
];

/// Replacement value for redacted fields.
pub const REDACTED: &str = "<redacted>";

/// The tool that captured the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeInfo {
    pub tool: String,
    pub version: String,
    pub executable: Option<String>,
}

/// Host platform facts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformInfo {
    pub os: String,
    pub family: String,
    pub arch: String,
    pub cpu_count: usize,
}

/// Immutable, fingerprinted description of an execution context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentSnapshot {
    #[serde(flatten)]
    pub header: ArtifactHeader,
    pub runtime: RuntimeInfo,
    pub platform: PlatformInfo,
    pub libraries: BTreeMap<String, Option<String>>,
    pub device: Option<DeviceInfo>,
    pub env_vars: BTreeMap<String, Option<String>>,
    pub fingerprint: String,
}

impl EnvironmentSnapshot {
    /// Assemble a snapshot from its fact groups and compute the fingerprint.
    pub fn from_parts(
        runtime: RuntimeInfo,
        platform: PlatformInfo,
        libraries: BTreeMap<String, Option<String>>,
        device: Option<DeviceInfo>,
        env_vars: BTreeMap<String, Option<String>>,
    ) -> Result<Self> {
        let mut snapshot = Self {
            header: ArtifactHeader::new(ArtifactType::EnvSnapshot),
            runtime,
            platform,
            libraries,
            device,
            env_vars,
            fingerprint: String::new(),
        };
        snapshot.fingerprint = snapshot.compute_fingerprint()?;
        Ok(snapshot)
    }

    /// Hash of the canonicalized snapshot with the `fingerprint` field removed.
    pub fn compute_fingerprint(&self) -> Result<String> {
        let mut value = serde_json::to_value(self)?;
        if let Some(object) = value.as_object_mut() {
            object.remove("fingerprint");
        }
        compute_digest(&value)
    }

    /// Whether the stored fingerprint matches the snapshot content.
    pub fn verify_fingerprint(&self) -> Result<bool> {
        Ok(self.compute_fingerprint()? == self.fingerprint)
    }

    pub fn same_environment(&self, other: &EnvironmentSnapshot) -> bool {
        self.fingerprint == other.fingerprint
    }
}

/// Which snapshot fields are masked before fingerprinting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Redaction {
    /// Mask path-bearing fields such as the executable location.
    pub redact_paths: bool,
    /// Allowlisted environment variables whose values are masked.
    pub env_vars: BTreeSet<String>,
}

impl Redaction {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        !self.redact_paths && self.env_vars.is_empty()
    }
}

/// Source of environment snapshots for a check session.
pub trait EnvironmentProbe {
    fn capture(&self, backend: &BackendDescriptor) -> Result<EnvironmentSnapshot>;
}

/// Captures the live process environment.
#[derive(Debug, Clone, Default)]
pub struct SystemProbe {
    pub redaction: Redaction,
}

impl SystemProbe {
    pub fn new(redaction: Redaction) -> Self {
        Self { redaction }
    }
}

impl EnvironmentProbe for SystemProbe {
    fn capture(&self, backend: &BackendDescriptor) -> Result<EnvironmentSnapshot> {
        capture_environment(backend, &self.redaction)
    }
}

/// Capture a fingerprinted snapshot of the current process environment.
pub fn capture_environment(
    backend: &BackendDescriptor,
    redaction: &Redaction,
) -> Result<EnvironmentSnapshot> {
    let executable = if redaction.redact_paths {
        Some(REDACTED.to_string())
    } else {
        std::env::current_exe()
            .ok()
            .map(|path| path.display().to_string())
    };

    let runtime = RuntimeInfo {
        tool: "detcheck".to_string(),
        version: crate::VERSION.to_string(),
        executable,
    };

    let platform = PlatformInfo {
        os: std::env::consts::OS.to_string(),
        family: std::env::consts::FAMILY.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        cpu_count: std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1),
    };

    let env_vars = CONTROL_ENV_VARS
        .iter()
        .map(|name| {
            let value = if redaction.env_vars.contains(*name) {
                std::env::var(name).ok().map(|_| REDACTED.to_string())
            } else {
                std::env::var(name).ok()
            };
            (name.to_string(), value)
        })
        .collect();

    let snapshot = EnvironmentSnapshot::from_parts(
        runtime,
        platform,
        backend.libraries.clone(),
        backend.device.clone(),
        env_vars,
    )?;
    tracing::debug!(
        fingerprint = %&snapshot.fingerprint[..12],
        "environment snapshot captured"
    );
    Ok(snapshot)
}
