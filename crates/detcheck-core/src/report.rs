//! Session verdicts and their text rendering.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::artifacts::{wrap_artifact, ArtifactType};
use crate::capabilities::CapabilityDecision;
use crate::diff::{Category, DiffResult, Divergence, Status};
use crate::domain::Result;

/// Externally visible verdict of a check, run or diff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub status: Status,
    pub category: Category,
    #[serde(default)]
    pub details: Map<String, Value>,
}

impl Report {
    pub fn new(status: Status, category: Category) -> Self {
        Self {
            status,
            category,
            details: Map::new(),
        }
    }

    pub fn with_detail(mut self, key: &str, value: Value) -> Self {
        self.details.insert(key.to_string(), value);
        self
    }

    /// Report for a single two-trace comparison.
    pub fn from_diff(result: &DiffResult) -> Self {
        Self::new(result.status, result.category)
            .with_detail("first_divergence", divergence_value(result.first_divergence.as_ref()))
    }

    /// Report for a request the backend cannot honour in strict mode.
    pub fn unsupported(runs: usize, decision: &CapabilityDecision) -> Self {
        Self::new(Status::Fail, Category::UnsupportedRequest)
            .with_detail("runs", json!(runs))
            .with_detail(
                "capability_failures",
                serde_json::to_value(&decision.capability_failures).unwrap_or(Value::Null),
            )
            .with_detail("notes", json!(decision.notes))
    }

    /// Report for a run whose environment drifted from the baseline.
    pub fn env_mismatch(
        runs: usize,
        run_index: usize,
        baseline_fingerprint: &str,
        current_fingerprint: &str,
    ) -> Self {
        Self::new(Status::Fail, Category::EnvMismatch)
            .with_detail("runs", json!(runs))
            .with_detail("run_index", json!(run_index))
            .with_detail("baseline_fingerprint", json!(baseline_fingerprint))
            .with_detail("current_fingerprint", json!(current_fingerprint))
    }

    pub fn is_pass(&self) -> bool {
        self.status == Status::Pass
    }

    /// Process exit code for this verdict: 0 pass, 2 unsupported request,
    /// 3 any other failure.
    pub fn exit_code(&self) -> i32 {
        match (self.status, self.category) {
            (Status::Pass, _) => 0,
            (Status::Fail, Category::UnsupportedRequest) => 2,
            (Status::Fail, _) => 3,
        }
    }

    /// The report wrapped with its artifact header.
    pub fn to_artifact(&self) -> Result<Value> {
        wrap_artifact(ArtifactType::Report, self)
    }

    /// Human-readable form: status, category, then one line per detail.
    pub fn render_text(&self) -> String {
        let mut out = format!("Status: {}\nCategory: {}\n", self.status, self.category);
        if !self.details.is_empty() {
            out.push_str("Details:\n");
            for (key, value) in &self.details {
                out.push_str(&format!("- {key}: {}\n", render_value(value)));
            }
        }
        out
    }
}

pub(crate) fn divergence_value(divergence: Option<&Divergence>) -> Value {
    divergence
        .and_then(|d| serde_json::to_value(d).ok())
        .unwrap_or(Value::Null)
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::CapabilityFailure;
    use crate::domain::Tier;

    #[test]
    fn test_render_text_lists_details() {
        let report = Report::env_mismatch(3, 1, "aaa", "bbb");
        let text = report.render_text();
        assert_eq!(
            text,
            "Status: FAIL\n\
             Category: ENV_MISMATCH\n\
             Details:\n\
             - baseline_fingerprint: aaa\n\
             - current_fingerprint: bbb\n\
             - run_index: 1\n\
             - runs: 3\n"
        );
    }

    #[test]
    fn test_render_text_without_details() {
        let text = Report::new(Status::Pass, Category::Pass).render_text();
        assert_eq!(text, "Status: PASS\nCategory: PASS\n");
    }

    #[test]
    fn test_from_diff_pass_has_null_divergence() {
        let report = Report::from_diff(&DiffResult::pass());
        assert!(report.is_pass());
        assert_eq!(report.details["first_divergence"], Value::Null);
        assert!(report.render_text().contains("- first_divergence: null"));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(Report::new(Status::Pass, Category::Pass).exit_code(), 0);
        assert_eq!(
            Report::new(Status::Fail, Category::UnsupportedRequest).exit_code(),
            2
        );
        assert_eq!(
            Report::new(Status::Fail, Category::BatchVariance).exit_code(),
            3
        );
    }

    #[test]
    fn test_unsupported_details() {
        let decision = CapabilityDecision {
            supported: false,
            tier_effective: Tier::FIXED_BATCH,
            capability_failures: vec![CapabilityFailure {
                requirement: "scores".to_string(),
                reason: "no scores".to_string(),
            }],
            notes: vec!["cpu only".to_string()],
        };
        let report = Report::unsupported(3, &decision);
        assert_eq!(report.exit_code(), 2);
        assert_eq!(report.details["runs"], 3);
        assert_eq!(
            report.details["capability_failures"][0]["requirement"],
            "scores"
        );
        let artifact = report.to_artifact().expect("artifact");
        crate::artifacts::validate_artifact(&artifact).expect("valid report");
        assert_eq!(artifact["category"], "UNSUPPORTED_REQUEST");
    }
}
