//! Trace comparison and divergence classification.
//!
//! [`diff_traces`] walks two traces once, left to right, and stops at the first
//! divergence. For each row it checks, in order:
//!
//! 1. `prompt_id` (`GEN_CONTEXT_MISMATCH`)
//! 2. tokenizer id, input token hash, input token ids (`TOKENIZATION_MISMATCH`)
//! 3. decoding parameters (`GEN_CONTEXT_MISMATCH`)
//! 4. generated tokens (`RUN_VARIANCE_FIXED_BATCH`)
//! 5. scores, when both sides captured them (`SCORE_VARIANCE`)
//!
//! A row count mismatch is reported before any row is inspected.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::trace::TokenTraceRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Pass,
    Fail,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pass => "PASS",
            Status::Fail => "FAIL",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Diagnosis attached to a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Category {
    Pass,
    GenContextMismatch,
    TokenizationMismatch,
    RunVarianceFixedBatch,
    ScoreVariance,
    BatchVariance,
    UnsupportedRequest,
    EnvMismatch,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Pass => "PASS",
            Category::GenContextMismatch => "GEN_CONTEXT_MISMATCH",
            Category::TokenizationMismatch => "TOKENIZATION_MISMATCH",
            Category::RunVarianceFixedBatch => "RUN_VARIANCE_FIXED_BATCH",
            Category::ScoreVariance => "SCORE_VARIANCE",
            Category::BatchVariance => "BATCH_VARIANCE",
            Category::UnsupportedRequest => "UNSUPPORTED_REQUEST",
            Category::EnvMismatch => "ENV_MISMATCH",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// First point at which two traces disagree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Divergence {
    RowCountMismatch {
        left_rows: usize,
        right_rows: usize,
    },
    PromptIdMismatch {
        index: usize,
        left_prompt_id: String,
        right_prompt_id: String,
    },
    TokenizationMismatch {
        index: usize,
        field: String,
        left: Value,
        right: Value,
    },
    DecodingMismatch {
        index: usize,
        field: String,
        left: Value,
        right: Value,
    },
    TokenMismatch {
        index: usize,
        token_index: usize,
        left_token: Option<u32>,
        right_token: Option<u32>,
    },
    ScoreMismatch {
        index: usize,
        score_index: usize,
        #[serde(default, with = "crate::trace::log_prob::score")]
        left_score: Option<f64>,
        #[serde(default, with = "crate::trace::log_prob::score")]
        right_score: Option<f64>,
    },
}

impl Divergence {
    pub fn category(&self) -> Category {
        match self {
            Divergence::RowCountMismatch { .. }
            | Divergence::PromptIdMismatch { .. }
            | Divergence::DecodingMismatch { .. } => Category::GenContextMismatch,
            Divergence::TokenizationMismatch { .. } => Category::TokenizationMismatch,
            Divergence::TokenMismatch { .. } => Category::RunVarianceFixedBatch,
            Divergence::ScoreMismatch { .. } => Category::ScoreVariance,
        }
    }

    /// Row the divergence was found in; `None` for a row count mismatch.
    pub fn row_index(&self) -> Option<usize> {
        match self {
            Divergence::RowCountMismatch { .. } => None,
            Divergence::PromptIdMismatch { index, .. }
            | Divergence::TokenizationMismatch { index, .. }
            | Divergence::DecodingMismatch { index, .. }
            | Divergence::TokenMismatch { index, .. }
            | Divergence::ScoreMismatch { index, .. } => Some(*index),
        }
    }
}

/// Verdict of one comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffResult {
    pub status: Status,
    pub category: Category,
    pub first_divergence: Option<Divergence>,
}

impl DiffResult {
    pub fn pass() -> Self {
        Self {
            status: Status::Pass,
            category: Category::Pass,
            first_divergence: None,
        }
    }

    pub fn fail(divergence: Divergence) -> Self {
        Self {
            status: Status::Fail,
            category: divergence.category(),
            first_divergence: Some(divergence),
        }
    }

    pub fn is_pass(&self) -> bool {
        self.status == Status::Pass
    }
}

/// Index of the first differing token, or the shorter length when one
/// sequence is a strict prefix of the other.
pub fn first_token_divergence(left: &[u32], right: &[u32]) -> Option<usize> {
    first_divergence_by(left, right, |a, b| a == b)
}

/// Bit-exact score comparison.
fn first_score_divergence(left: &[f64], right: &[f64]) -> Option<usize> {
    first_divergence_by(left, right, |a, b| a.to_bits() == b.to_bits())
}

fn first_divergence_by<T>(left: &[T], right: &[T], eq: impl Fn(&T, &T) -> bool) -> Option<usize> {
    let shared = left.len().min(right.len());
    (0..shared)
        .find(|&i| !eq(&left[i], &right[i]))
        .or_else(|| (left.len() != right.len()).then_some(shared))
}

/// Compare two traces and classify the first divergence.
pub fn diff_traces(base: &[TokenTraceRow], other: &[TokenTraceRow]) -> DiffResult {
    if base.len() != other.len() {
        return DiffResult::fail(Divergence::RowCountMismatch {
            left_rows: base.len(),
            right_rows: other.len(),
        });
    }

    for (index, (left, right)) in base.iter().zip(other).enumerate() {
        if let Some(divergence) = diff_row(index, left, right) {
            return DiffResult::fail(divergence);
        }
    }
    DiffResult::pass()
}

fn diff_row(index: usize, left: &TokenTraceRow, right: &TokenTraceRow) -> Option<Divergence> {
    if left.prompt_id != right.prompt_id {
        return Some(Divergence::PromptIdMismatch {
            index,
            left_prompt_id: left.prompt_id.clone(),
            right_prompt_id: right.prompt_id.clone(),
        });
    }

    let tokenization = field_mismatch("tokenizer_id", &left.tokenizer_id, &right.tokenizer_id)
        .or_else(|| {
            field_mismatch(
                "input_token_ids_hash",
                &left.input_token_ids_hash,
                &right.input_token_ids_hash,
            )
        })
        .or_else(|| {
            field_mismatch(
                "input_token_ids",
                &left.input_token_ids,
                &right.input_token_ids,
            )
        });
    if let Some((field, l, r)) = tokenization {
        return Some(Divergence::TokenizationMismatch {
            index,
            field,
            left: l,
            right: r,
        });
    }

    let decoding = field_mismatch(
        "decoding_max_new_tokens",
        &left.decoding_max_new_tokens,
        &right.decoding_max_new_tokens,
    )
    .or_else(|| {
        field_mismatch(
            "decoding_do_sample",
            &left.decoding_do_sample,
            &right.decoding_do_sample,
        )
    })
    .or_else(|| {
        field_mismatch(
            "decoding_temperature",
            &left.decoding_temperature,
            &right.decoding_temperature,
        )
    })
    .or_else(|| field_mismatch("decoding_top_p", &left.decoding_top_p, &right.decoding_top_p))
    .or_else(|| field_mismatch("decoding_top_k", &left.decoding_top_k, &right.decoding_top_k));
    if let Some((field, l, r)) = decoding {
        return Some(Divergence::DecodingMismatch {
            index,
            field,
            left: l,
            right: r,
        });
    }

    if let Some(token_index) =
        first_token_divergence(&left.generated_token_ids, &right.generated_token_ids)
    {
        return Some(Divergence::TokenMismatch {
            index,
            token_index,
            left_token: left.generated_token_ids.get(token_index).copied(),
            right_token: right.generated_token_ids.get(token_index).copied(),
        });
    }

    if let (Some(left_scores), Some(right_scores)) = (&left.scores, &right.scores) {
        if let Some(score_index) = first_score_divergence(left_scores, right_scores) {
            return Some(Divergence::ScoreMismatch {
                index,
                score_index,
                left_score: left_scores.get(score_index).copied(),
                right_score: right_scores.get(score_index).copied(),
            });
        }
    }
    None
}

fn field_mismatch<T: PartialEq + Serialize>(
    field: &str,
    left: &T,
    right: &T,
) -> Option<(String, Value, Value)> {
    if left == right {
        return None;
    }
    Some((
        field.to_string(),
        serde_json::to_value(left).unwrap_or(Value::Null),
        serde_json::to_value(right).unwrap_or(Value::Null),
    ))
}

/// First non-passing result in order, or a canonical pass.
pub fn aggregate<I>(diffs: I) -> DiffResult
where
    I: IntoIterator<Item = DiffResult>,
{
    diffs
        .into_iter()
        .find(|diff| !diff.is_pass())
        .unwrap_or_else(DiffResult::pass)
}
