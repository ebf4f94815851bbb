//! Token traces and their JSONL form.
//!
//! A trace holds one row per prompt in submission order. On disk each row is
//! one JSON object per line with sorted keys.

use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::artifacts::validate_trace_row;
use crate::backend::GenerationOutput;
use crate::config::DecodingParams;
use crate::domain::digest::{prompt_id, token_ids_hash};
use crate::domain::{DetError, Result};

/// Generation record for one prompt of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenTraceRow {
    pub prompt_id: String,
    pub input_token_ids: Vec<u32>,
    pub input_token_ids_hash: String,
    pub generated_token_ids: Vec<u32>,
    /// Per-step log-probabilities; serialized as `null` when not captured.
    #[serde(default, with = "log_prob::scores")]
    pub scores: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokenizer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decoding_max_new_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decoding_do_sample: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decoding_temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decoding_top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decoding_top_k: Option<u32>,
}

impl TokenTraceRow {
    /// Row for a prompt's tokens, without scores, tokenizer or decoding context.
    pub fn new(prompt: &str, input_token_ids: Vec<u32>, generated_token_ids: Vec<u32>) -> Self {
        Self {
            prompt_id: prompt_id(prompt),
            input_token_ids_hash: token_ids_hash(&input_token_ids),
            input_token_ids,
            generated_token_ids,
            scores: None,
            tokenizer_id: None,
            decoding_max_new_tokens: None,
            decoding_do_sample: None,
            decoding_temperature: None,
            decoding_top_p: None,
            decoding_top_k: None,
        }
    }

    pub fn from_output(output: GenerationOutput, decoding: &DecodingParams) -> Self {
        let mut row = Self::new(
            &output.prompt,
            output.input_token_ids,
            output.output_token_ids,
        );
        row.scores = output.scores;
        row.tokenizer_id = output.tokenizer_id;
        row.decoding_max_new_tokens = Some(decoding.max_new_tokens);
        row.decoding_do_sample = Some(decoding.do_sample);
        row.decoding_temperature = decoding.temperature;
        row.decoding_top_p = decoding.top_p;
        row.decoding_top_k = decoding.top_k;
        row
    }

    pub fn with_scores(mut self, scores: Vec<f64>) -> Self {
        self.scores = Some(scores);
        self
    }

    pub fn with_tokenizer(mut self, tokenizer_id: impl Into<String>) -> Self {
        self.tokenizer_id = Some(tokenizer_id.into());
        self
    }
}

/// Lossless JSON form for log-probabilities.
///
/// Finite values are plain numbers. `-inf`, `inf` and `nan` are written as
/// those strings, since JSON has no number for them.
pub(crate) mod log_prob {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    fn encode(value: f64) -> Repr {
        if value.is_finite() {
            Repr::Number(value)
        } else if value.is_nan() {
            Repr::Text("nan".to_string())
        } else if value > 0.0 {
            Repr::Text("inf".to_string())
        } else {
            Repr::Text("-inf".to_string())
        }
    }

    fn decode<E: serde::de::Error>(repr: Repr) -> Result<f64, E> {
        match repr {
            Repr::Number(value) => Ok(value),
            Repr::Text(text) => match text.as_str() {
                "-inf" => Ok(f64::NEG_INFINITY),
                "inf" => Ok(f64::INFINITY),
                "nan" => Ok(f64::NAN),
                other => Err(E::custom(format!("invalid log-probability {other:?}"))),
            },
        }
    }

    /// `Option<Vec<f64>>` score lists.
    pub mod scores {
        use super::*;

        pub fn serialize<S: Serializer>(
            value: &Option<Vec<f64>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            value
                .as_ref()
                .map(|scores| scores.iter().copied().map(encode).collect::<Vec<_>>())
                .serialize(serializer)
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Vec<f64>>, D::Error> {
            Option::<Vec<Repr>>::deserialize(deserializer)?
                .map(|reprs| {
                    reprs
                        .into_iter()
                        .map(decode::<D::Error>)
                        .collect::<Result<Vec<f64>, D::Error>>()
                })
                .transpose()
        }
    }

    /// A single optional score.
    pub mod score {
        use super::*;

        pub fn serialize<S: Serializer>(
            value: &Option<f64>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            value.map(encode).serialize(serializer)
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<f64>, D::Error> {
            Option::<Repr>::deserialize(deserializer)?
                .map(decode::<D::Error>)
                .transpose()
        }
    }
}

/// Ordered rows of one generation pass.
pub type Trace = Vec<TokenTraceRow>;

/// Write `rows` as JSONL, optionally checking each row against the trace-row schema.
pub fn write_trace(path: &Path, rows: &[TokenTraceRow], validate_rows: bool) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut out = BufWriter::new(std::fs::File::create(path)?);
    for row in rows {
        let value = serde_json::to_value(row)?;
        if validate_rows {
            validate_trace_row(&value)?;
        }
        serde_json::to_writer(&mut out, &value)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

/// Read a JSONL trace. Blank lines are skipped; errors carry 1-based line numbers.
pub fn read_trace(path: &Path) -> Result<Trace> {
    let reader = BufReader::new(std::fs::File::open(path)?);
    let mut rows = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let row = serde_json::from_str(&line).map_err(|e| DetError::TraceParse {
            line: idx + 1,
            reason: e.to_string(),
        })?;
        rows.push(row);
    }
    Ok(rows)
}
