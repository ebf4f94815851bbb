//! Determinism tiers, modes and the request a session is opened with.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Ordinal bundle of determinism guarantees.
///
/// - `0`: none
/// - `1`: fixed-batch run repeatability
/// - `2`: tier 1 plus stable per-step score capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Tier(u8);

impl Tier {
    pub const NONE: Tier = Tier(0);
    pub const FIXED_BATCH: Tier = Tier(1);
    pub const SCORES: Tier = Tier(2);

    pub fn value(self) -> u8 {
        self.0
    }
}

impl Default for Tier {
    fn default() -> Self {
        Tier::FIXED_BATCH
    }
}

impl TryFrom<u8> for Tier {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        if value <= 2 {
            Ok(Tier(value))
        } else {
            Err(format!("tier must be 0, 1 or 2, got {value}"))
        }
    }
}

impl From<Tier> for u8 {
    fn from(tier: Tier) -> Self {
        tier.0
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: u8 = s
            .trim()
            .parse()
            .map_err(|_| format!("tier must be 0, 1 or 2, got {s:?}"))?;
        Tier::try_from(value)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How unmet determinism requirements are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Mode {
    /// Any control or capability failure rejects the request.
    #[serde(rename = "strict")]
    Strict,
    /// Failures are recorded and the effective tier is downgraded.
    #[default]
    #[serde(rename = "best-effort")]
    BestEffort,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Strict => "strict",
            Mode::BestEffort => "best-effort",
        }
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "strict" => Ok(Mode::Strict),
            "best-effort" => Ok(Mode::BestEffort),
            other => Err(format!(
                "mode must be \"strict\" or \"best-effort\", got {other:?}"
            )),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable input to a determinism session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeterminismRequest {
    pub tier: Tier,
    pub mode: Mode,
    pub seed: Option<u64>,
}

impl DeterminismRequest {
    pub fn new(tier: Tier, mode: Mode, seed: Option<u64>) -> Self {
        Self { tier, mode, seed }
    }

    /// Seed applied to the process generator; `0` when none was given.
    pub fn effective_seed(&self) -> u64 {
        self.seed.unwrap_or(0)
    }
}
