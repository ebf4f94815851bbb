//! Domain models for detcheck.
//!
//! - `Tier`, `Mode`, `DeterminismRequest`: what a session is asked to guarantee
//! - `digest`: canonical JSON and SHA-256 helpers used for fingerprints and ids
//! - `error`: the crate-wide error taxonomy

pub mod digest;
pub mod error;
pub mod request;

pub use error::{ControlError, DetError, Result};
pub use request::{DeterminismRequest, Mode, Tier};
