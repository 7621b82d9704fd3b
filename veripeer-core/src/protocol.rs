//! Veripeer wire protocol: message bodies exchanged after the handshake.
//!
//! Bodies are JSON. The initiator sends a [`ClaimSet`]; the responder answers with exactly one
//! [`VerificationVerdict`].

use serde::{Deserialize, Serialize};

/// Fixed chunk width, in characters.
pub const CHUNK_WIDTH: usize = 4;

/// Error text returned when a request cannot be parsed as a claim set.
pub const CORRUPTED_DATA: &str = "corrupted data";

/// Assertion that `chunk` occupies `position` within a payload.
///
/// `position` is signed on the wire; a negative value is out of range for that claim only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub chunk: String,
    pub position: i64,
}

impl Claim {
    pub fn new(chunk: impl Into<String>, position: usize) -> Self {
        Self {
            chunk: chunk.into(),
            position: i64::try_from(position).unwrap_or(i64::MAX),
        }
    }

    /// Index into a chunk list, if the position can be one.
    pub fn index(&self) -> Option<usize> {
        usize::try_from(self.position).ok()
    }
}

/// Verification request: ordered claims against one payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimSet {
    pub payload_id: String,
    pub claims: Vec<Claim>,
}

/// Outcome for one claim. Serialized as a bare bool, or `{"error": ...}` when the claim could not
/// be evaluated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClaimOutcome {
    Checked(bool),
    Error { error: String },
}

impl ClaimOutcome {
    pub fn is_match(&self) -> bool {
        matches!(self, ClaimOutcome::Checked(true))
    }
}

/// Response to a claim set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationVerdict {
    pub chunk_available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<ClaimOutcome>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl VerificationVerdict {
    /// Responder does not hold the payload.
    pub fn unavailable() -> Self {
        Self {
            chunk_available: false,
            results: None,
            error: None,
        }
    }

    /// Request could not be parsed as a claim set.
    pub fn corrupted() -> Self {
        Self {
            chunk_available: false,
            results: None,
            error: Some(CORRUPTED_DATA.to_string()),
        }
    }

    pub fn checked(results: Vec<ClaimOutcome>) -> Self {
        Self {
            chunk_available: true,
            results: Some(results),
            error: None,
        }
    }

    pub fn is_corrupted(&self) -> bool {
        self.error.is_some()
    }

    /// Payload available and every claim matched.
    pub fn is_verified(&self) -> bool {
        self.chunk_available
            && self
                .results
                .as_ref()
                .is_some_and(|r| r.iter().all(ClaimOutcome::is_match))
    }

    /// Plain per-claim booleans; claims that errored count as `false`.
    pub fn matches(&self) -> Vec<bool> {
        self.results
            .as_ref()
            .map(|r| r.iter().map(ClaimOutcome::is_match).collect())
            .unwrap_or_default()
    }
}
