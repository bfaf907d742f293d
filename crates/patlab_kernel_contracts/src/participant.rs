#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::{validate_text, ContractViolation, Validate};

pub const PARTICIPANT_ID_MAX_LEN: usize = 100;
pub const PROLIFIC_ID_MAX_LEN: usize = 64;
pub const PARTICIPANT_ID_PREFIX: &str = "P_";
pub const PARTICIPANT_ID_SUFFIX_LEN: usize = 9;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Result<Self, ContractViolation> {
        let id = Self(id.into().trim().to_string());
        id.validate()?;
        Ok(id)
    }

    /// `P_<unix-ms>_<suffix>`, the shape generated on first visit.
    pub fn from_parts(unix_ms: u64, suffix: &str) -> Result<Self, ContractViolation> {
        Self::new(format!("{PARTICIPANT_ID_PREFIX}{unix_ms}_{suffix}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for ParticipantId {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_text("participant_id", &self.0, PARTICIPANT_ID_MAX_LEN)
    }
}

/// Recruitment-platform identifier typed in by the participant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProlificId(String);

impl ProlificId {
    pub fn new(id: impl Into<String>) -> Result<Self, ContractViolation> {
        let id = Self(id.into().trim().to_string());
        id.validate()?;
        Ok(id)
    }

    /// Blank input means "no id"; anything else must be a valid id.
    pub fn parse_optional(raw: &str) -> Result<Option<Self>, ContractViolation> {
        if raw.trim().is_empty() {
            return Ok(None);
        }
        Self::new(raw).map(Some)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for ProlificId {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_text("prolific_id", &self.0, PROLIFIC_ID_MAX_LEN)
    }
}
