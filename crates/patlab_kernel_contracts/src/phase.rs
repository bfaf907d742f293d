#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::storage_keys::LocalStorageKey;
use crate::{ContractViolation, Validate};

pub const DEBRIEF_ANSWERS_MAX: usize = 64;
pub const DEBRIEF_ANSWER_MAX_LEN: usize = 4_096;
/// Key under which the debrief record is attached to task/freeplay bodies.
pub const DEBRIEF_ATTACH_KEY: &str = "debrief";

const DEBRIEF_RESERVED_KEYS: &[&str] = &["prolificId", "participantId", "submissionTime"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PhaseKind {
    Task,
    Freeplay,
    Debrief,
}

impl PhaseKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Freeplay => "freeplay",
            Self::Debrief => "debrief",
        }
    }

    pub const fn storage_key(self) -> LocalStorageKey {
        match self {
            Self::Task => LocalStorageKey::TaskExperimentData,
            Self::Freeplay => LocalStorageKey::FreeplayExperimentData,
            Self::Debrief => LocalStorageKey::DebriefData,
        }
    }
}

/// Captured task or freeplay data. Always a JSON object or array.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseBody(Value);

impl PhaseBody {
    pub fn v1(body: Value) -> Result<Self, ContractViolation> {
        let b = Self(body);
        b.validate()?;
        Ok(b)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    /// Adds `debrief` to an object body. Array bodies have nowhere to carry it and are left as-is.
    pub fn attach_debrief(&mut self, debrief: &DebriefRecord) -> bool {
        match self.0.as_object_mut() {
            Some(obj) => {
                obj.insert(DEBRIEF_ATTACH_KEY.to_string(), debrief.to_value());
                true
            }
            None => false,
        }
    }
}

impl Validate for PhaseBody {
    fn validate(&self) -> Result<(), ContractViolation> {
        if !(self.0.is_object() || self.0.is_array()) {
            return Err(ContractViolation::InvalidValue {
                field: "phase_body",
                reason: "must be a JSON object or array",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebriefRecord {
    #[serde(flatten)]
    pub answers: BTreeMap<String, String>,
    pub prolific_id: Option<String>,
    pub participant_id: Option<String>,
    pub submission_time: String,
}

impl DebriefRecord {
    /// Answers named like a metadata field are dropped; the metadata value wins.
    pub fn v1(
        mut answers: BTreeMap<String, String>,
        prolific_id: Option<String>,
        participant_id: Option<String>,
        submission_time: String,
    ) -> Result<Self, ContractViolation> {
        answers.retain(|key, _| !DEBRIEF_RESERVED_KEYS.contains(&key.as_str()));
        let r = Self {
            answers,
            prolific_id,
            participant_id,
            submission_time,
        };
        r.validate()?;
        Ok(r)
    }

    pub fn to_value(&self) -> Value {
        // A flat string map with optional strings always serializes.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl Validate for DebriefRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.answers.len() > DEBRIEF_ANSWERS_MAX {
            return Err(ContractViolation::InvalidValue {
                field: "debrief_record.answers",
                reason: "too many answers",
            });
        }
        for (key, value) in &self.answers {
            if key.trim().is_empty() {
                return Err(ContractViolation::InvalidValue {
                    field: "debrief_record.answers",
                    reason: "answer keys must not be empty",
                });
            }
            if DEBRIEF_RESERVED_KEYS.contains(&key.as_str()) {
                return Err(ContractViolation::InvalidValue {
                    field: "debrief_record.answers",
                    reason: "answer key collides with a reserved field",
                });
            }
            if value.len() > DEBRIEF_ANSWER_MAX_LEN {
                return Err(ContractViolation::InvalidValue {
                    field: "debrief_record.answers",
                    reason: "answer exceeds max length",
                });
            }
        }
        if self.submission_time.trim().is_empty() {
            return Err(ContractViolation::MissingField {
                field: "debrief_record.submission_time",
            });
        }
        Ok(())
    }
}

/// One phase's captured data, tagged by phase.
#[derive(Debug, Clone, PartialEq)]
pub enum PhaseRecord {
    Task(PhaseBody),
    Freeplay(PhaseBody),
    Debrief(DebriefRecord),
}

impl PhaseRecord {
    pub fn kind(&self) -> PhaseKind {
        match self {
            Self::Task(_) => PhaseKind::Task,
            Self::Freeplay(_) => PhaseKind::Freeplay,
            Self::Debrief(_) => PhaseKind::Debrief,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Task(b) | Self::Freeplay(b) => b.as_value().clone(),
            Self::Debrief(d) => d.to_value(),
        }
    }

    pub fn to_storage_string(&self) -> String {
        self.to_value().to_string()
    }

    /// Decodes a stored string. Malformed or wrongly-shaped JSON yields `None`.
    pub fn parse(kind: PhaseKind, raw: &str) -> Option<Self> {
        match kind {
            PhaseKind::Task | PhaseKind::Freeplay => {
                let value = serde_json::from_str::<Value>(raw).ok()?;
                let body = PhaseBody::v1(value).ok()?;
                Some(if kind == PhaseKind::Task {
                    Self::Task(body)
                } else {
                    Self::Freeplay(body)
                })
            }
            PhaseKind::Debrief => {
                let record = serde_json::from_str::<DebriefRecord>(raw).ok()?;
                record.validate().ok()?;
                Some(Self::Debrief(record))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn debrief() -> DebriefRecord {
        let mut answers = BTreeMap::new();
        answers.insert("strategy".to_string(), "reused favorites".to_string());
        DebriefRecord::v1(
            answers,
            Some("PROLIFIC123".to_string()),
            Some("P_1_abc".to_string()),
            "2025-12-21T21:48:35.000Z".to_string(),
        )
        .unwrap()
    }

    #[test]
    fn at_phase_01_scalar_bodies_are_rejected() {
        assert!(PhaseBody::v1(json!(5)).is_err());
        assert!(PhaseBody::v1(json!("text")).is_err());
        assert!(PhaseBody::v1(json!(null)).is_err());
        assert!(PhaseBody::v1(json!([])).is_ok());
        assert!(PhaseBody::v1(json!({})).is_ok());
    }

    #[test]
    fn at_phase_02_malformed_storage_is_treated_as_absent() {
        assert_eq!(PhaseRecord::parse(PhaseKind::Task, "{not json"), None);
        assert_eq!(PhaseRecord::parse(PhaseKind::Freeplay, "42"), None);
        assert_eq!(PhaseRecord::parse(PhaseKind::Debrief, "[]"), None);
    }

    #[test]
    fn at_phase_03_debrief_attaches_to_objects_only() {
        let d = debrief();
        let mut obj = PhaseBody::v1(json!({"trials": []})).unwrap();
        assert!(obj.attach_debrief(&d));
        assert_eq!(obj.as_value()["debrief"]["prolificId"], "PROLIFIC123");
        assert_eq!(obj.as_value()["debrief"]["strategy"], "reused favorites");

        let mut arr = PhaseBody::v1(json!([{"metadata": {}}])).unwrap();
        assert!(!arr.attach_debrief(&d));
        assert_eq!(arr.as_value(), &json!([{"metadata": {}}]));
    }

    #[test]
    fn at_phase_04_debrief_record_flattens_answers_on_the_wire() {
        let stored = PhaseRecord::Debrief(debrief()).to_storage_string();
        let value: Value = serde_json::from_str(&stored).unwrap();
        assert_eq!(value["strategy"], "reused favorites");
        assert_eq!(value["participantId"], "P_1_abc");
        assert_eq!(
            PhaseRecord::parse(PhaseKind::Debrief, &stored),
            Some(PhaseRecord::Debrief(debrief()))
        );
    }

    #[test]
    fn at_phase_05_metadata_overrides_answers_with_reserved_names() {
        let mut answers = BTreeMap::new();
        answers.insert("prolificId".to_string(), "typed-in".to_string());
        answers.insert("submissionTime".to_string(), "later".to_string());
        answers.insert("strategy".to_string(), "x".to_string());
        let record = DebriefRecord::v1(
            answers,
            Some("PRO_REAL".to_string()),
            None,
            "2025-12-21T21:48:35.000Z".to_string(),
        )
        .unwrap();
        assert_eq!(record.answers.len(), 1);
        let value = record.to_value();
        assert_eq!(value["prolificId"], "PRO_REAL");
        assert_eq!(value["submissionTime"], "2025-12-21T21:48:35.000Z");
        assert_eq!(value["strategy"], "x");
    }

    #[test]
    fn at_phase_06_hand_built_record_with_reserved_answer_fails_validation() {
        let mut answers = BTreeMap::new();
        answers.insert("participantId".to_string(), "x".to_string());
        let record = DebriefRecord {
            answers,
            prolific_id: None,
            participant_id: None,
            submission_time: "t".to_string(),
        };
        assert!(record.validate().is_err());
    }
}
