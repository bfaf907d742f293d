#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::participant::{ParticipantId, PROLIFIC_ID_MAX_LEN};
use crate::{validate_text, ContractViolation, Validate};

pub const CONDITION_MAX_LEN: usize = 50;
pub const SCREEN_RESOLUTION_MAX_LEN: usize = 50;
pub const USER_AGENT_MAX_LEN: usize = 1_024;

/// Combined document POSTed by the client and accepted by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionPayload {
    pub participant_id: ParticipantId,
    pub condition: String,
    pub task_data: Option<Value>,
    pub freeplay_data: Option<Value>,
    pub submission_time: Option<String>,
    pub user_agent: Option<String>,
    pub screen_resolution: Option<String>,
    pub prolific_id: Option<String>,
    pub debrief_data: Option<Value>,
}

impl SubmissionPayload {
    /// Reads a decoded request body. Only `participantId` and `condition` are required;
    /// optional fields that are absent or `null` become `None`.
    pub fn from_wire(body: &Value) -> Result<Self, ContractViolation> {
        let obj = body.as_object().ok_or(ContractViolation::InvalidValue {
            field: "submission_payload",
            reason: "must be a JSON object",
        })?;

        let participant_id = required_text(obj, "participantId")?;
        let participant_id =
            ParticipantId::new(participant_id).map_err(|_| ContractViolation::InvalidValue {
                field: "submission_payload.participantId",
                reason: "must be a valid participant id",
            })?;
        let condition = required_text(obj, "condition")?;

        let payload = Self {
            participant_id,
            condition,
            task_data: optional_json(obj, "taskData"),
            freeplay_data: optional_json(obj, "freeplayData"),
            submission_time: optional_text(obj, "submissionTime", "submission_payload.submissionTime")?,
            user_agent: optional_text(obj, "userAgent", "submission_payload.userAgent")?,
            screen_resolution: optional_text(
                obj,
                "screenResolution",
                "submission_payload.screenResolution",
            )?,
            prolific_id: optional_text(obj, "prolificId", "submission_payload.prolificId")?
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
            debrief_data: optional_json(obj, "debriefData"),
        };
        payload.validate()?;
        Ok(payload)
    }
}

impl Validate for SubmissionPayload {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.participant_id.validate()?;
        validate_text("submission_payload.condition", &self.condition, CONDITION_MAX_LEN)?;
        if let Some(res) = &self.screen_resolution {
            if res.len() > SCREEN_RESOLUTION_MAX_LEN {
                return Err(ContractViolation::InvalidValue {
                    field: "submission_payload.screenResolution",
                    reason: "exceeds max length",
                });
            }
        }
        if let Some(ua) = &self.user_agent {
            if ua.len() > USER_AGENT_MAX_LEN {
                return Err(ContractViolation::InvalidValue {
                    field: "submission_payload.userAgent",
                    reason: "exceeds max length",
                });
            }
        }
        if let Some(pid) = &self.prolific_id {
            validate_text("submission_payload.prolificId", pid, PROLIFIC_ID_MAX_LEN)?;
        }
        Ok(())
    }
}

fn required_text(obj: &Map<String, Value>, key: &'static str) -> Result<String, ContractViolation> {
    match obj.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Some(Value::String(_)) | Some(Value::Null) | None => Err(ContractViolation::MissingField {
            field: key,
        }),
        Some(_) => Err(ContractViolation::InvalidValue {
            field: key,
            reason: "must be a string",
        }),
    }
}

fn optional_text(
    obj: &Map<String, Value>,
    key: &str,
    field: &'static str,
) -> Result<Option<String>, ContractViolation> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(ContractViolation::InvalidValue {
            field,
            reason: "must be a string",
        }),
    }
}

fn optional_json(obj: &Map<String, Value>, key: &str) -> Option<Value> {
    obj.get(key).filter(|v| !v.is_null()).cloned()
}

/// Backend acknowledgment body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionAck {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SubmissionAck {
    pub fn saved(id: i64) -> Self {
        Self {
            success: true,
            message: Some("Data saved successfully".to_string()),
            id: Some(id),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: None,
            id: None,
            error: Some(error.into()),
        }
    }
}
