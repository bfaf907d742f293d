#![forbid(unsafe_code)]

use std::env;

use chrono::{SecondsFormat, Utc};
use patlab_kernel_contracts::condition::{normalize_condition, ExperimentCondition};
use patlab_kernel_contracts::participant::ParticipantId;
use patlab_kernel_contracts::phase::{PhaseKind, PhaseRecord};
use patlab_kernel_contracts::storage_keys::LocalStorageKey;
use patlab_kernel_contracts::submission::{SubmissionAck, SubmissionPayload};
use rand::Rng;
use serde_json::Value;
use tracing::{info, warn};

use crate::local_store::LocalStorage;
use crate::participant::get_or_create_participant_id;

const SEND_ERROR_MESSAGE_MAX_LEN: usize = 256;
pub const ENDPOINT_NOT_CONFIGURED_MESSAGE: &str = "submission endpoint not configured";

pub fn default_user_agent() -> String {
    format!("patlab/{}", env!("CARGO_PKG_VERSION"))
}

/// What the client reports about itself alongside the data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientMetadata {
    pub user_agent: String,
    pub screen_resolution: Option<String>,
}

impl Default for ClientMetadata {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            screen_resolution: None,
        }
    }
}

impl ClientMetadata {
    pub fn with_screen(user_agent: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            user_agent: user_agent.into(),
            screen_resolution: Some(format!("{width}x{height}")),
        }
    }
}

/// Data handed to the pipeline before metadata is stamped on.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SubmissionRequest {
    pub participant_id: Option<ParticipantId>,
    pub condition: String,
    pub task_data: Option<Value>,
    pub freeplay_data: Option<Value>,
    pub prolific_id: Option<String>,
    pub debrief_data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionSendError {
    pub message: String,
}

impl SubmissionSendError {
    pub fn new(message: impl Into<String>) -> Self {
        let mut message = message.into();
        if message.len() > SEND_ERROR_MESSAGE_MAX_LEN {
            let mut cut = SEND_ERROR_MESSAGE_MAX_LEN;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
        }
        Self { message }
    }
}

/// Result of one submission attempt. Never an error: failures carry the download hint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionOutcome {
    pub success: bool,
    pub error: Option<String>,
    pub fallback_to_download: bool,
    pub ack: Option<SubmissionAck>,
}

impl SubmissionOutcome {
    pub fn succeeded(ack: SubmissionAck) -> Self {
        Self {
            success: true,
            error: None,
            fallback_to_download: false,
            ack: Some(ack),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            fallback_to_download: true,
            ack: None,
        }
    }

    pub fn saved_id(&self) -> Option<i64> {
        self.ack.as_ref().and_then(|ack| ack.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionHttpSenderConfig {
    pub endpoint: String,
}

impl SubmissionHttpSenderConfig {
    pub fn from_env() -> Option<Self> {
        Self::from_env_var_map(|key| env::var(key).ok())
    }

    pub fn from_env_var_map<F>(lookup: F) -> Option<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let endpoint = lookup("PATLAB_SUBMIT_ENDPOINT")?;
        let endpoint = endpoint.trim().to_string();
        if endpoint.is_empty() {
            return None;
        }
        Some(Self { endpoint })
    }
}

/// `LoopbackAck` acknowledges without sending anything; it is only ever chosen explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionSenderRuntime {
    LoopbackAck,
    Http(SubmissionHttpSenderConfig),
    Unconfigured,
    AlwaysFail { message: String },
}

impl Default for SubmissionSenderRuntime {
    fn default() -> Self {
        Self::from_env_or_unconfigured()
    }
}

impl SubmissionSenderRuntime {
    /// Without an endpoint every send fails, so the caller keeps offering the download.
    pub fn from_env_or_unconfigured() -> Self {
        Self::from_env_var_map(|key| env::var(key).ok())
    }

    pub fn from_env_var_map<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        match SubmissionHttpSenderConfig::from_env_var_map(lookup) {
            Some(config) => Self::Http(config),
            None => {
                warn!("PATLAB_SUBMIT_ENDPOINT is not set; submissions will fail");
                Self::Unconfigured
            }
        }
    }

    #[cfg(test)]
    pub fn always_fail_for_tests(message: &str) -> Self {
        Self::AlwaysFail {
            message: message.to_string(),
        }
    }

    pub fn send(&self, payload: &SubmissionPayload) -> Result<SubmissionAck, SubmissionSendError> {
        match self {
            Self::LoopbackAck => Ok(SubmissionAck {
                success: true,
                message: Some(format!("loopback_ack:{}", payload.participant_id.as_str())),
                id: None,
                error: None,
            }),
            Self::Unconfigured => {
                Err(SubmissionSendError::new(ENDPOINT_NOT_CONFIGURED_MESSAGE))
            }
            Self::AlwaysFail { message } => Err(SubmissionSendError::new(message.clone())),
            Self::Http(config) => send_http_submission(config, payload),
        }
    }
}

fn send_http_submission(
    config: &SubmissionHttpSenderConfig,
    payload: &SubmissionPayload,
) -> Result<SubmissionAck, SubmissionSendError> {
    let body = serde_json::to_string(payload).map_err(|err| {
        SubmissionSendError::new(format!("submission payload encode failed: {err}"))
    })?;
    let agent = ureq::AgentBuilder::new().build();
    let req = agent
        .post(&config.endpoint)
        .set("content-type", "application/json");
    match req.send_string(&body) {
        Ok(resp) => {
            let status = resp.status();
            let text = resp.into_string().map_err(|err| {
                SubmissionSendError::new(format!("failed to read response body: {err}"))
            })?;
            evaluate_response(status, &text)
        }
        Err(ureq::Error::Status(code, _resp)) => Err(SubmissionSendError::new(format!(
            "HTTP error! status: {code}"
        ))),
        Err(ureq::Error::Transport(err)) => Err(SubmissionSendError::new(format!(
            "submission transport error: {err}"
        ))),
    }
}

/// Success needs a 2xx status and an acknowledgment body with `success: true`.
pub fn evaluate_response(status: u16, body: &str) -> Result<SubmissionAck, SubmissionSendError> {
    if !(200..=299).contains(&status) {
        return Err(SubmissionSendError::new(format!(
            "HTTP error! status: {status}"
        )));
    }
    let ack = serde_json::from_str::<SubmissionAck>(body).map_err(|err| {
        SubmissionSendError::new(format!("response was not a valid acknowledgment: {err}"))
    })?;
    if !ack.success {
        let reason = ack
            .error
            .clone()
            .unwrap_or_else(|| "server reported failure".to_string());
        return Err(SubmissionSendError::new(reason));
    }
    Ok(ack)
}

/// Reads one phase's stored data. Absent, malformed and wrongly-shaped entries are all `None`.
pub fn read_phase_data<S: LocalStorage + ?Sized>(storage: &S, kind: PhaseKind) -> Option<Value> {
    let raw = match storage.get_item(kind.storage_key()) {
        Ok(Some(raw)) => raw,
        Ok(None) => return None,
        Err(err) => {
            warn!(phase = kind.as_str(), error = %err, "failed to read phase data");
            return None;
        }
    };
    if raw.is_empty() {
        return None;
    }
    match PhaseRecord::parse(kind, &raw) {
        Some(record) => Some(record.to_value()),
        None => {
            warn!(phase = kind.as_str(), "stored phase data is malformed; treating as absent");
            None
        }
    }
}

fn read_text<S: LocalStorage + ?Sized>(storage: &S, key: LocalStorageKey) -> Option<String> {
    match storage.get_item(key) {
        Ok(v) => v.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()),
        Err(err) => {
            warn!(key = key.as_str(), error = %err, "failed to read local storage");
            None
        }
    }
}

/// Stored condition after normalization, or the default ordering when none was stored.
pub fn stored_condition_or_default<S: LocalStorage + ?Sized>(storage: &S) -> String {
    read_text(storage, LocalStorageKey::ExperimentCondition)
        .and_then(|raw| normalize_condition(&raw))
        .map(|c| c.as_str().to_string())
        .unwrap_or_else(|| ExperimentCondition::default().as_str().to_string())
}

/// Client side of the submission contract: builds documents from local storage and
/// POSTs them through the configured sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionPipeline {
    sender: SubmissionSenderRuntime,
    metadata: ClientMetadata,
}

impl SubmissionPipeline {
    pub fn new(sender: SubmissionSenderRuntime, metadata: ClientMetadata) -> Self {
        Self { sender, metadata }
    }

    pub fn from_env(metadata: ClientMetadata) -> Self {
        Self::new(SubmissionSenderRuntime::from_env_or_unconfigured(), metadata)
    }

    pub fn sender(&self) -> &SubmissionSenderRuntime {
        &self.sender
    }

    /// Stamps metadata onto `request` and performs exactly one POST.
    pub fn submit_data_to_server<S, R>(
        &self,
        storage: &mut S,
        rng: &mut R,
        request: SubmissionRequest,
    ) -> SubmissionOutcome
    where
        S: LocalStorage + ?Sized,
        R: Rng + ?Sized,
    {
        let participant_id = match request.participant_id {
            Some(id) => id,
            None => match get_or_create_participant_id(storage, rng) {
                Ok(id) => id,
                Err(err) => {
                    warn!(error = %err, "could not resolve participant id for submission");
                    return SubmissionOutcome::failed(err.to_string());
                }
            },
        };
        let payload = SubmissionPayload {
            participant_id,
            condition: request.condition,
            task_data: request.task_data,
            freeplay_data: request.freeplay_data,
            submission_time: Some(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
            user_agent: Some(self.metadata.user_agent.clone()),
            screen_resolution: self.metadata.screen_resolution.clone(),
            prolific_id: request.prolific_id,
            debrief_data: request.debrief_data,
        };

        info!(
            participant_id = payload.participant_id.as_str(),
            condition = payload.condition.as_str(),
            has_task = payload.task_data.is_some(),
            has_freeplay = payload.freeplay_data.is_some(),
            "submitting data to server"
        );
        match self.sender.send(&payload) {
            Ok(ack) => {
                info!(id = ?ack.id, "data submitted successfully");
                SubmissionOutcome::succeeded(ack)
            }
            Err(err) => {
                warn!(error = %err.message, "failed to submit data to server");
                SubmissionOutcome::failed(err.message)
            }
        }
    }

    /// Combined document from every phase currently in storage. Phase entries are read, never
    /// rewritten; only a missing participant id is generated and persisted.
    pub fn build_combined_request<S, R>(&self, storage: &mut S, rng: &mut R) -> SubmissionRequest
    where
        S: LocalStorage + ?Sized,
        R: Rng + ?Sized,
    {
        SubmissionRequest {
            participant_id: get_or_create_participant_id(storage, rng).ok(),
            condition: stored_condition_or_default(storage),
            task_data: read_phase_data(storage, PhaseKind::Task),
            freeplay_data: read_phase_data(storage, PhaseKind::Freeplay),
            prolific_id: read_text(storage, LocalStorageKey::ProlificId),
            debrief_data: read_phase_data(storage, PhaseKind::Debrief),
        }
    }

    pub fn submit_combined_data<S, R>(&self, storage: &mut S, rng: &mut R) -> SubmissionOutcome
    where
        S: LocalStorage + ?Sized,
        R: Rng + ?Sized,
    {
        let request = self.build_combined_request(storage, rng);
        let outcome = self.submit_data_to_server(storage, rng, request);
        if outcome.fallback_to_download {
            info!("server submission failed; download fallback should be offered");
        }
        outcome
    }

    /// `None` when no task data is stored.
    pub fn submit_task_data<S, R>(&self, storage: &mut S, rng: &mut R) -> Option<SubmissionOutcome>
    where
        S: LocalStorage + ?Sized,
        R: Rng + ?Sized,
    {
        self.submit_single_phase(storage, rng, PhaseKind::Task)
    }

    /// `None` when no freeplay data is stored.
    pub fn submit_freeplay_data<S, R>(
        &self,
        storage: &mut S,
        rng: &mut R,
    ) -> Option<SubmissionOutcome>
    where
        S: LocalStorage + ?Sized,
        R: Rng + ?Sized,
    {
        self.submit_single_phase(storage, rng, PhaseKind::Freeplay)
    }

    fn submit_single_phase<S, R>(
        &self,
        storage: &mut S,
        rng: &mut R,
        kind: PhaseKind,
    ) -> Option<SubmissionOutcome>
    where
        S: LocalStorage + ?Sized,
        R: Rng + ?Sized,
    {
        let Some(data) = read_phase_data(storage, kind) else {
            warn!(phase = kind.as_str(), "no phase data to submit");
            return None;
        };
        let mut request = SubmissionRequest {
            participant_id: get_or_create_participant_id(storage, rng).ok(),
            condition: stored_condition_or_default(storage),
            prolific_id: read_text(storage, LocalStorageKey::ProlificId),
            ..SubmissionRequest::default()
        };
        match kind {
            PhaseKind::Freeplay => request.freeplay_data = Some(data),
            _ => request.task_data = Some(data),
        }
        Some(self.submit_data_to_server(storage, rng, request))
    }
}
