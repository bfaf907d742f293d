#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use chrono::{SecondsFormat, Utc};
use patlab_engines::local_store::LocalStorage;
use patlab_engines::submission::SubmissionPipeline;
use patlab_kernel_contracts::phase::{DebriefRecord, PhaseBody, PhaseKind, PhaseRecord};
use patlab_kernel_contracts::storage_keys::{LocalStorageKey, SUBMISSION_SUCCESS_MARKER};
use rand::Rng;
use tracing::{info, warn};

use crate::session::{SessionContext, SessionError};

pub const INCOMPLETE_FORM_MESSAGE: &str = "Please answer all questions before continuing.";
pub const SUBMISSION_FAILED_MESSAGE: &str = "We could not submit your data automatically. \
Please check your internet connection and try again. \
If the issue persists, please contact the researcher.";
pub const UNEXPECTED_FAILURE_MESSAGE: &str = "Something went wrong while submitting. \
Please try again. If the issue persists, please contact the researcher.";

pub const LABEL_DONE: &str = "Done";
pub const LABEL_SUBMITTING: &str = "Submitting...";
pub const LABEL_SUBMITTED: &str = "Submitted ✓";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebriefGateState {
    Incomplete,
    CompleteUnsubmitted,
    Submitting,
    Submitted,
}

/// Questionnaire answers keyed by field name. Every required field must carry a
/// non-blank answer before the gate opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebriefForm {
    required: Vec<String>,
    answers: BTreeMap<String, String>,
}

impl DebriefForm {
    pub fn new<I, T>(required: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            required: required.into_iter().map(Into::into).collect(),
            answers: BTreeMap::new(),
        }
    }

    pub fn set_answer(&mut self, field: &str, value: &str) {
        self.answers
            .insert(field.to_string(), value.trim().to_string());
    }

    pub fn is_complete(&self) -> bool {
        self.required.iter().all(|field| {
            self.answers
                .get(field)
                .is_some_and(|v| !v.trim().is_empty())
        })
    }

    /// Answers including empty ones, so unanswered required fields show up as "".
    pub fn answers_including_empty(&self) -> BTreeMap<String, String> {
        let mut out = self.answers.clone();
        for field in &self.required {
            out.entry(field.clone()).or_default();
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EnsureSubmitted {
    pub ok: bool,
    pub skipped: bool,
    pub error: Option<String>,
}

/// What the page should render for the gate's current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebriefView {
    pub state: DebriefGateState,
    pub done_enabled: bool,
    pub label: &'static str,
    pub completion_visible: bool,
    pub error: Option<String>,
}

/// Submits the combined document once per session. A stored success marker short-circuits
/// the network call.
pub fn ensure_submitted<S, R>(
    storage: &mut S,
    pipeline: &SubmissionPipeline,
    rng: &mut R,
) -> EnsureSubmitted
where
    S: LocalStorage + ?Sized,
    R: Rng + ?Sized,
{
    match storage.get_item(LocalStorageKey::ServerSubmissionSuccess) {
        Ok(Some(marker)) if marker == SUBMISSION_SUCCESS_MARKER => {
            return EnsureSubmitted {
                ok: true,
                skipped: true,
                error: None,
            };
        }
        Ok(_) => {}
        Err(err) => warn!(error = %err, "could not read submission marker"),
    }

    let outcome = pipeline.submit_combined_data(storage, rng);
    if outcome.success {
        if let Err(err) = storage.set_item(
            LocalStorageKey::ServerSubmissionSuccess,
            SUBMISSION_SUCCESS_MARKER,
        ) {
            warn!(error = %err, "submission succeeded but marker could not be stored");
        }
        return EnsureSubmitted {
            ok: true,
            skipped: false,
            error: None,
        };
    }
    EnsureSubmitted {
        ok: false,
        skipped: false,
        error: Some(
            outcome
                .error
                .unwrap_or_else(|| "Submission failed.".to_string()),
        ),
    }
}

#[derive(Debug, Clone)]
pub struct DebriefGate {
    form: DebriefForm,
    state: DebriefGateState,
    error: Option<String>,
}

impl DebriefGate {
    pub fn new(form: DebriefForm) -> Self {
        let state = if form.is_complete() {
            DebriefGateState::CompleteUnsubmitted
        } else {
            DebriefGateState::Incomplete
        };
        Self {
            form,
            state,
            error: None,
        }
    }

    pub fn state(&self) -> DebriefGateState {
        self.state
    }

    pub fn form(&self) -> &DebriefForm {
        &self.form
    }

    /// Input/change handler. Answers are frozen once the data is submitted.
    pub fn set_answer(&mut self, field: &str, value: &str) {
        if self.state == DebriefGateState::Submitted {
            return;
        }
        self.form.set_answer(field, value);
        self.refresh();
    }

    fn refresh(&mut self) {
        if matches!(
            self.state,
            DebriefGateState::Submitted | DebriefGateState::Submitting
        ) {
            return;
        }
        if self.form.is_complete() {
            self.state = DebriefGateState::CompleteUnsubmitted;
            self.error = None;
        } else {
            self.state = DebriefGateState::Incomplete;
        }
    }

    pub fn view(&self) -> DebriefView {
        let (done_enabled, label, completion_visible) = match self.state {
            DebriefGateState::Incomplete => (false, LABEL_DONE, false),
            DebriefGateState::CompleteUnsubmitted => (true, LABEL_DONE, false),
            DebriefGateState::Submitting => (false, LABEL_SUBMITTING, false),
            DebriefGateState::Submitted => (false, LABEL_SUBMITTED, true),
        };
        DebriefView {
            state: self.state,
            done_enabled,
            label,
            completion_visible,
            error: self.error.clone(),
        }
    }

    /// Done-button handler. Saves the debrief record, folds it into the stored phase data,
    /// then makes sure the combined document reached the server.
    pub fn submit<S, R>(
        &mut self,
        session: &mut SessionContext<S>,
        pipeline: &SubmissionPipeline,
        rng: &mut R,
    ) -> DebriefView
    where
        S: LocalStorage,
        R: Rng + ?Sized,
    {
        if self.state == DebriefGateState::Submitted {
            return self.view();
        }
        self.error = None;
        if !self.form.is_complete() {
            self.state = DebriefGateState::Incomplete;
            self.error = Some(INCOMPLETE_FORM_MESSAGE.to_string());
            return self.view();
        }

        self.state = DebriefGateState::Submitting;
        if let Err(err) = self.save_debrief(session) {
            warn!(error = %err, "failed to save debrief data");
            self.state = DebriefGateState::CompleteUnsubmitted;
            self.error = Some(UNEXPECTED_FAILURE_MESSAGE.to_string());
            return self.view();
        }

        let submitted = ensure_submitted(session.storage_mut(), pipeline, rng);
        if submitted.ok {
            info!(skipped = submitted.skipped, "debrief submission confirmed");
            self.state = DebriefGateState::Submitted;
        } else {
            warn!(error = ?submitted.error, "debrief submission failed; retry allowed");
            self.state = DebriefGateState::CompleteUnsubmitted;
            self.error = Some(SUBMISSION_FAILED_MESSAGE.to_string());
        }
        self.view()
    }

    fn save_debrief<S: LocalStorage>(
        &self,
        session: &mut SessionContext<S>,
    ) -> Result<DebriefRecord, SessionError> {
        let storage = session.storage();
        let prolific_id = storage
            .get_item(LocalStorageKey::ProlificId)?
            .filter(|v| !v.is_empty());
        let participant_id = storage
            .get_item(LocalStorageKey::ParticipantId)?
            .filter(|v| !v.is_empty());
        let record = DebriefRecord::v1(
            self.form.answers_including_empty(),
            prolific_id,
            participant_id,
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        )?;
        session.store_phase(PhaseRecord::Debrief(record.clone()))?;

        for kind in [PhaseKind::Task, PhaseKind::Freeplay] {
            attach_debrief_to_phase(session, kind, &record)?;
        }
        Ok(record)
    }
}

/// Adds `debrief` to a stored object-shaped phase body. Missing, malformed or array bodies
/// are left as they are.
fn attach_debrief_to_phase<S: LocalStorage>(
    session: &mut SessionContext<S>,
    kind: PhaseKind,
    record: &DebriefRecord,
) -> Result<(), SessionError> {
    let Some(raw) = session.storage().get_item(kind.storage_key())? else {
        return Ok(());
    };
    let Some(parsed) = PhaseRecord::parse(kind, &raw) else {
        return Ok(());
    };
    let mut body: PhaseBody = match parsed {
        PhaseRecord::Task(b) | PhaseRecord::Freeplay(b) => b,
        PhaseRecord::Debrief(_) => return Ok(()),
    };
    if !body.attach_debrief(record) {
        return Ok(());
    }
    let updated = match kind {
        PhaseKind::Freeplay => PhaseRecord::Freeplay(body),
        _ => PhaseRecord::Task(body),
    };
    session.store_phase(updated)
}
