#![forbid(unsafe_code)]

use patlab_engines::condition::get_condition;
use patlab_engines::local_store::{LocalStorage, LocalStorageError};
use patlab_engines::participant::get_or_create_participant_id;
use patlab_kernel_contracts::condition::{ExperimentCondition, NormalizedCondition};
use patlab_kernel_contracts::participant::{ParticipantId, ProlificId};
use patlab_kernel_contracts::phase::{PhaseBody, PhaseKind, PhaseRecord};
use patlab_kernel_contracts::storage_keys::LocalStorageKey;
use patlab_kernel_contracts::ContractViolation;
use rand::Rng;
use serde_json::Value;
use tracing::{debug, info};

/// One point per correct trial; the scored set has 25 patterns.
pub const POINTS_MAX: u32 = 25;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("local storage error: {0}")]
    Storage(#[from] LocalStorageError),
    #[error("contract violation: {0}")]
    Contract(#[from] ContractViolation),
}

/// Progress through the scored trials of the current phase.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrialProgress {
    pub current_index: usize,
    pub total_points: u32,
    pub trials: Vec<Value>,
}

impl TrialProgress {
    pub fn record_trial(&mut self, record: Value, correct: bool) {
        self.trials.push(record);
        self.current_index += 1;
        if correct {
            self.total_points = (self.total_points + 1).min(POINTS_MAX);
        }
    }
}

/// Everything a page controller needs about the running session. Replaces the
/// process-wide state object: controllers receive it explicitly.
#[derive(Debug)]
pub struct SessionContext<S: LocalStorage> {
    storage: S,
    participant_id: ParticipantId,
    condition: NormalizedCondition,
    progress: TrialProgress,
}

impl<S: LocalStorage> SessionContext<S> {
    /// Resolves (or creates) the participant id and condition from storage.
    pub fn start<R: Rng + ?Sized>(mut storage: S, rng: &mut R) -> Result<Self, SessionError> {
        let participant_id = get_or_create_participant_id(&mut storage, rng)?;
        let condition = get_condition(&mut storage, rng)?;
        info!(
            participant_id = participant_id.as_str(),
            condition = condition.as_str(),
            "session started"
        );
        Ok(Self {
            storage,
            participant_id,
            condition,
            progress: TrialProgress::default(),
        })
    }

    pub fn participant_id(&self) -> &ParticipantId {
        &self.participant_id
    }

    pub fn condition(&self) -> &NormalizedCondition {
        &self.condition
    }

    /// Legacy conditions run in the default order.
    pub fn phase_sequence(&self) -> [PhaseKind; 3] {
        let [first, second] = self
            .condition
            .canonical()
            .unwrap_or_default()
            .phase_order();
        [first, second, PhaseKind::Debrief]
    }

    pub fn progress(&self) -> &TrialProgress {
        &self.progress
    }

    pub fn progress_mut(&mut self) -> &mut TrialProgress {
        &mut self.progress
    }

    /// Starts a fresh phase's trial counter.
    pub fn reset_progress(&mut self) {
        self.progress = TrialProgress::default();
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    pub fn into_storage(self) -> S {
        self.storage
    }

    /// Stores the trimmed recruitment id; blank input removes any stored id.
    pub fn record_prolific_id(&mut self, raw: &str) -> Result<Option<ProlificId>, SessionError> {
        let parsed = ProlificId::parse_optional(raw)?;
        match &parsed {
            Some(id) => self
                .storage
                .set_item(LocalStorageKey::ProlificId, id.as_str())?,
            None => self.storage.remove_item(LocalStorageKey::ProlificId)?,
        }
        debug!(present = parsed.is_some(), "recorded prolific id");
        Ok(parsed)
    }

    pub fn stored_prolific_id(&self) -> Result<Option<String>, SessionError> {
        Ok(self.storage.get_item(LocalStorageKey::ProlificId)?)
    }

    pub fn complete_task_phase(&mut self, body: Value) -> Result<(), SessionError> {
        self.store_phase(PhaseRecord::Task(PhaseBody::v1(body)?))
    }

    pub fn complete_freeplay_phase(&mut self, body: Value) -> Result<(), SessionError> {
        self.store_phase(PhaseRecord::Freeplay(PhaseBody::v1(body)?))
    }

    pub(crate) fn store_phase(&mut self, record: PhaseRecord) -> Result<(), SessionError> {
        let key = record.kind().storage_key();
        self.storage.set_item(key, &record.to_storage_string())?;
        info!(phase = record.kind().as_str(), "phase data saved");
        Ok(())
    }
}

/// Condition a controller should branch on, falling back to the default ordering.
pub fn effective_condition(condition: &NormalizedCondition) -> ExperimentCondition {
    condition.canonical().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use patlab_engines::local_store::MemoryLocalStorage;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;

    fn session(items: &[(LocalStorageKey, &str)]) -> SessionContext<MemoryLocalStorage> {
        let storage = MemoryLocalStorage::with_items(items.iter().copied());
        SessionContext::start(storage, &mut StdRng::seed_from_u64(11)).unwrap()
    }

    #[test]
    fn at_session_01_start_assigns_and_persists_identity() {
        let s = session(&[]);
        let storage = s.storage();
        assert_eq!(
            storage
                .get_item(LocalStorageKey::ParticipantId)
                .unwrap()
                .as_deref(),
            Some(s.participant_id().as_str())
        );
        assert_eq!(
            storage
                .get_item(LocalStorageKey::ExperimentCondition)
                .unwrap()
                .as_deref(),
            Some(s.condition().as_str())
        );
    }

    #[test]
    fn at_session_02_phase_sequence_follows_condition() {
        let s = session(&[(LocalStorageKey::ExperimentCondition, "freeplayFirst")]);
        assert_eq!(
            s.phase_sequence(),
            [PhaseKind::Freeplay, PhaseKind::Task, PhaseKind::Debrief]
        );
        let s = session(&[(LocalStorageKey::ExperimentCondition, "pilot")]);
        assert_eq!(
            s.phase_sequence(),
            [PhaseKind::Task, PhaseKind::Freeplay, PhaseKind::Debrief]
        );
        assert_eq!(
            effective_condition(s.condition()),
            ExperimentCondition::PuzzleFirst
        );
    }

    #[test]
    fn at_session_03_blank_prolific_id_removes_key() {
        let mut s = session(&[]);
        let id = s.record_prolific_id("  5f00aa  ").unwrap().unwrap();
        assert_eq!(id.as_str(), "5f00aa");
        assert_eq!(s.stored_prolific_id().unwrap().as_deref(), Some("5f00aa"));

        assert_eq!(s.record_prolific_id("   ").unwrap(), None);
        assert_eq!(s.stored_prolific_id().unwrap(), None);
    }

    #[test]
    fn at_session_04_phase_completion_rejects_scalar_bodies() {
        let mut s = session(&[]);
        s.complete_task_phase(json!({"trials": [1, 2]})).unwrap();
        assert!(matches!(
            s.complete_freeplay_phase(json!("just a string")),
            Err(SessionError::Contract(_))
        ));
        assert_eq!(
            s.storage()
                .get_item(LocalStorageKey::TaskExperimentData)
                .unwrap()
                .as_deref(),
            Some(r#"{"trials":[1,2]}"#)
        );
        assert_eq!(
            s.storage()
                .get_item(LocalStorageKey::FreeplayExperimentData)
                .unwrap(),
            None
        );
    }

    #[test]
    fn at_session_05_points_are_capped() {
        let mut s = session(&[]);
        for i in 0..30 {
            s.progress_mut().record_trial(json!({"trial": i}), true);
        }
        assert_eq!(s.progress().total_points, POINTS_MAX);
        assert_eq!(s.progress().current_index, 30);
        s.reset_progress();
        assert_eq!(s.progress(), &TrialProgress::default());
    }
}
