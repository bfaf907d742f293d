#![forbid(unsafe_code)]

/// Keys the participant's browser-side store is addressed by. All values are strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LocalStorageKey {
    ParticipantId,
    ExperimentCondition,
    ProlificId,
    TaskExperimentData,
    FreeplayExperimentData,
    DebriefData,
    ServerSubmissionSuccess,
}

impl LocalStorageKey {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ParticipantId => "participantId",
            Self::ExperimentCondition => "experimentCondition",
            Self::ProlificId => "prolificId",
            Self::TaskExperimentData => "taskExperimentData",
            Self::FreeplayExperimentData => "freeplayExperimentData",
            Self::DebriefData => "debriefData",
            Self::ServerSubmissionSuccess => "serverSubmissionSuccess",
        }
    }

    pub const fn all() -> &'static [Self] {
        &[
            Self::ParticipantId,
            Self::ExperimentCondition,
            Self::ProlificId,
            Self::TaskExperimentData,
            Self::FreeplayExperimentData,
            Self::DebriefData,
            Self::ServerSubmissionSuccess,
        ]
    }

    /// Keys are matched exactly; browser storage is case-sensitive.
    pub fn parse(raw: &str) -> Option<Self> {
        Self::all().iter().copied().find(|key| key.as_str() == raw)
    }
}

/// Value stored under `serverSubmissionSuccess` once the backend acknowledged a submission.
pub const SUBMISSION_SUCCESS_MARKER: &str = "true";

#[cfg(test)]
mod tests {
    use super::LocalStorageKey;

    #[test]
    fn storage_keys_are_roundtrippable() {
        for key in LocalStorageKey::all() {
            assert_eq!(LocalStorageKey::parse(key.as_str()), Some(*key));
        }
    }

    #[test]
    fn storage_key_parse_is_case_sensitive() {
        assert_eq!(LocalStorageKey::parse("participantid"), None);
        assert_eq!(
            LocalStorageKey::parse("debriefData"),
            Some(LocalStorageKey::DebriefData)
        );
    }
}
