#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::phase::PhaseKind;

/// Condition label written for rows whose condition column was blank.
pub const UNKNOWN_CONDITION: &str = "unknown";

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum ExperimentCondition {
    #[default]
    #[serde(rename = "puzzleFirst")]
    PuzzleFirst,
    #[serde(rename = "freeplayFirst")]
    FreeplayFirst,
}

impl ExperimentCondition {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PuzzleFirst => "puzzleFirst",
            Self::FreeplayFirst => "freeplayFirst",
        }
    }

    pub const fn all() -> &'static [Self] {
        &[Self::PuzzleFirst, Self::FreeplayFirst]
    }

    /// Order in which the two scored phases run; debrief always comes last.
    pub const fn phase_order(self) -> [PhaseKind; 2] {
        match self {
            Self::PuzzleFirst => [PhaseKind::Task, PhaseKind::Freeplay],
            Self::FreeplayFirst => [PhaseKind::Freeplay, PhaseKind::Task],
        }
    }

    fn from_folded(folded: &str) -> Option<Self> {
        match folded {
            "puzzlefirst" => Some(Self::PuzzleFirst),
            "freeplayfirst" => Some(Self::FreeplayFirst),
            _ => None,
        }
    }
}

/// A stored condition after case/whitespace repair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizedCondition {
    Canonical(ExperimentCondition),
    /// Neither canonical spelling; kept trimmed so old sessions are not reassigned.
    Legacy(String),
}

impl NormalizedCondition {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Canonical(c) => c.as_str(),
            Self::Legacy(raw) => raw.as_str(),
        }
    }

    pub fn canonical(&self) -> Option<ExperimentCondition> {
        match self {
            Self::Canonical(c) => Some(*c),
            Self::Legacy(_) => None,
        }
    }
}

/// Returns `None` for blank input.
pub fn normalize_condition(raw: &str) -> Option<NormalizedCondition> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let folded = trimmed.to_lowercase();
    Some(match ExperimentCondition::from_folded(&folded) {
        Some(c) => NormalizedCondition::Canonical(c),
        None => NormalizedCondition::Legacy(trimmed.to_string()),
    })
}
