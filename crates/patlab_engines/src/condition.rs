#![forbid(unsafe_code)]

use patlab_kernel_contracts::condition::{
    normalize_condition, ExperimentCondition, NormalizedCondition,
};
use patlab_kernel_contracts::storage_keys::LocalStorageKey;
use rand::Rng;
use tracing::info;

use crate::local_store::{LocalStorage, LocalStorageError};

/// Fair coin flip between the two orderings.
pub fn assign_condition<R: Rng + ?Sized>(rng: &mut R) -> ExperimentCondition {
    if rng.gen_bool(0.5) {
        ExperimentCondition::PuzzleFirst
    } else {
        ExperimentCondition::FreeplayFirst
    }
}

/// Returns the session's condition, assigning and persisting one on first use.
///
/// A stored value is normalized on every read and written back when the repair changed
/// it. Blank stored values count as unassigned.
pub fn get_condition<S, R>(storage: &mut S, rng: &mut R) -> Result<NormalizedCondition, LocalStorageError>
where
    S: LocalStorage + ?Sized,
    R: Rng + ?Sized,
{
    let stored = storage.get_item(LocalStorageKey::ExperimentCondition)?;
    if let Some(normalized) = stored.as_deref().and_then(normalize_condition) {
        let stored = stored.as_deref().unwrap_or_default();
        if normalized.as_str() != stored {
            info!(from = stored, to = normalized.as_str(), "normalized stored condition");
            storage.set_item(LocalStorageKey::ExperimentCondition, normalized.as_str())?;
        }
        return Ok(normalized);
    }

    let assigned = assign_condition(rng);
    storage.set_item(LocalStorageKey::ExperimentCondition, assigned.as_str())?;
    info!(condition = assigned.as_str(), "assigned new condition");
    Ok(NormalizedCondition::Canonical(assigned))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_store::MemoryLocalStorage;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn at_condition_assign_01_first_call_persists_and_later_calls_are_stable() {
        let mut storage = MemoryLocalStorage::new();
        let mut rng = StdRng::seed_from_u64(7);
        let first = get_condition(&mut storage, &mut rng).unwrap();
        assert!(first.canonical().is_some());
        for _ in 0..10 {
            assert_eq!(get_condition(&mut storage, &mut rng).unwrap(), first);
        }
        assert_eq!(
            storage
                .get_item(LocalStorageKey::ExperimentCondition)
                .unwrap()
                .as_deref(),
            Some(first.as_str())
        );
    }

    #[test]
    fn at_condition_assign_02_stored_variant_is_repaired_in_place() {
        let mut storage = MemoryLocalStorage::with_items([(
            LocalStorageKey::ExperimentCondition,
            " FREEPLAYFIRST ",
        )]);
        let mut rng = StdRng::seed_from_u64(1);
        let c = get_condition(&mut storage, &mut rng).unwrap();
        assert_eq!(c.canonical(), Some(ExperimentCondition::FreeplayFirst));
        assert_eq!(
            storage
                .get_item(LocalStorageKey::ExperimentCondition)
                .unwrap()
                .as_deref(),
            Some("freeplayFirst")
        );
    }

    #[test]
    fn at_condition_assign_03_legacy_value_is_kept_trimmed() {
        let mut storage = MemoryLocalStorage::with_items([(
            LocalStorageKey::ExperimentCondition,
            "pilot ",
        )]);
        let mut rng = StdRng::seed_from_u64(1);
        let c = get_condition(&mut storage, &mut rng).unwrap();
        assert_eq!(c, NormalizedCondition::Legacy("pilot".to_string()));
        assert_eq!(
            storage
                .get_item(LocalStorageKey::ExperimentCondition)
                .unwrap()
                .as_deref(),
            Some("pilot")
        );
    }

    #[test]
    fn at_condition_assign_04_coin_flip_reaches_both_conditions() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut puzzle = 0;
        let mut freeplay = 0;
        for _ in 0..2_000 {
            match assign_condition(&mut rng) {
                ExperimentCondition::PuzzleFirst => puzzle += 1,
                ExperimentCondition::FreeplayFirst => freeplay += 1,
            }
        }
        assert!(puzzle > 800, "puzzle={puzzle}");
        assert!(freeplay > 800, "freeplay={freeplay}");
    }
}
