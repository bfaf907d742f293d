#![forbid(unsafe_code)]

use patlab_kernel_contracts::participant::{ParticipantId, PARTICIPANT_ID_SUFFIX_LEN};
use patlab_kernel_contracts::storage_keys::LocalStorageKey;
use rand::Rng;
use tracing::{info, warn};

use crate::local_store::{LocalStorage, LocalStorageError};

const BASE36_ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

pub fn base36_suffix<R: Rng + ?Sized>(rng: &mut R, len: usize) -> String {
    (0..len)
        .map(|_| BASE36_ALPHABET[rng.gen_range(0..BASE36_ALPHABET.len())] as char)
        .collect()
}

pub fn generate_participant_id<R: Rng + ?Sized>(
    unix_ms: u64,
    rng: &mut R,
) -> Result<ParticipantId, LocalStorageError> {
    let suffix = base36_suffix(rng, PARTICIPANT_ID_SUFFIX_LEN);
    Ok(ParticipantId::from_parts(unix_ms, &suffix)?)
}

/// Reads the stored participant id, generating and persisting one when none is usable.
pub fn get_or_create_participant_id<S, R>(
    storage: &mut S,
    rng: &mut R,
) -> Result<ParticipantId, LocalStorageError>
where
    S: LocalStorage + ?Sized,
    R: Rng + ?Sized,
{
    if let Some(stored) = storage.get_item(LocalStorageKey::ParticipantId)? {
        if !stored.trim().is_empty() {
            match ParticipantId::new(stored.as_str()) {
                Ok(id) => return Ok(id),
                Err(err) => warn!(error = %err, "stored participant id is invalid; regenerating"),
            }
        }
    }

    let unix_ms = chrono::Utc::now().timestamp_millis().max(1) as u64;
    let id = generate_participant_id(unix_ms, rng)?;
    storage.set_item(LocalStorageKey::ParticipantId, id.as_str())?;
    info!(participant_id = id.as_str(), "generated participant id");
    Ok(id)
}
