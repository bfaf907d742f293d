#![forbid(unsafe_code)]

pub mod common;
pub mod condition;
pub mod participant;
pub mod phase;
pub mod storage_keys;
pub mod submission;

pub use common::{non_empty_trimmed, validate_text, ContractViolation, Validate};
