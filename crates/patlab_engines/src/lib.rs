#![forbid(unsafe_code)]

pub mod condition;
pub mod local_store;
pub mod participant;
pub mod submission;
