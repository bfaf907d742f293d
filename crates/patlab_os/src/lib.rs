#![forbid(unsafe_code)]

pub mod debrief;
pub mod session;
