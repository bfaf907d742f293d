#![forbid(unsafe_code)]

pub mod migrate_cli;
