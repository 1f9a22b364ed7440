//! Filesystem-backed pieces: config, long-term memory and the audit trail.

pub mod audit;
pub mod config;
pub mod memory_store;
