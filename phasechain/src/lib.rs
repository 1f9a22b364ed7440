//! Reliability layer for multi-agent phase chains.
//!
//! A chain is an ordered list of phases, each run by an external executor
//! that fills the shared [`environment::Environment`] with per-agent actions.
//! Around every step the orchestrator checks actions against role
//! constraints, records them in hybrid short/long-term memory, watches for
//! repetition loops and decides whether the chain should stop.
//!
//! - **[`core`]**: Pure, deterministic logic (role validation, repetition
//!   detection, termination policy, text similarity).
//! - **[`io`]**: Side-effecting pieces (config, memory persistence, JSONL audit).
//!
//! [`orchestrator::PhaseOrchestrator`] ties them together over a
//! [`phase::PhaseRegistry`].

pub mod commands;
pub mod core;
pub mod environment;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod phase;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
