//! Deterministic reliability logic for phase chains.
//!
//! Core modules do no I/O. Time enters only through [`clock::Clock`], so every
//! decision here is reproducible in tests.

pub mod clock;
pub mod repetition;
pub mod role_validator;
pub mod termination;
pub mod text;
pub mod types;
