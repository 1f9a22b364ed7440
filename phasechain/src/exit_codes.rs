//! Stable exit codes for phasechain CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid config, unreadable memory log or other errors.
pub const INVALID: i32 = 1;
/// `phasechain memory query` found no matching entries.
pub const EMPTY: i32 = 2;
