//! Stable exit codes for scriptbox CLI commands.

/// Script admitted (or evaluated successfully).
pub const OK: i32 = 0;
/// Script or modules rejected by validation, or the entry module is missing.
pub const INVALID: i32 = 1;
/// The script faulted at runtime.
pub const FAULT: i32 = 2;
/// Any other failure: unreadable input, bad config, engine or session errors.
pub const ERROR: i32 = 3;
