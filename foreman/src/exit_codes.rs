//! Stable exit codes for foreman CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Command failed due to invalid layout/config/arguments or other errors.
pub const INVALID: i32 = 1;
/// `foreman work` lost the lock race: the issue is held by another session.
pub const LOCKED: i32 = 2;
/// `foreman work` refused to start because a pause marker is present.
pub const PAUSED: i32 = 3;
