//! Stable exit codes for `reqstore` commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid input, uninitialized project, rejected delta or I/O failure.
pub const INVALID: i32 = 1;
/// Another live session holds the project lock.
pub const LOCKED: i32 = 3;
