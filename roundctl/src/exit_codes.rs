//! Stable exit codes for `roundctl` commands.

/// Round finished and the next round may start, or the generator found
/// unfinished work and nothing was submitted.
pub const OK: i32 = 0;
/// Fatal: bad arguments or configuration, generator failure, job failure, or
/// any other error. The caller must not start another round.
pub const FATAL: i32 = 1;
