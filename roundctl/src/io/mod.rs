//! Side-effecting collaborators of the round controller.
//!
//! Each external system sits behind a narrow trait (`StoreLauncher`,
//! `Generator`, `Scheduler`, `LogRelocator`, `Clock`) so orchestration can be
//! exercised with the fakes in `test_support`.

pub mod barrier;
pub mod config;
pub mod generator;
pub mod process;
pub mod relocate;
pub mod round_log;
pub mod scheduler;
pub mod state_file;
pub mod store;
