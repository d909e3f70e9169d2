//! Round controller for adaptive sampling workflows on batch clusters.
//!
//! One invocation drives one round (or, with `loop`, a sequence of rounds):
//! start an ephemeral store, run the head-node generator, stop the store,
//! decode the generator's status, and on `PROCEED` submit a batch job and wait
//! for it to report completion through the State File.
//!
//! - **[`core`]**: Pure logic (parameters, status decoding, request building,
//!   templating). No I/O.
//! - **[`io`]**: Side-effecting collaborators (store process, generator,
//!   scheduler, State File, configuration), each behind a trait.
//!
//! [`round`] and [`looping`] coordinate the two to implement the CLI commands.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod round;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
