//! Multi-round driver for `roundctl loop`.

use tracing::info;

use crate::core::params::RoundParams;
use crate::core::status::StatusCode;
use crate::io::barrier::Clock;
use crate::io::config::ControllerConfig;
use crate::io::generator::Generator;
use crate::io::relocate::LogRelocator;
use crate::io::scheduler::Scheduler;
use crate::io::store::StoreLauncher;
use crate::round::{RoundError, RoundOutcome, RoundServices, run_round};

/// Reason why `run_rounds` stopped without an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// The generator reported unfinished work from an earlier round.
    Skipped { round: u32, status: StatusCode },
    /// The configured number of rounds completed.
    MaxRounds { max_rounds: u32 },
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub first_round: u32,
    pub rounds_completed: u32,
    pub stop: LoopStop,
}

/// Run rounds with increasing round numbers while they return `Continue`.
///
/// Stops on the first skip, after `max_rounds` completed rounds, or on the
/// first error, which is returned as is. Running out of round numbers is
/// an error too.
pub fn run_rounds<S, G, Q, C, L, F>(
    first: RoundParams,
    max_rounds: Option<u32>,
    config: &ControllerConfig,
    services: &RoundServices<'_, S, G, Q, C, L>,
    mut on_round: F,
) -> Result<LoopOutcome, RoundError>
where
    S: StoreLauncher,
    G: Generator,
    Q: Scheduler,
    C: Clock,
    L: LogRelocator,
    F: FnMut(&RoundParams, &RoundOutcome),
{
    let first_round = first.round;
    let mut params = first;
    let mut rounds_completed = 0u32;

    loop {
        if let Some(max_rounds) = max_rounds
            && rounds_completed >= max_rounds
        {
            return Ok(LoopOutcome {
                first_round,
                rounds_completed,
                stop: LoopStop::MaxRounds { max_rounds },
            });
        }

        let outcome = run_round(&params, config, services)?;
        on_round(&params, &outcome);
        match outcome {
            RoundOutcome::Skip { status } => {
                return Ok(LoopOutcome {
                    first_round,
                    rounds_completed,
                    stop: LoopStop::Skipped {
                        round: params.round,
                        status,
                    },
                });
            }
            RoundOutcome::Continue { .. } => {
                rounds_completed += 1;
                info!(round = params.round, rounds_completed, "round completed");
                params = params.next_round()?;
            }
        }
    }
}
