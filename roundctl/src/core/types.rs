//! Shared vocabulary for round orchestration.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Phases a round moves through, in order.
///
/// `StoreDown` always follows `GeneratorRun`, so the store is never alive
/// while the batch job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundPhase {
    Init,
    StoreUp,
    GeneratorRun,
    StoreDown,
    Decode,
    Submit,
    Await,
    Handoff,
}

impl RoundPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            RoundPhase::Init => "init",
            RoundPhase::StoreUp => "store_up",
            RoundPhase::GeneratorRun => "generator_run",
            RoundPhase::StoreDown => "store_down",
            RoundPhase::Decode => "decode",
            RoundPhase::Submit => "submit",
            RoundPhase::Await => "await",
            RoundPhase::Handoff => "handoff",
        }
    }
}

impl fmt::Display for RoundPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
