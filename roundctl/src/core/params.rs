//! Round parameters supplied by the caller at controller start.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Port used when the data-home specifier carries none.
pub const DEFAULT_DB_PORT: u16 = 27017;

/// Separator used when round parameters are serialized into the job payload.
pub const PAYLOAD_DELIMITER: char = ':';

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParamsError {
    #[error("unknown workload {0:?} (expected one of: traj, model, all)")]
    UnknownWorkload(String),
    #[error("data home must not be empty")]
    EmptyDataHome,
    #[error("invalid database port {0:?}")]
    InvalidPort(String),
    #[error("{field} must be > 0")]
    Zero { field: &'static str },
    #[error("platform must not be empty")]
    EmptyPlatform,
    #[error("round number {0} has no successor")]
    RoundOverflow(u32),
}

/// Workload category of a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Workload {
    /// Trajectory generation only.
    Traj,
    /// Model building only.
    Model,
    /// Trajectories followed by a model.
    All,
}

impl Workload {
    pub fn as_str(self) -> &'static str {
        match self {
            Workload::Traj => "traj",
            Workload::Model => "model",
            Workload::All => "all",
        }
    }
}

impl fmt::Display for Workload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Workload {
    type Err = ParamsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "traj" | "trajectory" => Ok(Workload::Traj),
            "model" => Ok(Workload::Model),
            "all" => Ok(Workload::All),
            _ => Err(ParamsError::UnknownWorkload(s.to_string())),
        }
    }
}

/// Combined `DATA_HOME[:PORT]` specifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataHome {
    pub path: PathBuf,
    pub port: u16,
}

impl FromStr for DataHome {
    type Err = ParamsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        static DATA_HOME_RE: LazyLock<Regex> =
            LazyLock::new(|| Regex::new(r"^(?P<home>.*?)(?::(?P<port>\d+))?$").unwrap());

        let caps = DATA_HOME_RE
            .captures(s.trim())
            .ok_or(ParamsError::EmptyDataHome)?;
        let home = caps.name("home").map(|m| m.as_str()).unwrap_or_default();
        if home.is_empty() {
            return Err(ParamsError::EmptyDataHome);
        }
        let port = match caps.name("port") {
            Some(m) => match m.as_str().parse::<u16>() {
                Ok(port) if port > 0 => port,
                _ => return Err(ParamsError::InvalidPort(m.as_str().to_string())),
            },
            None => DEFAULT_DB_PORT,
        };
        Ok(Self {
            path: PathBuf::from(home),
            port,
        })
    }
}

/// Everything one round needs from its caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundParams {
    pub round: u32,
    pub workload: Workload,
    /// Number of tasks (trajectories) to generate.
    pub tasks: u32,
    /// Steps per task.
    pub steps: u32,
    /// Requested wall-clock budget for the batch job.
    pub minutes: u32,
    pub data_home: PathBuf,
    pub port: u16,
    /// Name of a platform profile in the controller configuration.
    pub platform: String,
    /// Node count override; the platform profile decides when absent.
    pub nodes: Option<u32>,
}

impl RoundParams {
    pub fn validate(&self) -> Result<(), ParamsError> {
        if self.tasks == 0 {
            return Err(ParamsError::Zero { field: "tasks" });
        }
        if self.steps == 0 {
            return Err(ParamsError::Zero { field: "steps" });
        }
        if self.minutes == 0 {
            return Err(ParamsError::Zero { field: "minutes" });
        }
        if self.nodes == Some(0) {
            return Err(ParamsError::Zero { field: "nodes" });
        }
        if self.data_home.as_os_str().is_empty() {
            return Err(ParamsError::EmptyDataHome);
        }
        if self.port == 0 {
            return Err(ParamsError::InvalidPort("0".to_string()));
        }
        if self.platform.trim().is_empty() {
            return Err(ParamsError::EmptyPlatform);
        }
        Ok(())
    }

    /// Round parameters joined by [`PAYLOAD_DELIMITER`], in positional order.
    pub fn payload(&self) -> String {
        [
            self.round.to_string(),
            self.workload.to_string(),
            self.tasks.to_string(),
            self.steps.to_string(),
            self.minutes.to_string(),
        ]
        .join(&PAYLOAD_DELIMITER.to_string())
    }

    /// Same parameters for the round after this one.
    pub fn next_round(&self) -> Result<Self, ParamsError> {
        let round = self
            .round
            .checked_add(1)
            .ok_or(ParamsError::RoundOverflow(self.round))?;
        Ok(Self {
            round,
            ..self.clone()
        })
    }
}
