//! Scheduler request construction and response parsing.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::params::RoundParams;

pub const ENV_ROUND: &str = "ADMD_ROUND";
pub const ENV_DATA_HOME: &str = "ADMD_DATA_HOME";
pub const ENV_STATE_FILE: &str = "ADMD_STATE_FILE";
pub const ENV_DB_PORT: &str = "ADMD_DB_PORT";

/// Scheduler-assigned job identifier (digits only).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobHandle(String);

impl JobHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resources requested from the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRequest {
    pub nodes: u32,
    pub minutes: u32,
    pub allocation: Option<String>,
    pub queue: Option<String>,
    /// Platform-specific flags passed through verbatim.
    pub flags: Vec<String>,
}

/// A fully formed batch submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRequest {
    pub job_name: String,
    pub resources: ResourceRequest,
    pub job_script: PathBuf,
    /// Environment payload exported to the job, in a stable order.
    pub env: Vec<(String, String)>,
}

impl SubmitRequest {
    pub fn new(
        job_name: String,
        resources: ResourceRequest,
        job_script: PathBuf,
        params: &RoundParams,
        state_file: &Path,
    ) -> Self {
        Self {
            job_name,
            resources,
            job_script,
            env: job_environment(params, state_file),
        }
    }

    /// Arguments for an `sbatch`-style submission command.
    pub fn scheduler_args(&self) -> Vec<String> {
        let mut args = vec![
            "--job-name".to_string(),
            self.job_name.clone(),
            "--nodes".to_string(),
            self.resources.nodes.to_string(),
            "--time".to_string(),
            format_walltime(self.resources.minutes),
        ];
        if let Some(allocation) = &self.resources.allocation {
            args.push("--account".to_string());
            args.push(allocation.clone());
        }
        if let Some(queue) = &self.resources.queue {
            args.push("--partition".to_string());
            args.push(queue.clone());
        }
        args.extend(self.resources.flags.iter().cloned());
        args.push(format!("--export={}", self.export_payload()));
        args.push(self.job_script.display().to_string());
        args
    }

    /// `ALL,KEY=VALUE,...` as understood by `--export`.
    pub fn export_payload(&self) -> String {
        let mut payload = String::from("ALL");
        for (key, value) in &self.env {
            payload.push(',');
            payload.push_str(key);
            payload.push('=');
            payload.push_str(value);
        }
        payload
    }
}

/// Environment handed to the batch job.
pub fn job_environment(params: &RoundParams, state_file: &Path) -> Vec<(String, String)> {
    vec![
        (ENV_ROUND.to_string(), params.payload()),
        (
            ENV_DATA_HOME.to_string(),
            params.data_home.display().to_string(),
        ),
        (ENV_STATE_FILE.to_string(), state_file.display().to_string()),
        (ENV_DB_PORT.to_string(), params.port.to_string()),
    ]
}

/// Render minutes as `D-HH:MM:SS`.
pub fn format_walltime(minutes: u32) -> String {
    let days = minutes / (24 * 60);
    let hours = (minutes / 60) % 24;
    let mins = minutes % 60;
    format!("{days}-{hours:02}:{mins:02}:00")
}

/// Strip every non-digit character from a scheduler response.
///
/// Returns `None` when no digits remain.
pub fn extract_job_id(response: &str) -> Option<JobHandle> {
    static NON_DIGIT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\D+").unwrap());

    let digits = NON_DIGIT_RE.replace_all(response, "");
    if digits.is_empty() {
        None
    } else {
        Some(JobHandle(digits.into_owned()))
    }
}
