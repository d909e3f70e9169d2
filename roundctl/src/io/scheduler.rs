//! Batch scheduler adapter.
//!
//! The [`Scheduler`] trait decouples round orchestration from the actual
//! scheduler CLI (currently Slurm's `sbatch`/`squeue`). Tests use scripted
//! schedulers that return canned responses without spawning processes.

use std::time::Duration;

use anyhow::{Result, anyhow};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::request::{JobHandle, SubmitRequest, extract_job_id};
use crate::io::config::SchedulerConfig;
use crate::io::process::{command_from_argv, run_command_with_timeout};

/// Slurm states in which a job still occupies the queue.
const ACTIVE_STATES: &[&str] = &[
    "PENDING",
    "RUNNING",
    "CONFIGURING",
    "COMPLETING",
    "SUSPENDED",
    "REQUEUED",
    "RESIZING",
];

const QUERY_OUTPUT_LIMIT_BYTES: usize = 64 * 1024;

/// Queue membership of a submitted job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueState {
    /// Still queued or running, with the scheduler's state label.
    Active(String),
    /// The job has left the queue/run state.
    Gone,
}

/// Abstraction over batch scheduler backends.
pub trait Scheduler {
    /// Issue the submission and return the scheduler's raw response text.
    fn submit(&self, request: &SubmitRequest) -> Result<String>;
    /// Report whether `job` is still queued or running.
    fn query(&self, job: &JobHandle) -> Result<QueueState>;
}

#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("scheduler rejected submission: {0}")]
    Rejected(String),
    #[error("no job id in scheduler response {response:?}")]
    NoJobId { response: String },
}

/// Submit `request` and extract the job id from the response. No retries.
#[instrument(skip_all, fields(job_name = %request.job_name))]
pub fn submit_job<S: Scheduler>(
    scheduler: &S,
    request: &SubmitRequest,
) -> Result<JobHandle, SubmissionError> {
    let response = scheduler
        .submit(request)
        .map_err(|err| SubmissionError::Rejected(format!("{err:#}")))?;
    let job = extract_job_id(&response).ok_or_else(|| SubmissionError::NoJobId {
        response: response.trim().to_string(),
    })?;
    info!(job = %job, "job submitted");
    Ok(job)
}

/// Scheduler backed by the Slurm command line tools.
pub struct SlurmScheduler {
    config: SchedulerConfig,
}

impl SlurmScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.config.command_timeout_secs)
    }
}

impl Scheduler for SlurmScheduler {
    fn submit(&self, request: &SubmitRequest) -> Result<String> {
        let mut argv = self.config.submit_command.clone();
        argv.extend(request.scheduler_args());
        debug!(argv = ?argv, "submitting batch job");

        let output = run_command_with_timeout(
            command_from_argv(&argv)?,
            self.command_timeout(),
            QUERY_OUTPUT_LIMIT_BYTES,
        )?;
        if output.timed_out {
            return Err(anyhow!(
                "{} timed out after {:?}",
                argv[0],
                self.command_timeout()
            ));
        }
        if !output.status.success() {
            return Err(anyhow!(
                "{} exited with status {:?}: {}",
                argv[0],
                output.status.code(),
                output.stderr_lossy().trim()
            ));
        }
        Ok(output.stdout_lossy())
    }

    fn query(&self, job: &JobHandle) -> Result<QueueState> {
        let mut argv = self.config.query_command.clone();
        argv.extend([
            "-h".to_string(),
            "-j".to_string(),
            job.to_string(),
            "-o".to_string(),
            "%T".to_string(),
        ]);

        let output = run_command_with_timeout(
            command_from_argv(&argv)?,
            self.command_timeout(),
            QUERY_OUTPUT_LIMIT_BYTES,
        )?;
        if output.timed_out {
            return Err(anyhow!("{} timed out", argv[0]));
        }
        let stderr = output.stderr_lossy();
        if !output.status.success() {
            // squeue forgets finished jobs and then reports the id as invalid.
            if stderr.contains("Invalid job id") {
                return Ok(QueueState::Gone);
            }
            warn!(job = %job, exit_code = ?output.status.code(), "queue query failed");
            return Err(anyhow!(
                "{} exited with status {:?}: {}",
                argv[0],
                output.status.code(),
                stderr.trim()
            ));
        }
        Ok(parse_queue_state(&output.stdout_lossy()))
    }
}

/// Interpret `squeue -h -o %T` output for a single job.
pub fn parse_queue_state(stdout: &str) -> QueueState {
    match stdout.lines().map(str::trim).find(|line| !line.is_empty()) {
        Some(state) if ACTIVE_STATES.contains(&state) => QueueState::Active(state.to_string()),
        _ => QueueState::Gone,
    }
}
