//! Head-node generator invocation.
//!
//! The generator inspects the store, decides whether new work is needed and
//! prints a status integer as its last line. Its exit code is informational:
//! the status line is what the round acts on.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::core::params::RoundParams;
use crate::core::template::{render_args, round_context};
use crate::io::config::GeneratorConfig;
use crate::io::process::{command_from_argv, run_command_with_timeout};

/// Captured generator run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratorOutput {
    pub stdout: String,
    pub exit_code: Option<i32>,
}

pub trait Generator {
    fn run(&self, params: &RoundParams) -> Result<GeneratorOutput>;
}

/// Generator run as a child process.
pub struct CommandGenerator {
    config: GeneratorConfig,
}

impl CommandGenerator {
    pub fn new(config: GeneratorConfig) -> Self {
        Self { config }
    }

    /// Full argv for one round: command, rendered round arguments, submit-only marker.
    pub fn argv(&self, params: &RoundParams) -> Result<Vec<String>> {
        let ctx = round_context(params);
        let mut argv = self.config.command.clone();
        argv.extend(render_args(&self.config.args, &ctx).context("render generator args")?);
        if !self.config.submit_only_flag.is_empty() {
            argv.push(self.config.submit_only_flag.clone());
        }
        Ok(argv)
    }
}

impl Generator for CommandGenerator {
    #[instrument(skip_all, fields(round = params.round, workload = %params.workload))]
    fn run(&self, params: &RoundParams) -> Result<GeneratorOutput> {
        let argv = self.argv(params)?;
        debug!(argv = ?argv, "running generator");

        let timeout = Duration::from_secs(self.config.timeout_secs);
        let output = run_command_with_timeout(
            command_from_argv(&argv)?,
            timeout,
            self.config.output_limit_bytes,
        )?;
        if output.timed_out {
            return Err(anyhow!("generator timed out after {timeout:?}"));
        }

        let exit_code = output.status.code();
        if !output.status.success() {
            warn!(
                exit_code = ?exit_code,
                stderr = %output.stderr_lossy().trim(),
                "generator exited unsuccessfully"
            );
        }

        // Only the tail is kept; the status line is the last one.
        if output.stdout_truncated > 0 {
            warn!(
                dropped_bytes = output.stdout_truncated,
                kept_bytes = output.stdout.len(),
                "generator stdout exceeded output_limit_bytes, earlier progress dropped"
            );
        }

        Ok(GeneratorOutput {
            stdout: output.stdout_lossy(),
            exit_code,
        })
    }
}
