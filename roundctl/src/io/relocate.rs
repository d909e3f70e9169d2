//! Log relocation after a successful round.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info};

use crate::core::params::RoundParams;
use crate::core::template::{render_args, round_context};
use crate::io::config::RelocateConfig;
use crate::io::process::{command_from_argv, run_command_with_timeout};

const RELOCATE_TIMEOUT: Duration = Duration::from_secs(15 * 60);
const RELOCATE_OUTPUT_LIMIT_BYTES: usize = 64 * 1024;

/// Moves a finished round's logs out of the working area.
pub trait LogRelocator {
    fn relocate(&self, params: &RoundParams) -> Result<()>;
}

pub struct CommandRelocator {
    config: RelocateConfig,
}

impl CommandRelocator {
    pub fn new(config: RelocateConfig) -> Self {
        Self { config }
    }
}

impl LogRelocator for CommandRelocator {
    fn relocate(&self, params: &RoundParams) -> Result<()> {
        if self.config.command.is_empty() {
            debug!("no log relocation command configured");
            return Ok(());
        }
        let argv = render_args(&self.config.command, &round_context(params))
            .context("render relocate command")?;
        let output = run_command_with_timeout(
            command_from_argv(&argv)?,
            RELOCATE_TIMEOUT,
            RELOCATE_OUTPUT_LIMIT_BYTES,
        )?;
        if output.timed_out || !output.status.success() {
            return Err(anyhow!(
                "log relocation {:?} failed (exit {:?}): {}",
                argv[0],
                output.status.code(),
                output.stderr_lossy().trim()
            ));
        }
        info!(round = params.round, "round logs relocated");
        Ok(())
    }
}
