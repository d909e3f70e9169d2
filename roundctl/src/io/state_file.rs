//! State File handoff between the batch job and the controller.
//!
//! The controller writes [`PENDING_SENTINEL`] before submission; the job
//! overwrites it with its integer exit status; the controller removes the file
//! once it has consumed that value.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

pub const PENDING_SENTINEL: &str = "PEND";

/// Interpreted State File content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateValue {
    /// Sentinel still present, or the job is mid-write (empty file).
    Pending,
    /// Exit status written by the job.
    Terminal(i64),
    /// Anything else.
    Malformed(String),
}

impl StateValue {
    pub fn parse(contents: &str) -> Self {
        let token = contents.trim();
        if token.is_empty() || token == PENDING_SENTINEL {
            return StateValue::Pending;
        }
        match token.parse::<i64>() {
            Ok(status) => StateValue::Terminal(status),
            Err(_) => StateValue::Malformed(token.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the pending sentinel, replacing any previous content.
    pub fn mark_pending(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create state dir {}", parent.display()))?;
        }
        fs::write(&self.path, format!("{PENDING_SENTINEL}\n"))
            .with_context(|| format!("write state file {}", self.path.display()))?;
        debug!(path = %self.path.display(), "state file marked pending");
        Ok(())
    }

    pub fn read(&self) -> Result<StateValue> {
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read state file {}", self.path.display()))?;
        Ok(StateValue::parse(&contents))
    }

    /// Remove the file. Removing a file that is already gone is not an error.
    pub fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "state file removed");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("remove state file {}", self.path.display()))
            }
        }
    }
}
