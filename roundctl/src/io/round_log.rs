//! Per-round records under `<data_home>/rounds/<n>/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::params::Workload;
use crate::core::request::JobHandle;
use crate::core::status::StatusClass;

/// Summary of one round, written once the generator status has been decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoundRecord {
    pub round: u32,
    pub workload: Workload,
    pub platform: String,
    pub data_home: PathBuf,
    pub generator_status: Option<i64>,
    pub class: Option<StatusClass>,
    pub job_id: Option<JobHandle>,
    pub job_status: Option<i64>,
    /// `continue`, `skip` or `error`.
    pub outcome: String,
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct RoundPaths {
    pub dir: PathBuf,
    pub record_path: PathBuf,
    pub generator_log_path: PathBuf,
}

impl RoundPaths {
    pub fn new(data_home: &Path, rounds_dir: &str, round: u32) -> Self {
        let dir = data_home.join(rounds_dir).join(round.to_string());
        Self {
            record_path: dir.join("round.json"),
            generator_log_path: dir.join("generator.log"),
            dir,
        }
    }
}

pub fn write_round_record(paths: &RoundPaths, record: &RoundRecord) -> Result<()> {
    create_dir(paths)?;
    let mut buf = serde_json::to_string_pretty(record).context("serialize round record")?;
    buf.push('\n');
    write_text(&paths.record_path, &buf)
}

pub fn write_generator_log(paths: &RoundPaths, stdout: &str) -> Result<()> {
    create_dir(paths)?;
    write_text(&paths.generator_log_path, stdout)
}

fn create_dir(paths: &RoundPaths) -> Result<()> {
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create round dir {}", paths.dir.display()))
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}
