//! Controller configuration (`roundctl.toml`).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Controller configuration (TOML).
///
/// Passed explicitly into every component; nothing is read from the process
/// environment. Missing fields fall back to the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ControllerConfig {
    pub paths: PathsConfig,
    pub store: StoreConfig,
    pub generator: GeneratorConfig,
    pub scheduler: SchedulerConfig,
    pub barrier: BarrierConfig,
    pub relocate: RelocateConfig,
    /// Named resource profiles selected by `--platform`.
    pub platforms: BTreeMap<String, PlatformProfile>,
}

/// File layout under the data home. All entries are relative to it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub state_file: String,
    pub address_file: String,
    pub pid_file: String,
    pub store_log: String,
    pub data_dir: String,
    pub socket_dir: String,
    /// Lock file, relative to `data_dir`.
    pub lock_file: String,
    pub rounds_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    /// Store command; templates see `data_home`, `data_dir`, `socket_dir`, `port`.
    pub command: Vec<String>,
    /// Command printing the address remote workers should use. Empty means
    /// the node hostname.
    pub address_command: Vec<String>,
    /// Bounded wait after `SIGTERM` before escalating to `SIGKILL`.
    /// Unset waits for as long as the store takes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_grace_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GeneratorConfig {
    pub command: Vec<String>,
    /// Round arguments appended to `command`, rendered against the round.
    pub args: Vec<String>,
    pub submit_only_flag: String,
    pub timeout_secs: u64,
    /// Bytes of stdout kept in memory. Only the tail is kept, so the status
    /// line survives long progress output.
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SchedulerConfig {
    pub submit_command: Vec<String>,
    pub query_command: Vec<String>,
    /// Job name template, rendered against the round.
    pub job_name: String,
    /// Timeout for a single submit or query command.
    pub command_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BarrierConfig {
    pub poll_interval_secs: u64,
    /// Give up waiting after this long. Unset waits without limit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RelocateConfig {
    /// Log relocation command run after a successful round. Empty disables it.
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PlatformProfile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    pub nodes: u32,
    pub flags: Vec<String>,
    /// Batch script; relative paths resolve against the data home.
    pub job_script: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_file: "admd.state".to_string(),
            address_file: "db.hostname".to_string(),
            pid_file: "db.pid".to_string(),
            store_log: "db.log".to_string(),
            data_dir: "db".to_string(),
            socket_dir: "socket".to_string(),
            lock_file: "mongod.lock".to_string(),
            rounds_dir: "rounds".to_string(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            command: strings(&[
                "mongod",
                "--dbpath",
                "{{ data_dir }}",
                "--port",
                "{{ port }}",
                "--unixSocketPrefix",
                "{{ socket_dir }}",
                "--bind_ip_all",
            ]),
            address_command: Vec::new(),
            stop_grace_secs: None,
        }
    }
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            command: strings(&["python", "-m", "admd.generator"]),
            args: strings(&[
                "--round",
                "{{ round }}",
                "--workload",
                "{{ workload }}",
                "--tasks",
                "{{ tasks }}",
                "--steps",
                "{{ steps }}",
                "--dbhome",
                "{{ data_home }}",
                "--dbport",
                "{{ port }}",
            ]),
            submit_only_flag: "--submit-only".to_string(),
            timeout_secs: 60 * 60,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            submit_command: strings(&["sbatch"]),
            query_command: strings(&["squeue"]),
            job_name: "admd-r{{ round }}".to_string(),
            command_timeout_secs: 120,
        }
    }
}

impl Default for BarrierConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            timeout_secs: None,
        }
    }
}

impl Default for PlatformProfile {
    fn default() -> Self {
        Self {
            allocation: None,
            queue: None,
            nodes: 1,
            flags: Vec::new(),
            job_script: PathBuf::from("job.sh"),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            store: StoreConfig::default(),
            generator: GeneratorConfig::default(),
            scheduler: SchedulerConfig::default(),
            barrier: BarrierConfig::default(),
            relocate: RelocateConfig::default(),
            platforms: BTreeMap::from([("local".to_string(), PlatformProfile::default())]),
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.store.command.is_empty() || self.store.command[0].trim().is_empty() {
            return Err(anyhow!("store.command must be a non-empty array"));
        }
        if self.generator.command.is_empty() || self.generator.command[0].trim().is_empty() {
            return Err(anyhow!("generator.command must be a non-empty array"));
        }
        if self.generator.timeout_secs == 0 {
            return Err(anyhow!("generator.timeout_secs must be > 0"));
        }
        if self.generator.output_limit_bytes == 0 {
            return Err(anyhow!("generator.output_limit_bytes must be > 0"));
        }
        if self.scheduler.submit_command.is_empty() {
            return Err(anyhow!("scheduler.submit_command must be a non-empty array"));
        }
        if self.scheduler.query_command.is_empty() {
            return Err(anyhow!("scheduler.query_command must be a non-empty array"));
        }
        if self.scheduler.command_timeout_secs == 0 {
            return Err(anyhow!("scheduler.command_timeout_secs must be > 0"));
        }
        if self.barrier.poll_interval_secs == 0 {
            return Err(anyhow!("barrier.poll_interval_secs must be > 0"));
        }
        if self.barrier.timeout_secs == Some(0) {
            return Err(anyhow!("barrier.timeout_secs must be > 0 when set"));
        }
        if self.paths.state_file.trim().is_empty() {
            return Err(anyhow!("paths.state_file must not be empty"));
        }
        if self.platforms.is_empty() {
            return Err(anyhow!("at least one [platforms.<name>] profile is required"));
        }
        for (name, profile) in &self.platforms {
            if profile.nodes == 0 {
                return Err(anyhow!("platforms.{name}.nodes must be > 0"));
            }
        }
        Ok(())
    }

    pub fn platform(&self, name: &str) -> Result<&PlatformProfile> {
        self.platforms.get(name).ok_or_else(|| {
            let known: Vec<&str> = self.platforms.keys().map(String::as_str).collect();
            anyhow!(
                "unknown platform {name:?} (configured: {})",
                known.join(", ")
            )
        })
    }
}

impl BarrierConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ControllerConfig::default()`.
pub fn load_config(path: &Path) -> Result<ControllerConfig> {
    if !path.exists() {
        let cfg = ControllerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ControllerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ControllerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, ControllerConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("roundctl.toml");
        let mut cfg = ControllerConfig::default();
        cfg.barrier.timeout_secs = Some(3600);
        cfg.platforms.insert(
            "summit".to_string(),
            PlatformProfile {
                allocation: Some("bip149".to_string()),
                queue: Some("batch".to_string()),
                nodes: 4,
                flags: vec!["--gpus-per-node=6".to_string()],
                job_script: PathBuf::from("/ccs/proj/admd/job.sh"),
            },
        );
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("roundctl.toml");
        fs::write(
            &path,
            "[barrier]\npoll_interval_secs = 5\n\n[platforms.titan]\nqueue = \"debug\"\n",
        )
        .expect("write");

        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.barrier.poll_interval(), Duration::from_secs(5));
        assert_eq!(cfg.barrier.timeout(), None);
        assert_eq!(cfg.generator, GeneratorConfig::default());
        let titan = cfg.platform("titan").expect("titan");
        assert_eq!(titan.queue.as_deref(), Some("debug"));
        assert_eq!(titan.nodes, 1);
        assert!(cfg.platform("local").is_err());
    }

    #[test]
    fn validate_rejects_zero_poll_interval() {
        let mut cfg = ControllerConfig::default();
        cfg.barrier.poll_interval_secs = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("poll_interval_secs"));
    }

    #[test]
    fn unknown_platform_lists_configured_names() {
        let cfg = ControllerConfig::default();
        let err = cfg.platform("frontier").unwrap_err();
        assert!(err.to_string().contains("local"));
    }
}
