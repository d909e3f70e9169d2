//! Ephemeral store lifecycle.
//!
//! The store (a MongoDB `mongod` by default) lives only for the generator
//! phase of a round. [`StoreLauncher`] is the seam the round controller talks
//! to; [`ProcessStore`] is the real implementation that spawns the configured
//! command and publishes its address under the data home.

use std::fs::{self, File};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Child, Stdio};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use minijinja::context;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{debug, info, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::template::render_args;
use crate::io::config::{PathsConfig, StoreConfig};
use crate::io::process::{command_from_argv, run_command_with_timeout};

const ADDRESS_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
const ADDRESS_OUTPUT_LIMIT_BYTES: usize = 4096;

/// Start and stop the store around a round's generator phase.
pub trait StoreLauncher {
    type Handle;

    fn start(&self, data_home: &Path, port: u16) -> Result<Self::Handle>;
    /// Stop the store. `Err` means the process may still be running.
    fn stop(&self, handle: Self::Handle) -> Result<()>;
}

/// Resolves the address remote workers use to reach the store.
pub trait AddressResolver {
    fn resolve(&self) -> Result<String>;
}

/// Node hostname.
pub struct HostnameResolver;

impl AddressResolver for HostnameResolver {
    fn resolve(&self) -> Result<String> {
        let name = nix::unistd::gethostname().context("read hostname")?;
        name.into_string()
            .map_err(|raw| anyhow!("hostname is not valid UTF-8: {raw:?}"))
    }
}

/// First non-empty stdout line of a configured command.
pub struct CommandResolver {
    argv: Vec<String>,
}

impl CommandResolver {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }
}

impl AddressResolver for CommandResolver {
    fn resolve(&self) -> Result<String> {
        let output = run_command_with_timeout(
            command_from_argv(&self.argv)?,
            ADDRESS_COMMAND_TIMEOUT,
            ADDRESS_OUTPUT_LIMIT_BYTES,
        )?;
        if output.timed_out || !output.status.success() {
            return Err(anyhow!(
                "address command {:?} failed (exit {:?}): {}",
                self.argv,
                output.status.code(),
                output.stderr_lossy().trim()
            ));
        }
        output
            .stdout_lossy()
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("address command {:?} printed nothing", self.argv))
    }
}

/// Store-related locations under one data home.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    pub data_home: PathBuf,
    pub data_dir: PathBuf,
    pub socket_dir: PathBuf,
    pub lock_file: PathBuf,
    pub address_file: PathBuf,
    pub pid_file: PathBuf,
    pub log_file: PathBuf,
}

impl StorePaths {
    pub fn new(data_home: &Path, paths: &PathsConfig) -> Self {
        let data_dir = data_home.join(&paths.data_dir);
        Self {
            data_home: data_home.to_path_buf(),
            lock_file: data_dir.join(&paths.lock_file),
            data_dir,
            socket_dir: data_home.join(&paths.socket_dir),
            address_file: data_home.join(&paths.address_file),
            pid_file: data_home.join(&paths.pid_file),
            log_file: data_home.join(&paths.store_log),
        }
    }
}

/// Proof that the caller is the only client of the store under `data_home`.
///
/// Required by [`recover_lock_artifacts`], which deletes files a live store
/// would still be using.
#[derive(Debug)]
pub struct StoreOwnership {
    data_home: PathBuf,
}

impl StoreOwnership {
    /// Assert that no other process uses the store under `data_home`.
    ///
    /// Nothing is checked; the round controller calls this after stopping
    /// the store it started itself.
    pub fn assert_sole_client(data_home: &Path) -> Self {
        debug!(data_home = %data_home.display(), "asserting sole store client");
        Self {
            data_home: data_home.to_path_buf(),
        }
    }

    pub fn data_home(&self) -> &Path {
        &self.data_home
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub socket_entries_removed: usize,
    pub lock_removed: bool,
}

/// Remove stale socket and lock files left behind by a store that did not shut
/// down cleanly. Does nothing when the socket directory is absent or empty.
#[instrument(skip_all, fields(data_home = %paths.data_home.display()))]
pub fn recover_lock_artifacts(
    paths: &StorePaths,
    ownership: &StoreOwnership,
) -> Result<RecoveryReport> {
    if ownership.data_home() != paths.data_home {
        return Err(anyhow!(
            "store ownership was asserted for {}, not {}",
            ownership.data_home().display(),
            paths.data_home.display()
        ));
    }

    let entries = match fs::read_dir(&paths.socket_dir) {
        Ok(entries) => entries.count(),
        Err(err) if err.kind() == ErrorKind::NotFound => 0,
        Err(err) => {
            return Err(err)
                .with_context(|| format!("read socket dir {}", paths.socket_dir.display()));
        }
    };
    if entries == 0 {
        debug!("no stale store artifacts");
        return Ok(RecoveryReport::default());
    }

    warn!(
        path = %paths.socket_dir.display(),
        entries,
        "removing stale store socket directory"
    );
    fs::remove_dir_all(&paths.socket_dir)
        .with_context(|| format!("remove socket dir {}", paths.socket_dir.display()))?;

    let lock_removed = match fs::remove_file(&paths.lock_file) {
        Ok(()) => {
            warn!(path = %paths.lock_file.display(), "removed stale store lock file");
            true
        }
        Err(err) if err.kind() == ErrorKind::NotFound => false,
        Err(err) => {
            return Err(err)
                .with_context(|| format!("remove lock file {}", paths.lock_file.display()));
        }
    };

    Ok(RecoveryReport {
        socket_entries_removed: entries,
        lock_removed,
    })
}

/// A store process started by [`ProcessStore`].
#[derive(Debug)]
pub struct StoreHandle {
    child: Child,
    paths: StorePaths,
    address: String,
}

impl StoreHandle {
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }
}

/// Store backed by a local child process.
pub struct ProcessStore {
    config: StoreConfig,
    paths: PathsConfig,
    resolver: Box<dyn AddressResolver>,
}

impl ProcessStore {
    pub fn new(config: StoreConfig, paths: PathsConfig) -> Self {
        let resolver: Box<dyn AddressResolver> = if config.address_command.is_empty() {
            Box::new(HostnameResolver)
        } else {
            Box::new(CommandResolver::new(config.address_command.clone()))
        };
        Self::with_resolver(config, paths, resolver)
    }

    pub fn with_resolver(
        config: StoreConfig,
        paths: PathsConfig,
        resolver: Box<dyn AddressResolver>,
    ) -> Self {
        Self {
            config,
            paths,
            resolver,
        }
    }
}

impl StoreLauncher for ProcessStore {
    type Handle = StoreHandle;

    #[instrument(skip_all, fields(data_home = %data_home.display(), port))]
    fn start(&self, data_home: &Path, port: u16) -> Result<StoreHandle> {
        let paths = StorePaths::new(data_home, &self.paths);
        for dir in [&paths.data_dir, &paths.socket_dir] {
            fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        }

        let ctx = context! {
            data_home => paths.data_home.display().to_string(),
            data_dir => paths.data_dir.display().to_string(),
            socket_dir => paths.socket_dir.display().to_string(),
            port => port,
        };
        let argv = render_args(&self.config.command, &ctx).context("render store command")?;
        let log = File::create(&paths.log_file)
            .with_context(|| format!("create store log {}", paths.log_file.display()))?;
        let mut cmd = command_from_argv(&argv)?;
        cmd.stdin(Stdio::null())
            .stdout(log.try_clone().context("clone store log handle")?)
            .stderr(log);

        debug!(argv = ?argv, "spawning store");
        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn store {:?}", argv[0]))?;

        let published = fs::write(&paths.pid_file, format!("{}\n", child.id()))
            .with_context(|| format!("write pid file {}", paths.pid_file.display()))
            .and_then(|()| self.resolver.resolve().context("resolve store address"))
            .and_then(|address| {
                fs::write(&paths.address_file, format!("{address}\n"))
                    .with_context(|| format!("write address file {}", paths.address_file.display()))
                    .map(|()| address)
            });
        let address = match published {
            Ok(address) => address,
            Err(err) => {
                warn!(pid = child.id(), "store setup failed, killing store");
                let _ = child.kill();
                let _ = child.wait();
                let _ = fs::remove_file(&paths.pid_file);
                return Err(err);
            }
        };

        info!(pid = child.id(), address = %address, "store started");
        Ok(StoreHandle {
            child,
            paths,
            address,
        })
    }

    #[instrument(skip_all, fields(pid = handle.child.id()))]
    fn stop(&self, mut handle: StoreHandle) -> Result<()> {
        let raw_pid = i32::try_from(handle.child.id()).context("store pid out of range")?;
        match kill(Pid::from_raw(raw_pid), Signal::SIGTERM) {
            Ok(()) => debug!("sent SIGTERM to store"),
            Err(Errno::ESRCH) => debug!("store already exited"),
            Err(err) => return Err(err).context("signal store"),
        }

        let status = match self.config.stop_grace_secs.map(Duration::from_secs) {
            None => handle.child.wait().context("wait for store")?,
            Some(grace) => match handle
                .child
                .wait_timeout(grace)
                .context("wait for store")?
            {
                Some(status) => status,
                None => {
                    warn!(grace_secs = grace.as_secs(), "store ignored SIGTERM, killing");
                    handle.child.kill().context("kill store")?;
                    handle.child.wait().context("wait for store after kill")?
                }
            },
        };

        info!(exit_code = ?status.code(), "store stopped");
        // Reaped; pid file cleanup is best effort.
        match fs::remove_file(&handle.paths.pid_file) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(
                path = %handle.paths.pid_file.display(),
                err = %err,
                "failed to remove store pid file"
            ),
        }
        Ok(())
    }
}
