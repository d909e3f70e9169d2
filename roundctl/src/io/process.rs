//! Helpers for running child processes with timeouts and bounded output.

use std::collections::VecDeque;
use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Build a `Command` from an argv vector (`argv[0]` is the program).
pub fn command_from_argv(argv: &[String]) -> Result<Command> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("empty command line"))?;
    let mut cmd = Command::new(program);
    cmd.args(args);
    Ok(cmd)
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory: the last `output_limit_bytes` of each stream are kept and the
/// older bytes are counted and dropped while the pipe keeps draining.
#[instrument(skip_all, fields(program = ?cmd.get_program(), timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).with_context(|| format!("spawn {:?}", cmd.get_program()));
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_stream_tail(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_tail(stderr, output_limit_bytes));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_tail<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf: VecDeque<u8> = VecDeque::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        buf.extend(&chunk[..n]);
        let excess = buf.len().saturating_sub(limit);
        if excess > 0 {
            buf.drain(..excess);
            truncated += excess;
        }
    }

    Ok((buf.into(), truncated))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_stdout_and_exit_code() {
        let output = run_command_with_timeout(
            sh("echo progress; echo 0; echo oops >&2; exit 3"),
            Duration::from_secs(10),
            1024,
        )
        .expect("run");
        assert_eq!(output.stdout_lossy(), "progress\n0\n");
        assert_eq!(output.stderr_lossy(), "oops\n");
        assert_eq!(output.status.code(), Some(3));
        assert!(!output.timed_out);
    }

    #[test]
    fn output_beyond_limit_keeps_the_tail() {
        let output =
            run_command_with_timeout(sh("printf 'abcdefghij'"), Duration::from_secs(10), 4)
                .expect("run");
        assert_eq!(output.stdout, b"ghij");
        assert_eq!(output.stdout_truncated, 6);
    }

    #[test]
    fn long_output_keeps_last_line_across_reads() {
        let output = run_command_with_timeout(
            sh("i=0; while [ $i -lt 5000 ]; do echo progress-$i; i=$((i+1)); done; echo done"),
            Duration::from_secs(30),
            64,
        )
        .expect("run");
        assert_eq!(output.stdout.len(), 64);
        assert!(output.stdout_lossy().ends_with("progress-4999\ndone\n"));
        assert!(output.stdout_truncated > 0);
    }

    #[test]
    fn slow_command_is_killed() {
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let output =
            run_command_with_timeout(cmd, Duration::from_millis(200), 1024).expect("run");
        assert!(output.timed_out);
        assert!(!output.status.success());
    }

    #[test]
    fn argv_must_not_be_empty() {
        assert!(command_from_argv(&[]).is_err());
        let cmd = command_from_argv(&["squeue".to_string(), "-h".to_string()]).expect("cmd");
        assert_eq!(cmd.get_program(), "squeue");
    }
}
